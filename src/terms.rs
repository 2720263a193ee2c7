//! Terminology correction of transcribed text.
//!
//! Speech recognition reliably mangles some product names. Every term is
//! replaced literally, in map order, and text produced by a replacement is
//! never matched again.

use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{TermEntry, TermsConfig};
use crate::error::{Result, TransxError};

/// Built-in global terms, applied before any configured entry.
const BUILTIN_TERMS: &[(&str, &str)] = &[
    ("VING", "Vaadin"),
    ("crudes", "'CRUDs'"),
    ("Barland", "Borland"),
    ("Querkus", "Quarkus"),
    ("Quercus", "Quarkus"),
    ("Quus", "Quarkus"),
];

enum Piece<'a> {
    Source(&'a str),
    Replaced(&'a str),
}

#[derive(Debug, Clone)]
pub struct TerminologyCorrector {
    global: Vec<TermEntry>,
    languages: BTreeMap<String, Vec<TermEntry>>,
}

impl Default for TerminologyCorrector {
    fn default() -> Self {
        Self::new(&TermsConfig::default())
    }
}

/// Insert `entry` in place of an entry with the same term, or append it.
fn merge_entry<'a>(merged: &mut Vec<&'a TermEntry>, entry: &'a TermEntry) {
    match merged.iter_mut().find(|existing| existing.term == entry.term) {
        Some(slot) => *slot = entry,
        None => merged.push(entry),
    }
}

impl TerminologyCorrector {
    pub fn new(config: &TermsConfig) -> Self {
        let mut global: Vec<TermEntry> = BUILTIN_TERMS
            .iter()
            .map(|(term, replacement)| TermEntry {
                term: term.to_string(),
                replacement: replacement.to_string(),
            })
            .collect();

        for entry in &config.global {
            match global.iter_mut().find(|existing| existing.term == entry.term) {
                Some(slot) => slot.replacement = entry.replacement.clone(),
                None => global.push(entry.clone()),
            }
        }

        Self {
            global,
            languages: config.languages.clone(),
        }
    }

    /// Language overrides for `lang`, falling back to its primary subtag (`en-US` -> `en`).
    fn overrides(&self, lang: &str) -> &[TermEntry] {
        let primary = lang.split(['-', '_']).next().unwrap_or(lang);
        self.languages
            .get(lang)
            .or_else(|| self.languages.get(primary))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Effective term map for `lang`, in application order.
    pub fn terms(&self, lang: &str) -> Vec<&TermEntry> {
        let mut merged: Vec<&TermEntry> = self.global.iter().collect();
        for entry in self.overrides(lang) {
            merge_entry(&mut merged, entry);
        }
        merged.retain(|entry| !entry.term.is_empty());
        merged
    }

    pub fn correct(&self, text: &str, lang: &str) -> String {
        let terms = self.terms(lang);
        let mut pieces = vec![Piece::Source(text)];

        for entry in terms {
            let mut next = Vec::with_capacity(pieces.len());
            for piece in pieces {
                match piece {
                    Piece::Source(source) if source.contains(entry.term.as_str()) => {
                        let mut parts = source.split(entry.term.as_str());
                        if let Some(first) = parts.next() {
                            next.push(Piece::Source(first));
                        }
                        for part in parts {
                            next.push(Piece::Replaced(entry.replacement.as_str()));
                            next.push(Piece::Source(part));
                        }
                    }
                    other => next.push(other),
                }
            }
            pieces = next;
        }

        pieces
            .into_iter()
            .map(|piece| match piece {
                Piece::Source(s) | Piece::Replaced(s) => s,
            })
            .collect()
    }

    /// Correct `input` into `output`.
    pub fn correct_file(&self, input: &Path, lang: &str, output: &Path) -> Result<()> {
        if !input.exists() {
            return Err(TransxError::FileNotFound(input.display().to_string()));
        }
        let text = std::fs::read_to_string(input)?;
        debug!("Replacing {} terms in {}", self.terms(lang).len(), input.display());
        let corrected = self.correct(&text, lang);
        std::fs::write(output, corrected)?;
        info!("Fixed terms in {} [{}] to {}", input.display(), lang, output.display());
        Ok(())
    }
}

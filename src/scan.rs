use std::path::{Path, PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::error::{Result, TransxError};

/// Sub-directories holding generated subtitles next to a media file.
pub const SUBTITLE_DIRS: [&str; 2] = ["subs", "subtitles"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Media,
    Subtitle,
}

/// Snapshot of a local file taken at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
    /// Path relative to the scan root, always `/`-separated
    pub relative: String,
    pub kind: FileKind,
}

impl LocalFile {
    /// Build a snapshot for a single file outside of a directory scan.
    pub fn from_path(root: &Path, path: &Path, kind: FileKind) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|_| TransxError::FileNotFound(path.display().to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            relative: relative_identity(root, path),
            kind,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Media stem a generated artifact belongs to.
///
/// Artifacts are named `<stem>.<tag>.<ext>`, where the tag is a language or the
/// transcription marker, so only the last two segments are removed:
/// `my.talk.pt.vtt` belongs to `my.talk`.
pub fn artifact_stem(file_name: &str) -> &str {
    let without_ext = file_name.rsplit_once('.').map_or(file_name, |(head, _)| head);
    without_ext.rsplit_once('.').map_or(without_ext, |(stem, _)| stem)
}

/// Enumerates media and subtitle files under a root directory.
pub struct DirectoryScanner {
    media_extensions: Vec<String>,
    subtitle_extensions: Vec<String>,
}

impl DirectoryScanner {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            media_extensions: config.media_extensions.iter().map(|e| e.to_lowercase()).collect(),
            subtitle_extensions: config.subtitle_extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn classify(&self, path: &Path) -> Option<FileKind> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if self.media_extensions.contains(&ext) {
            Some(FileKind::Media)
        } else if self.subtitle_extensions.contains(&ext) {
            Some(FileKind::Subtitle)
        } else {
            None
        }
    }

    /// Recursively list matching files, sorted by relative path.
    pub fn scan<P: AsRef<Path>>(&self, root: P) -> Result<Vec<LocalFile>> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(TransxError::FileNotFound(root.display().to_string()));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = self.classify(entry.path()) else {
                continue;
            };
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            debug!("Found {:?} file {}", kind, entry.path().display());
            files.push(LocalFile {
                path: entry.path().to_path_buf(),
                size,
                relative: relative_identity(root, entry.path()),
                kind,
            });
        }

        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        info!("Found {} files under {}", files.len(), root.display());
        Ok(files)
    }
}

/// Path of `path` relative to `root` with `/` separators.
pub fn relative_identity(root: &Path, path: &Path) -> String {
    let relative = pathdiff::diff_paths(path, root).unwrap_or_else(|| path.to_path_buf());
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use assert_fs::prelude::*;

    #[test]
    fn test_scan_classifies_and_sorts() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("b/clip2.MP4").write_binary(b"video2").unwrap();
        temp.child("a/clip1.mp4").write_binary(b"video1").unwrap();
        temp.child("a/subs/clip1.en.vtt").write_str("WEBVTT").unwrap();
        temp.child("a/notes.txt").write_str("ignored").unwrap();

        let scanner = DirectoryScanner::new(&Config::default().scan);
        let files = scanner.scan(temp.path()).unwrap();

        let relatives: Vec<_> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(relatives, vec!["a/clip1.mp4", "a/subs/clip1.en.vtt", "b/clip2.MP4"]);
        assert_eq!(files[0].kind, FileKind::Media);
        assert_eq!(files[0].size, 6);
        assert_eq!(files[1].kind, FileKind::Subtitle);
        assert_eq!(files[2].kind, FileKind::Media);
    }

    #[test]
    fn test_scan_missing_root() {
        let scanner = DirectoryScanner::new(&Config::default().scan);
        let result = scanner.scan("/definitely/not/here");
        assert!(matches!(result, Err(TransxError::FileNotFound(_))));
    }

    #[test]
    fn test_file_name() {
        let file = LocalFile {
            path: PathBuf::from("/x/my.talk.mp4"),
            size: 0,
            relative: "my.talk.mp4".to_string(),
            kind: FileKind::Media,
        };
        assert_eq!(file.file_name(), "my.talk.mp4");
    }

    #[test]
    fn test_artifact_stem() {
        assert_eq!(artifact_stem("clip1.en.vtt"), "clip1");
        assert_eq!(artifact_stem("clip1.transcribe.json"), "clip1");
        assert_eq!(artifact_stem("my.talk.pt-BR.srt"), "my.talk");
        assert_eq!(artifact_stem("my.other.pt.vtt"), "my.other");
        assert_eq!(artifact_stem("clip1.vtt"), "clip1");
    }
}

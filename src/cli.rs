use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Overrides, split_languages};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory to scan for media and subtitles
    #[arg(short, long, global = true)]
    pub directory: Option<PathBuf>,

    /// Destination bucket
    #[arg(short, long, global = true)]
    pub bucket: Option<String>,

    /// Media files processed concurrently
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload media and subtitles whose remote copy differs
    Sync,

    /// Sync, then transcribe every media file into corrected subtitles
    Transcribe,

    /// Sync, then translate existing transcripts
    Translate {
        #[command(flatten)]
        languages: LanguageArgs,
    },

    /// Sync, then publish media and subtitles to the video catalog
    Publish,

    /// Sync, transcribe, translate and publish
    Run {
        #[command(flatten)]
        languages: LanguageArgs,
    },

    /// Delete generated subtitles and every remote object of the caller
    Clean,

    /// Inspect or write the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct LanguageArgs {
    /// Source language of the transcripts
    #[arg(short, long)]
    pub source_lang: Option<String>,

    /// Target languages (comma-separated)
    #[arg(short, long)]
    pub target_langs: Option<String>,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the resolved configuration
    Show,

    /// Write the default configuration to a file
    Init {
        /// Output file
        #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Args {
    /// Configuration values given on the command line.
    pub fn overrides(&self) -> Overrides {
        let languages = match &self.command {
            Commands::Translate { languages } | Commands::Run { languages } => languages.clone(),
            _ => LanguageArgs::default(),
        };

        Overrides {
            directory: self.directory.clone(),
            bucket: self.bucket.clone(),
            workers: self.workers,
            source_language: languages.source_lang,
            target_languages: languages.target_langs.as_deref().map(split_languages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["transx", "sync", "--bucket", "media", "-w", "3"]).unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.bucket.as_deref(), Some("media"));
        assert_eq!(overrides.workers, Some(3));
        assert!(overrides.target_languages.is_none());
    }

    #[test]
    fn test_run_languages() {
        let args = Args::try_parse_from(["transx", "-d", "talks", "run", "-s", "en", "-t", "pt,es"]).unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.directory, Some(PathBuf::from("talks")));
        assert_eq!(overrides.source_language.as_deref(), Some("en"));
        assert_eq!(overrides.target_languages, Some(vec!["pt".to_string(), "es".to_string()]));
    }
}

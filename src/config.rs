use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use crate::error::{Result, TransxError};

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "transx.toml";

/// Prefix of every environment variable read by [`Config::resolve`].
pub const ENV_PREFIX: &str = "TRANSX_";

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub scan: ScanConfig,
    pub transcribe: TranscribeConfig,
    pub translate: TranslateConfig,
    #[serde(default)]
    pub terms: TermsConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Destination bucket
    pub bucket: String,
    /// AWS region; falls back to the SDK default chain when unset
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores
    pub endpoint_url: Option<String>,
    /// Caller identity, used as the first segment of every object key
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Root directory to scan
    pub root: PathBuf,
    /// Extensions treated as media (lowercase, without dot)
    pub media_extensions: Vec<String>,
    /// Extensions treated as subtitles (lowercase, without dot)
    pub subtitle_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subtitle formats requested from the transcription service
    pub subtitle_formats: Vec<String>,
    /// Let the service detect several spoken languages
    pub identify_multiple_languages: bool,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateConfig {
    /// Source language of the corrected transcripts
    pub source_language: String,
    /// Target languages; translation is skipped when empty
    pub target_languages: Vec<String>,
    /// Data access role assumed by the translation service
    pub role_name: String,
    /// Service principal trusted by the role
    pub service_principal: String,
    /// Policy attached to the role
    pub policy_arn: String,
    /// Content type of the uploaded input documents
    pub content_type: String,
    pub backoff: BackoffConfig,
}

/// Exponential backoff settings, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub multiplier: f64,
    pub min_wait_secs: u64,
    pub max_wait_secs: u64,
    /// Overall deadline measured from job submission
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    pub term: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TermsConfig {
    /// Extra global terms, applied after the built-in ones
    #[serde(default)]
    pub global: Vec<TermEntry>,
    /// Per-language overrides keyed by language code
    #[serde(default)]
    pub languages: BTreeMap<String, Vec<TermEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub api_base_url: String,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Media files processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { workers: default_workers() }
    }
}

impl CatalogConfig {
    pub fn is_configured(&self) -> bool {
        self.user_id.is_some() && self.access_token.is_some()
    }
}

/// Values given explicitly on the command line. They win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub directory: Option<PathBuf>,
    pub bucket: Option<String>,
    pub workers: Option<usize>,
    pub source_language: Option<String>,
    pub target_languages: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                bucket: format!("transx.s3.{}", chrono::Local::now().format("%Y%m%d")),
                region: None,
                endpoint_url: None,
                identity: "anonymous".to_string(),
            },
            scan: ScanConfig {
                root: PathBuf::from("."),
                media_extensions: vec!["mp4".to_string(), "mov".to_string(), "mkv".to_string(), "webm".to_string()],
                subtitle_extensions: vec!["vtt".to_string(), "srt".to_string()],
            },
            transcribe: TranscribeConfig {
                enabled: true,
                subtitle_formats: vec!["vtt".to_string(), "srt".to_string()],
                identify_multiple_languages: true,
                backoff: BackoffConfig {
                    multiplier: 4.0,
                    min_wait_secs: 30,
                    max_wait_secs: 120,
                    deadline_secs: 60 * 60,
                },
            },
            translate: TranslateConfig {
                source_language: "en".to_string(),
                target_languages: Vec::new(),
                role_name: "transx-translate-access".to_string(),
                service_principal: "translate.amazonaws.com".to_string(),
                policy_arn: "arn:aws:iam::aws:policy/AmazonS3FullAccess".to_string(),
                content_type: "text/plain".to_string(),
                backoff: BackoffConfig {
                    multiplier: 1.5,
                    min_wait_secs: 30,
                    max_wait_secs: 120,
                    deadline_secs: 60 * 60,
                },
            },
            terms: TermsConfig::default(),
            catalog: CatalogConfig {
                api_base_url: "https://api.vimeo.com".to_string(),
                user_id: None,
                access_token: None,
            },
            workflow: WorkflowConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransxError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| TransxError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TransxError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| TransxError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Build the run configuration: explicit argument > environment > config file > default.
    /// Without `path`, `transx.toml` in the working directory is used when present.
    pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        let path = path.or_else(|| default_file.exists().then_some(default_file));
        Self::resolve_with(path, overrides, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::resolve`] with an injectable environment lookup and no
    /// working-directory lookup: `None` starts from the defaults.
    pub fn resolve_with<F>(path: Option<&Path>, overrides: &Overrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let mut config = Self::default();
                // The login name is only a default identity; a file value wins over it
                if let Some(user) = env("USER").filter(|v| !v.trim().is_empty()) {
                    config.storage.identity = user;
                }
                config
            }
        };

        config.apply_env(&env)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("PATH") {
            self.scan.root = PathBuf::from(path);
        }
        if let Some(bucket) = var("S3_BUCKET_NAME") {
            self.storage.bucket = bucket;
        }
        if let Some(region) = var("REGION") {
            self.storage.region = Some(region);
        }
        if let Some(endpoint) = var("S3_ENDPOINT_URL") {
            self.storage.endpoint_url = Some(endpoint);
        }
        if let Some(identity) = var("IDENTITY") {
            self.storage.identity = identity;
        }
        if let Some(lang) = var("SOURCE_LANG") {
            self.translate.source_language = lang;
        }
        if let Some(langs) = var("TARGET_LANG") {
            self.translate.target_languages = split_languages(&langs);
        }
        if let Some(workers) = var("WORKERS") {
            self.workflow.workers = workers.parse()
                .map_err(|_| TransxError::Config(format!("{}WORKERS is not a number: {}", ENV_PREFIX, workers)))?;
        }
        if let Some(user_id) = var("VIMEO_USER_ID") {
            self.catalog.user_id = Some(user_id);
        }
        if let Some(token) = var("VIMEO_ACCESS_TOKEN") {
            self.catalog.access_token = Some(token);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(directory) = &overrides.directory {
            self.scan.root = directory.clone();
        }
        if let Some(bucket) = &overrides.bucket {
            self.storage.bucket = bucket.clone();
        }
        if let Some(workers) = overrides.workers {
            self.workflow.workers = workers;
        }
        if let Some(lang) = &overrides.source_language {
            self.translate.source_language = lang.clone();
        }
        if let Some(langs) = &overrides.target_languages {
            self.translate.target_languages = langs.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.bucket.trim().is_empty() {
            return Err(TransxError::Config("storage.bucket must not be empty".to_string()));
        }
        if self.storage.identity.trim().is_empty() || self.storage.identity.contains('/') {
            return Err(TransxError::Config(format!(
                "storage.identity must be a single non-empty key segment: '{}'",
                self.storage.identity
            )));
        }
        if self.workflow.workers == 0 {
            return Err(TransxError::Config("workflow.workers must be at least 1".to_string()));
        }
        for (name, backoff) in [("transcribe", &self.transcribe.backoff), ("translate", &self.translate.backoff)] {
            if backoff.multiplier <= 0.0 || backoff.min_wait_secs > backoff.max_wait_secs {
                return Err(TransxError::Config(format!("{}.backoff is inconsistent: {:?}", name, backoff)));
            }
        }
        Ok(())
    }
}

/// Split a comma-separated language list, dropping blanks.
pub fn split_languages(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

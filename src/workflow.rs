// Media pipeline
//
//   scan -> sync -> transcribe -> correct -> translate -> publish
//
// Every synced media file runs its own pipeline. Pipelines run concurrently up
// to `workflow.workers`; failures stay inside the file's report.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogReconciler, PublishReport, SubtitleOutcome, VideoHostApi, find_subtitles, subtitle_language};
use crate::config::Config;
use crate::error::{RemoteError, Result, TransxError};
use crate::jobs::transcribe::{
    self, SUBS_DIR, TranscribeBackend, TranscriptionApi, TranscriptionRequest, corrected_path, subtitle_destination,
};
use crate::jobs::translate::{self, TranslateBackend, TranslationApi, TranslationRequest, translation_destination};
use crate::jobs::{BackoffPolicy, Job, JobBackend, JobOrchestrator, JobRegistry};
use crate::roles::{AccessRoleApi, RoleProvisioner};
use crate::scan::{DirectoryScanner, FileKind, LocalFile, artifact_stem};
use crate::storage::ObjectStore;
use crate::sync::{SyncCoordinator, SyncReport};
use crate::terms::TerminologyCorrector;

/// Remote collaborators of a workflow.
pub struct Services {
    pub store: Arc<dyn ObjectStore>,
    pub transcription: Arc<dyn TranscriptionApi>,
    pub translation: Arc<dyn TranslationApi>,
    pub roles: Arc<dyn AccessRoleApi>,
    /// Publishing is skipped when no video host is configured
    pub catalog: Option<Arc<dyn VideoHostApi>>,
}

/// Stages run after sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub transcribe: bool,
    pub translate: bool,
    pub publish: bool,
}

impl Stages {
    pub const TRANSCRIBE: Stages = Stages { transcribe: true, translate: false, publish: false };
    pub const TRANSLATE: Stages = Stages { transcribe: false, translate: true, publish: false };
    pub const PUBLISH: Stages = Stages { transcribe: false, translate: false, publish: true };
    pub const ALL: Stages = Stages { transcribe: true, translate: true, publish: true };

    fn any(&self) -> bool {
        self.transcribe || self.translate || self.publish
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StageOutcome {
    Done { artifacts: Vec<PathBuf> },
    Failed(String),
    Skipped(String),
}

impl StageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Done { .. } => "done",
            StageOutcome::Failed(_) => "failed",
            StageOutcome::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaReport {
    pub media: String,
    pub transcribe: Option<StageOutcome>,
    pub translate: Option<StageOutcome>,
    pub publish: Option<StageOutcome>,
}

impl MediaReport {
    fn new(media: &LocalFile) -> Self {
        Self {
            media: media.relative.clone(),
            transcribe: None,
            translate: None,
            publish: None,
        }
    }

    pub fn failed(&self) -> bool {
        [&self.transcribe, &self.translate, &self.publish]
            .into_iter()
            .flatten()
            .any(StageOutcome::is_failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub sync: SyncReport,
    pub media: Vec<MediaReport>,
}

impl BatchReport {
    /// `ok` when every file synced and every stage succeeded or was skipped.
    pub fn status(&self) -> &'static str {
        if self.sync.status() == "ok" && !self.media.iter().any(MediaReport::failed) {
            "ok"
        } else {
            "partial"
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub local_removed: Vec<PathBuf>,
    pub remote_deleted: usize,
}

pub struct Workflow {
    config: Config,
    scanner: DirectoryScanner,
    store: Arc<dyn ObjectStore>,
    sync: SyncCoordinator,
    transcribe: JobOrchestrator<TranscribeBackend>,
    translate: JobOrchestrator<TranslateBackend>,
    roles: RoleProvisioner,
    corrector: TerminologyCorrector,
    catalog: Option<CatalogReconciler>,
}

impl Workflow {
    pub fn new(config: Config, services: Services) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let sync = SyncCoordinator::new(
            services.store.clone(),
            config.storage.bucket.clone(),
            config.storage.identity.clone(),
        );

        Self {
            scanner: DirectoryScanner::new(&config.scan),
            transcribe: JobOrchestrator::new(
                TranscribeBackend::new(services.transcription),
                services.store.clone(),
                registry.clone(),
            ),
            translate: JobOrchestrator::new(
                TranslateBackend::new(services.translation),
                services.store.clone(),
                registry,
            ),
            roles: RoleProvisioner::new(services.roles, &config.translate),
            corrector: TerminologyCorrector::new(&config.terms),
            catalog: services.catalog.map(CatalogReconciler::new),
            store: services.store,
            sync,
            config,
        }
    }

    /// Show a progress bar while syncing.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.sync = self.sync.with_progress(show);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn bucket(&self) -> &str {
        &self.config.storage.bucket
    }

    fn identity(&self) -> &str {
        &self.config.storage.identity
    }

    /// Scan the configured root and sync it to the bucket.
    pub async fn sync(&self) -> Result<SyncReport> {
        info!("Syncing {} to bucket {}", self.config.scan.root.display(), self.bucket());
        self.sync.sync(&self.scanner, &self.config.scan.root).await
    }

    /// Sync, then run `stages` for every synced media file.
    pub async fn run(self: &Arc<Self>, stages: Stages) -> Result<BatchReport> {
        let sync = self.sync().await?;
        if !stages.any() {
            return Ok(BatchReport { sync, media: Vec::new() });
        }

        let media: Vec<LocalFile> = sync.synced_media().map(|r| r.file.clone()).collect();

        // Setup failures abort the run before any job is submitted
        if stages.translate && !media.is_empty() && !self.config.translate.target_languages.is_empty() {
            let arn = self.roles.ensure_role().await?;
            debug!("Translation jobs will use role {}", arn);
        }

        info!("Processing {} synced media files with {} workers", media.len(), self.config.workflow.workers);

        let semaphore = Arc::new(Semaphore::new(self.config.workflow.workers));
        let mut tasks = JoinSet::new();
        for file in media {
            let workflow = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                workflow.process_media(&file, stages).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Media pipeline aborted: {}", e),
            }
        }
        reports.sort_by(|a, b| a.media.cmp(&b.media));

        Ok(BatchReport { sync, media: reports })
    }

    /// Run `stages` for one synced media file.
    pub async fn process_media(&self, media: &LocalFile, stages: Stages) -> MediaReport {
        let mut report = MediaReport::new(media);
        let mut corrected: Option<Vec<PathBuf>> = None;

        if stages.transcribe {
            let outcome = if !self.config.transcribe.enabled {
                StageOutcome::Skipped("transcription disabled".to_string())
            } else if transcribe::media_format(&media.path).is_none() {
                warn!("Not transcribing {}: the service does not accept this media format", media.relative);
                StageOutcome::Skipped("unsupported media format".to_string())
            } else {
                match self.transcribe_media(media).await {
                    Ok(paths) => {
                        corrected = Some(paths.clone());
                        StageOutcome::Done { artifacts: paths }
                    }
                    Err(e) => {
                        error!("Transcription of {} failed: {}", media.relative, e);
                        StageOutcome::Failed(e.to_string())
                    }
                }
            };
            report.transcribe = Some(outcome);
        }

        if stages.translate {
            let transcribe_failed = report.transcribe.as_ref().is_some_and(StageOutcome::is_failed);
            let outcome = if self.config.translate.target_languages.is_empty() {
                StageOutcome::Skipped("no target languages".to_string())
            } else if transcribe_failed {
                StageOutcome::Skipped("transcription failed".to_string())
            } else {
                let sources = corrected.unwrap_or_else(|| self.existing_transcripts(media));
                if sources.is_empty() {
                    StageOutcome::Skipped("no transcripts to translate".to_string())
                } else {
                    match self.translate_media(media, &sources).await {
                        Ok(paths) => StageOutcome::Done { artifacts: paths },
                        Err(e) => {
                            error!("Translation of {} failed: {}", media.relative, e);
                            StageOutcome::Failed(e.to_string())
                        }
                    }
                }
            };
            report.translate = Some(outcome);
        }

        if stages.publish {
            let outcome = match self.publish_media(media).await {
                Ok(None) => StageOutcome::Skipped("catalog not configured".to_string()),
                Ok(Some(published)) if published.failures.is_empty() => StageOutcome::Done {
                    artifacts: published
                        .subtitles
                        .into_iter()
                        .filter(|(_, outcome)| matches!(outcome, SubtitleOutcome::Attached(_)))
                        .map(|(path, _)| path)
                        .collect(),
                },
                Ok(Some(published)) => StageOutcome::Failed(
                    published
                        .failures
                        .iter()
                        .map(|(path, e)| format!("{}: {}", path.display(), e))
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
                Err(e) => {
                    error!("Publishing {} failed: {}", media.relative, e);
                    StageOutcome::Failed(e.to_string())
                }
            };
            report.publish = Some(outcome);
        }

        report
    }

    async fn run_job<B: JobBackend>(
        jobs: &JobOrchestrator<B>,
        resource: &str,
        request: &B::Request,
        backoff: &crate::config::BackoffConfig,
    ) -> Result<Job> {
        let job = jobs.submit(resource, request).await?;
        let job = jobs
            .await_terminal(job, &BackoffPolicy::from(backoff), Duration::from_secs(backoff.deadline_secs))
            .await;
        Ok(job)
    }

    /// Transcribe `media`, download its subtitles and correct them.
    /// Returns the corrected subtitle paths.
    pub async fn transcribe_media(&self, media: &LocalFile) -> Result<Vec<PathBuf>> {
        let request = TranscriptionRequest::for_media(&self.config.transcribe, self.bucket(), self.identity(), media)
            .ok_or_else(|| TransxError::Job(format!("unsupported media format: {}", media.relative)))?;
        let job = Self::run_job(&self.transcribe, &media.relative, &request, &self.config.transcribe.backoff).await?;

        transcribe::write_sidecar(&media.path, &job)?;
        if let Some(reason) = &job.failure {
            return Err(TransxError::Job(format!("{} job {}: {}", job.kind, job.name, reason)));
        }

        let formats = &self.config.transcribe.subtitle_formats;
        let downloaded = self
            .transcribe
            .fetch_artifacts(&job, |key| subtitle_destination(&media.path, key, formats))
            .await?;

        let language = job
            .language_codes
            .first()
            .cloned()
            .unwrap_or_else(|| self.config.translate.source_language.clone());

        let mut corrected = Vec::with_capacity(downloaded.len());
        for transcript in downloaded {
            let output = corrected_path(&transcript, &language);
            self.corrector.correct_file(&transcript, &language, &output)?;
            corrected.push(output);
        }
        info!("Transcribed {} into {} subtitles [{}]", media.relative, corrected.len(), language);
        Ok(corrected)
    }

    /// Corrected transcripts already next to `media` in the source language.
    fn existing_transcripts(&self, media: &LocalFile) -> Vec<PathBuf> {
        let source = &self.config.translate.source_language;
        let source_primary = source.split(['-', '_']).next().unwrap_or(source);
        find_subtitles(&media.path)
            .into_iter()
            .filter(|path| path.parent().and_then(Path::file_name).is_some_and(|d| d == SUBS_DIR))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(subtitle_language)
                    .is_some_and(|lang| lang.split('-').next() == Some(source_primary))
            })
            .collect()
    }

    /// Translate `sources` into every target language. Returns the downloaded translations.
    pub async fn translate_media(&self, media: &LocalFile, sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.sync.ensure_bucket().await?;
        let prefix = translate::input_prefix(self.identity(), &media.relative);
        for source in sources {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| TransxError::FileNotFound(source.display().to_string()))?;
            self.store
                .put_object(self.bucket(), &format!("{}{}", prefix, name), source)
                .await?;
        }

        // Resolved once per workflow; later calls return the cached ARN
        let role_arn = self.roles.ensure_role().await?;
        let request = TranslationRequest::new(
            &self.config.translate,
            self.bucket(),
            self.identity(),
            &media.relative,
            &prefix,
            &role_arn,
            Utc::now(),
        );
        let job = Self::run_job(&self.translate, &media.relative, &request, &self.config.translate.backoff).await?;
        if let Some(reason) = &job.failure {
            return Err(TransxError::Job(format!("{} job {}: {}", job.kind, job.name, reason)));
        }

        let dir = media.path.parent().unwrap_or_else(|| Path::new(".")).join(SUBS_DIR);
        let translated = self
            .translate
            .fetch_artifacts(&job, |key| translation_destination(&dir, key))
            .await?;
        info!("Translated {} into {} subtitles", media.relative, translated.len());
        Ok(translated)
    }

    /// Publish `media` and its subtitles. `None` when no catalog is configured.
    pub async fn publish_media(&self, media: &LocalFile) -> Result<Option<PublishReport>> {
        match &self.catalog {
            Some(catalog) => catalog.publish(&media.path, self.identity()).await.map(Some),
            None => {
                debug!("No catalog configured, not publishing {}", media.relative);
                Ok(None)
            }
        }
    }

    /// Delete generated local artifacts and every remote object of the caller.
    pub async fn clean(&self) -> Result<CleanReport> {
        let mut report = CleanReport::default();

        let files = self.scanner.scan(&self.config.scan.root)?;
        for media in files.iter().filter(|f| f.kind == FileKind::Media) {
            for artifact in generated_artifacts(&media.path) {
                std::fs::remove_file(&artifact)?;
                debug!("Deleted {}", artifact.display());
                report.local_removed.push(artifact);
            }
        }

        let prefix = format!("{}/", self.identity());
        let objects = match self.store.list_objects(self.bucket(), &prefix).await {
            Ok(objects) => objects,
            Err(RemoteError::NotFound(_)) => {
                warn!("Bucket {} not found, nothing to delete", self.bucket());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        for object in &objects {
            self.store.delete_object(self.bucket(), &object.key).await?;
        }
        report.remote_deleted = objects.len();

        info!(
            "Cleaned {} local files and {} objects under s3://{}/{}",
            report.local_removed.len(),
            report.remote_deleted,
            self.bucket(),
            prefix
        );
        Ok(report)
    }
}

/// Files written for `media` in its `subs/` directory.
fn generated_artifacts(media: &Path) -> Vec<PathBuf> {
    let Some(stem) = media.file_stem().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let dir = media.parent().unwrap_or_else(|| Path::new(".")).join(SUBS_DIR);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            artifact_stem(name) == stem && matches!(ext, "vtt" | "srt" | "json")
        })
        .collect();
    found.sort();
    found
}

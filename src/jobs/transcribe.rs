// Speech-to-subtitle jobs on AWS Transcribe
//
// Media already synced to the object store is transcribed in place; the service
// writes subtitle files under an output prefix of the same bucket.

use async_trait::async_trait;
use aws_sdk_transcribe::Client;
use aws_sdk_transcribe::types::{Media, MediaFormat, SubtitleFormat, Subtitles};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{Job, JobBackend, JobKind, JobStatusReport, Phase, StartedJob};
use crate::aws::classify;
use crate::config::TranscribeConfig;
use crate::error::{RemoteError, RemoteResult, Result};
use crate::scan::LocalFile;
use crate::storage::s3_uri;
use crate::sync::object_key;

/// Marker segment of downloaded, not yet corrected transcripts.
pub const TRANSCRIBE_MARKER: &str = "transcribe";

/// Directory next to the media where transcripts are stored.
pub const SUBS_DIR: &str = "subs";

/// Media formats the service accepts, by file extension. QuickTime files share
/// the MP4 container and are submitted as `mp4`.
const MEDIA_FORMATS: [(&str, &str); 10] = [
    ("amr", "amr"),
    ("flac", "flac"),
    ("m4a", "m4a"),
    ("m4v", "mp4"),
    ("mov", "mp4"),
    ("mp3", "mp3"),
    ("mp4", "mp4"),
    ("ogg", "ogg"),
    ("wav", "wav"),
    ("webm", "webm"),
];

/// Format to submit `media` as, or `None` when the service cannot read it.
pub fn media_format(media: &Path) -> Option<&'static str> {
    let ext = media.extension()?.to_str()?.to_lowercase();
    MEDIA_FORMATS
        .iter()
        .find(|(extension, _)| *extension == ext)
        .map(|(_, format)| *format)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionRequest {
    pub media_uri: String,
    pub media_format: String,
    pub output_bucket: String,
    /// Output folder; ends with `/`
    pub output_key: String,
    pub identify_multiple_languages: bool,
    pub subtitle_formats: Vec<String>,
}

impl TranscriptionRequest {
    /// Request transcribing a synced media file stored under `identity` in `bucket`.
    ///
    /// Returns `None` for media in a format the service does not accept.
    pub fn for_media(config: &TranscribeConfig, bucket: &str, identity: &str, media: &LocalFile) -> Option<Self> {
        let media_format = media_format(&media.path)?;

        Some(Self {
            media_uri: s3_uri(bucket, &object_key(identity, media)),
            media_format: media_format.to_string(),
            output_bucket: bucket.to_string(),
            output_key: format!("{}/{}/{}/", identity, TRANSCRIBE_MARKER, media.relative),
            identify_multiple_languages: config.identify_multiple_languages,
            subtitle_formats: config.subtitle_formats.clone(),
        })
    }
}

/// Job description as reported by the service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptionJobInfo {
    pub name: String,
    pub status: String,
    pub language_codes: Vec<String>,
    pub subtitle_uris: Vec<String>,
    pub failure_reason: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptionApi: Send + Sync {
    async fn start_job(&self, name: &str, request: &TranscriptionRequest) -> RemoteResult<()>;

    async fn get_job(&self, name: &str) -> RemoteResult<TranscriptionJobInfo>;
}

/// Map a transcription job status onto a poll phase.
pub fn transcription_phase(status: &str) -> Phase {
    match status {
        "COMPLETED" => Phase::Completed,
        "FAILED" => Phase::Failed,
        // QUEUED, IN_PROGRESS
        _ => Phase::Running,
    }
}

pub struct AwsTranscribe {
    client: Client,
}

impl AwsTranscribe {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self { client: Client::new(sdk_config) }
    }
}

#[async_trait]
impl TranscriptionApi for AwsTranscribe {
    async fn start_job(&self, name: &str, request: &TranscriptionRequest) -> RemoteResult<()> {
        let media = Media::builder().media_file_uri(&request.media_uri).build();
        let formats = request
            .subtitle_formats
            .iter()
            .map(|f| SubtitleFormat::from(f.as_str()))
            .collect::<Vec<_>>();
        let subtitles = Subtitles::builder().set_formats(Some(formats)).build();

        let mut call = self
            .client
            .start_transcription_job()
            .transcription_job_name(name)
            .media(media)
            .output_bucket_name(&request.output_bucket)
            .output_key(&request.output_key)
            .subtitles(subtitles);

        // The service needs a language or one of the identification modes
        call = if request.identify_multiple_languages {
            call.identify_multiple_languages(true)
        } else {
            call.identify_language(true)
        };

        call.media_format(MediaFormat::from(request.media_format.as_str()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> RemoteResult<TranscriptionJobInfo> {
        let output = self
            .client
            .get_transcription_job()
            .transcription_job_name(name)
            .send()
            .await
            .map_err(classify)?;

        let job = output
            .transcription_job()
            .ok_or_else(|| RemoteError::Invalid(format!("no job description for {}", name)))?;

        let mut language_codes: Vec<String> = job
            .language_codes()
            .iter()
            .filter_map(|item| item.language_code())
            .map(|code| code.as_str().to_string())
            .collect();
        if language_codes.is_empty() {
            if let Some(code) = job.language_code() {
                language_codes.push(code.as_str().to_string());
            }
        }

        Ok(TranscriptionJobInfo {
            name: name.to_string(),
            status: job
                .transcription_job_status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            language_codes,
            subtitle_uris: job
                .subtitles()
                .map(|s| s.subtitle_file_uris().to_vec())
                .unwrap_or_default(),
            failure_reason: job.failure_reason().map(str::to_string),
        })
    }
}

/// Transcription jobs driven through [`super::JobOrchestrator`].
pub struct TranscribeBackend {
    api: Arc<dyn TranscriptionApi>,
}

impl TranscribeBackend {
    pub fn new(api: Arc<dyn TranscriptionApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl JobBackend for TranscribeBackend {
    type Request = TranscriptionRequest;

    fn kind(&self) -> JobKind {
        JobKind::Transcribe
    }

    fn inputs(&self, request: &TranscriptionRequest) -> Vec<String> {
        vec![request.media_uri.clone()]
    }

    async fn start(&self, name: &str, request: &TranscriptionRequest) -> RemoteResult<StartedJob> {
        info!("Starting transcribe job {} for {}", name, request.media_uri);
        self.api.start_job(name, request).await?;
        Ok(StartedJob {
            remote_id: name.to_string(),
            outputs: Vec::new(),
        })
    }

    async fn status(&self, remote_id: &str) -> RemoteResult<JobStatusReport> {
        let info = self.api.get_job(remote_id).await?;
        debug!("Current status of job {}: {}", remote_id, info.status);
        Ok(JobStatusReport {
            phase: transcription_phase(&info.status),
            status: info.status,
            outputs: info.subtitle_uris,
            language_codes: info.language_codes,
            message: info.failure_reason,
        })
    }
}

fn media_stem(media: &Path) -> String {
    media
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn subs_dir(media: &Path) -> PathBuf {
    media.parent().unwrap_or_else(|| Path::new(".")).join(SUBS_DIR)
}

/// Local path of a downloaded subtitle: `<media dir>/subs/<stem>.transcribe.<ext>`.
///
/// Objects other than subtitle files (the transcript JSON) are skipped.
pub fn subtitle_destination(media: &Path, key: &str, subtitle_formats: &[String]) -> Option<PathBuf> {
    let file_name = key.rsplit('/').next()?;
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_lowercase();
    if !subtitle_formats.iter().any(|f| f.eq_ignore_ascii_case(&ext)) {
        return None;
    }
    Some(subs_dir(media).join(format!("{}.{}.{}", media_stem(media), TRANSCRIBE_MARKER, ext)))
}

/// Name of the corrected artifact: the transcribe marker replaced by `lang`.
pub fn corrected_path(transcript: &Path, lang: &str) -> PathBuf {
    let name = transcript
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let marker = format!(".{}.", TRANSCRIBE_MARKER);
    transcript.with_file_name(name.replacen(&marker, &format!(".{}.", lang), 1))
}

/// Write the job summary next to the media as `subs/<stem>.transcribe.json`.
pub fn write_sidecar(media: &Path, job: &Job) -> Result<PathBuf> {
    let dir = subs_dir(media);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.{}.json", media_stem(media), TRANSCRIBE_MARKER));

    let summary = json!({
        "TranscriptionJobName": job.name,
        "State": job.state,
        "LanguageCodes": job.language_codes,
        "SubtitleFileUris": job.outputs,
        "Failure": job.failure.as_ref().map(|f| f.to_string()),
    });
    std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
    info!("Wrote job info to {}", path.display());
    Ok(path)
}

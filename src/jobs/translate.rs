// Batch text translation jobs on AWS Translate
//
// Corrected subtitles are uploaded under an input prefix; the service reads every
// object below it and writes `<target>.<input name>` files under the output prefix.

use async_trait::async_trait;
use aws_sdk_translate::Client;
use aws_sdk_translate::types::{InputDataConfig, OutputDataConfig};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{JobBackend, JobKind, JobStatusReport, Phase, StartedJob};
use crate::aws::classify;
use crate::config::TranslateConfig;
use crate::error::{RemoteError, RemoteResult};
use crate::scan::artifact_stem;
use crate::storage::s3_uri;

/// Segment of the auxiliary report files written by the service.
const DETAILS_SEGMENT: &str = "details";

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRequest {
    /// Input folder; ends with `/`
    pub input_uri: String,
    /// Output folder; ends with `/`
    pub output_uri: String,
    pub content_type: String,
    pub role_arn: String,
    pub source_language: String,
    pub target_languages: Vec<String>,
}

impl TranslationRequest {
    /// Request translating everything under `input_prefix` for the media `resource`.
    pub fn new(
        config: &TranslateConfig,
        bucket: &str,
        identity: &str,
        resource: &str,
        input_prefix: &str,
        role_arn: &str,
        at: DateTime<Utc>,
    ) -> Self {
        let output_key = format!("{}/translate/{}/{}/", identity, resource, at.format("%Y%m%d%H%M%S"));
        Self {
            input_uri: s3_uri(bucket, input_prefix),
            output_uri: s3_uri(bucket, &output_key),
            content_type: config.content_type.clone(),
            role_arn: role_arn.to_string(),
            source_language: config.source_language.clone(),
            target_languages: config.target_languages.clone(),
        }
    }
}

/// Prefix under which the inputs of `resource` are uploaded.
pub fn input_prefix(identity: &str, resource: &str) -> String {
    format!("{}/translate-input/{}/", identity, resource)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationJobInfo {
    pub job_id: String,
    pub status: String,
    pub message: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranslationApi: Send + Sync {
    /// Start a job and return its service identifier.
    async fn start_job(&self, name: &str, request: &TranslationRequest) -> RemoteResult<String>;

    async fn describe_job(&self, job_id: &str) -> RemoteResult<TranslationJobInfo>;
}

pub fn translation_phase(status: &str) -> Phase {
    match status {
        "COMPLETED" => Phase::Completed,
        "COMPLETED_WITH_ERROR" | "FAILED" | "STOPPED" => Phase::Failed,
        // SUBMITTED, IN_PROGRESS, STOP_REQUESTED
        _ => Phase::Running,
    }
}

pub struct AwsTranslate {
    client: Client,
}

impl AwsTranslate {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self { client: Client::new(sdk_config) }
    }
}

#[async_trait]
impl TranslationApi for AwsTranslate {
    async fn start_job(&self, name: &str, request: &TranslationRequest) -> RemoteResult<String> {
        let input = InputDataConfig::builder()
            .s3_uri(&request.input_uri)
            .content_type(&request.content_type)
            .build()
            .map_err(|e| RemoteError::Invalid(e.to_string()))?;
        let output = OutputDataConfig::builder()
            .s3_uri(&request.output_uri)
            .build()
            .map_err(|e| RemoteError::Invalid(e.to_string()))?;

        let response = self
            .client
            .start_text_translation_job()
            .job_name(name)
            .input_data_config(input)
            .output_data_config(output)
            .data_access_role_arn(&request.role_arn)
            .source_language_code(&request.source_language)
            .set_target_language_codes(Some(request.target_languages.clone()))
            .send()
            .await
            .map_err(classify)?;

        response
            .job_id()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Invalid(format!("no job id returned for {}", name)))
    }

    async fn describe_job(&self, job_id: &str) -> RemoteResult<TranslationJobInfo> {
        let output = self
            .client
            .describe_text_translation_job()
            .job_id(job_id)
            .send()
            .await
            .map_err(classify)?;

        let props = output
            .text_translation_job_properties()
            .ok_or_else(|| RemoteError::Invalid(format!("no job properties for {}", job_id)))?;

        Ok(TranslationJobInfo {
            job_id: job_id.to_string(),
            status: props
                .job_status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            message: props.message().map(str::to_string),
        })
    }
}

pub struct TranslateBackend {
    api: Arc<dyn TranslationApi>,
}

impl TranslateBackend {
    pub fn new(api: Arc<dyn TranslationApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl JobBackend for TranslateBackend {
    type Request = TranslationRequest;

    fn kind(&self) -> JobKind {
        JobKind::Translate
    }

    fn inputs(&self, request: &TranslationRequest) -> Vec<String> {
        vec![request.input_uri.clone()]
    }

    async fn start(&self, name: &str, request: &TranslationRequest) -> RemoteResult<StartedJob> {
        info!(
            "Starting translate job {} from {} to {:?}",
            name, request.source_language, request.target_languages
        );
        let job_id = self.api.start_job(name, request).await?;
        // The output location is only known from the request
        Ok(StartedJob {
            remote_id: job_id,
            outputs: vec![request.output_uri.clone()],
        })
    }

    async fn status(&self, remote_id: &str) -> RemoteResult<JobStatusReport> {
        let info = self.api.describe_job(remote_id).await?;
        debug!("Current status of job {}: {}", remote_id, info.status);
        Ok(JobStatusReport {
            phase: translation_phase(&info.status),
            status: info.status,
            outputs: Vec::new(),
            language_codes: Vec::new(),
            message: info.message,
        })
    }
}

/// Local name of a translated object: `pt.clip1.en-US.vtt` becomes `clip1.pt.vtt`.
///
/// Only the trailing source language and extension are replaced, so
/// `pt.my.talk.en.vtt` becomes `my.talk.pt.vtt`. Auxiliary report files are skipped.
pub fn translated_name(key: &str) -> Option<String> {
    if key.split('/').any(|segment| segment == DETAILS_SEGMENT) {
        return None;
    }
    let file_name = key.rsplit('/').next()?;
    let (lang, rest) = file_name.split_once('.')?;
    let (_, ext) = rest.rsplit_once('.')?;
    let stem = artifact_stem(rest);
    if lang.is_empty() || stem.is_empty() || ext.eq_ignore_ascii_case("json") {
        return None;
    }
    Some(format!("{}.{}.{}", stem, lang, ext))
}

/// Where a translated object lands: next to the corrected subtitles in `dir`.
pub fn translation_destination(dir: &Path, key: &str) -> Option<PathBuf> {
    translated_name(key).map(|name| dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::{BackoffPolicy, FailureReason, JobOrchestrator, JobRegistry, JobState};
    use crate::storage::MemoryObjectStore;
    use chrono::TimeZone;
    use mockall::Sequence;
    use std::time::Duration;

    fn request() -> TranslationRequest {
        let mut config = Config::default().translate;
        config.target_languages = vec!["pt".to_string(), "es".to_string()];
        TranslationRequest::new(
            &config,
            "media",
            "alice",
            "talks/clip1.mp4",
            &input_prefix("alice", "talks/clip1.mp4"),
            "arn:aws:iam::123456789012:role/transx-translate-access",
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
        )
    }

    fn described(status: &str) -> TranslationJobInfo {
        TranslationJobInfo {
            job_id: "abc".to_string(),
            status: status.to_string(),
            message: None,
        }
    }

    #[test]
    fn test_request_layout() {
        let request = request();
        assert_eq!(request.input_uri, "s3://media/alice/translate-input/talks/clip1.mp4/");
        assert_eq!(request.output_uri, "s3://media/alice/translate/talks/clip1.mp4/20240501093000/");
        assert_eq!(request.source_language, "en");
        assert_eq!(request.content_type, "text/plain");
    }

    #[test]
    fn test_status_mapping() {
        for status in ["SUBMITTED", "IN_PROGRESS", "STOP_REQUESTED"] {
            assert_eq!(translation_phase(status), Phase::Running);
        }
        assert_eq!(translation_phase("COMPLETED"), Phase::Completed);
        for status in ["COMPLETED_WITH_ERROR", "FAILED", "STOPPED"] {
            assert_eq!(translation_phase(status), Phase::Failed);
        }
    }

    #[test]
    fn test_translated_name() {
        assert_eq!(translated_name("alice/translate/x/123-TranslateText-abc/pt.clip1.en.vtt"), Some("clip1.pt.vtt".to_string()));
        assert_eq!(translated_name("out/es.clip1.en-US.srt"), Some("clip1.es.srt".to_string()));
        assert_eq!(translated_name("out/details/pt.auxiliary-translation-details.json"), None);
        assert_eq!(translated_name("out/README"), None);
        assert_eq!(translated_name("out/pt.my.talk.en-US.vtt"), Some("my.talk.pt.vtt".to_string()));
        assert_eq!(translated_name("out/pt.my.other.en.vtt"), Some("my.other.pt.vtt".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_translation_artifacts_downloaded() {
        let mut api = MockTranslationApi::new();
        let mut seq = Sequence::new();
        api.expect_start_job().times(1).returning(|_, _| Ok("abc".to_string()));
        api.expect_describe_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(described("SUBMITTED")));
        api.expect_describe_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(described("COMPLETED")));

        let store = Arc::new(MemoryObjectStore::new());
        let prefix = "alice/translate/talks/clip1.mp4/20240501093000/123-TranslateText-abc";
        store.insert("media", &format!("{}/pt.clip1.en.vtt", prefix), b"WEBVTT pt".to_vec());
        store.insert("media", &format!("{}/es.clip1.en.vtt", prefix), b"WEBVTT es".to_vec());
        store.insert("media", &format!("{}/details/pt.auxiliary-translation-details.json", prefix), b"{}".to_vec());

        let jobs = JobOrchestrator::new(TranslateBackend::new(Arc::new(api)), store, Arc::new(JobRegistry::new()));
        let job = jobs.submit("talks/clip1.mp4", &request()).await.unwrap();
        assert_eq!(job.remote_id, "abc");

        let job = jobs
            .await_terminal(job, &BackoffPolicy::new(1.5, Duration::from_secs(30), Duration::from_secs(120)), Duration::from_secs(3600))
            .await;
        assert_eq!(job.state, JobState::Completed);

        let dir = tempfile::tempdir().unwrap();
        let mut written = jobs
            .fetch_artifacts(&job, |key| translation_destination(dir.path(), key))
            .await
            .unwrap();
        written.sort();
        assert_eq!(written, vec![dir.path().join("clip1.es.vtt"), dir.path().join("clip1.pt.vtt")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_with_error_is_a_failure() {
        let mut api = MockTranslationApi::new();
        api.expect_start_job().returning(|_, _| Ok("abc".to_string()));
        api.expect_describe_job().returning(|_| {
            Ok(TranslationJobInfo {
                job_id: "abc".to_string(),
                status: "COMPLETED_WITH_ERROR".to_string(),
                message: Some("1 document failed".to_string()),
            })
        });

        let jobs = JobOrchestrator::new(
            TranslateBackend::new(Arc::new(api)),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(JobRegistry::new()),
        );
        let job = jobs.submit("clip", &request()).await.unwrap();
        let job = jobs
            .await_terminal(job, &BackoffPolicy::new(1.5, Duration::from_secs(30), Duration::from_secs(120)), Duration::from_secs(3600))
            .await;

        assert_eq!(job.failure, Some(FailureReason::Remote("1 document failed".to_string())));
    }
}

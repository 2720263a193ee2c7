// Remote job orchestration
//
// Long-running remote operations share one lifecycle:
//   submit -> poll until terminal (bounded backoff, local deadline) -> fetch artifacts
//
// Each service plugs in through the JobBackend trait:
// - transcribe: AWS Transcribe batch jobs producing subtitle files
// - translate: AWS Translate batch text translation over an object prefix

pub mod poll;
pub mod transcribe;
pub mod translate;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub use poll::{BackoffPolicy, Phase, PollOutcome, poll_until_terminal};

use crate::error::{RemoteError, RemoteResult, Result, TransxError};
use crate::storage::{ObjectStore, parse_object_uri};

/// Job names accepted by the services: `[0-9A-Za-z._-]`, at most 200 characters.
const MAX_JOB_NAME: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobKind {
    Transcribe,
    Translate,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Transcribe => write!(f, "transcribe"),
            JobKind::Translate => write!(f, "translate"),
        }
    }
}

/// Lifecycle state. Transitions only move forward: `Submitted -> Running -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The service reported the job as failed
    Remote(String),
    /// The local deadline passed while the job was still running
    TimedOut { waited_secs: u64 },
    /// Polling hit a non-retryable error
    Rejected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Remote(message) => write!(f, "remote failure: {}", message),
            FailureReason::TimedOut { waited_secs } => write!(f, "timed out locally after {}s", waited_secs),
            FailureReason::Rejected(message) => write!(f, "polling rejected: {}", message),
        }
    }
}

/// Status snapshot returned by a backend poll.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusReport {
    pub phase: Phase,
    /// Raw service status, e.g. `IN_PROGRESS`
    pub status: String,
    pub outputs: Vec<String>,
    pub language_codes: Vec<String>,
    pub message: Option<String>,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedJob {
    /// Identifier used to query the job
    pub remote_id: String,
    /// Outputs known at submission time
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub name: String,
    pub kind: JobKind,
    /// Local resource the job works on, e.g. the media file's relative path
    pub resource: String,
    pub remote_id: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub language_codes: Vec<String>,
    pub state: JobState,
    pub remote_status: Option<String>,
    pub failure: Option<FailureReason>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip)]
    started: Instant,
}

impl Job {
    /// Move to `next` if it is a forward transition. Returns whether the state changed.
    pub fn advance(&mut self, next: JobState) -> bool {
        if next > self.state && !self.state.is_terminal() {
            self.state = next;
            true
        } else {
            if next != self.state {
                warn!("Ignoring transition {:?} -> {:?} for job {}", self.state, next, self.name);
            }
            false
        }
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if self.advance(JobState::Failed) {
            self.failure = Some(reason);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(FailureReason::TimedOut { .. }))
    }

    /// Time since submission.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A remote service able to run jobs of one kind.
#[async_trait]
pub trait JobBackend: Send + Sync {
    type Request: Send + Sync;

    fn kind(&self) -> JobKind;

    /// Input URIs of a request, recorded on the job.
    fn inputs(&self, request: &Self::Request) -> Vec<String>;

    /// Submit a job under `name`.
    async fn start(&self, name: &str, request: &Self::Request) -> RemoteResult<StartedJob>;

    /// Query the job identified by `remote_id`.
    async fn status(&self, remote_id: &str) -> RemoteResult<JobStatusReport>;
}

/// Deterministic job name: `<kind>__<resource>__<yyyymmddHHMMSS>`.
pub fn job_name(kind: JobKind, resource: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d%H%M%S").to_string();
    let fixed = kind.to_string().len() + stamp.len() + 4;
    let resource: String = resource
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .take(MAX_JOB_NAME.saturating_sub(fixed))
        .collect();
    format!("{}__{}__{}", kind, resource, stamp)
}

/// Tracks active jobs so a resource never has two non-terminal jobs of one kind.
#[derive(Default)]
pub struct JobRegistry {
    active: Mutex<HashMap<(JobKind, String), String>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `(kind, resource)` for `name`. Fails if another job holds it.
    pub fn claim(&self, kind: JobKind, resource: &str, name: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        match active.get(&(kind, resource.to_string())) {
            Some(existing) => Err(TransxError::Job(format!(
                "{} job {} is still active for {}",
                kind, existing, resource
            ))),
            None => {
                active.insert((kind, resource.to_string()), name.to_string());
                Ok(())
            }
        }
    }

    pub fn release(&self, kind: JobKind, resource: &str) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(kind, resource.to_string()));
    }

    pub fn active_job(&self, kind: JobKind, resource: &str) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(kind, resource.to_string()))
            .cloned()
    }
}

/// Drives jobs of one backend through submit, poll and artifact download.
pub struct JobOrchestrator<B: JobBackend> {
    backend: B,
    store: Arc<dyn ObjectStore>,
    registry: Arc<JobRegistry>,
}

impl<B: JobBackend> JobOrchestrator<B> {
    pub fn new(backend: B, store: Arc<dyn ObjectStore>, registry: Arc<JobRegistry>) -> Self {
        Self { backend, store, registry }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Submit a job for `resource`. Submission failures are not retried.
    pub async fn submit(&self, resource: &str, request: &B::Request) -> Result<Job> {
        let kind = self.backend.kind();
        let submitted_at = Utc::now();
        let name = job_name(kind, resource, submitted_at);
        self.registry.claim(kind, resource, &name)?;

        let started = match self.backend.start(&name, request).await {
            Ok(started) => started,
            Err(e) => {
                self.registry.release(kind, resource);
                error!("Failed to start {} job {}: {}", kind, name, e);
                return Err(TransxError::Remote(e));
            }
        };

        info!("Started {} job {} ({})", kind, name, started.remote_id);
        Ok(Job {
            name,
            kind,
            resource: resource.to_string(),
            remote_id: started.remote_id,
            inputs: self.backend.inputs(request),
            outputs: started.outputs,
            language_codes: Vec::new(),
            state: JobState::Submitted,
            remote_status: None,
            failure: None,
            submitted_at,
            started: Instant::now(),
        })
    }

    /// Poll until the job is terminal or `deadline` (from submission) passes.
    pub async fn await_terminal(&self, mut job: Job, backoff: &BackoffPolicy, deadline: Duration) -> Job {
        if job.is_terminal() {
            return job;
        }

        let remote_id = job.remote_id.clone();
        let backend = &self.backend;
        let outcome = poll_until_terminal(
            || backend.status(&remote_id),
            |report: &JobStatusReport| report.phase,
            backoff,
            job.started,
            deadline,
        )
        .await;

        match outcome {
            PollOutcome::Completed(report) => {
                job.advance(JobState::Running);
                Self::absorb(&mut job, report);
                job.advance(JobState::Completed);
            }
            PollOutcome::Failed(report) => {
                job.advance(JobState::Running);
                let message = report.message.clone().unwrap_or_else(|| report.status.clone());
                Self::absorb(&mut job, report);
                job.fail(FailureReason::Remote(message));
            }
            PollOutcome::TimedOut { waited, polls } => {
                if polls > 0 {
                    job.advance(JobState::Running);
                }
                job.fail(FailureReason::TimedOut { waited_secs: waited.as_secs() });
            }
            PollOutcome::Rejected(e) => job.fail(FailureReason::Rejected(e.to_string())),
        }

        self.registry.release(job.kind, &job.resource);
        match &job.failure {
            None => info!("{} job {} completed in {:?}", job.kind, job.name, job.elapsed()),
            Some(reason) => error!("{} job {} failed: {}", job.kind, job.name, reason),
        }
        job
    }

    fn absorb(job: &mut Job, report: JobStatusReport) {
        job.remote_status = Some(report.status);
        if !report.outputs.is_empty() {
            job.outputs = report.outputs;
        }
        job.language_codes = report.language_codes;
    }

    /// Download the outputs of a completed job.
    ///
    /// Outputs ending in `/` are prefixes and every object below them is fetched.
    /// `destination` maps an object key to a local path, or `None` to skip it.
    pub async fn fetch_artifacts<F>(&self, job: &Job, destination: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        if job.state != JobState::Completed {
            return Err(TransxError::Job(format!("job {} is not completed ({:?})", job.name, job.state)));
        }

        let mut objects = Vec::new();
        for uri in &job.outputs {
            let (bucket, key) = parse_object_uri(uri)
                .ok_or_else(|| TransxError::Job(format!("unsupported output URI {}", uri)))?;
            if key.ends_with('/') {
                for summary in self.store.list_objects(&bucket, &key).await? {
                    objects.push((bucket.clone(), summary.key));
                }
            } else {
                objects.push((bucket, key));
            }
        }

        let mut written = Vec::new();
        for (bucket, key) in objects {
            let Some(path) = destination(&key) else {
                continue;
            };
            let data = match self.store.get_object(&bucket, &key).await {
                Ok(data) => data,
                Err(RemoteError::NotFound(_)) => {
                    warn!("Artifact s3://{}/{} disappeared, skipping", bucket, key);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, data).await?;
            info!("Downloaded s3://{}/{} to {}", bucket, key, path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend replaying a fixed sequence of phases.
    struct ScriptedBackend {
        phases: Vec<Phase>,
        polls: AtomicU32,
        outputs: Vec<String>,
        fail_start: bool,
    }

    impl ScriptedBackend {
        fn new(phases: Vec<Phase>) -> Self {
            Self {
                phases,
                polls: AtomicU32::new(0),
                outputs: vec!["s3://media/out/job.vtt".to_string()],
                fail_start: false,
            }
        }
    }

    #[async_trait]
    impl JobBackend for ScriptedBackend {
        type Request = ();

        fn kind(&self) -> JobKind {
            JobKind::Transcribe
        }

        fn inputs(&self, _request: &()) -> Vec<String> {
            vec!["s3://media/in.mp4".to_string()]
        }

        async fn start(&self, name: &str, _request: &()) -> RemoteResult<StartedJob> {
            if self.fail_start {
                return Err(RemoteError::Denied("not allowed".to_string()));
            }
            Ok(StartedJob { remote_id: name.to_string(), outputs: Vec::new() })
        }

        async fn status(&self, _remote_id: &str) -> RemoteResult<JobStatusReport> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) as usize;
            let phase = self.phases[n.min(self.phases.len() - 1)];
            Ok(JobStatusReport {
                phase,
                status: format!("{:?}", phase).to_uppercase(),
                outputs: if phase == Phase::Completed { self.outputs.clone() } else { Vec::new() },
                language_codes: vec!["en-US".to_string()],
                message: None,
            })
        }
    }

    fn orchestrator(backend: ScriptedBackend, store: Arc<MemoryObjectStore>) -> JobOrchestrator<ScriptedBackend> {
        JobOrchestrator::new(backend, store, Arc::new(JobRegistry::new()))
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(4.0, Duration::from_secs(30), Duration::from_secs(120))
    }

    #[test]
    fn test_job_name_is_deterministic_and_safe() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        assert_eq!(
            job_name(JobKind::Transcribe, "talks/clip 1.mp4", at),
            "transcribe__talks_clip_1.mp4__20240501093000"
        );
        let long = "x".repeat(500);
        assert_eq!(job_name(JobKind::Translate, &long, at).len(), MAX_JOB_NAME);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_job_returns_outputs() {
        let store = Arc::new(MemoryObjectStore::new());
        let jobs = orchestrator(ScriptedBackend::new(vec![Phase::Running, Phase::Completed]), store);

        let job = jobs.submit("talks/clip1.mp4", &()).await.unwrap();
        assert_eq!(job.state, JobState::Submitted);
        let job = jobs.await_terminal(job, &policy(), Duration::from_secs(3600)).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.outputs, vec!["s3://media/out/job.vtt"]);
        assert_eq!(job.language_codes, vec!["en-US"]);
        assert_eq!(job.remote_status.as_deref(), Some("COMPLETED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_marks_job_failed_locally() {
        let store = Arc::new(MemoryObjectStore::new());
        let jobs = orchestrator(ScriptedBackend::new(vec![Phase::Running]), store);

        let job = jobs.submit("clip", &()).await.unwrap();
        let job = jobs.await_terminal(job, &policy(), Duration::from_secs(300)).await;

        assert_eq!(job.state, JobState::Failed);
        assert!(job.timed_out());
        assert!(jobs.backend().polls.load(Ordering::SeqCst) < 10);
        // A terminal job frees the resource for resubmission
        assert!(jobs.submit("clip", &()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_is_distinct_from_timeout() {
        let store = Arc::new(MemoryObjectStore::new());
        let jobs = orchestrator(ScriptedBackend::new(vec![Phase::Failed]), store);

        let job = jobs.submit("clip", &()).await.unwrap();
        let job = jobs.await_terminal(job, &policy(), Duration::from_secs(300)).await;

        assert_eq!(job.state, JobState::Failed);
        assert!(matches!(job.failure, Some(FailureReason::Remote(_))));
        assert!(!job.timed_out());
    }

    #[tokio::test]
    async fn test_duplicate_active_job_refused() {
        let store = Arc::new(MemoryObjectStore::new());
        let jobs = orchestrator(ScriptedBackend::new(vec![Phase::Running]), store);

        let first = jobs.submit("clip", &()).await.unwrap();
        let second = jobs.submit("clip", &()).await;
        assert!(matches!(second, Err(TransxError::Job(_))));
        assert_eq!(jobs.registry.active_job(JobKind::Transcribe, "clip"), Some(first.name));
    }

    #[tokio::test]
    async fn test_submission_failure_releases_claim() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut backend = ScriptedBackend::new(vec![Phase::Running]);
        backend.fail_start = true;
        let jobs = orchestrator(backend, store);

        assert!(matches!(jobs.submit("clip", &()).await, Err(TransxError::Remote(RemoteError::Denied(_)))));
        assert_eq!(jobs.registry.active_job(JobKind::Transcribe, "clip"), None);
    }

    #[test]
    fn test_backward_transition_ignored() {
        let mut job = Job {
            name: "j".to_string(),
            kind: JobKind::Translate,
            resource: "r".to_string(),
            remote_id: "id".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            language_codes: Vec::new(),
            state: JobState::Submitted,
            remote_status: None,
            failure: None,
            submitted_at: Utc::now(),
            started: Instant::now(),
        };
        assert!(job.advance(JobState::Running));
        assert!(job.advance(JobState::Completed));
        assert!(!job.advance(JobState::Running));
        job.fail(FailureReason::Remote("late".to_string()));
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.failure, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_artifacts_lists_prefixes() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("media", "out/job.vtt", b"WEBVTT".to_vec());
        store.insert("media", "out/prefix/pt.clip.vtt", b"WEBVTT pt".to_vec());
        store.insert("media", "out/prefix/details/pt.json", b"{}".to_vec());

        let mut backend = ScriptedBackend::new(vec![Phase::Completed]);
        backend.outputs = vec!["s3://media/out/job.vtt".to_string(), "s3://media/out/prefix/".to_string()];
        let jobs = orchestrator(backend, store);

        let job = jobs.submit("clip", &()).await.unwrap();
        let job = jobs.await_terminal(job, &policy(), Duration::from_secs(60)).await;

        let dir = tempfile::tempdir().unwrap();
        let written = jobs
            .fetch_artifacts(&job, |key| {
                (!key.contains("/details/")).then(|| dir.path().join(key.rsplit('/').next().unwrap_or(key)))
            })
            .await
            .unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read_to_string(dir.path().join("pt.clip.vtt")).unwrap(), "WEBVTT pt");
    }
}

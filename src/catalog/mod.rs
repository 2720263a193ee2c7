// Video catalog reconciliation
//
// Publishes media and subtitles to a video host without ever duplicating:
//   user folder -> data folder -> video -> subtitle tracks
//
// Every entity is found by listing its parent scope and matching by name
// (or language, for tracks) before anything is created.

pub mod vimeo;

pub use vimeo::VimeoClient;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{RemoteError, RemoteResult, Result, TransxError};
use crate::scan::{SUBTITLE_DIRS, artifact_stem};

/// Language tag right before the subtitle extension: `clip1.en.vtt`, `clip1.pt-BR.vtt`, `clip1.en_US.srt`.
static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.([a-z]{2}(?:[-_][A-Za-z]{2})?)\.(vtt|srt)$").expect("language tag pattern is valid")
});

/// Listing attempts after creating a folder, for eventual consistency.
const RELIST_ATTEMPTS: u32 = 5;
const RELIST_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub uri: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVideo {
    pub uri: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubtitleTrack {
    pub uri: String,
    pub language: String,
    #[serde(default)]
    pub active: bool,
}

/// A freshly created track and where its content goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrack {
    pub track: RemoteSubtitleTrack,
    pub upload_link: String,
}

#[async_trait]
pub trait VideoHostApi: Send + Sync {
    /// Folders directly under `parent`, or the account's folders when `None`.
    async fn list_folders(&self, parent: Option<&RemoteFolder>) -> RemoteResult<Vec<RemoteFolder>>;

    async fn create_folder(&self, name: &str, parent: Option<&RemoteFolder>) -> RemoteResult<RemoteFolder>;

    async fn list_folder_videos(&self, folder: &RemoteFolder) -> RemoteResult<Vec<RemoteVideo>>;

    /// Upload `path` as `name` straight into `folder`.
    async fn upload_video(&self, path: &Path, name: &str, folder: &RemoteFolder) -> RemoteResult<RemoteVideo>;

    async fn list_subtitle_tracks(&self, video: &RemoteVideo) -> RemoteResult<Vec<RemoteSubtitleTrack>>;

    async fn create_subtitle_track(&self, video: &RemoteVideo, language: &str, name: &str) -> RemoteResult<PendingTrack>;

    async fn put_subtitle_content(&self, upload_link: &str, content: Vec<u8>) -> RemoteResult<()>;

    async fn activate_subtitle_track(&self, track: &RemoteSubtitleTrack) -> RemoteResult<()>;

    async fn delete_subtitle_track(&self, track: &RemoteSubtitleTrack) -> RemoteResult<()>;
}

/// Language tag of a subtitle file name, normalized to `xx` or `xx-YY`.
pub fn subtitle_language(file_name: &str) -> Option<String> {
    LANGUAGE_TAG
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace('_', "-"))
}

fn same_language(a: &str, b: &str) -> bool {
    a.replace('_', "-").eq_ignore_ascii_case(&b.replace('_', "-"))
}

/// Subtitles of `media`: `<stem>.<lang>.<ext>` files next to it or in its subtitle directories.
pub fn find_subtitles(media: &Path) -> Vec<PathBuf> {
    let Some(media_name) = media.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let Some(media_stem) = media.file_stem().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let dir = media.parent().unwrap_or_else(|| Path::new("."));

    let mut dirs = vec![dir.to_path_buf()];
    dirs.extend(SUBTITLE_DIRS.iter().map(|d| dir.join(d)));

    let mut found = Vec::new();
    for candidate_dir in dirs {
        let Ok(entries) = std::fs::read_dir(&candidate_dir) else {
            debug!("No subtitle directory at {}", candidate_dir.display());
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_subtitle = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("vtt") || e.eq_ignore_ascii_case("srt"));
            if path.is_file() && is_subtitle && artifact_stem(name) == media_stem {
                found.push(path);
            }
        }
    }
    found.sort();
    info!("Found {} subtitles for {}", found.len(), media_name);
    found
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubtitleOutcome {
    Attached(RemoteSubtitleTrack),
    /// A track for the language already exists
    AlreadyPresent(String),
    /// The file name carries no language tag
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub video: RemoteVideo,
    pub folder: RemoteFolder,
    pub subtitles: Vec<(PathBuf, SubtitleOutcome)>,
    pub failures: Vec<(PathBuf, String)>,
}

pub struct CatalogReconciler {
    api: Arc<dyn VideoHostApi>,
    relist_attempts: u32,
    relist_delay: Duration,
}

impl CatalogReconciler {
    pub fn new(api: Arc<dyn VideoHostApi>) -> Self {
        Self {
            api,
            relist_attempts: RELIST_ATTEMPTS,
            relist_delay: RELIST_DELAY,
        }
    }

    async fn find_folder(&self, name: &str, parent: Option<&RemoteFolder>) -> RemoteResult<Option<RemoteFolder>> {
        let folders = self.api.list_folders(parent).await?;
        Ok(folders.into_iter().find(|f| f.name == name))
    }

    /// Find folder `name` under `parent`, creating it only when no folder matches.
    pub async fn ensure_folder(&self, name: &str, parent: Option<&RemoteFolder>) -> Result<RemoteFolder> {
        if let Some(folder) = self.find_folder(name, parent).await? {
            debug!("Folder {} found at {}", name, folder.uri);
            return Ok(folder);
        }

        info!("Creating folder {}", name);
        let created = match self.api.create_folder(name, parent).await {
            Ok(folder) => Some(folder),
            Err(RemoteError::Conflict(_)) => None,
            Err(e) => return Err(e.into()),
        };

        for attempt in 0..self.relist_attempts {
            match self.find_folder(name, parent).await {
                Ok(Some(folder)) => {
                    info!("Folder {} ready at {}", name, folder.uri);
                    return Ok(folder);
                }
                Ok(None) => debug!("Folder {} not listed yet (attempt {})", name, attempt + 1),
                Err(e) if e.is_transient() => warn!("Listing folders failed, retrying: {}", e),
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.relist_delay).await;
        }

        created.ok_or_else(|| {
            TransxError::Remote(RemoteError::NotFound(format!("folder {} not visible after creation", name)))
        })
    }

    /// Find the video by file name inside `folder`, uploading it there if absent.
    pub async fn ensure_video_published(&self, media: &Path, folder: &RemoteFolder) -> Result<RemoteVideo> {
        let name = media
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| TransxError::FileNotFound(media.display().to_string()))?;

        let videos = self.api.list_folder_videos(folder).await?;
        if let Some(video) = videos.into_iter().find(|v| v.name == name) {
            info!("Video {} already published at {}", name, video.uri);
            return Ok(video);
        }

        if !media.is_file() {
            return Err(TransxError::FileNotFound(media.display().to_string()));
        }
        info!("Uploading {} to folder {}", name, folder.name);
        let video = self.api.upload_video(media, &name, folder).await?;
        info!("Video uploaded to {}", video.uri);
        Ok(video)
    }

    /// Attach `subtitle` to `video` unless its language is already present.
    pub async fn ensure_subtitle_attached(&self, video: &RemoteVideo, subtitle: &Path) -> Result<SubtitleOutcome> {
        let file_name = subtitle
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(language) = subtitle_language(&file_name) else {
            debug!("Skipping {}: no language tag", file_name);
            return Ok(SubtitleOutcome::Skipped);
        };

        let tracks = self.api.list_subtitle_tracks(video).await?;
        let (active, incomplete): (Vec<_>, Vec<_>) = tracks
            .into_iter()
            .filter(|t| same_language(&t.language, &language))
            .partition(|t| t.active);
        if !active.is_empty() {
            info!("Subtitle [{}] already attached to {}", language, video.uri);
            return Ok(SubtitleOutcome::AlreadyPresent(language));
        }

        // An inactive track is left over from an interrupted attach
        for track in &incomplete {
            warn!("Replacing incomplete subtitle track {} [{}]", track.uri, language);
            match self.api.delete_subtitle_track(track).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let content = tokio::fs::read(subtitle).await?;
        let pending = self.api.create_subtitle_track(video, &language, &language).await?;
        self.api.put_subtitle_content(&pending.upload_link, content).await?;
        self.api.activate_subtitle_track(&pending.track).await?;
        info!("Subtitle {} attached to {} as [{}]", file_name, video.uri, language);

        let mut track = pending.track;
        track.active = true;
        Ok(SubtitleOutcome::Attached(track))
    }

    /// Publish `media` under `<identity>/<media directory>` with all of its subtitles.
    pub async fn publish(&self, media: &Path, identity: &str) -> Result<PublishReport> {
        let user_folder = self.ensure_folder(identity, None).await?;
        let data_folder_name = media
            .parent()
            .and_then(|p| p.canonicalize().ok().or_else(|| Some(p.to_path_buf())))
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| identity.to_string());
        let data_folder = self.ensure_folder(&data_folder_name, Some(&user_folder)).await?;
        let video = self.ensure_video_published(media, &data_folder).await?;

        let mut subtitles = Vec::new();
        let mut failures = Vec::new();
        for subtitle in find_subtitles(media) {
            match self.ensure_subtitle_attached(&video, &subtitle).await {
                Ok(outcome) => subtitles.push((subtitle, outcome)),
                Err(e) => {
                    error!("Failed to attach {}: {}", subtitle.display(), e);
                    failures.push((subtitle, e.to_string()));
                }
            }
        }

        Ok(PublishReport {
            video,
            folder: data_folder,
            subtitles,
            failures,
        })
    }
}

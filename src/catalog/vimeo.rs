// Vimeo REST client (API 3.4)
//
// Folders are "projects", videos are uploaded with the tus protocol and
// subtitles are text tracks whose content goes to a dedicated upload link.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::{PendingTrack, RemoteFolder, RemoteSubtitleTrack, RemoteVideo, VideoHostApi};
use crate::config::CatalogConfig;
use crate::error::{RemoteError, RemoteResult, Result, TransxError};

const ACCEPT: &str = "application/vnd.vimeo.*+json;version=3.4";
const PER_PAGE: u32 = 100;
const TUS_VERSION: &str = "1.0.0";
/// Bytes sent per tus PATCH request.
const UPLOAD_CHUNK: u64 = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderItem {
    #[serde(rename = "type")]
    kind: String,
    video: Option<RemoteVideo>,
    folder: Option<RemoteFolder>,
}

#[derive(Debug, Deserialize)]
struct UploadTicket {
    uri: String,
    upload: UploadInfo,
}

#[derive(Debug, Deserialize)]
struct UploadInfo {
    upload_link: String,
}

#[derive(Debug, Deserialize)]
struct TextTrack {
    uri: String,
    language: String,
    #[serde(default)]
    active: bool,
    link: Option<String>,
}

impl From<TextTrack> for RemoteSubtitleTrack {
    fn from(track: TextTrack) -> Self {
        Self {
            uri: track.uri,
            language: track.language,
            active: track.active,
        }
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        RemoteError::Transient(e.to_string())
    } else {
        RemoteError::Invalid(e.to_string())
    }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), format!("{} {}: {}", status, url, body)))
}

pub struct VimeoClient {
    client: Client,
    base_url: String,
    user_id: String,
    access_token: String,
}

impl VimeoClient {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        match (&config.user_id, &config.access_token) {
            (Some(user_id), Some(token)) => Self::with_base_url(&config.api_base_url, user_id, token),
            _ => Err(TransxError::Config(
                "catalog.user_id and catalog.access_token are required to publish".to_string(),
            )),
        }
    }

    pub fn with_base_url(base_url: &str, user_id: &str, access_token: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn api(&self, method: Method, path: &str, body: Option<Value>) -> RemoteResult<Response> {
        let url = self.url(path);
        debug!("Vimeo {} {}", method, url);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::ACCEPT, ACCEPT);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(transport_error)?;
        check_status(response).await
    }

    async fn api_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> RemoteResult<T> {
        self.api(method, path, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Invalid(format!("unexpected response from {}: {}", path, e)))
    }

    /// Every element of a paginated collection.
    async fn get_all<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<Vec<T>> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut next = Some(format!("{}{}per_page={}", path, separator, PER_PAGE));
        let mut items = Vec::new();

        while let Some(page_path) = next.take() {
            let page: Page<T> = self.api_json(Method::GET, &page_path, None).await?;
            items.extend(page.data);
            next = page.paging.and_then(|p| p.next);
        }
        Ok(items)
    }

    async fn folder_items(&self, folder: &RemoteFolder) -> RemoteResult<Vec<FolderItem>> {
        self.get_all(&format!("{}/items", folder.uri)).await
    }

    async fn tus_upload(&self, path: &Path, upload_link: &str, size: u64) -> RemoteResult<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| RemoteError::Invalid(format!("cannot read {}: {}", path.display(), e)))?;
        let mut offset: u64 = 0;

        while offset < size {
            let mut chunk = Vec::with_capacity(UPLOAD_CHUNK.min(size - offset) as usize);
            (&mut file)
                .take(UPLOAD_CHUNK)
                .read_to_end(&mut chunk)
                .await
                .map_err(|e| RemoteError::Invalid(format!("cannot read {}: {}", path.display(), e)))?;
            if chunk.is_empty() {
                return Err(RemoteError::Invalid(format!("{} shrank during upload", path.display())));
            }
            let sent = chunk.len() as u64;

            let response = self
                .client
                .patch(upload_link)
                .header("Tus-Resumable", TUS_VERSION)
                .header("Upload-Offset", offset.to_string())
                .header(reqwest::header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(Bytes::from(chunk))
                .send()
                .await
                .map_err(transport_error)?;
            let response = check_status(response).await?;

            let acknowledged = response
                .headers()
                .get("Upload-Offset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(offset + sent);
            if acknowledged != offset + sent {
                return Err(RemoteError::Transient(format!(
                    "upload offset mismatch: sent up to {}, acknowledged {}",
                    offset + sent,
                    acknowledged
                )));
            }
            offset = acknowledged;
            debug!("Uploaded {}/{} bytes of {}", offset, size, path.display());
        }
        Ok(())
    }
}

#[async_trait]
impl VideoHostApi for VimeoClient {
    async fn list_folders(&self, parent: Option<&RemoteFolder>) -> RemoteResult<Vec<RemoteFolder>> {
        match parent {
            None => self.get_all(&format!("/users/{}/projects", self.user_id)).await,
            Some(parent) => Ok(self
                .folder_items(parent)
                .await?
                .into_iter()
                .filter(|item| item.kind == "folder")
                .filter_map(|item| item.folder)
                .collect()),
        }
    }

    async fn create_folder(&self, name: &str, parent: Option<&RemoteFolder>) -> RemoteResult<RemoteFolder> {
        let mut body = json!({ "name": name });
        if let Some(parent) = parent {
            body["parent_folder_uri"] = json!(parent.uri);
        }
        let folder: RemoteFolder = self
            .api_json(Method::POST, &format!("/users/{}/projects", self.user_id), Some(body))
            .await?;
        info!("Folder created: {} ({})", folder.name, folder.uri);
        Ok(folder)
    }

    async fn list_folder_videos(&self, folder: &RemoteFolder) -> RemoteResult<Vec<RemoteVideo>> {
        Ok(self
            .folder_items(folder)
            .await?
            .into_iter()
            .filter(|item| item.kind == "video")
            .filter_map(|item| item.video)
            .collect())
    }

    async fn upload_video(&self, path: &Path, name: &str, folder: &RemoteFolder) -> RemoteResult<RemoteVideo> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| RemoteError::Invalid(format!("cannot read {}: {}", path.display(), e)))?
            .len();

        let body = json!({
            "upload": { "approach": "tus", "size": size },
            "name": name,
            "description": name,
            "folder_uri": folder.uri,
        });
        let ticket: UploadTicket = self.api_json(Method::POST, "/me/videos", Some(body)).await?;
        info!("Uploading {} ({} bytes) to {}", path.display(), size, ticket.uri);

        self.tus_upload(path, &ticket.upload.upload_link, size).await?;
        Ok(RemoteVideo {
            uri: ticket.uri,
            name: name.to_string(),
        })
    }

    async fn list_subtitle_tracks(&self, video: &RemoteVideo) -> RemoteResult<Vec<RemoteSubtitleTrack>> {
        let tracks: Vec<TextTrack> = self.get_all(&format!("{}/texttracks", video.uri)).await?;
        Ok(tracks.into_iter().map(RemoteSubtitleTrack::from).collect())
    }

    async fn create_subtitle_track(&self, video: &RemoteVideo, language: &str, name: &str) -> RemoteResult<PendingTrack> {
        let body = json!({ "type": "subtitles", "language": language, "name": name });
        let mut track: TextTrack = self
            .api_json(Method::POST, &format!("{}/texttracks", video.uri), Some(body))
            .await?;
        let upload_link = track
            .link
            .take()
            .ok_or_else(|| RemoteError::Invalid(format!("text track {} has no upload link", track.uri)))?;
        Ok(PendingTrack {
            track: track.into(),
            upload_link,
        })
    }

    async fn put_subtitle_content(&self, upload_link: &str, content: Vec<u8>) -> RemoteResult<()> {
        let response = self
            .client
            .put(upload_link)
            .body(Bytes::from(content))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn activate_subtitle_track(&self, track: &RemoteSubtitleTrack) -> RemoteResult<()> {
        self.api(Method::PATCH, &track.uri, Some(json!({ "active": true })))
            .await?;
        debug!("Activated text track {}", track.uri);
        Ok(())
    }

    async fn delete_subtitle_track(&self, track: &RemoteSubtitleTrack) -> RemoteResult<()> {
        self.api(Method::DELETE, &track.uri, None).await?;
        debug!("Deleted text track {}", track.uri);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogReconciler, SubtitleOutcome};
    use mockito::Matcher;
    use std::sync::Arc;

    fn client(server: &mockito::ServerGuard) -> VimeoClient {
        VimeoClient::with_base_url(&server.url(), "42", "secret").unwrap()
    }

    #[test]
    fn test_requires_credentials() {
        let config = crate::config::Config::default().catalog;
        assert!(matches!(VimeoClient::new(&config), Err(TransxError::Config(_))));
    }

    #[tokio::test]
    async fn test_list_folders_follows_paging() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/users/42/projects")
            .match_query(Matcher::UrlEncoded("per_page".into(), "100".into()))
            .match_header("authorization", "Bearer secret")
            .match_header("accept", ACCEPT)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"uri":"/users/42/projects/1","name":"alice"}],
                    "paging":{"next":"/users/42/projects?page=2"}}"#,
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/users/42/projects")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"uri":"/users/42/projects/2","name":"bob"}],"paging":{"next":null}}"#)
            .create_async()
            .await;

        let folders = client(&server).list_folders(None).await.unwrap();
        let names: Vec<_> = folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_folder_items_split_by_type() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/42/projects/1/items")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[
                    {"type":"folder","folder":{"uri":"/users/42/projects/5","name":"talks"}},
                    {"type":"video","video":{"uri":"/videos/7","name":"clip1.mp4"}}
                ]}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let parent = RemoteFolder { uri: "/users/42/projects/1".to_string(), name: "alice".to_string() };
        let vimeo = client(&server);
        let folders = vimeo.list_folders(Some(&parent)).await.unwrap();
        let videos = vimeo.list_folder_videos(&parent).await.unwrap();
        assert_eq!(folders, vec![RemoteFolder { uri: "/users/42/projects/5".to_string(), name: "talks".to_string() }]);
        assert_eq!(videos, vec![RemoteVideo { uri: "/videos/7".to_string(), name: "clip1.mp4".to_string() }]);
    }

    #[tokio::test]
    async fn test_status_codes_are_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/42/projects")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error":"unauthorized"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/users/42/projects")
            .with_status(503)
            .create_async()
            .await;

        let vimeo = client(&server);
        assert!(matches!(vimeo.list_folders(None).await, Err(RemoteError::Denied(_))));
        assert!(matches!(vimeo.create_folder("x", None).await, Err(RemoteError::Transient(_))));
    }

    #[tokio::test]
    async fn test_create_folder_with_parent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/users/42/projects")
            .match_body(Matcher::PartialJson(json!({
                "name": "talks",
                "parent_folder_uri": "/users/42/projects/1"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"uri":"/users/42/projects/5","name":"talks"}"#)
            .create_async()
            .await;

        let parent = RemoteFolder { uri: "/users/42/projects/1".to_string(), name: "alice".to_string() };
        let folder = client(&server).create_folder("talks", Some(&parent)).await.unwrap();
        assert_eq!(folder.uri, "/users/42/projects/5");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_tus_upload_into_folder() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("clip1.mp4");
        std::fs::write(&media, b"hello").unwrap();

        let ticket = server
            .mock("POST", "/me/videos")
            .match_body(Matcher::PartialJson(json!({
                "upload": { "approach": "tus", "size": 5 },
                "name": "clip1.mp4",
                "folder_uri": "/users/42/projects/5"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "uri": "/videos/7",
                    "upload": { "upload_link": format!("{}/tus/abc", server.url()) }
                })
                .to_string(),
            )
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/tus/abc")
            .match_header("tus-resumable", "1.0.0")
            .match_header("upload-offset", "0")
            .match_body("hello")
            .with_status(204)
            .with_header("upload-offset", "5")
            .create_async()
            .await;

        let folder = RemoteFolder { uri: "/users/42/projects/5".to_string(), name: "talks".to_string() };
        let video = client(&server).upload_video(&media, "clip1.mp4", &folder).await.unwrap();
        assert_eq!(video.uri, "/videos/7");
        ticket.assert_async().await;
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn test_subtitle_attached_through_reconciler() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let subtitle = dir.path().join("clip1.pt.vtt");
        std::fs::write(&subtitle, "WEBVTT\n").unwrap();

        server
            .mock("GET", "/videos/7/texttracks")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"uri":"/videos/7/texttracks/1","language":"en","active":true}]}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/videos/7/texttracks")
            .match_body(Matcher::PartialJson(json!({ "type": "subtitles", "language": "pt" })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "uri": "/videos/7/texttracks/2",
                    "language": "pt",
                    "active": false,
                    "link": format!("{}/texttrack-upload/2", server.url())
                })
                .to_string(),
            )
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/texttrack-upload/2")
            .match_body("WEBVTT\n")
            .with_status(200)
            .create_async()
            .await;
        let activate = server
            .mock("PATCH", "/videos/7/texttracks/2")
            .match_body(Matcher::Json(json!({ "active": true })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let catalog = CatalogReconciler::new(Arc::new(client(&server)));
        let video = RemoteVideo { uri: "/videos/7".to_string(), name: "clip1.mp4".to_string() };
        let outcome = catalog.ensure_subtitle_attached(&video, &subtitle).await.unwrap();

        assert!(matches!(outcome, SubtitleOutcome::Attached(ref track) if track.active && track.language == "pt"));
        create.assert_async().await;
        put.assert_async().await;
        activate.assert_async().await;
    }

    #[tokio::test]
    async fn test_inactive_track_is_replaced() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let subtitle = dir.path().join("clip1.pt.vtt");
        std::fs::write(&subtitle, "WEBVTT\n").unwrap();

        server
            .mock("GET", "/videos/7/texttracks")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"uri":"/videos/7/texttracks/1","language":"pt","active":false}]}"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/videos/7/texttracks/1")
            .with_status(204)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/videos/7/texttracks")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "uri": "/videos/7/texttracks/2",
                    "language": "pt",
                    "active": false,
                    "link": format!("{}/texttrack-upload/2", server.url())
                })
                .to_string(),
            )
            .create_async()
            .await;
        server.mock("PUT", "/texttrack-upload/2").with_status(200).create_async().await;
        server
            .mock("PATCH", "/videos/7/texttracks/2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let catalog = CatalogReconciler::new(Arc::new(client(&server)));
        let video = RemoteVideo { uri: "/videos/7".to_string(), name: "clip1.mp4".to_string() };
        let outcome = catalog.ensure_subtitle_attached(&video, &subtitle).await.unwrap();

        assert!(matches!(outcome, SubtitleOutcome::Attached(ref track) if track.uri == "/videos/7/texttracks/2"));
        delete.assert_async().await;
        create.assert_async().await;
    }
}

//! transx - Content-addressed media sync and remote subtitle jobs
//!
//! Syncs a media tree to an object store without re-uploading unchanged files,
//! drives remote transcription and translation jobs to completion, corrects
//! recurring terminology errors and publishes media with subtitles to a video
//! catalog.

pub mod aws;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod etag;
pub mod jobs;
pub mod roles;
pub mod scan;
pub mod storage;
pub mod sync;
pub mod terms;
pub mod workflow;

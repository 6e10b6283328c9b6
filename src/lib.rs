#![forbid(unsafe_code)]

//! Video upload and analysis backend.
//!
//! A submitted video (uploaded file or remote URL) becomes a job that moves
//! through `pending -> processing -> completed | failed`. Workers probe the
//! media with ffprobe, sample key frames with ffmpeg, transcribe the audio
//! through a Whisper compatible endpoint and store everything in SQLite; a
//! downloadable HTML report is rendered on demand.

pub mod adapters;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod security;
pub mod service;
pub mod storage;
pub mod store;

pub use error::{Error, Result};

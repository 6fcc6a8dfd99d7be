//! podx-studio library crate.
//!
//! Run orchestration for the PodX podcast processing pipeline: a run moves a
//! source URL through fetch, transcode, transcribe and the optional
//! enrichment stages, with progress streamed to subscribers and every run
//! kept in a SQLite history.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use error::{Error, Result};

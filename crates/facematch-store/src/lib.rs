//! facematch-store — SQLite persistence for the face gallery.
//!
//! Stores enrolled [`GalleryEntry`](facematch_core::GalleryEntry) records and
//! a log of recognition attempts in a single SQLite database.

mod schema;

pub mod gallery;
pub mod log;

pub use gallery::SqliteGallery;
pub use log::{RecognitionLog, RecognitionMethod, DEFAULT_LOG_LIMIT};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("database lock poisoned")]
    Poisoned,
}

impl From<StoreError> for facematch_core::GalleryError {
    fn from(e: StoreError) -> Self {
        facematch_core::GalleryError::Backend(Box::new(e))
    }
}

//! Tiered content resolution for a multilingual Bible-study app.
//!
//! Content is answered from an in-memory reactive cache, a local SQLite
//! store or the remote translation API, in that order. Records whose
//! translation is still running are polled to completion in the background.

pub mod api;
pub mod cache;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod installer;
pub mod keys;
pub mod metrics;
pub mod poller;
pub mod resolver;
pub mod retry;
pub mod services;

pub use content::{ContentKind, ContentRecord};
pub use error::{ContentError, Result};
pub use keys::CacheKey;

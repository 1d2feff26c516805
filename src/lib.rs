//! Offline-first client for a Bugzilla-style tracker.
//!
//! Bugs, users and attachments are kept in a local SQLite store and
//! refreshed from the tracker's REST API on demand. Each record has exactly
//! one live model instance per [`session::Session`].

pub mod collection;
pub mod config;
pub mod db;
pub mod decoder;
pub mod error;
pub mod model;
pub mod session;
pub mod tracker;

pub use error::{Error, ErrorKind, Result};

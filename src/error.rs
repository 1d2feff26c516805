//! Error taxonomy shared by the store, remote client and entity models.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by entity operations (`fetch`, `save`, `get_data`).
///
/// Collections never swallow or retry these; they propagate to whoever
/// called the entity-level operation.
#[derive(Debug, Error)]
pub enum Error {
  /// Network or HTTP failure, or the response did not contain the record.
  #[error("Remote tracker unavailable: {0}")]
  RemoteUnavailable(String),

  /// A partial fetch succeeded but carried no payload for the attachment.
  #[error("Attachment {id} has no data on the server")]
  AttachmentUnavailable { id: String },

  /// Persistence layer failure (quota, corruption, constraint violation).
  #[error("Local store error: {0}")]
  Store(String),

  /// The attachment payload could not be decoded.
  #[error("Failed to decode attachment: {0}")]
  Decode(String),
}

/// Plain discriminant of [`Error`], for callers that branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  RemoteUnavailable,
  AttachmentUnavailable,
  Store,
  Decode,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
      Error::AttachmentUnavailable { .. } => ErrorKind::AttachmentUnavailable,
      Error::Store(_) => ErrorKind::Store,
      Error::Decode(_) => ErrorKind::Decode,
    }
  }

  pub(crate) fn remote(msg: impl Into<String>) -> Self {
    Error::RemoteUnavailable(msg.into())
  }

  pub(crate) fn store(msg: impl Into<String>) -> Self {
    Error::Store(msg.into())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Store(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Store(format!("Invalid stored payload: {}", e))
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Error::RemoteUnavailable(e.to_string())
  }
}

//! Entity models: one live, authoritative instance per remote record.
//!
//! Models are created by their [`Collection`](crate::collection::Collection)
//! and never by consumers. Field data lives in an internal JSON mapping read
//! through accessor methods; every local change bumps a revision stamp so a
//! fetch resolving late can tell that newer data exists.

mod attachment;
mod bug;
pub mod timeline;
mod types;
mod user;

pub use attachment::{Attachment, AttachmentData, AttachmentDeps, AttachmentKey, NewAttachment};
pub use bug::Bug;
pub use timeline::{Rendering, Timeline, TimelineEntry, TimelineItem};
pub use types::{AttachmentMeta, Comment, FieldChange, HistoryEntry};
pub use user::User;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
pub use crate::tracker::Record;

/// Prefix of locally-held annotations that are never sent to the tracker.
pub const LOCAL_PREFIX: char = '_';

/// Backing data of one entity plus its revision stamp.
#[derive(Debug, Default)]
pub struct EntityState {
  record: RwLock<Option<Record>>,
  revision: AtomicU64,
}

impl EntityState {
  pub fn new(record: Option<Record>) -> Self {
    Self {
      record: RwLock::new(record),
      revision: AtomicU64::new(0),
    }
  }

  /// Whether any data (stored or fetched) backs this entity yet.
  pub fn is_loaded(&self) -> bool {
    self
      .record
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  pub fn revision(&self) -> u64 {
    self.revision.load(Ordering::SeqCst)
  }

  pub fn snapshot(&self) -> Option<Record> {
    self
      .record
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn read<R>(&self, f: impl FnOnce(&Record) -> R) -> Option<R> {
    self
      .record
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .map(f)
  }

  /// Install data read from the store, unless something is already loaded.
  pub(crate) fn load(&self, record: Record) -> bool {
    let mut guard = self.record.write().unwrap_or_else(PoisonError::into_inner);
    if guard.is_some() {
      return false;
    }
    *guard = Some(record);
    true
  }

  /// Apply a local change. `f` works on a copy and must persist it; the copy
  /// only replaces the live record if `f` succeeds.
  pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Record) -> Result<R>) -> Result<R> {
    let applied = self.apply(None, true, f)?;
    applied.ok_or_else(|| Error::store("Entity update was not applied"))
  }

  /// Like [`update`](Self::update) but only if no other change happened
  /// since `revision` was read. Returns `None` for a stale write.
  pub(crate) fn update_if_current<R>(
    &self,
    revision: u64,
    f: impl FnOnce(&mut Record) -> Result<R>,
  ) -> Result<Option<R>> {
    self.apply(Some(revision), true, f)
  }

  /// Change local annotations only. Does not bump the revision, since
  /// fetched server data never touches annotations.
  pub(crate) fn annotate<R>(&self, f: impl FnOnce(&mut Record) -> Result<R>) -> Result<R> {
    let applied = self.apply(None, false, f)?;
    applied.ok_or_else(|| Error::store("Annotation was not applied"))
  }

  fn apply<R>(
    &self,
    expected: Option<u64>,
    bump: bool,
    f: impl FnOnce(&mut Record) -> Result<R>,
  ) -> Result<Option<R>> {
    let mut guard = self.record.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(expected) = expected {
      if self.revision.load(Ordering::SeqCst) != expected {
        return Ok(None);
      }
    }

    let mut draft = guard.clone().unwrap_or_default();
    let out = f(&mut draft)?;
    *guard = Some(draft);
    if bump {
      self.revision.fetch_add(1, Ordering::SeqCst);
    }
    Ok(Some(out))
  }
}

/// Read access over an entity's field mapping.
pub trait Fields {
  fn state(&self) -> &EntityState;

  fn is_loaded(&self) -> bool {
    self.state().is_loaded()
  }

  fn field(&self, name: &str) -> Option<Value> {
    self.state().read(|r| r.get(name).cloned()).flatten()
  }

  fn str_field(&self, name: &str) -> Option<String> {
    self
      .state()
      .read(|r| r.get(name).and_then(Value::as_str).map(String::from))
      .flatten()
  }

  fn u64_field(&self, name: &str) -> Option<u64> {
    self
      .state()
      .read(|r| r.get(name).and_then(crate::tracker::api_types::as_id))
      .flatten()
  }

  fn bool_field(&self, name: &str) -> bool {
    self
      .state()
      .read(|r| r.get(name).map(truthy).unwrap_or(false))
      .unwrap_or(false)
  }

  fn time_field(&self, name: &str) -> Option<DateTime<Utc>> {
    self.str_field(name).and_then(|s| parse_time(&s))
  }

  /// Copy of the full backing record, annotations included.
  fn snapshot(&self) -> Option<Record> {
    self.state().snapshot()
  }

  /// Copy of the record without local annotations.
  fn remote_fields(&self) -> Record {
    self
      .snapshot()
      .unwrap_or_default()
      .into_iter()
      .filter(|(k, _)| !k.starts_with(LOCAL_PREFIX))
      .collect()
  }
}

/// Tracker flags arrive as booleans or as 0/1.
pub fn truthy(value: &Value) -> bool {
  match value {
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
    Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
    _ => false,
  }
}

pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|t| t.with_timezone(&Utc))
}

/// Merge a server record into the local one: server fields win, local
/// annotations survive, fields the server omitted are kept.
pub(crate) fn merge_server_fields(local: &mut Record, server: Record) {
  for (key, value) in server {
    if key.starts_with(LOCAL_PREFIX) {
      continue;
    }
    local.insert(key, value);
  }
}

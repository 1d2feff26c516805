use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::collection::{Change, Collection, Entity, EntityContext};
use crate::db::{schema, Key};
use crate::error::{Error, Result};
use crate::model::types::{parse_list, AttachmentMeta, Comment, HistoryEntry};
use crate::model::{
  merge_server_fields, parse_time, AttachmentKey, EntityState, Fields, Record, Timeline,
};
use crate::session::Backend;
use crate::tracker::api_types::{array_of, as_id};

const LAST_VISIT: &str = "_last_visit";
const UNREAD: &str = "_unread";
const STARRED: &str = "_starred";

/// One bug: its fields plus embedded comments, attachments and history.
pub struct Bug {
  id: u64,
  state: EntityState,
  ctx: EntityContext<Bug>,
}

impl fmt::Debug for Bug {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Bug")
      .field("id", &self.id)
      .field("loaded", &self.state.is_loaded())
      .field("revision", &self.state.revision())
      .finish()
  }
}

impl Fields for Bug {
  fn state(&self) -> &EntityState {
    &self.state
  }
}

impl Entity for Bug {
  type Key = u64;
  type Deps = Arc<Backend>;

  fn entity_type() -> &'static str {
    "bug"
  }

  fn create(key: u64, record: Option<Record>, ctx: EntityContext<Self>) -> Self {
    Self {
      id: key,
      state: EntityState::new(record),
      ctx,
    }
  }

  fn key(&self) -> &u64 {
    &self.id
  }

  fn persist(&self, record: &Record) -> Result<()> {
    self
      .ctx
      .deps
      .store
      .put(schema::BUGS, &Key::try_from(self.id)?, &Value::Object(record.clone()))
  }

  fn load_many(deps: &Arc<Backend>, keys: &[u64]) -> Result<Vec<(u64, Record)>> {
    let keys = keys
      .iter()
      .copied()
      .map(Key::try_from)
      .collect::<Result<Vec<_>>>()?;
    Ok(
      deps
        .store
        .get_many(schema::BUGS, &keys)?
        .into_iter()
        .filter_map(|(key, value)| match (key, value) {
          (Key::Int(id), Value::Object(record)) => Some((u64::try_from(id).ok()?, record)),
          _ => None,
        })
        .collect(),
    )
  }
}

impl Bug {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn summary(&self) -> Option<String> {
    self.str_field("summary")
  }

  pub fn status(&self) -> Option<String> {
    self.str_field("status")
  }

  pub fn resolution(&self) -> Option<String> {
    self.str_field("resolution").filter(|r| !r.is_empty())
  }

  pub fn product(&self) -> Option<String> {
    self.str_field("product")
  }

  pub fn component(&self) -> Option<String> {
    self.str_field("component")
  }

  pub fn assigned_to(&self) -> Option<String> {
    self.str_field("assigned_to")
  }

  pub fn creator(&self) -> Option<String> {
    self.str_field("creator")
  }

  pub fn creation_time(&self) -> Option<DateTime<Utc>> {
    self.time_field("creation_time")
  }

  pub fn last_change_time(&self) -> Option<DateTime<Utc>> {
    self.time_field("last_change_time")
  }

  /// Aliases. Older records hold a single string, newer ones an array;
  /// neither is unique across bugs.
  pub fn aliases(&self) -> Vec<String> {
    match self.field("alias") {
      Some(Value::String(s)) if !s.is_empty() => vec![s],
      Some(Value::Array(items)) => items
        .iter()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect(),
      _ => Vec::new(),
    }
  }

  pub fn comments(&self) -> Vec<Comment> {
    self
      .state
      .read(|r| parse_list(r.get("comments")))
      .unwrap_or_default()
  }

  pub fn history(&self) -> Vec<HistoryEntry> {
    self
      .state
      .read(|r| parse_list(r.get("history")))
      .unwrap_or_default()
  }

  /// Attachment metadata embedded in this bug, data-less stubs included.
  pub fn attachments(&self) -> Vec<AttachmentMeta> {
    self
      .state
      .read(|r| {
        r.get("attachments")
          .and_then(Value::as_array)
          .map(|items| items.iter().filter_map(AttachmentMeta::from_value).collect())
          .unwrap_or_default()
      })
      .unwrap_or_default()
  }

  pub fn last_visit(&self) -> Option<DateTime<Utc>> {
    self.str_field(LAST_VISIT).and_then(|s| parse_time(&s))
  }

  pub fn is_unread(&self) -> bool {
    self.bool_field(UNREAD)
  }

  pub fn is_starred(&self) -> bool {
    self.bool_field(STARRED)
  }

  /// Merged timeline, with entries since the last visit marked for full rendering.
  pub fn timeline(&self) -> Timeline {
    Timeline::build(
      self.comments(),
      self.attachments(),
      self.history(),
      self.last_visit(),
    )
  }

  /// Replace local field data with the tracker's copy of this bug.
  ///
  /// A response that arrives after a newer local change is discarded.
  pub async fn fetch(self: &Arc<Self>) -> Result<Arc<Self>> {
    let revision = self.state.revision();
    let mut bugs = self.ctx.deps.remote.bugs(&[self.id], &[]).await?;
    let server = bugs
      .remove(&self.id)
      .ok_or_else(|| Error::remote(format!("Bug {} missing from response", self.id)))?;

    let applied = self.state.update_if_current(revision, |record| {
      apply_server_record(record, self.id, server);
      self.persist(record)
    })?;
    self.finish_fetch(applied.is_some());
    Ok(Arc::clone(self))
  }

  /// Fetch comments, history and attachment metadata and merge them in.
  pub async fn fetch_details(self: &Arc<Self>) -> Result<Arc<Self>> {
    let revision = self.state.revision();
    let remote = &self.ctx.deps.remote;
    let (comments, history, attachments) = tokio::try_join!(
      remote.bug_comments(self.id),
      remote.bug_history(self.id),
      remote.bug_attachments(self.id),
    )?;

    let applied = self.state.update_if_current(revision, |record| {
      record.insert("id".into(), json!(self.id));
      record.insert("comments".into(), Value::Array(comments));
      record.insert("history".into(), Value::Array(history));
      let merged = merge_attachments(record.get("attachments"), attachments);
      record.insert("attachments".into(), merged);
      self.persist(record)
    })?;
    self.finish_fetch(applied.is_some());
    Ok(Arc::clone(self))
  }

  fn finish_fetch(&self, applied: bool) {
    if applied {
      debug!(bug = self.id, "Applied fetched bug data");
      self.ctx.notify(&self.id, Change::Fetched);
      self.sync_attachments();
    } else {
      debug!(bug = self.id, "Discarding fetch result superseded by a local change");
    }
  }

  /// Persist the current in-memory data.
  pub fn save(&self) -> Result<()> {
    let record = self
      .snapshot()
      .ok_or_else(|| Error::store(format!("Bug {} has no data to save", self.id)))?;
    self.persist(&record)?;
    self.ctx.notify(&self.id, Change::Saved);
    Ok(())
  }

  /// Record a visit: sets the last-visit stamp and clears the unread flag.
  pub fn mark_visited(&self, at: DateTime<Utc>) -> Result<()> {
    self.annotate(|record| {
      record.insert(LAST_VISIT.into(), json!(at.to_rfc3339()));
      record.insert(UNREAD.into(), json!(false));
    })
  }

  pub fn mark_unread(&self) -> Result<()> {
    self.annotate(|record| {
      record.insert(UNREAD.into(), json!(true));
    })
  }

  pub fn set_starred(&self, starred: bool) -> Result<()> {
    self.annotate(|record| {
      record.insert(STARRED.into(), json!(starred));
    })
  }

  fn annotate(&self, f: impl FnOnce(&mut Record)) -> Result<()> {
    self.state.annotate(|record| {
      record.entry("id").or_insert(json!(self.id));
      f(record);
      self.persist(record)
    })?;
    self.ctx.notify(&self.id, Change::Annotated);
    Ok(())
  }

  /// Write an attachment's record into the embedded copy. Fields the
  /// attachment does not carry (an obtained payload, say) are kept.
  /// Returns the embedded copy as stored.
  pub(crate) fn upsert_attachment(&self, attachment: &Record) -> Result<Record> {
    self.embed(attachment, |existing| {
      let mut merged = existing.unwrap_or_default();
      merged.extend(attachment.clone());
      merged
    })
  }

  /// Store a downloaded payload in the embedded copy, leaving its metadata
  /// as the parent has it. `attachment` is only used when the parent does
  /// not list the attachment yet.
  pub(crate) fn attach_payload(&self, attachment: &Record, payload: &str) -> Result<Record> {
    self.embed(attachment, |existing| {
      let mut merged = existing.unwrap_or_else(|| attachment.clone());
      merged.insert("data".into(), json!(payload));
      merged
    })
  }

  fn embed(&self, attachment: &Record, f: impl FnOnce(Option<Record>) -> Record) -> Result<Record> {
    let embedded = self.state.update(|record| {
      record.entry("id").or_insert(json!(self.id));
      let mut items = record
        .get("attachments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

      let position = items.iter().position(|item| same_attachment(item, attachment));
      let existing = position.and_then(|i| items[i].as_object().cloned());
      let embedded = f(existing);
      match position {
        Some(i) => items[i] = Value::Object(embedded.clone()),
        None => items.push(Value::Object(embedded.clone())),
      }
      record.insert("attachments".into(), Value::Array(items));
      self.persist(record)?;
      Ok(embedded)
    })?;
    self.ctx.notify(&self.id, Change::Saved);
    Ok(embedded)
  }

  /// Hand the embedded copies to attachment instances that are already live.
  fn sync_attachments(&self) {
    let Some(attachments) = self.ctx.deps.attachments() else {
      return;
    };
    let items = self
      .state
      .read(|r| array_of(r.get("attachments")))
      .unwrap_or_default();

    for item in items {
      let (Some(key), Value::Object(embedded)) = (AttachmentKey::of(&item), item) else {
        continue;
      };
      if let Some(attachment) = attachments.cached(&key) {
        attachment.adopt(embedded);
      }
    }
  }
}

/// Normalise a server record and merge it into the local one.
fn apply_server_record(record: &mut Record, id: u64, mut server: Record) {
  if let Some(Value::String(alias)) = server.get("alias").cloned() {
    let alias = if alias.is_empty() {
      json!([])
    } else {
      json!([alias])
    };
    server.insert("alias".into(), alias);
  }
  if let Some(incoming) = server.remove("attachments") {
    let merged = merge_attachments(record.get("attachments"), array(incoming));
    record.insert("attachments".into(), merged);
  }
  merge_server_fields(record, server);
  record.insert("id".into(), json!(id));
}

fn array(value: Value) -> Vec<Value> {
  match value {
    Value::Array(items) => items,
    _ => Vec::new(),
  }
}

fn same_attachment(a: &Value, b: &Record) -> bool {
  match (a.get("id").and_then(as_id), b.get("id").and_then(as_id)) {
    (Some(x), Some(y)) => x == y,
    _ => match (a.get("hash").and_then(Value::as_str), b.get("hash").and_then(Value::as_str)) {
      (Some(x), Some(y)) => x == y,
      _ => false,
    },
  }
}

/// Merge server attachment stubs with the local list. Server metadata wins,
/// payloads already obtained locally are kept, and local attachments that
/// have not been uploaded yet stay in place.
fn merge_attachments(local: Option<&Value>, incoming: Vec<Value>) -> Value {
  let local: Vec<Value> = local
    .and_then(Value::as_array)
    .cloned()
    .unwrap_or_default();

  let mut merged: Vec<Value> = incoming
    .into_iter()
    .map(|mut item| {
      let id = item.get("id").and_then(as_id);
      let has_data = item.get("data").and_then(Value::as_str).is_some_and(|d| !d.is_empty());
      if let (Some(id), false, Value::Object(fields)) = (id, has_data, &mut item) {
        let kept = local
          .iter()
          .find(|l| l.get("id").and_then(as_id) == Some(id))
          .and_then(|l| l.get("data"))
          .cloned();
        if let Some(data) = kept {
          fields.insert("data".into(), data);
        }
      }
      item
    })
    .collect();

  merged.extend(
    local
      .into_iter()
      .filter(|l| l.get("id").and_then(as_id).is_none() && l.get("hash").is_some()),
  );
  Value::Array(merged)
}

impl Collection<Bug> {
  /// Load every stored bug into the collection.
  pub fn load_all(&self) -> Result<Vec<Arc<Bug>>> {
    let stored = self.deps().store.get_all(schema::BUGS)?;
    Ok(
      stored
        .into_iter()
        .filter_map(|(key, value)| match (key, value) {
          (Key::Int(id), Value::Object(record)) => Some(self.absorb(u64::try_from(id).ok()?, record)),
          _ => None,
        })
        .collect(),
    )
  }

  /// Bugs carrying `alias`. Aliases are not unique, so this may return several.
  pub fn find_by_alias(&self, alias: &str) -> Result<Vec<Arc<Bug>>> {
    Ok(
      self
        .load_all()?
        .into_iter()
        .filter(|bug| bug.aliases().iter().any(|a| a == alias))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collection::tests::{backend, record};
  use crate::collection::EntityChanged;
  use crate::tracker::transport::mock::MockTransport;
  use chrono::TimeZone;

  fn setup() -> (Arc<MockTransport>, Collection<Bug>) {
    let mock = MockTransport::new();
    let bugs = Collection::new(backend(&mock));
    (mock, bugs)
  }

  #[tokio::test]
  async fn test_fetch_stub_from_mapping_response() {
    let (mock, bugs) = setup();
    mock.respond("bug", json!({ "bugs": { "42": { "id": 42, "status": "NEW" } } }));

    let bug = bugs.get(42);
    assert_eq!(bug.id(), 42);
    let fetched = bug.fetch().await.unwrap();

    assert!(Arc::ptr_eq(&bug, &fetched));
    assert_eq!(fetched.status().as_deref(), Some("NEW"));

    let stored = bugs.deps().store.get(schema::BUGS, &Key::Int(42)).unwrap().unwrap();
    assert_eq!(stored["status"], "NEW");
  }

  #[tokio::test]
  async fn test_fetch_failure_keeps_last_known_good() {
    let (mock, bugs) = setup();
    let bug = bugs.set(9, record(json!({ "id": 9, "status": "NEW" }))).unwrap();

    mock.fail("bug", "connection reset");
    let err = bug.fetch().await.unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::RemoteUnavailable);
    assert_eq!(bug.status().as_deref(), Some("NEW"));

    mock.respond("bug", json!({ "bugs": [] }));
    let err = bug.fetch().await.unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::RemoteUnavailable);
    assert_eq!(bug.status().as_deref(), Some("NEW"));
    assert!(format!("{:?}", bug).starts_with("Bug { id: 9, loaded: true"));
  }

  #[tokio::test]
  async fn test_fetch_keeps_annotations_and_normalises_alias() {
    let (mock, bugs) = setup();
    let bug = bugs.get(3);
    let visit = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    bug.mark_visited(visit).unwrap();
    bug.set_starred(true).unwrap();

    mock.respond("bug", json!({ "bugs": [{ "id": 3, "alias": "crash-fix", "status": "NEW" }] }));
    bug.fetch().await.unwrap();

    assert_eq!(bug.aliases(), vec!["crash-fix".to_string()]);
    assert_eq!(bug.last_visit(), Some(visit));
    assert!(bug.is_starred());
    assert!(!bug.remote_fields().contains_key("_starred"));
  }

  #[tokio::test]
  async fn test_late_fetch_does_not_overwrite_newer_edit() {
    let (mock, bugs) = setup();
    let bug = bugs.set(8, record(json!({ "id": 8, "status": "NEW" }))).unwrap();
    mock.respond("bug", json!({ "bugs": [{ "id": 8, "status": "RESOLVED" }] }));
    let release = mock.hold("bug");

    let pending = tokio::spawn({
      let bug = Arc::clone(&bug);
      async move { bug.fetch().await }
    });
    while mock.call_count() == 0 {
      tokio::task::yield_now().await;
    }

    bugs.set(8, record(json!({ "id": 8, "status": "ASSIGNED" }))).unwrap();
    release.notify_one();
    pending.await.unwrap().unwrap();

    assert_eq!(bug.status().as_deref(), Some("ASSIGNED"));
    let stored = bugs.deps().store.get(schema::BUGS, &Key::Int(8)).unwrap().unwrap();
    assert_eq!(stored["status"], "ASSIGNED");
  }

  #[tokio::test]
  async fn test_fetch_details_merges_attachment_stubs() {
    let (mock, bugs) = setup();
    bugs
      .set(
        1,
        record(json!({
          "id": 1,
          "attachments": [
            { "id": 7, "bug_id": 1, "data": "aGk=", "creation_time": "2015-03-01T10:02:00Z" },
            { "hash": "abc", "bug_id": 1, "data": "eA==", "creation_time": "2015-03-01T11:00:00Z" }
          ]
        })),
      )
      .unwrap();

    mock.respond(
      "bug/1/comment",
      json!({ "bugs": { "1": { "comments": [
        { "id": 1, "count": 0, "text": "desc", "creation_time": "2015-03-01T10:00:00Z" },
        { "id": 2, "count": 1, "text": "patch", "creation_time": "2015-03-01T10:02:00Z" }
      ] } } }),
    );
    mock.respond(
      "bug/1/history",
      json!({ "bugs": [{ "id": 1, "history": [
        { "when": "2015-03-01T10:02:00Z", "who": "a", "changes": [
          { "field_name": "status", "removed": "NEW", "added": "ASSIGNED" }
        ] }
      ] }] }),
    );
    mock.respond(
      "bug/1/attachment",
      json!({ "bugs": { "1": [
        { "id": 7, "bug_id": 1, "summary": "fix", "is_patch": 1, "creation_time": "2015-03-01T10:02:00Z" }
      ] } }),
    );

    let bug = bugs.get(1);
    bug.fetch_details().await.unwrap();

    let attachments = bug.attachments();
    assert_eq!(attachments.len(), 2);
    assert!(attachments[0].has_data);
    assert_eq!(attachments[0].summary, "fix");
    assert_eq!(attachments[1].hash.as_deref(), Some("abc"));

    let timeline = bug.timeline();
    assert_eq!(timeline.len(), 3);
    let grouped = &timeline.entries()[1];
    assert_eq!(grouped.comments.len(), 1);
    assert_eq!(grouped.attachments.len(), 1);
    assert_eq!(grouped.history.len(), 1);
  }

  #[tokio::test]
  async fn test_fetch_details_partial_failure_changes_nothing() {
    let (mock, bugs) = setup();
    let bug = bugs.set(2, record(json!({ "id": 2, "comments": [] }))).unwrap();
    mock.respond("bug/2/comment", json!({ "bugs": { "2": { "comments": [] } } }));
    mock.fail("bug/2/history", "503");
    mock.respond("bug/2/attachment", json!({ "bugs": { "2": [] } }));

    assert!(bug.fetch_details().await.is_err());
    assert_eq!(bug.snapshot().unwrap(), record(json!({ "id": 2, "comments": [] })));
  }

  #[test]
  fn test_save_requires_data() {
    let (_mock, bugs) = setup();
    let err = bugs.get(11).save().unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::Store);
  }

  #[test]
  fn test_annotations_notify() {
    let (_mock, bugs) = setup();
    let bug = bugs.get(4);
    let mut events = bugs.subscribe();
    bug.mark_unread().unwrap();
    assert!(bug.is_unread());
    assert_eq!(
      events.try_recv().unwrap(),
      EntityChanged { key: 4, change: Change::Annotated }
    );
    // Annotations are not a data change
    assert_eq!(bug.state().revision(), 0);
  }

  #[test]
  fn test_load_all_and_find_by_alias() {
    let (_mock, bugs) = setup();
    let store = &bugs.deps().store;
    store.put(schema::BUGS, &Key::Int(1), &json!({ "id": 1, "alias": ["dup"] })).unwrap();
    store.put(schema::BUGS, &Key::Int(2), &json!({ "id": 2, "alias": "dup" })).unwrap();
    store.put(schema::BUGS, &Key::Int(3), &json!({ "id": 3, "alias": [] })).unwrap();

    assert_eq!(bugs.load_all().unwrap().len(), 3);
    let mut found: Vec<u64> = bugs.find_by_alias("dup").unwrap().iter().map(|b| b.id()).collect();
    found.sort_unstable();
    assert_eq!(found, vec![1, 2]);
  }
}

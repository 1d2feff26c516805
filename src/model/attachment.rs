use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::collection::{Change, Collection, Entity, EntityContext};
use crate::db::schema;
use crate::decoder::{text_projection, Blob, DecodeRequest};
use crate::error::{Error, Result};
use crate::model::{merge_server_fields, Bug, EntityState, Fields, Record};
use crate::session::Backend;
use crate::tracker::api_types::{array_of, as_id};

/// Identity of an attachment: the tracker id, or a content hash for one
/// created locally and not uploaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttachmentKey {
  Id(u64),
  Hash(String),
}

impl fmt::Display for AttachmentKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AttachmentKey::Id(id) => write!(f, "{}", id),
      AttachmentKey::Hash(hash) => write!(f, "hash:{}", hash),
    }
  }
}

impl From<u64> for AttachmentKey {
  fn from(id: u64) -> Self {
    AttachmentKey::Id(id)
  }
}

impl AttachmentKey {
  pub(crate) fn of(record: &Value) -> Option<Self> {
    if let Some(id) = record.get("id").and_then(as_id) {
      return Some(AttachmentKey::Id(id));
    }
    record
      .get("hash")
      .and_then(Value::as_str)
      .map(|h| AttachmentKey::Hash(h.to_string()))
  }
}

/// Services an attachment needs: the backend plus the bug collection that
/// holds the parent copies.
#[derive(Clone)]
pub struct AttachmentDeps {
  pub backend: Arc<Backend>,
  pub bugs: Collection<Bug>,
}

/// Decoded attachment content.
#[derive(Debug, Clone)]
pub struct AttachmentData {
  pub binary: Vec<u8>,
  pub blob: Blob,
  /// UTF-8 projection, only for textual content and patches
  pub text: Option<String>,
}

/// A file to attach locally before upload.
#[derive(Debug, Clone)]
pub struct NewAttachment {
  pub bug_id: u64,
  pub file_name: String,
  pub summary: String,
  pub content_type: String,
  pub is_patch: bool,
  /// Base64-encoded payload
  pub data: String,
}

pub struct Attachment {
  key: AttachmentKey,
  state: EntityState,
  ctx: EntityContext<Attachment>,
}

impl fmt::Debug for Attachment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Attachment")
      .field("key", &self.key)
      .field("loaded", &self.state.is_loaded())
      .field("revision", &self.state.revision())
      .finish()
  }
}

impl Fields for Attachment {
  fn state(&self) -> &EntityState {
    &self.state
  }
}

impl Entity for Attachment {
  type Key = AttachmentKey;
  type Deps = AttachmentDeps;

  fn entity_type() -> &'static str {
    "attachment"
  }

  fn create(key: AttachmentKey, record: Option<Record>, ctx: EntityContext<Self>) -> Self {
    Self {
      key,
      state: EntityState::new(record),
      ctx,
    }
  }

  fn key(&self) -> &AttachmentKey {
    &self.key
  }

  /// Attachments live inside their parent bug's record; persisting one
  /// rewrites the parent's embedded copy and re-persists the parent.
  fn persist(&self, record: &Record) -> Result<()> {
    self.embed(record).map(drop)
  }

  /// Embedded copies of `keys`. Live parent bugs are searched first; the
  /// stored bugs are only scanned for keys still missing.
  fn load_many(deps: &AttachmentDeps, keys: &[AttachmentKey]) -> Result<Vec<(AttachmentKey, Record)>> {
    let mut wanted = keys.to_vec();
    let mut found = Vec::new();

    for bug_id in deps.bugs.keys() {
      if wanted.is_empty() {
        return Ok(found);
      }
      let Some(bug) = deps.bugs.cached(&bug_id) else {
        continue;
      };
      if let Some(items) = bug.state().read(|r| array_of(r.get("attachments"))) {
        collect_embedded(&items, &mut wanted, &mut found);
      }
    }
    if wanted.is_empty() {
      return Ok(found);
    }

    for (_, bug) in deps.backend.store.get_all(schema::BUGS)? {
      collect_embedded(&array_of(bug.get("attachments")), &mut wanted, &mut found);
      if wanted.is_empty() {
        break;
      }
    }
    Ok(found)
  }
}

/// Move the items of `items` matching a `wanted` key into `found`.
fn collect_embedded(
  items: &[Value],
  wanted: &mut Vec<AttachmentKey>,
  found: &mut Vec<(AttachmentKey, Record)>,
) {
  for item in items {
    let (Some(key), Value::Object(record)) = (AttachmentKey::of(item), item) else {
      continue;
    };
    if let Some(position) = wanted.iter().position(|k| *k == key) {
      wanted.swap_remove(position);
      found.push((key, record.clone()));
    }
  }
}

impl Attachment {
  pub fn id(&self) -> Option<u64> {
    match self.key {
      AttachmentKey::Id(id) => Some(id),
      AttachmentKey::Hash(_) => None,
    }
  }

  pub fn bug_id(&self) -> Option<u64> {
    self.u64_field("bug_id")
  }

  pub fn file_name(&self) -> Option<String> {
    self.str_field("file_name")
  }

  pub fn summary(&self) -> Option<String> {
    self.str_field("summary")
  }

  pub fn content_type(&self) -> Option<String> {
    self.str_field("content_type")
  }

  pub fn is_patch(&self) -> bool {
    self.bool_field("is_patch")
  }

  pub fn is_obsolete(&self) -> bool {
    self.bool_field("is_obsolete")
  }

  pub fn flags(&self) -> Vec<Value> {
    match self.field("flags") {
      Some(Value::Array(flags)) => flags,
      _ => Vec::new(),
    }
  }

  /// Whether the base64 payload has been obtained.
  pub fn has_data(&self) -> bool {
    self.payload().is_some()
  }

  fn payload(&self) -> Option<String> {
    self.str_field("data").filter(|d| !d.is_empty())
  }

  fn parent(&self, bug_id: u64) -> Result<Arc<Bug>> {
    self
      .ctx
      .deps
      .bugs
      .get_many(&[bug_id])?
      .remove(&bug_id)
      .ok_or_else(|| Error::store(format!("Parent bug {} unavailable", bug_id)))
  }

  /// Write `record` into the parent bug and return the embedded copy.
  fn embed(&self, record: &Record) -> Result<Record> {
    let bug_id = record
      .get("bug_id")
      .and_then(as_id)
      .ok_or_else(|| Error::store(format!("Attachment {} has no parent bug", self.key)))?;
    self.parent(bug_id)?.upsert_attachment(record)
  }

  /// Take over the parent's embedded copy after the parent was refreshed.
  pub(crate) fn adopt(&self, embedded: Record) {
    let applied = self.state.update(|record| {
      *record = embedded;
      Ok(())
    });
    if applied.is_ok() {
      self.ctx.notify(&self.key, Change::Fetched);
    }
  }

  /// Fill an uninitialised instance from the stored parent copy.
  fn load_stored(&self) -> Result<()> {
    if self.is_loaded() {
      return Ok(());
    }
    let stored = Self::load_many(&self.ctx.deps, std::slice::from_ref(&self.key))?;
    if let Some((_, record)) = stored.into_iter().next() {
      if self.state.load(record) {
        self.ctx.notify(&self.key, Change::Loaded);
      }
    }
    Ok(())
  }

  fn remote_id(&self) -> Result<u64> {
    self
      .id()
      .ok_or_else(|| Error::remote(format!("Attachment {} is not uploaded yet", self.key)))
  }

  /// Replace metadata with the tracker's copy. An obtained payload is kept.
  pub async fn fetch(self: &Arc<Self>) -> Result<Arc<Self>> {
    let id = self.remote_id()?;
    let revision = self.state.revision();
    let server = self
      .ctx
      .deps
      .backend
      .remote
      .attachment(id, &[])
      .await?
      .ok_or_else(|| Error::remote(format!("Attachment {} missing from response", id)))?;

    let applied = self.state.update_if_current(revision, |record| {
      merge_server_fields(record, server);
      *record = self.embed(record)?;
      Ok(())
    })?;
    if applied.is_some() {
      self.ctx.notify(&self.key, Change::Fetched);
    } else {
      debug!(attachment = %self.key, "Discarding fetch result superseded by a local change");
    }
    Ok(Arc::clone(self))
  }

  /// Persist the current data, updating the parent bug's copy in the same step.
  pub fn save(&self) -> Result<()> {
    let record = self
      .snapshot()
      .ok_or_else(|| Error::store(format!("Attachment {} has no data to save", self.key)))?;
    self.persist(&record)?;
    self.ctx.notify(&self.key, Change::Saved);
    Ok(())
  }

  /// Binary and text content. Downloads the payload once; later calls
  /// decode the local copy without touching the network.
  pub async fn get_data(self: &Arc<Self>) -> Result<AttachmentData> {
    self.load_stored()?;
    let payload = match self.payload() {
      Some(payload) => payload,
      None => self.download().await?,
    };

    let content_type = self
      .content_type()
      .unwrap_or_else(|| "application/octet-stream".to_string());
    let decoded = self
      .ctx
      .deps
      .backend
      .decoder
      .decode(DecodeRequest {
        str: payload,
        content_type: content_type.clone(),
      })
      .await?;

    let text = text_projection(&decoded.binary, &content_type, self.is_patch());
    Ok(AttachmentData {
      binary: decoded.binary,
      blob: decoded.blob,
      text,
    })
  }

  /// Fetch only the payload, store it in this instance and persist it.
  /// Metadata is fetched first when the parent bug is not known yet.
  async fn download(self: &Arc<Self>) -> Result<String> {
    let id = self.id().ok_or_else(|| Error::AttachmentUnavailable {
      id: self.key.to_string(),
    })?;
    if self.bug_id().is_none() {
      self.fetch().await?;
      if let Some(payload) = self.payload() {
        return Ok(payload);
      }
    }
    let bug_id = self
      .bug_id()
      .ok_or_else(|| Error::store(format!("Attachment {} has no parent bug", id)))?;

    info!(attachment = id, bug = bug_id, "Downloading attachment payload");
    let unavailable = || Error::AttachmentUnavailable { id: id.to_string() };
    let payload = self
      .ctx
      .deps
      .backend
      .remote
      .attachment(id, &["data"])
      .await?
      .ok_or_else(unavailable)?
      .get("data")
      .and_then(Value::as_str)
      .filter(|d| !d.is_empty())
      .map(String::from)
      .ok_or_else(unavailable)?;

    let parent = self.parent(bug_id)?;
    self.state.update(|record| {
      *record = parent.attach_payload(record, &payload)?;
      Ok(())
    })?;
    self.ctx.notify(&self.key, Change::Saved);
    Ok(payload)
  }
}

impl Collection<Attachment> {
  /// Attachment registry over `bugs`. Fetching a bug refreshes the live
  /// attachments it embeds.
  pub fn for_bugs(bugs: &Collection<Bug>) -> Self {
    let backend = Arc::clone(bugs.deps());
    let attachments = Collection::new(AttachmentDeps {
      backend: Arc::clone(&backend),
      bugs: bugs.clone(),
    });
    backend.register_attachments(&attachments);
    attachments
  }

  /// Register a local attachment keyed by the hash of its payload and
  /// persist it into the parent bug.
  pub fn create_local(&self, new: NewAttachment) -> Result<Arc<Attachment>> {
    let hash = hex::encode(Sha256::digest(new.data.as_bytes()));
    let size = base64_len(&new.data);
    let record = json!({
      "hash": hash,
      "bug_id": new.bug_id,
      "file_name": new.file_name,
      "summary": new.summary,
      "content_type": new.content_type,
      "is_patch": new.is_patch,
      "is_obsolete": false,
      "size": size,
      "creation_time": Utc::now().to_rfc3339(),
      "data": new.data,
    });
    let Value::Object(record) = record else {
      return Err(Error::store("Attachment record is not an object"));
    };
    self.set(AttachmentKey::Hash(hash), record)
  }
}

/// Decoded size of a base64 payload.
fn base64_len(data: &str) -> usize {
  let len = data.chars().filter(|c| !c.is_ascii_whitespace()).count();
  let padding = data.trim_end().chars().rev().take_while(|c| *c == '=').count();
  (len / 4 * 3).saturating_sub(padding)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collection::tests::{backend, record};
  use crate::db::Key;
  use crate::tracker::transport::mock::MockTransport;

  struct Fixture {
    mock: Arc<MockTransport>,
    bugs: Collection<Bug>,
    attachments: Collection<Attachment>,
  }

  fn setup() -> Fixture {
    let mock = MockTransport::new();
    let bugs = Collection::new(backend(&mock));
    let attachments = Collection::<Attachment>::for_bugs(&bugs);
    Fixture {
      mock,
      bugs,
      attachments,
    }
  }

  fn stub(id: u64, bug_id: u64, content_type: &str) -> Value {
    json!({
      "id": id, "bug_id": bug_id, "content_type": content_type,
      "file_name": "file", "creation_time": "2015-03-01T10:00:00Z"
    })
  }

  #[test]
  fn test_save_updates_parent_copy() {
    let f = setup();
    f.bugs
      .set(42, record(json!({ "id": 42, "attachments": [stub(7, 42, "text/plain")] })))
      .unwrap();

    let mut data = record(stub(7, 42, "text/plain"));
    data.insert("data".into(), json!("aGVsbG8="));
    let attachment = f.attachments.get(AttachmentKey::Id(7));
    attachment.state().update(|r| {
      *r = data;
      Ok(())
    })
    .unwrap();
    attachment.save().unwrap();

    let parent = f.bugs.get(42);
    assert!(parent.attachments()[0].has_data);
    let stored = f.bugs.deps().store.get(schema::BUGS, &Key::Int(42)).unwrap().unwrap();
    assert_eq!(stored["attachments"][0]["data"], "aGVsbG8=");
    assert_eq!(stored["attachments"].as_array().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_get_data_downloads_once() {
    let f = setup();
    f.bugs
      .set(42, record(json!({ "id": 42, "attachments": [stub(7, 42, "text/x-patch")] })))
      .unwrap();
    f.mock.respond(
      "bug/attachment/7",
      json!({ "attachments": { "7": { "data": "ZGlmZg==" } } }),
    );

    let attachment = f
      .attachments
      .get_many(&[AttachmentKey::Id(7)])
      .unwrap()
      .remove(&AttachmentKey::Id(7))
      .unwrap();
    assert_eq!(attachment.bug_id(), Some(42));

    let first = attachment.get_data().await.unwrap();
    assert_eq!(first.binary, b"diff");
    assert_eq!(first.text.as_deref(), Some("diff"));
    assert_eq!(f.mock.call_count(), 1);
    assert_eq!(
      f.mock.calls_to("bug/attachment/7")[0],
      vec![("include_fields".to_string(), "data".to_string())]
    );

    let second = attachment.get_data().await.unwrap();
    assert_eq!(second.binary, b"diff");
    assert_eq!(f.mock.call_count(), 1);

    // The payload reached the parent bug's stored copy
    let stored = f.bugs.deps().store.get(schema::BUGS, &Key::Int(42)).unwrap().unwrap();
    assert_eq!(stored["attachments"][0]["data"], "ZGlmZg==");
  }

  #[tokio::test]
  async fn test_binary_content_has_no_text() {
    let f = setup();
    let mut data = record(stub(3, 1, "image/png"));
    data.insert("data".into(), json!("iVBORw=="));
    let attachment = f.attachments.set(AttachmentKey::Id(3), data).unwrap();

    let content = attachment.get_data().await.unwrap();
    assert!(content.text.is_none());
    assert_eq!(content.blob.content_type, "image/png");
    assert_eq!(f.mock.call_count(), 0);
  }

  #[tokio::test]
  async fn test_missing_payload_is_attachment_unavailable() {
    let f = setup();
    f.bugs
      .set(5, record(json!({ "id": 5, "attachments": [stub(7, 5, "text/plain")] })))
      .unwrap();
    f.mock.respond("bug/attachment/7", json!({ "attachments": { "7": {} } }));

    let attachment = f.attachments.get_many(&[AttachmentKey::Id(7)]).unwrap()[&AttachmentKey::Id(7)].clone();
    let err = attachment.get_data().await.unwrap_err();

    assert_eq!(err.kind(), crate::ErrorKind::AttachmentUnavailable);
    assert!(!attachment.has_data());
    assert!(!f.bugs.get(5).attachments()[0].has_data);
  }

  #[tokio::test]
  async fn test_unknown_parent_fetches_metadata_first() {
    let f = setup();
    f.mock.queue(
      "bug/attachment/9",
      json!({ "attachments": { "9": {
        "id": 9, "bug_id": 77, "content_type": "text/plain",
        "file_name": "log.txt", "creation_time": "2015-03-01T10:00:00Z"
      } } }),
    );
    f.mock.queue("bug/attachment/9", json!({ "attachments": { "9": { "data": "eA==" } } }));

    let attachment = f.attachments.get(AttachmentKey::Id(9));
    let content = attachment.get_data().await.unwrap();
    assert_eq!(content.text.as_deref(), Some("x"));

    let calls = f.mock.calls_to("bug/attachment/9");
    assert_eq!(calls[0], vec![("exclude_fields".to_string(), "data".to_string())]);
    assert_eq!(calls[1], vec![("include_fields".to_string(), "data".to_string())]);

    // The embedded copy is complete enough to show up everywhere
    let parent = f.bugs.get(77);
    let embedded = parent.attachments();
    assert_eq!(embedded.len(), 1);
    assert!(embedded[0].has_data);
    assert_eq!(embedded[0].file_name, "log.txt");
    assert_eq!(parent.timeline().len(), 1);
  }

  #[tokio::test]
  async fn test_get_data_uses_stored_parent_copy() {
    let f = setup();
    let mut embedded = stub(7, 42, "text/plain");
    embedded["data"] = json!("aGk=");
    f.bugs
      .deps()
      .store
      .put(schema::BUGS, &Key::Int(42), &json!({ "id": 42, "attachments": [embedded] }))
      .unwrap();

    let attachment = f.attachments.get(AttachmentKey::Id(7));
    assert!(!attachment.is_loaded());
    let content = attachment.get_data().await.unwrap();

    assert_eq!(content.binary, b"hi");
    assert_eq!(f.mock.call_count(), 0);
    assert_eq!(attachment.bug_id(), Some(42));
  }

  #[tokio::test]
  async fn test_parent_refresh_reaches_live_attachment() {
    let f = setup();
    let mut old = stub(7, 1, "text/plain");
    old["summary"] = json!("old");
    f.bugs.set(1, record(json!({ "id": 1, "attachments": [old] }))).unwrap();
    let attachment = f.attachments.get_many(&[AttachmentKey::Id(7)]).unwrap()[&AttachmentKey::Id(7)].clone();
    assert_eq!(attachment.summary().as_deref(), Some("old"));

    let mut new = stub(7, 1, "text/plain");
    new["summary"] = json!("new");
    new["is_obsolete"] = json!(1);
    f.mock.respond("bug/1/comment", json!({ "bugs": { "1": { "comments": [] } } }));
    f.mock.respond("bug/1/history", json!({ "bugs": [{ "id": 1, "history": [] }] }));
    f.mock.respond("bug/1/attachment", json!({ "bugs": { "1": [new] } }));
    f.bugs.get(1).fetch_details().await.unwrap();

    assert_eq!(attachment.summary().as_deref(), Some("new"));
    assert!(attachment.is_obsolete());

    f.mock.respond("bug/attachment/7", json!({ "attachments": { "7": { "data": "aGk=" } } }));
    attachment.get_data().await.unwrap();

    let stored = f.bugs.deps().store.get(schema::BUGS, &Key::Int(1)).unwrap().unwrap();
    assert_eq!(stored["attachments"][0]["summary"], "new");
    assert_eq!(stored["attachments"][0]["is_obsolete"], 1);
    assert_eq!(stored["attachments"][0]["data"], "aGk=");
  }

  #[tokio::test]
  async fn test_download_keeps_parent_metadata() {
    let f = setup();
    let mut old = stub(7, 1, "text/plain");
    old["summary"] = json!("old");
    f.bugs.set(1, record(json!({ "id": 1, "attachments": [old] }))).unwrap();
    let attachment = f.attachments.get_many(&[AttachmentKey::Id(7)]).unwrap()[&AttachmentKey::Id(7)].clone();

    // The parent changes without the live attachment hearing about it
    let mut new = stub(7, 1, "text/plain");
    new["summary"] = json!("new");
    f.bugs.set(1, record(json!({ "id": 1, "attachments": [new] }))).unwrap();

    f.mock.respond("bug/attachment/7", json!({ "attachments": { "7": { "data": "aGk=" } } }));
    attachment.get_data().await.unwrap();

    let stored = f.bugs.deps().store.get(schema::BUGS, &Key::Int(1)).unwrap().unwrap();
    assert_eq!(stored["attachments"][0]["summary"], "new");
    assert_eq!(stored["attachments"][0]["data"], "aGk=");
    assert_eq!(attachment.summary().as_deref(), Some("new"));
  }

  #[test]
  fn test_load_many_prefers_live_parents() {
    let f = setup();
    f.bugs
      .set(1, record(json!({ "id": 1, "attachments": [stub(7, 1, "text/plain")] })))
      .unwrap();
    assert!(f.bugs.deps().store.delete(schema::BUGS, &Key::Int(1)).unwrap());

    let found = f.attachments.get_many(&[AttachmentKey::Id(7)]).unwrap();
    assert_eq!(found[&AttachmentKey::Id(7)].bug_id(), Some(1));
  }

  #[tokio::test]
  async fn test_fetch_keeps_payload() {
    let f = setup();
    let mut data = record(stub(7, 42, "text/plain"));
    data.insert("data".into(), json!("aGk="));
    let attachment = f.attachments.set(AttachmentKey::Id(7), data).unwrap();

    f.mock.respond(
      "bug/attachment/7",
      json!({ "attachments": { "7": { "id": 7, "bug_id": 42, "summary": "log", "is_obsolete": 1 } } }),
    );
    attachment.fetch().await.unwrap();

    assert_eq!(attachment.summary().as_deref(), Some("log"));
    assert!(attachment.is_obsolete());
    assert!(attachment.has_data());
  }

  #[test]
  fn test_create_local_persists_into_parent() {
    let f = setup();
    f.bugs.set(1, record(json!({ "id": 1 }))).unwrap();

    let attachment = f
      .attachments
      .create_local(NewAttachment {
        bug_id: 1,
        file_name: "notes.txt".into(),
        summary: "notes".into(),
        content_type: "text/plain".into(),
        is_patch: false,
        data: "aGVsbG8=".into(),
      })
      .unwrap();

    assert!(matches!(attachment.key(), AttachmentKey::Hash(_)));
    assert_eq!(attachment.id(), None);
    let embedded = f.bugs.get(1).attachments();
    assert_eq!(embedded.len(), 1);
    assert_eq!(embedded[0].size, Some(5));
    assert!(embedded[0].hash.is_some());
  }

  #[tokio::test]
  async fn test_local_attachment_cannot_fetch() {
    let f = setup();
    let attachment = f.attachments.get(AttachmentKey::Hash("abc".into()));
    let err = attachment.fetch().await.unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::RemoteUnavailable);
    assert!(format!("{:?}", attachment).contains(r#"Hash("abc")"#));
  }
}

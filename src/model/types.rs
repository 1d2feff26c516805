//! Typed read-only views of the immutable facts embedded in a bug record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use super::truthy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
  pub id: Option<u64>,
  /// Position in the bug's comment list (0 is the description)
  pub count: Option<u64>,
  pub creator: Option<String>,
  pub creation_time: DateTime<Utc>,
  #[serde(default)]
  pub text: String,
  pub attachment_id: Option<u64>,
  #[serde(default, deserialize_with = "flag")]
  pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
  pub field_name: String,
  #[serde(default)]
  pub removed: String,
  #[serde(default)]
  pub added: String,
  pub attachment_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
  pub when: DateTime<Utc>,
  #[serde(default)]
  pub who: String,
  #[serde(default)]
  pub changes: Vec<FieldChange>,
}

/// Attachment metadata as embedded in a bug. `data` is deliberately not
/// part of this view; `has_data` says whether it has been obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
  pub id: Option<u64>,
  /// Content hash of a local attachment that is not uploaded yet
  pub hash: Option<String>,
  pub bug_id: Option<u64>,
  #[serde(default)]
  pub file_name: String,
  #[serde(default)]
  pub summary: String,
  #[serde(default)]
  pub content_type: String,
  #[serde(default, deserialize_with = "flag")]
  pub is_patch: bool,
  #[serde(default, deserialize_with = "flag")]
  pub is_obsolete: bool,
  pub size: Option<u64>,
  pub creator: Option<String>,
  pub creation_time: DateTime<Utc>,
  #[serde(default)]
  pub flags: Vec<Value>,
  #[serde(skip)]
  pub has_data: bool,
}

impl AttachmentMeta {
  pub(crate) fn from_value(value: &Value) -> Option<Self> {
    let mut meta: AttachmentMeta = parse_item(value)?;
    meta.has_data = value
      .get("data")
      .and_then(Value::as_str)
      .is_some_and(|d| !d.is_empty());
    Some(meta)
  }
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Value::deserialize(deserializer)?;
  Ok(truthy(&value))
}

/// Deserialize one embedded item, skipping (and logging) malformed ones.
pub(crate) fn parse_item<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
  match serde_json::from_value(value.clone()) {
    Ok(item) => Some(item),
    Err(e) => {
      warn!(error = %e, "Skipping malformed embedded record");
      None
    }
  }
}

/// Deserialize every well-formed element of an array field.
pub(crate) fn parse_list<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
  value
    .and_then(Value::as_array)
    .map(|items| items.iter().filter_map(parse_item).collect())
    .unwrap_or_default()
}

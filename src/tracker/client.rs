use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tracker::api_types::{array_of, entry_for, records, Record};
use crate::tracker::transport::Transport;

/// Typed endpoints of the tracker REST API.
#[derive(Clone)]
pub struct RemoteClient {
  transport: Arc<dyn Transport>,
}

impl RemoteClient {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  async fn get(&self, path: &str, query: Vec<(String, String)>) -> Result<Value> {
    self.transport.request(path, &query).await
  }

  /// Fetch bugs by id. A non-empty `fields` limits the response to those fields.
  pub async fn bugs(&self, ids: &[u64], fields: &[&str]) -> Result<BTreeMap<u64, Record>> {
    let ids: Vec<String> = ids.iter().map(u64::to_string).collect();
    let mut query = vec![("id".to_string(), ids.join(","))];
    if !fields.is_empty() {
      query.push(("include_fields".to_string(), fields.join(",")));
    }

    let body = self.get("bug", query).await?;
    Ok(records(body.get("bugs")))
  }

  pub async fn bug_comments(&self, id: u64) -> Result<Vec<Value>> {
    let body = self.get(&format!("bug/{}/comment", id), Vec::new()).await?;
    let entry = entry_for(body.get("bugs"), id)
      .ok_or_else(|| Error::remote(format!("Comments for bug {} missing from response", id)))?;
    Ok(array_of(entry.get("comments")))
  }

  pub async fn bug_history(&self, id: u64) -> Result<Vec<Value>> {
    let body = self.get(&format!("bug/{}/history", id), Vec::new()).await?;
    let entry = entry_for(body.get("bugs"), id)
      .ok_or_else(|| Error::remote(format!("History for bug {} missing from response", id)))?;
    Ok(array_of(entry.get("history")))
  }

  /// Attachment metadata for a bug, payloads excluded.
  pub async fn bug_attachments(&self, id: u64) -> Result<Vec<Value>> {
    let query = vec![("exclude_fields".to_string(), "data".to_string())];
    let body = self.get(&format!("bug/{}/attachment", id), query).await?;
    let entry = entry_for(body.get("bugs"), id)
      .ok_or_else(|| Error::remote(format!("Attachments for bug {} missing from response", id)))?;
    Ok(array_of(Some(entry)))
  }

  /// One attachment limited to `fields`, or its metadata when `fields` is
  /// empty. `None` when the response does not mention the id.
  pub async fn attachment(&self, id: u64, fields: &[&str]) -> Result<Option<Record>> {
    let query = if fields.is_empty() {
      vec![("exclude_fields".to_string(), "data".to_string())]
    } else {
      vec![("include_fields".to_string(), fields.join(","))]
    };
    let body = self.get(&format!("bug/attachment/{}", id), query).await?;
    Ok(records(body.get("attachments")).remove(&id))
  }

  /// Users by login name.
  pub async fn users(&self, names: &[&str]) -> Result<BTreeMap<String, Record>> {
    let query = names
      .iter()
      .map(|n| ("names".to_string(), n.to_string()))
      .collect();
    let body = self.get("user", query).await?;

    let mut out = BTreeMap::new();
    for record in records(body.get("users")).into_values() {
      if let Some(name) = record.get("name").and_then(Value::as_str).map(String::from) {
        out.insert(name, record);
      }
    }
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tracker::transport::mock::MockTransport;
  use serde_json::json;

  #[tokio::test]
  async fn test_bugs_with_fields() {
    let mock = MockTransport::new();
    mock.respond("bug", json!({ "bugs": [{ "id": 1, "status": "NEW" }] }));
    let client = RemoteClient::new(mock.clone());

    let bugs = client.bugs(&[1, 2], &["status"]).await.unwrap();
    assert_eq!(bugs[&1]["status"], "NEW");

    let query = &mock.calls_to("bug")[0];
    assert!(query.contains(&("id".to_string(), "1,2".to_string())));
    assert!(query.contains(&("include_fields".to_string(), "status".to_string())));
  }

  #[tokio::test]
  async fn test_comments_missing_bug_is_remote_error() {
    let mock = MockTransport::new();
    mock.respond("bug/5/comment", json!({ "bugs": {} }));
    let client = RemoteClient::new(mock);

    let err = client.bug_comments(5).await.unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::RemoteUnavailable);
  }

  #[tokio::test]
  async fn test_attachment_partial_fields() {
    let mock = MockTransport::new();
    mock.respond(
      "bug/attachment/7",
      json!({ "attachments": { "7": { "data": "aGk=" } }, "bugs": {} }),
    );
    let client = RemoteClient::new(mock.clone());

    let record = client.attachment(7, &["data"]).await.unwrap().unwrap();
    assert_eq!(record["data"], "aGk=");
    assert_eq!(
      mock.calls_to("bug/attachment/7")[0],
      vec![("include_fields".to_string(), "data".to_string())]
    );
  }

  #[tokio::test]
  async fn test_users_keyed_by_name() {
    let mock = MockTransport::new();
    mock.respond(
      "user",
      json!({ "users": [{ "id": 3, "name": "dev@example.org", "real_name": "Dev" }] }),
    );
    let client = RemoteClient::new(mock);

    let users = client.users(&["dev@example.org"]).await.unwrap();
    assert_eq!(users["dev@example.org"]["real_name"], "Dev");
  }
}

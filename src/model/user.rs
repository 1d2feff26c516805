use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::collection::{Change, Collection, Entity, EntityContext};
use crate::db::{schema, Key};
use crate::error::{Error, Result};
use crate::model::{merge_server_fields, EntityState, Fields, Record};
use crate::session::Backend;

/// A tracker account, keyed by login name.
pub struct User {
  name: String,
  state: EntityState,
  ctx: EntityContext<User>,
}

impl fmt::Debug for User {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("User")
      .field("name", &self.name)
      .field("loaded", &self.state.is_loaded())
      .finish()
  }
}

impl Fields for User {
  fn state(&self) -> &EntityState {
    &self.state
  }
}

impl Entity for User {
  type Key = String;
  type Deps = Arc<Backend>;

  fn entity_type() -> &'static str {
    "user"
  }

  fn create(key: String, record: Option<Record>, ctx: EntityContext<Self>) -> Self {
    Self {
      name: key,
      state: EntityState::new(record),
      ctx,
    }
  }

  fn key(&self) -> &String {
    &self.name
  }

  fn persist(&self, record: &Record) -> Result<()> {
    self.ctx.deps.store.put(
      schema::USERS,
      &Key::from(self.name.as_str()),
      &Value::Object(record.clone()),
    )
  }

  fn load_many(deps: &Arc<Backend>, keys: &[String]) -> Result<Vec<(String, Record)>> {
    let keys: Vec<Key> = keys.iter().map(|k| Key::from(k.as_str())).collect();
    Ok(
      deps
        .store
        .get_many(schema::USERS, &keys)?
        .into_iter()
        .filter_map(|(key, value)| match (key, value) {
          (Key::Text(name), Value::Object(record)) => Some((name, record)),
          _ => None,
        })
        .collect(),
    )
  }
}

impl User {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn id(&self) -> Option<u64> {
    self.u64_field("id")
  }

  pub fn real_name(&self) -> Option<String> {
    self.str_field("real_name").filter(|n| !n.is_empty())
  }

  pub fn email(&self) -> Option<String> {
    self.str_field("email").filter(|e| !e.is_empty())
  }

  pub fn nick(&self) -> Option<String> {
    self.str_field("nick").filter(|n| !n.is_empty())
  }

  /// Real name when known, otherwise the login name.
  pub fn display_name(&self) -> String {
    self.real_name().unwrap_or_else(|| self.name.clone())
  }

  /// Gravatar URL for the account's email (falls back to the login name).
  pub fn avatar_url(&self, size: u32) -> String {
    let email = self.email().unwrap_or_else(|| self.name.clone());
    let hash = hex::encode(Sha256::digest(email.trim().to_lowercase().as_bytes()));
    format!("https://www.gravatar.com/avatar/{}?s={}&d=blank", hash, size)
  }

  /// Replace the account's data with the tracker's copy.
  pub async fn fetch(self: &Arc<Self>) -> Result<Arc<Self>> {
    let revision = self.state.revision();
    let mut found = self.ctx.deps.remote.users(&[self.name.as_str()]).await?;
    let server = found
      .remove(&self.name)
      .ok_or_else(|| Error::remote(format!("User {} missing from response", self.name)))?;

    let applied = self.state.update_if_current(revision, |record| {
      merge_server_fields(record, server);
      record.insert("name".into(), json!(self.name));
      self.persist(record)
    })?;
    if applied.is_some() {
      self.ctx.notify(&self.name, Change::Fetched);
    } else {
      debug!(user = %self.name, "Discarding fetch result superseded by a local change");
    }
    Ok(Arc::clone(self))
  }

  pub fn save(&self) -> Result<()> {
    let record = self
      .snapshot()
      .ok_or_else(|| Error::store(format!("User {} has no data to save", self.name)))?;
    self.persist(&record)?;
    self.ctx.notify(&self.name, Change::Saved);
    Ok(())
  }
}

impl Collection<User> {
  /// The user with numeric account id `id`, looked up through the store's
  /// unique id index.
  pub fn get_by_id(&self, id: u64) -> Result<Option<Arc<User>>> {
    let found = self
      .deps()
      .store
      .get_by_index(schema::USERS, "id", &json!(id))?;
    Ok(found.into_iter().find_map(|(key, value)| match (key, value) {
      (Key::Text(name), Value::Object(record)) => Some(self.absorb(name, record)),
      _ => None,
    }))
  }
}

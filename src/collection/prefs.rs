use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::collection::{Change, EntityChanged};
use crate::db::{schema, Key};
use crate::error::Result;
use crate::session::Backend;

/// Account-wide name/value preferences, persisted in the `prefs` store.
#[derive(Clone)]
pub struct Prefs {
  backend: Arc<Backend>,
  events: broadcast::Sender<EntityChanged<String>>,
}

impl Prefs {
  pub fn new(backend: Arc<Backend>) -> Self {
    let (events, _) = broadcast::channel(64);
    Self { backend, events }
  }

  pub fn get(&self, name: &str) -> Result<Option<Value>> {
    self.backend.store.get(schema::PREFS, &Key::from(name))
  }

  pub fn set(&self, name: &str, value: Value) -> Result<()> {
    self.backend.store.put(schema::PREFS, &Key::from(name), &value)?;
    self.notify(name, Change::Saved);
    Ok(())
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    let removed = self.backend.store.delete(schema::PREFS, &Key::from(name))?;
    if removed {
      self.notify(name, Change::Deleted);
    }
    Ok(removed)
  }

  pub fn all(&self) -> Result<BTreeMap<String, Value>> {
    Ok(
      self
        .backend
        .store
        .get_all(schema::PREFS)?
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect(),
    )
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EntityChanged<String>> {
    self.events.subscribe()
  }

  fn notify(&self, name: &str, change: Change) {
    let _ = self.events.send(EntityChanged {
      key: name.to_string(),
      change,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collection::tests::backend;
  use crate::tracker::transport::mock::MockTransport;
  use serde_json::json;

  #[test]
  fn test_set_get_delete() {
    let prefs = Prefs::new(backend(&MockTransport::new()));
    let mut events = prefs.subscribe();

    prefs.set("ui.theme", json!("dark")).unwrap();
    prefs.set("notifications", json!({ "enabled": true })).unwrap();
    assert_eq!(prefs.get("ui.theme").unwrap(), Some(json!("dark")));
    assert_eq!(prefs.all().unwrap().len(), 2);

    assert!(prefs.delete("ui.theme").unwrap());
    assert!(prefs.get("ui.theme").unwrap().is_none());

    assert_eq!(events.try_recv().unwrap().change, Change::Saved);
    assert_eq!(events.try_recv().unwrap().key, "notifications");
    assert_eq!(events.try_recv().unwrap().change, Change::Deleted);
  }
}

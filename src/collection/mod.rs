//! In-memory registries of live entity instances.
//!
//! A collection is the single source of truth for whether an entity is
//! loaded, and guarantees one instance per key for its lifetime:
//! - `get` hands out a (possibly uninitialised) instance without any I/O
//! - `get_many` fills in absent instances from the local store in one batch
//! - `set` replaces an entity's data and persists it
//! - every change is broadcast as a typed [`EntityChanged`] event

mod prefs;
mod traits;

pub use prefs::Prefs;
pub use traits::{Change, Entity, EntityChanged, EntityContext};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::model::Record;

const EVENT_CAPACITY: usize = 256;

struct Inner<E: Entity> {
  items: Mutex<HashMap<E::Key, Arc<E>>>,
  ctx: EntityContext<E>,
}

/// Registry of live `E` instances. Cloning shares the registry.
pub struct Collection<E: Entity> {
  inner: Arc<Inner<E>>,
}

impl<E: Entity> Clone for Collection<E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Non-owning handle to a collection, for back-references that must not
/// keep the registry alive.
pub struct WeakCollection<E: Entity> {
  inner: Weak<Inner<E>>,
}

impl<E: Entity> Clone for WeakCollection<E> {
  fn clone(&self) -> Self {
    Self {
      inner: Weak::clone(&self.inner),
    }
  }
}

impl<E: Entity> WeakCollection<E> {
  pub fn upgrade(&self) -> Option<Collection<E>> {
    self.inner.upgrade().map(|inner| Collection { inner })
  }
}

impl<E: Entity> Collection<E> {
  pub fn new(deps: E::Deps) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        items: Mutex::new(HashMap::new()),
        ctx: EntityContext::new(deps, events),
      }),
    }
  }

  pub fn downgrade(&self) -> WeakCollection<E> {
    WeakCollection {
      inner: Arc::downgrade(&self.inner),
    }
  }

  pub fn deps(&self) -> &E::Deps {
    &self.inner.ctx.deps
  }

  /// The instance for `key`, creating an uninitialised one if needed.
  pub fn get(&self, key: E::Key) -> Arc<E> {
    let mut items = self
      .inner
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(items.entry(key.clone()).or_insert_with(|| {
      debug!(entity = E::entity_type(), %key, "Registering entity");
      Arc::new(E::create(key, None, self.inner.ctx.clone()))
    }))
  }

  /// The instance for `key` if one is registered.
  pub fn cached(&self, key: &E::Key) -> Option<Arc<E>> {
    self
      .inner
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }

  /// Instances for `keys`, loading the ones without data from the local
  /// store in one batch. Never reaches the network.
  pub fn get_many(&self, keys: &[E::Key]) -> Result<HashMap<E::Key, Arc<E>>> {
    let missing: Vec<E::Key> = keys
      .iter()
      .filter(|key| self.cached(key).map_or(true, |e| !e.is_loaded()))
      .cloned()
      .collect();

    if !missing.is_empty() {
      for (key, record) in E::load_many(self.deps(), &missing)? {
        self.absorb(key, record);
      }
    }

    Ok(
      keys
        .iter()
        .map(|key| (key.clone(), self.get(key.clone())))
        .collect(),
    )
  }

  /// Replace (or create) the entity's data and persist it.
  pub fn set(&self, key: E::Key, record: Record) -> Result<Arc<E>> {
    let entity = self.get(key);
    entity.state().update(|current| {
      *current = record;
      entity.persist(current)
    })?;
    self.notify(entity.key(), Change::Saved);
    Ok(entity)
  }

  /// Register stored data for `key` unless the instance already has data.
  pub(crate) fn absorb(&self, key: E::Key, record: Record) -> Arc<E> {
    let entity = self.get(key);
    if entity.state().load(record) {
      self.notify(entity.key(), Change::Loaded);
    }
    entity
  }

  pub fn notify(&self, key: &E::Key, change: Change) {
    self.inner.ctx.notify(key, change);
  }

  /// Receive a notification for every change to an entity of this collection.
  pub fn subscribe(&self) -> broadcast::Receiver<EntityChanged<E::Key>> {
    self.inner.ctx.subscribe()
  }

  pub fn len(&self) -> usize {
    self
      .inner
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn keys(&self) -> Vec<E::Key> {
    self
      .inner
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::db::{schema, Key, LocalStore};
  use crate::decoder::Decoder;
  use crate::model::{Bug, Fields};
  use crate::session::Backend;
  use crate::tracker::transport::mock::MockTransport;
  use crate::tracker::RemoteClient;
  use serde_json::json;

  pub(crate) fn backend(mock: &Arc<MockTransport>) -> Arc<Backend> {
    Arc::new(Backend::new(
      LocalStore::open_in_memory(schema::VERSION).unwrap(),
      RemoteClient::new(mock.clone()),
      Decoder::spawn(4).unwrap(),
    ))
  }

  pub(crate) fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_get_returns_same_instance() {
    let bugs: Collection<Bug> = Collection::new(backend(&MockTransport::new()));
    let first = bugs.get(42);
    let second = bugs.get(42);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.id(), 42);
    assert!(!first.is_loaded());
    assert_eq!(bugs.len(), 1);
  }

  #[test]
  fn test_get_many_loads_from_store_without_network() {
    let mock = MockTransport::new();
    let backend = backend(&mock);
    backend
      .store
      .put(schema::BUGS, &Key::Int(1), &json!({ "id": 1, "summary": "stored" }))
      .unwrap();
    let bugs: Collection<Bug> = Collection::new(backend);

    // A stub registered earlier is filled in, not duplicated
    let stub = bugs.get(1);
    let found = bugs.get_many(&[1, 2]).unwrap();

    assert!(Arc::ptr_eq(&stub, &found[&1]));
    assert_eq!(found[&1].summary().as_deref(), Some("stored"));
    assert!(!found[&2].is_loaded());
    assert_eq!(mock.call_count(), 0);
  }

  #[test]
  fn test_set_persists_and_notifies() {
    let backend = backend(&MockTransport::new());
    let bugs: Collection<Bug> = Collection::new(backend.clone());
    let mut events = bugs.subscribe();

    let bug = bugs.set(5, record(json!({ "id": 5, "status": "NEW" }))).unwrap();
    assert_eq!(bug.status().as_deref(), Some("NEW"));

    let stored = backend.store.get(schema::BUGS, &Key::Int(5)).unwrap().unwrap();
    assert_eq!(stored["status"], "NEW");

    let event = events.try_recv().unwrap();
    assert_eq!(event, EntityChanged { key: 5, change: Change::Saved });
  }

  #[test]
  fn test_weak_handle_does_not_keep_registry_alive() {
    let bugs: Collection<Bug> = Collection::new(backend(&MockTransport::new()));
    bugs.get(1);
    let weak = bugs.downgrade();
    assert_eq!(weak.upgrade().unwrap().len(), 1);

    drop(bugs);
    assert!(weak.upgrade().is_none());
  }

  #[test]
  fn test_loaded_instance_is_not_reloaded() {
    let backend = backend(&MockTransport::new());
    let bugs: Collection<Bug> = Collection::new(backend.clone());
    bugs.set(3, record(json!({ "id": 3, "summary": "live" }))).unwrap();

    // Diverge the stored copy behind the collection's back
    backend
      .store
      .put(schema::BUGS, &Key::Int(3), &json!({ "id": 3, "summary": "disk" }))
      .unwrap();

    let found = bugs.get_many(&[3]).unwrap();
    assert_eq!(found[&3].summary().as_deref(), Some("live"));
  }
}

//! Core traits and types for entity collections.

use std::fmt;
use std::hash::Hash;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{Fields, Record};

/// Trait for entity models a [`Collection`](super::Collection) can own.
pub trait Entity: Fields + Send + Sync + Sized + 'static {
  /// Stable identity (bug id, login name, attachment id or hash)
  type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

  /// Services the model needs (store, remote client, sibling collections)
  type Deps: Clone + Send + Sync + 'static;

  /// Entity type name for logs (e.g., "bug", "user")
  fn entity_type() -> &'static str;

  /// Build an instance. `record` is `None` for an uninitialised stub.
  fn create(key: Self::Key, record: Option<Record>, ctx: EntityContext<Self>) -> Self;

  fn key(&self) -> &Self::Key;

  /// Write `record` as this entity's durable copy.
  fn persist(&self, record: &Record) -> Result<()>;

  /// Read the stored records for `keys` in one batch; absent keys are skipped.
  fn load_many(deps: &Self::Deps, keys: &[Self::Key]) -> Result<Vec<(Self::Key, Record)>>;
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
  /// Read from the local store
  Loaded,
  /// Replaced by server data
  Fetched,
  /// Changed locally and persisted
  Saved,
  /// Local annotations changed
  Annotated,
  /// Removed from the local store
  Deleted,
}

/// Notification broadcast by a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChanged<K> {
  pub key: K,
  pub change: Change,
}

/// Handed to every model at creation: its services and its collection's
/// change channel.
pub struct EntityContext<E: Entity> {
  pub deps: E::Deps,
  events: broadcast::Sender<EntityChanged<E::Key>>,
}

impl<E: Entity> EntityContext<E> {
  pub(crate) fn new(deps: E::Deps, events: broadcast::Sender<EntityChanged<E::Key>>) -> Self {
    Self { deps, events }
  }

  /// Broadcast a change. Nobody listening is not an error.
  pub fn notify(&self, key: &E::Key, change: Change) {
    let _ = self.events.send(EntityChanged {
      key: key.clone(),
      change,
    });
  }

  pub(crate) fn subscribe(&self) -> broadcast::Receiver<EntityChanged<E::Key>> {
    self.events.subscribe()
  }
}

impl<E: Entity> Clone for EntityContext<E> {
  fn clone(&self) -> Self {
    Self {
      deps: self.deps.clone(),
      events: self.events.clone(),
    }
  }
}

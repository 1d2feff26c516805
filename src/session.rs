//! Signed-in account context.
//!
//! A [`Session`] is built once per account and owns everything the models
//! share: the local store, the remote client, the decoder worker and the
//! entity collections. Signing out drops it all.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::collection::{Collection, Prefs, WeakCollection};
use crate::db::LocalStore;
use crate::decoder::Decoder;
use crate::error::Result;
use crate::model::{Attachment, Bug, User};
use crate::tracker::{RemoteClient, Transport};

/// A tracker host plus the login signed in on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
  pub host: String,
  pub login: String,
}

impl Account {
  /// Per-account database file under `root`.
  pub fn database_path(&self, root: &Path) -> PathBuf {
    root.join(&self.host).join(format!("{}.db", self.login))
  }
}

/// Services shared by every model of a session.
pub struct Backend {
  pub store: LocalStore,
  pub remote: RemoteClient,
  pub decoder: Decoder,
  /// Live attachments, refreshed whenever a parent bug is fetched
  attachments: OnceLock<WeakCollection<Attachment>>,
}

impl Backend {
  pub fn new(store: LocalStore, remote: RemoteClient, decoder: Decoder) -> Self {
    Self {
      store,
      remote,
      decoder,
      attachments: OnceLock::new(),
    }
  }

  pub(crate) fn register_attachments(&self, attachments: &Collection<Attachment>) {
    if self.attachments.set(attachments.downgrade()).is_err() {
      debug!("Attachment collection already registered for this backend");
    }
  }

  pub(crate) fn attachments(&self) -> Option<Collection<Attachment>> {
    self.attachments.get().and_then(WeakCollection::upgrade)
  }
}

pub struct Session {
  account: Account,
  backend: Arc<Backend>,
  pub bugs: Collection<Bug>,
  pub users: Collection<User>,
  pub attachments: Collection<Attachment>,
  pub prefs: Prefs,
}

impl Session {
  pub fn sign_in(
    account: Account,
    store: LocalStore,
    transport: Arc<dyn Transport>,
    decoder_queue: usize,
  ) -> Result<Self> {
    let backend = Arc::new(Backend::new(
      store,
      RemoteClient::new(transport),
      Decoder::spawn(decoder_queue)?,
    ));

    let bugs = Collection::new(Arc::clone(&backend));
    let users = Collection::new(Arc::clone(&backend));
    let attachments = Collection::<Attachment>::for_bugs(&bugs);
    let prefs = Prefs::new(Arc::clone(&backend));

    info!(host = %account.host, login = %account.login, "Signed in");
    Ok(Self {
      account,
      backend,
      bugs,
      users,
      attachments,
      prefs,
    })
  }

  pub fn account(&self) -> &Account {
    &self.account
  }

  pub fn backend(&self) -> &Arc<Backend> {
    &self.backend
  }

  /// Drop every live entity and close the store once the last handle goes.
  pub fn sign_out(self) {
    info!(
      host = %self.account.host,
      login = %self.account.login,
      bugs = self.bugs.len(),
      users = self.users.len(),
      "Signing out"
    );
  }
}

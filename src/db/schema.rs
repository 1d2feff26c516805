//! Versioned structure of the per-account database.
//!
//! Each migration is a list of purely structural steps. Data shape changes
//! are handled by the model layer reading payload fields defensively.

/// Schema version this build writes.
pub const VERSION: u32 = 2;

/// Store names.
pub const BUGS: &str = "bugs";
pub const USERS: &str = "users";
pub const PREFS: &str = "prefs";

/// How a store's primary key is typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
  Integer,
  Text,
}

impl KeyKind {
  pub fn sql_type(self) -> &'static str {
    match self {
      KeyKind::Integer => "INTEGER",
      KeyKind::Text => "TEXT",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      KeyKind::Integer => "integer",
      KeyKind::Text => "text",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "integer" => Some(KeyKind::Integer),
      "text" => Some(KeyKind::Text),
      _ => None,
    }
  }
}

/// One structural change.
#[derive(Debug, Clone, Copy)]
pub enum Step {
  CreateStore {
    name: &'static str,
    key: KeyKind,
  },
  CreateIndex {
    store: &'static str,
    name: &'static str,
    key_path: &'static str,
    unique: bool,
  },
  DeleteIndex {
    store: &'static str,
    name: &'static str,
  },
}

/// Steps to reach each version from the one before it.
pub const MIGRATIONS: &[(u32, &[Step])] = &[
  (
    1,
    &[
      Step::CreateStore {
        name: BUGS,
        key: KeyKind::Integer,
      },
      Step::CreateIndex {
        store: BUGS,
        name: "alias",
        key_path: "alias",
        unique: true,
      },
      Step::CreateStore {
        name: USERS,
        key: KeyKind::Text,
      },
      Step::CreateIndex {
        store: USERS,
        name: "id",
        key_path: "id",
        unique: true,
      },
      Step::CreateStore {
        name: PREFS,
        key: KeyKind::Text,
      },
    ],
  ),
  // Aliases are no longer unique upstream
  (
    2,
    &[Step::DeleteIndex {
      store: BUGS,
      name: "alias",
    }],
  ),
];

/// Migrations to apply when moving from `previous` to `target`, in order.
pub fn pending(previous: u32, target: u32) -> impl Iterator<Item = &'static (u32, &'static [Step])> {
  MIGRATIONS
    .iter()
    .filter(move |(version, _)| *version > previous && *version <= target)
}

/// Bookkeeping tables maintained by the engine itself, outside migrations.
pub const META_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta_stores (
    name TEXT PRIMARY KEY,
    key_kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meta_indexes (
    store TEXT NOT NULL,
    name TEXT NOT NULL,
    key_path TEXT NOT NULL,
    is_unique INTEGER NOT NULL,
    PRIMARY KEY (store, name)
);
"#;

pub fn table_name(store: &str) -> String {
  format!("store_{}", store)
}

pub fn index_column(index: &str) -> String {
  format!("idx_{}", index)
}

pub fn index_name(store: &str, index: &str) -> String {
  format!("store_{}__{}", store, index)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pending_from_zero() {
    let versions: Vec<u32> = pending(0, VERSION).map(|(v, _)| *v).collect();
    assert_eq!(versions, vec![1, 2]);
  }

  #[test]
  fn test_pending_skips_applied() {
    let versions: Vec<u32> = pending(1, 2).map(|(v, _)| *v).collect();
    assert_eq!(versions, vec![2]);
    assert_eq!(pending(2, 2).count(), 0);
  }

  #[test]
  fn test_migrations_are_increasing() {
    let versions: Vec<u32> = MIGRATIONS.iter().map(|(v, _)| *v).collect();
    let mut sorted = versions.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(versions, sorted);
    assert_eq!(versions.last().copied(), Some(VERSION));
  }
}

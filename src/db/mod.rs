//! Account-scoped persistent key-value store.
//!
//! Every logical store (`bugs`, `users`, `prefs`) is a SQLite table holding a
//! primary key and a JSON payload, plus one extracted column per declared
//! index. The schema version lives in `PRAGMA user_version`.

pub mod schema;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use schema::{KeyKind, Step};

/// Primary key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
  Int(i64),
  Text(String),
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Int(i) => write!(f, "{}", i),
      Key::Text(s) => f.write_str(s),
    }
  }
}

impl TryFrom<u64> for Key {
  type Error = Error;

  fn try_from(id: u64) -> Result<Self> {
    i64::try_from(id)
      .map(Key::Int)
      .map_err(|_| Error::store(format!("Id {} is out of range for a store key", id)))
  }
}

impl From<&str> for Key {
  fn from(s: &str) -> Self {
    Key::Text(s.to_string())
  }
}

impl From<String> for Key {
  fn from(s: String) -> Self {
    Key::Text(s)
  }
}

impl From<Key> for SqlValue {
  fn from(key: Key) -> Self {
    match key {
      Key::Int(i) => SqlValue::Integer(i),
      Key::Text(s) => SqlValue::Text(s),
    }
  }
}

impl TryFrom<SqlValue> for Key {
  type Error = Error;

  fn try_from(value: SqlValue) -> Result<Self> {
    match value {
      SqlValue::Integer(i) => Ok(Key::Int(i)),
      SqlValue::Text(s) => Ok(Key::Text(s)),
      other => Err(Error::store(format!("Unsupported key type: {:?}", other))),
    }
  }
}

/// An index as declared by the migrations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexDef {
  pub name: String,
  pub key_path: String,
  pub unique: bool,
}

#[derive(Debug, Clone)]
struct StoreDef {
  key: KeyKind,
  indexes: Vec<IndexDef>,
}

/// Structural snapshot of the database, used to compare migration paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreShape {
  pub version: u32,
  /// Store name -> declared indexes
  pub stores: BTreeMap<String, Vec<IndexDef>>,
  /// Index objects physically present in SQLite
  pub physical_indexes: BTreeSet<String>,
}

/// Persistent store for one account database.
pub struct LocalStore {
  conn: Mutex<Connection>,
  defs: HashMap<String, StoreDef>,
}

impl LocalStore {
  /// Open (creating if absent) the database at `path`, upgrading it to `version`.
  pub fn open(path: &Path, version: u32) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::store(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| Error::store(format!("Failed to open database at {}: {}", path.display(), e)))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.busy_timeout(Duration::from_secs(5))?;

    debug!(path = %path.display(), version, "Opening local store");
    Self::init(conn, version)
  }

  /// Open a throwaway database, mostly for tests.
  pub fn open_in_memory(version: u32) -> Result<Self> {
    Self::init(Connection::open_in_memory()?, version)
  }

  fn init(mut conn: Connection, version: u32) -> Result<Self> {
    conn.execute_batch(schema::META_SCHEMA)?;

    let current = user_version(&conn)?;
    if current > version {
      return Err(Error::store(format!(
        "Database schema version is newer than this build: db={}, app={}",
        current, version
      )));
    }

    for (target, steps) in schema::pending(current, version) {
      let tx = conn.transaction()?;
      for step in steps.iter() {
        apply_step(&tx, step)?;
      }
      tx.pragma_update(None, "user_version", target)?;
      tx.commit()?;
      info!(from = current, to = target, "Applied store migration");
    }

    let defs = load_defs(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
      defs,
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::store(format!("Lock poisoned: {}", e)))
  }

  fn def(&self, store: &str) -> Result<StoreDef> {
    self
      .defs
      .get(store)
      .cloned()
      .ok_or_else(|| Error::store(format!("Unknown store: {}", store)))
  }

  /// Schema version recorded by the engine.
  pub fn version(&self) -> Result<u32> {
    let conn = self.conn()?;
    user_version(&conn)
  }

  pub fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
    self.def(store)?;
    let conn = self.conn()?;
    let sql = format!("SELECT value FROM {} WHERE key = ?", schema::table_name(store));
    let data: Option<String> = conn
      .query_row(&sql, [SqlValue::from(key.clone())], |row| row.get(0))
      .optional()?;

    data.map(|d| serde_json::from_str(&d).map_err(Error::from)).transpose()
  }

  /// Load several records in one statement; absent keys are skipped.
  pub fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<(Key, Value)>> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    self.def(store)?;
    let placeholders = vec!["?"; keys.len()].join(", ");
    let sql = format!(
      "SELECT key, value FROM {} WHERE key IN ({}) ORDER BY key",
      schema::table_name(store),
      placeholders
    );
    self.select(&sql, keys.iter().cloned().map(SqlValue::from))
  }

  /// Insert or replace the record stored under `key`.
  pub fn put(&self, store: &str, key: &Key, value: &Value) -> Result<()> {
    let def = self.def(store)?;
    match (def.key, key) {
      (KeyKind::Integer, Key::Int(_)) | (KeyKind::Text, Key::Text(_)) => {}
      _ => {
        return Err(Error::store(format!(
          "Key {} does not match the {} keys of store {}",
          key,
          def.key.as_str(),
          store
        )))
      }
    }
    let data = serde_json::to_string(value)?;

    let mut columns = vec!["key".to_string(), "value".to_string()];
    let mut values = vec![SqlValue::from(key.clone()), SqlValue::Text(data)];
    for index in &def.indexes {
      columns.push(schema::index_column(&index.name));
      values.push(index_value(value, &index.key_path));
    }

    let updates: Vec<String> = columns
      .iter()
      .skip(1)
      .map(|c| format!("{c} = excluded.{c}"))
      .collect();
    let sql = format!(
      "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(key) DO UPDATE SET {}",
      schema::table_name(store),
      columns.join(", "),
      vec!["?"; columns.len()].join(", "),
      updates.join(", ")
    );

    self
      .conn()?
      .execute(&sql, params_from_iter(values))
      .map_err(|e| Error::store(format!("Failed to store {}/{}: {}", store, key, e)))?;
    Ok(())
  }

  pub fn delete(&self, store: &str, key: &Key) -> Result<bool> {
    self.def(store)?;
    let sql = format!("DELETE FROM {} WHERE key = ?", schema::table_name(store));
    let changed = self.conn()?.execute(&sql, [SqlValue::from(key.clone())])?;
    Ok(changed > 0)
  }

  pub fn clear(&self, store: &str) -> Result<()> {
    self.def(store)?;
    let sql = format!("DELETE FROM {}", schema::table_name(store));
    self.conn()?.execute(&sql, [])?;
    Ok(())
  }

  pub fn get_all(&self, store: &str) -> Result<Vec<(Key, Value)>> {
    self.range(store, None, None)
  }

  /// Records with `lower <= key <= upper`, in key order. Open bounds are `None`.
  pub fn range(
    &self,
    store: &str,
    lower: Option<&Key>,
    upper: Option<&Key>,
  ) -> Result<Vec<(Key, Value)>> {
    self.def(store)?;
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(lower) = lower {
      clauses.push("key >= ?");
      values.push(SqlValue::from(lower.clone()));
    }
    if let Some(upper) = upper {
      clauses.push("key <= ?");
      values.push(SqlValue::from(upper.clone()));
    }
    let filter = if clauses.is_empty() {
      String::new()
    } else {
      format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
      "SELECT key, value FROM {}{} ORDER BY key",
      schema::table_name(store),
      filter
    );
    self.select(&sql, values)
  }

  /// Records whose indexed field equals `value`.
  pub fn get_by_index(&self, store: &str, index: &str, value: &Value) -> Result<Vec<(Key, Value)>> {
    let def = self.def(store)?;
    let index = def
      .indexes
      .iter()
      .find(|i| i.name == index)
      .ok_or_else(|| Error::store(format!("Unknown index {}.{}", store, index)))?;

    let sql = format!(
      "SELECT key, value FROM {} WHERE {} = ? ORDER BY key",
      schema::table_name(store),
      schema::index_column(&index.name)
    );
    self.select(&sql, [scalar(value)])
  }

  fn select(
    &self,
    sql: &str,
    values: impl IntoIterator<Item = SqlValue>,
  ) -> Result<Vec<(Key, Value)>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
      .query_map(params_from_iter(values), |row| {
        Ok((row.get::<_, SqlValue>(0)?, row.get::<_, String>(1)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows
      .into_iter()
      .map(|(key, data)| Ok((Key::try_from(key)?, serde_json::from_str(&data)?)))
      .collect()
  }

  /// Current stores and indexes, declared and physical.
  pub fn shape(&self) -> Result<StoreShape> {
    let conn = self.conn()?;
    let stores = load_defs(&conn)?
      .into_iter()
      .map(|(name, def)| {
        let mut indexes = def.indexes;
        indexes.sort();
        (name, indexes)
      })
      .collect();

    let mut stmt = conn.prepare(
      "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'store\\_%' ESCAPE '\\'",
    )?;
    let physical_indexes = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<rusqlite::Result<BTreeSet<_>>>()?;

    Ok(StoreShape {
      version: user_version(&conn)?,
      stores,
      physical_indexes,
    })
  }
}

fn user_version(conn: &Connection) -> Result<u32> {
  Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn load_defs(conn: &Connection) -> Result<HashMap<String, StoreDef>> {
  let mut defs = HashMap::new();

  let mut stmt = conn.prepare("SELECT name, key_kind FROM meta_stores")?;
  let stores = stmt
    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  for (name, kind) in stores {
    let key = KeyKind::parse(&kind)
      .ok_or_else(|| Error::store(format!("Unknown key kind '{}' for store {}", kind, name)))?;
    defs.insert(
      name,
      StoreDef {
        key,
        indexes: Vec::new(),
      },
    );
  }

  let mut stmt = conn.prepare("SELECT store, name, key_path, is_unique FROM meta_indexes")?;
  let indexes = stmt
    .query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        IndexDef {
          name: row.get(1)?,
          key_path: row.get(2)?,
          unique: row.get(3)?,
        },
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  for (store, index) in indexes {
    if let Some(def) = defs.get_mut(&store) {
      def.indexes.push(index);
    }
  }

  Ok(defs)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
  let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
  let names = stmt
    .query_map([], |row| row.get::<_, String>(1))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(names.iter().any(|n| n == column))
}

/// Apply one step. Re-applying a step that already took effect is a no-op.
fn apply_step(conn: &Connection, step: &Step) -> Result<()> {
  match *step {
    Step::CreateStore { name, key } => {
      conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (key {} PRIMARY KEY, value TEXT NOT NULL)",
        schema::table_name(name),
        key.sql_type()
      ))?;
      conn.execute(
        "INSERT OR REPLACE INTO meta_stores (name, key_kind) VALUES (?, ?)",
        params![name, key.as_str()],
      )?;
    }
    Step::CreateIndex {
      store,
      name,
      key_path,
      unique,
    } => {
      let table = schema::table_name(store);
      let column = schema::index_column(name);
      if !column_exists(conn, &table, &column)? {
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {}", table, column))?;
      }
      let json_path = format!("$.{}", key_path);
      conn.execute(
        &format!(
          "UPDATE {table} SET {column} = CASE
             WHEN json_type(value, ?1) IN ('text', 'integer', 'real') THEN json_extract(value, ?1)
           END"
        ),
        params![json_path],
      )?;
      conn.execute_batch(&format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {}({})",
        if unique { "UNIQUE " } else { "" },
        schema::index_name(store, name),
        table,
        column
      ))?;
      conn.execute(
        "INSERT OR REPLACE INTO meta_indexes (store, name, key_path, is_unique) VALUES (?, ?, ?, ?)",
        params![store, name, key_path, unique],
      )?;
    }
    Step::DeleteIndex { store, name } => {
      let table = schema::table_name(store);
      let column = schema::index_column(name);
      conn.execute_batch(&format!(
        "DROP INDEX IF EXISTS {}",
        schema::index_name(store, name)
      ))?;
      if column_exists(conn, &table, &column)? {
        conn.execute_batch(&format!("ALTER TABLE {} DROP COLUMN {}", table, column))?;
      }
      conn.execute(
        "DELETE FROM meta_indexes WHERE store = ? AND name = ?",
        params![store, name],
      )?;
    }
  }
  Ok(())
}

/// Value of the field at `key_path` if it is a valid index key.
fn index_value(value: &Value, key_path: &str) -> SqlValue {
  let field = key_path
    .split('.')
    .try_fold(value, |v, segment| v.get(segment));
  match field {
    Some(v) => scalar(v),
    None => SqlValue::Null,
  }
}

fn scalar(value: &Value) -> SqlValue {
  match value {
    Value::String(s) => SqlValue::Text(s.clone()),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
    },
    _ => SqlValue::Null,
  }
}

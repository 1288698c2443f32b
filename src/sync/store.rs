//! Slot storage trait and its SQLite and in-memory implementations.
//!
//! The sync layer persists exactly two JSON documents: the write queue and the
//! read cache. Each lives in its own slot and is only ever changed through a
//! single read-modify-write cycle under the backend's lock.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// The two persisted documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
  Queue,
  Cache,
}

impl Slot {
  pub fn key(self) -> &'static str {
    match self {
      Slot::Queue => "offline_queue_v1",
      Slot::Cache => "offline_cache_v1",
    }
  }
}

/// Trait for slot storage backends.
pub trait SlotStorage: Send + Sync {
  /// Raw contents of a slot, if it was ever written.
  fn load(&self, slot: Slot) -> Result<Option<String>>;

  /// Replace the contents of a slot with whatever `f` computes from the
  /// current contents. No other update of the same backend can interleave.
  fn update(
    &self,
    slot: Slot,
    f: &mut dyn FnMut(Option<String>) -> Result<String>,
  ) -> Result<()>;
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  slots: Mutex<HashMap<Slot, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SlotStorage for MemoryStorage {
  fn load(&self, slot: Slot) -> Result<Option<String>> {
    let slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(slots.get(&slot).cloned())
  }

  fn update(
    &self,
    slot: Slot,
    f: &mut dyn FnMut(Option<String>) -> Result<String>,
  ) -> Result<()> {
    let mut slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let next = f(slots.get(&slot).cloned())?;
    slots.insert(slot, next);
    Ok(())
  }
}

/// SQLite-based slot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open sync database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that disappears with the connection.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("outbox").join("sync.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SLOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }
}

const SLOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS slots (
    name TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SlotStorage for SqliteStorage {
  fn load(&self, slot: Slot) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM slots WHERE name = ?",
        params![slot.key()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read slot {}: {}", slot.key(), e))
  }

  fn update(
    &self,
    slot: Slot,
    f: &mut dyn FnMut(Option<String>) -> Result<String>,
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current: Option<String> = tx
      .query_row(
        "SELECT data FROM slots WHERE name = ?",
        params![slot.key()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read slot {}: {}", slot.key(), e))?;

    let next = f(current)?;

    tx.execute(
      "INSERT OR REPLACE INTO slots (name, data, updated_at) VALUES (?, ?, datetime('now'))",
      params![slot.key(), next],
    )
    .map_err(|e| eyre!("Failed to write slot {}: {}", slot.key(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Typed access to the slots, shared by the queue and cache managers.
#[derive(Clone)]
pub struct Store {
  backend: Arc<dyn SlotStorage>,
}

impl Store {
  pub fn new(backend: impl SlotStorage + 'static) -> Self {
    Self {
      backend: Arc::new(backend),
    }
  }

  pub fn in_memory() -> Self {
    Self::new(MemoryStorage::new())
  }

  /// Decode a slot. Missing or malformed contents read as the empty document.
  pub fn read<T>(&self, slot: Slot) -> Result<T>
  where
    T: DeserializeOwned + Default,
  {
    let raw = self.backend.load(slot)?;
    Ok(decode(slot, raw.as_deref()))
  }

  /// Atomically decode, mutate and re-encode a slot.
  pub fn modify<T, R, F>(&self, slot: Slot, f: F) -> Result<R>
  where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> R,
  {
    let mut f = Some(f);
    let mut out = None;

    self.backend.update(slot, &mut |raw| {
      let f = f
        .take()
        .ok_or_else(|| eyre!("Update of slot {} ran twice", slot.key()))?;
      let mut document: T = decode(slot, raw.as_deref());
      out = Some(f(&mut document));
      serde_json::to_string(&document)
        .map_err(|e| eyre!("Failed to serialize slot {}: {}", slot.key(), e))
    })?;

    out.ok_or_else(|| eyre!("Update of slot {} did not run", slot.key()))
  }
}

fn decode<T>(slot: Slot, raw: Option<&str>) -> T
where
  T: DeserializeOwned + Default,
{
  let Some(raw) = raw else {
    return T::default();
  };

  serde_json::from_str(raw).unwrap_or_else(|e| {
    warn!(slot = slot.key(), error = %e, "Discarding malformed slot contents");
    T::default()
  })
}

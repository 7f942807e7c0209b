//! Snapshot storage trait and its SQLite, in-memory and no-op backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Raw bytes of a persisted snapshot plus when they were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
  pub data: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

/// Persisted key-value storage, keyed by `(namespace, owner_id)`.
///
/// Last write wins; there is no versioning.
pub trait SnapshotStore: Send + Sync {
  fn read(&self, namespace: &str, owner_id: &str) -> Result<Option<StoredSnapshot>>;

  fn write(&self, namespace: &str, owner_id: &str, data: &[u8]) -> Result<()>;

  fn remove(&self, namespace: &str, owner_id: &str) -> Result<()>;

  /// Remove every namespace stored for `owner_id`.
  fn clear_owner(&self, owner_id: &str) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopSnapshotStore;

impl SnapshotStore for NoopSnapshotStore {
  fn read(&self, _namespace: &str, _owner_id: &str) -> Result<Option<StoredSnapshot>> {
    Ok(None) // Always miss
  }

  fn write(&self, _namespace: &str, _owner_id: &str, _data: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _namespace: &str, _owner_id: &str) -> Result<()> {
    Ok(())
  }

  fn clear_owner(&self, _owner_id: &str) -> Result<()> {
    Ok(())
  }
}

/// Process-local store, used by tests and as a fallback when the database
/// cannot be opened.
#[derive(Default)]
pub struct MemorySnapshotStore {
  entries: Mutex<HashMap<(String, String), StoredSnapshot>>,
}

impl MemorySnapshotStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Write with an explicit timestamp.
  pub fn write_at(
    &self,
    namespace: &str,
    owner_id: &str,
    data: &[u8],
    stored_at: DateTime<Utc>,
  ) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(
      (namespace.to_string(), owner_id.to_string()),
      StoredSnapshot {
        data: data.to_vec(),
        stored_at,
      },
    );
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl SnapshotStore for MemorySnapshotStore {
  fn read(&self, namespace: &str, owner_id: &str) -> Result<Option<StoredSnapshot>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .get(&(namespace.to_string(), owner_id.to_string()))
        .cloned(),
    )
  }

  fn write(&self, namespace: &str, owner_id: &str, data: &[u8]) -> Result<()> {
    self.write_at(namespace, owner_id, data, Utc::now())
  }

  fn remove(&self, namespace: &str, owner_id: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(&(namespace.to_string(), owner_id.to_string()));
    Ok(())
  }

  fn clear_owner(&self, owner_id: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.retain(|(_, owner), _| owner != owner_id);
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteSnapshotStore {
  conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives only as long as the store.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
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

    Ok(data_dir.join("feedcore").join("cache.db"))
  }

  /// Run database migrations for snapshot tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    namespace TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, owner_id)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_owner ON snapshots(owner_id);
"#;

impl SnapshotStore for SqliteSnapshotStore {
  fn read(&self, namespace: &str, owner_id: &str) -> Result<Option<StoredSnapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, stored_at FROM snapshots WHERE namespace = ? AND owner_id = ?",
        params![namespace, owner_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read snapshot {}/{}: {}", namespace, owner_id, e))?;

    match row {
      Some((data, stored_at)) => Ok(Some(StoredSnapshot {
        data,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn write(&self, namespace: &str, owner_id: &str, data: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO snapshots (namespace, owner_id, data, stored_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![namespace, owner_id, data],
      )
      .map_err(|e| eyre!("Failed to store snapshot {}/{}: {}", namespace, owner_id, e))?;

    Ok(())
  }

  fn remove(&self, namespace: &str, owner_id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM snapshots WHERE namespace = ? AND owner_id = ?",
        params![namespace, owner_id],
      )
      .map_err(|e| eyre!("Failed to remove snapshot {}/{}: {}", namespace, owner_id, e))?;

    Ok(())
  }

  fn clear_owner(&self, owner_id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM snapshots WHERE owner_id = ?",
        params![owner_id],
      )
      .map_err(|e| eyre!("Failed to clear snapshots for {}: {}", owner_id, e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

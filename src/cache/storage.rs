//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedEntry, RequestKey};
use crate::net::Response;

/// Trait for the persistent store backends.
///
/// A backend holds any number of named stores, each a key/value collection
/// from request identity to response snapshot. Every call is individually
/// atomic; callers never lock around them.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Store a response under the request key, replacing any previous entry.
  /// Creates the store if needed.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Look up a request key in the named store.
  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Request descriptions held by the named store, oldest write first.
  fn entries(&self, name: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

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

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named store generation
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by store and request hash
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, key_hash),
    FOREIGN KEY (store) REFERENCES stores(name) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store '{}': {}", name, e))?;

    Ok(())
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    key.ensure_cacheable()?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open store '{}': {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (store, key_hash, request, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.description(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE store = ? AND key_hash = ?",
        params![name, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store '{}': {}", name, e))?;

    Ok(removed > 0)
  }

  fn entries(&self, name: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT request FROM entries WHERE store = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let requests = stmt
      .query_map(params![name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    Ok(requests)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    let url = Url::parse("http://localhost:8503").unwrap().join(path).unwrap();
    RequestKey::new("GET", &url)
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = Response::new(200, "<html>").with_header("content-type", "text/html");

    storage.put("v1", &key("/vr"), &response).unwrap();

    let entry = storage.match_entry("v1", &key("/vr")).unwrap().unwrap();
    assert_eq!(entry.response, response);
    assert!(storage.match_entry("v1", &key("/missing")).unwrap().is_none());
    assert!(storage.match_entry("v2", &key("/vr")).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/vr"), &Response::new(200, "old")).unwrap();
    storage.put("v1", &key("/vr"), &Response::new(200, "new")).unwrap();

    let entry = storage.match_entry("v1", &key("/vr")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
    assert_eq!(storage.entries("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_put_rejects_non_get() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let post = RequestKey::new("POST", key("/api/generate_cad").url());

    assert!(storage.put("v1", &post, &Response::new(200, "{}")).is_err());
    assert!(storage.match_entry("v1", &post).unwrap().is_none());
    assert!(storage.keys().unwrap().is_empty());
  }

  #[test]
  fn test_keys_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    storage.open("v1").unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["v1", "v2"]);
  }

  #[test]
  fn test_delete_cascades_to_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/vr"), &Response::new(200, "<html>")).unwrap();

    assert!(storage.delete("v1").unwrap());
    assert!(!storage.delete("v1").unwrap());
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.entries("v1").unwrap().is_empty());

    // Recreating the store does not resurrect old entries
    storage.open("v1").unwrap();
    assert!(storage.match_entry("v1", &key("/vr")).unwrap().is_none());
  }

  #[test]
  fn test_entries_lists_request_descriptions() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/vr"), &Response::new(200, "a")).unwrap();
    storage
      .put("v1", &key("/manifest.json"), &Response::new(200, "b"))
      .unwrap();

    assert_eq!(
      storage.entries("v1").unwrap(),
      vec![
        "GET http://localhost:8503/vr",
        "GET http://localhost:8503/manifest.json"
      ]
    );
  }

  #[test]
  fn test_reopen_from_disk() {
    let dir = std::env::temp_dir().join(format!("swcache-test-{}", std::process::id()));
    let path = dir.join("cache.db");
    let _ = std::fs::remove_file(&path);

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("v1", &key("/vr"), &Response::new(200, "<html>")).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let entry = storage.match_entry("v1", &key("/vr")).unwrap().unwrap();
    assert_eq!(entry.response.text(), "<html>");

    drop(storage);
    let _ = std::fs::remove_dir_all(&dir);
  }
}

//! In-process storage backend.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey};
use crate::net::Response;

#[derive(Default)]
struct Store {
  name: String,
  /// key hash -> (request description, entry)
  entries: HashMap<String, (String, CachedEntry)>,
  /// key hashes in write order
  order: Vec<String>,
}

/// Storage that keeps every store in memory.
/// Used for ephemeral runs and tests - nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Vec<Store>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn find<'a>(stores: &'a mut Vec<Store>, name: &str) -> &'a mut Store {
  match stores.iter().position(|s| s.name == name) {
    Some(index) => &mut stores[index],
    None => {
      stores.push(Store {
        name: name.to_string(),
        ..Store::default()
      });
      let last = stores.len() - 1;
      &mut stores[last]
    }
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    find(&mut stores, name);
    Ok(())
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    key.ensure_cacheable()?;

    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let store = find(&mut stores, name);

    let hash = key.cache_hash();
    store.order.retain(|h| h != &hash);
    store.order.push(hash.clone());
    store.entries.insert(
      hash,
      (
        key.description(),
        CachedEntry {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      ),
    );

    Ok(())
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      stores
        .iter()
        .find(|s| s.name == name)
        .and_then(|s| s.entries.get(&key.cache_hash()))
        .map(|(_, entry)| entry.clone()),
    )
  }

  fn keys(&self) -> Result<Vec<String>> {
    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.iter().map(|s| s.name.clone()).collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = stores.len();
    stores.retain(|s| s.name != name);
    Ok(stores.len() != before)
  }

  fn entries(&self, name: &str) -> Result<Vec<String>> {
    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let Some(store) = stores.iter().find(|s| s.name == name) else {
      return Ok(Vec::new());
    };

    Ok(
      store
        .order
        .iter()
        .filter_map(|hash| store.entries.get(hash))
        .map(|(description, _)| description.clone())
        .collect(),
    )
  }
}

//! Core types shared by the cache storage backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::{Request, Response};

/// Identity of a request as seen by a store: method plus URL.
///
/// Fragments never take part in matching, so `/vr#top` and `/vr` share an
/// entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);

    Self {
      method: method.to_uppercase(),
      url,
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Only GET requests may be stored or matched.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }

  /// Error out for methods a store refuses to hold.
  pub fn ensure_cacheable(&self) -> Result<()> {
    if self.is_cacheable() {
      Ok(())
    } else {
      Err(eyre!(
        "Request method '{}' is unsupported for {}",
        self.method,
        self.url
      ))
    }
  }

  /// Stable, fixed-length key for storage lookups.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human readable form, e.g. `GET http://localhost:8503/vr`
  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

impl From<&Request> for RequestKey {
  fn from(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }
}

/// A response snapshot held by a store.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_fragment_is_ignored() {
    let a = RequestKey::new("GET", &url("http://localhost:8503/vr#scene"));
    let b = RequestKey::new("get", &url("http://localhost:8503/vr"));
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.description(), "GET http://localhost:8503/vr");
  }

  #[test]
  fn test_query_and_method_distinguish_keys() {
    let plain = RequestKey::new("GET", &url("http://localhost:8503/vr"));
    let query = RequestKey::new("GET", &url("http://localhost:8503/vr?mode=ar"));
    let post = RequestKey::new("POST", &url("http://localhost:8503/vr"));
    assert_ne!(plain.cache_hash(), query.cache_hash());
    assert_ne!(plain.cache_hash(), post.cache_hash());
    assert_eq!(plain.cache_hash().len(), 64);
  }

  #[test]
  fn test_only_get_is_cacheable() {
    let post = RequestKey::new("POST", &url("http://localhost:8503/api/generate_cad"));
    assert!(!post.is_cacheable());
    assert!(post.ensure_cacheable().is_err());
    assert!(RequestKey::new("GET", post.url()).ensure_cacheable().is_ok());
  }
}

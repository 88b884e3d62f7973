use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the interceptor runs on; only requests to it are intercepted
  pub origin: String,
  /// Version-tagged store name. Changing it invalidates every older store.
  pub cache_name: String,
  /// Paths seeded into the store on install, in order
  pub static_assets: Vec<String>,
  /// SQLite database path (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8503".to_string(),
      cache_name: "trinity-vr-v1".to_string(),
      static_assets: vec![
        "/vr".to_string(),
        "/connection_test.html".to_string(),
        "/manifest.json".to_string(),
      ],
      database: None,
    }
  }
}

/// Validated configuration handed to one interceptor instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub origin: Url,
  pub cache_name: String,
  pub static_assets: Vec<String>,
}

impl WorkerConfig {
  pub fn new(origin: &str, cache_name: &str, static_assets: Vec<String>) -> Result<Self> {
    let origin =
      Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;

    if !origin.origin().is_tuple() {
      return Err(eyre!("Origin '{}' has no scheme/host/port", origin));
    }

    if cache_name.is_empty() {
      return Err(eyre!("Cache name must not be empty"));
    }

    Ok(Self {
      origin,
      cache_name: cache_name.to_string(),
      static_assets,
    })
  }

  /// Resolve a manifest path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn worker_config(&self) -> Result<WorkerConfig> {
    WorkerConfig::new(&self.origin, &self.cache_name, self.static_assets.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.cache_name, "trinity-vr-v1");
    assert_eq!(
      config.static_assets,
      vec!["/vr", "/connection_test.html", "/manifest.json"]
    );
    assert!(config.worker_config().is_ok());
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = Config::parse("cache_name: trinity-vr-v2\n").unwrap();
    assert_eq!(config.cache_name, "trinity-vr-v2");
    assert_eq!(config.origin, "http://localhost:8503");
    assert_eq!(config.static_assets.len(), 3);
  }

  #[test]
  fn test_full_file() {
    let config = Config::parse(
      "origin: https://quest.example.net\n\
       cache_name: shell-v7\n\
       static_assets: [/, /app.js]\n\
       database: /tmp/shell.db\n",
    )
    .unwrap();

    let worker = config.worker_config().unwrap();
    assert_eq!(worker.cache_name, "shell-v7");
    assert_eq!(
      worker.resolve("/app.js").unwrap().as_str(),
      "https://quest.example.net/app.js"
    );
    assert_eq!(config.database, Some(PathBuf::from("/tmp/shell.db")));
  }

  #[test]
  fn test_invalid_origin() {
    assert!(WorkerConfig::new("not a url", "v1", Vec::new()).is_err());
    assert!(WorkerConfig::new("data:text/plain,hi", "v1", Vec::new()).is_err());
    assert!(WorkerConfig::new("http://localhost:8503", "", Vec::new()).is_err());
  }

  #[test]
  fn test_missing_explicit_file() {
    let path = Path::new("/nonexistent/swcache.yaml");
    assert!(Config::load(Some(path)).is_err());
  }
}

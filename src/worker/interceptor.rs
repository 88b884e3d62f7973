//! Network-first interceptor with offline fallback.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Origin;

use super::lifecycle::{Clients, Registration};
use crate::cache::{CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::net::{CacheMode, Network, Request, Response};

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Network unreachable, served from the current store
  Cache,
  /// Network unreachable and nothing stored
  Synthetic,
}

/// Response produced by the interceptor for one request.
#[derive(Debug, Clone)]
pub struct Intercepted {
  pub response: Response,
  pub source: ResponseSource,
}

/// Result of handing a request to the interceptor.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not ours to handle (cross-origin); the host sends it untouched
  PassThrough,
  Responded(Intercepted),
}

impl FetchOutcome {
  pub fn intercepted(&self) -> Option<&Intercepted> {
    match self {
      FetchOutcome::Responded(intercepted) => Some(intercepted),
      FetchOutcome::PassThrough => None,
    }
  }
}

/// What install managed to seed.
#[derive(Debug, Default)]
pub struct InstallReport {
  /// URLs stored in the current store
  pub cached: Vec<String>,
  /// URLs that could not be seeded, with the reason
  pub failed: Vec<(String, String)>,
}

/// What activate cleaned up.
#[derive(Debug, Default)]
pub struct ActivateReport {
  /// Stores from older versions that were removed
  pub deleted: Vec<String>,
  /// Stores that could not be removed, with the reason
  pub failed: Vec<(String, String)>,
  /// Number of open client sessions now controlled by this version
  pub claimed: usize,
}

/// The interceptor for one deployed version.
///
/// Owns its configuration; the only state shared with other versions or
/// in-flight requests is the storage backend.
pub struct Interceptor<S: CacheStorage, N: Network> {
  config: WorkerConfig,
  origin: Origin,
  storage: Arc<S>,
  network: N,
  registration: Mutex<Registration>,
  clients: Arc<Clients>,
}

impl<S: CacheStorage, N: Network> Interceptor<S, N> {
  pub fn new(config: WorkerConfig, storage: S, network: N) -> Self {
    Self::with_storage(config, Arc::new(storage), network)
  }

  /// Build an interceptor over storage shared with other versions.
  pub fn with_storage(config: WorkerConfig, storage: Arc<S>, network: N) -> Self {
    let origin = config.origin.origin();
    Self {
      config,
      origin,
      storage,
      network,
      registration: Mutex::new(Registration::new()),
      clients: Arc::new(Clients::new()),
    }
  }

  /// Start from an existing registration and set of client sessions.
  pub fn with_host(mut self, registration: Registration, clients: Arc<Clients>) -> Self {
    self.registration = Mutex::new(registration);
    self.clients = clients;
    self
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn clients(&self) -> &Arc<Clients> {
    &self.clients
  }

  /// Run a closure against the registration.
  pub fn registration<T>(&self, f: impl FnOnce(&mut Registration) -> T) -> Result<T> {
    let mut registration = self
      .registration
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut registration))
  }

  /// Run a blocking storage call off the async executor.
  async fn blocking<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S, &str) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    let name = self.config.cache_name.clone();
    tokio::task::spawn_blocking(move || f(storage.as_ref(), name.as_str()))
      .await
      .map_err(|e| eyre!("Storage task failed: {}", e))?
  }

  /// Setup: open the current store and seed it with the static assets.
  ///
  /// Individual assets that cannot be fetched or stored are recorded in the
  /// report and otherwise ignored. Only failing to open the store fails
  /// the install.
  pub async fn install(&self) -> Result<InstallReport> {
    let version = self.config.cache_name.clone();
    info!(version = %version, "Installing");
    self.registration(|r| r.begin_install(&version))?;

    if let Err(e) = self.blocking(|storage, name| storage.open(name)).await {
      self.registration(|r| r.finish_install(false))??;
      return Err(e);
    }

    let seeds = self
      .config
      .static_assets
      .iter()
      .map(|asset| async move { (asset.clone(), self.seed(asset).await) });

    let mut report = InstallReport::default();
    for (asset, result) in join_all(seeds).await {
      match result {
        Ok(url) => report.cached.push(url),
        Err(e) => {
          warn!(asset = %asset, "Failed to seed asset: {}", e);
          report.failed.push((asset, e.to_string()));
        }
      }
    }

    self.registration(|r| r.skip_waiting())?;
    let activate_now = self.registration(|r| r.finish_install(true))??;

    info!(
      version = %version,
      cached = report.cached.len(),
      failed = report.failed.len(),
      activate_now,
      "Installed"
    );

    Ok(report)
  }

  async fn seed(&self, asset: &str) -> Result<String> {
    let url = self.config.resolve(asset)?;
    let request = Request::get(url).with_cache_mode(CacheMode::Reload);
    let response = self.network.send(&request).await?;

    if !response.is_ok() {
      return Err(eyre!("Unexpected status {} for {}", response.status, request.url));
    }

    let key = RequestKey::from(&request);
    self
      .blocking(move |storage, name| storage.put(name, &key, &response))
      .await?;

    Ok(request.url.to_string())
  }

  /// Takeover: delete every store from other versions and claim open sessions.
  ///
  /// Deletions run concurrently and are all awaited. A store that fails to
  /// delete is logged and reported; it does not fail the activation.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let version = self.config.cache_name.clone();
    info!(version = %version, "Activating");
    self.registration(|r| r.begin_activate(&version))?;

    let names = self.blocking(|storage, _| storage.keys()).await?;

    let deletions = names
      .into_iter()
      .filter(|name| name != &version)
      .map(|stale| async move {
        let target = stale.clone();
        let result = self
          .blocking(move |storage, _| storage.delete(&target))
          .await;
        (stale, result)
      });

    let claimed = self.clients.claim(&version)?;

    let mut report = ActivateReport {
      claimed,
      ..ActivateReport::default()
    };

    for (stale, result) in join_all(deletions).await {
      match result {
        Ok(_) => {
          debug!(store = %stale, "Deleted stale store");
          report.deleted.push(stale);
        }
        Err(e) => {
          warn!(store = %stale, "Failed to delete stale store: {}", e);
          report.failed.push((stale, e.to_string()));
        }
      }
    }

    self.registration(|r| r.finish_activate())??;

    info!(
      version = %version,
      deleted = report.deleted.len(),
      claimed = report.claimed,
      "Activated"
    );

    Ok(report)
  }

  /// Intercept one request with the network-first policy.
  ///
  /// A 200 response is written to the current store in a background task
  /// that is never awaited here, so a request racing right behind it may
  /// still miss the store.
  pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
    if request.url.origin() != self.origin {
      debug!(url = %request.url, "Passing through cross-origin request");
      return FetchOutcome::PassThrough;
    }

    match self.network.send(&request).await {
      Ok(response) => {
        if response.status == 200 {
          self.store_in_background(RequestKey::from(&request), response.clone());
        }
        FetchOutcome::Responded(Intercepted {
          response,
          source: ResponseSource::Network,
        })
      }
      Err(e) => {
        debug!(url = %request.url, "Network failed, falling back to store: {}", e);
        FetchOutcome::Responded(self.fallback(&request).await)
      }
    }
  }

  fn store_in_background(&self, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let name = self.config.cache_name.clone();

    tokio::task::spawn_blocking(move || match storage.put(&name, &key, &response) {
      Ok(()) => debug!(request = %key.description(), "Stored response"),
      Err(e) => warn!(request = %key.description(), "Failed to store response: {}", e),
    });
  }

  async fn fallback(&self, request: &Request) -> Intercepted {
    let key = RequestKey::from(request);
    let lookup = self
      .blocking(move |storage, name| storage.match_entry(name, &key))
      .await;

    match lookup {
      Ok(Some(entry)) => Intercepted {
        response: entry.response,
        source: ResponseSource::Cache,
      },
      Ok(None) => Intercepted {
        response: Response::offline(),
        source: ResponseSource::Synthetic,
      },
      Err(e) => {
        warn!(url = %request.url, "Store lookup failed: {}", e);
        Intercepted {
          response: Response::offline(),
          source: ResponseSource::Synthetic,
        }
      }
    }
  }
}

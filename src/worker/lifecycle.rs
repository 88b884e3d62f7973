//! Worker lifecycle and client session bookkeeping.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Lifecycle state of one worker version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Replaced or failed; never controls anything again
  Redundant,
}

/// One deployed version, identified by its store name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
  pub version: String,
  pub state: WorkerState,
}

impl Worker {
  fn new(version: &str, state: WorkerState) -> Self {
    Self {
      version: version.to_string(),
      state,
    }
  }
}

/// Installing, waiting and active slots for the versions of one interceptor.
///
/// An installed worker normally waits until the active one lets go. Calling
/// `skip_waiting` during install promotes it straight to activating and makes
/// the previous active worker redundant.
#[derive(Debug, Default)]
pub struct Registration {
  installing: Option<Worker>,
  waiting: Option<Worker>,
  active: Option<Worker>,
  /// Last worker that failed to install or was displaced
  redundant: Option<Worker>,
  skip_waiting: bool,
}

impl Registration {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registration that already has an activated version in control.
  pub fn with_active(version: &str) -> Self {
    Self {
      active: Some(Worker::new(version, WorkerState::Activated)),
      ..Self::default()
    }
  }

  pub fn installing(&self) -> Option<&Worker> {
    self.installing.as_ref()
  }

  pub fn waiting(&self) -> Option<&Worker> {
    self.waiting.as_ref()
  }

  pub fn active(&self) -> Option<&Worker> {
    self.active.as_ref()
  }

  pub fn redundant(&self) -> Option<&Worker> {
    self.redundant.as_ref()
  }

  pub fn begin_install(&mut self, version: &str) {
    self.skip_waiting = false;
    self.installing = Some(Worker::new(version, WorkerState::Installing));
  }

  /// Ask for activation as soon as install completes.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  /// Settle the installing worker. Returns true when it should activate now.
  pub fn finish_install(&mut self, succeeded: bool) -> Result<bool> {
    let mut worker = self
      .installing
      .take()
      .ok_or_else(|| eyre!("No worker is installing"))?;

    if !succeeded {
      self.retire(worker);
      return Ok(false);
    }

    worker.state = WorkerState::Installed;

    if self.skip_waiting || self.active.is_none() {
      self.promote(worker);
      Ok(true)
    } else {
      if let Some(previous) = self.waiting.replace(worker) {
        self.retire(previous);
      }
      Ok(false)
    }
  }

  /// Make `version` the activating worker, whatever slot it currently sits in.
  pub fn begin_activate(&mut self, version: &str) {
    let already_activating = self
      .active
      .as_ref()
      .is_some_and(|w| w.version == version && w.state == WorkerState::Activating);
    if already_activating {
      return;
    }

    let worker = match self.waiting.take() {
      Some(w) if w.version == version => w,
      other => {
        self.waiting = other;
        Worker::new(version, WorkerState::Installed)
      }
    };
    self.promote(worker);
  }

  pub fn finish_activate(&mut self) -> Result<()> {
    let worker = self
      .active
      .as_mut()
      .ok_or_else(|| eyre!("No worker is activating"))?;
    worker.state = WorkerState::Activated;
    Ok(())
  }

  fn promote(&mut self, mut worker: Worker) {
    worker.state = WorkerState::Activating;
    if let Some(previous) = self.active.replace(worker) {
      let same_version = self.active.as_ref().is_some_and(|w| w.version == previous.version);
      if !same_version {
        self.retire(previous);
      }
    }
  }

  fn retire(&mut self, mut worker: Worker) {
    worker.state = WorkerState::Redundant;
    self.redundant = Some(worker);
  }
}

/// Identifier of an open client session
pub type ClientId = u64;

/// Open client sessions and the version controlling each one.
#[derive(Debug, Default)]
pub struct Clients {
  sessions: Mutex<BTreeMap<ClientId, Option<String>>>,
  next_id: AtomicU64,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Open a session. New sessions start uncontrolled.
  pub fn open(&self) -> Result<ClientId> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .sessions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(id, None);
    Ok(id)
  }

  pub fn close(&self, id: ClientId) -> Result<()> {
    self
      .sessions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(&id);
    Ok(())
  }

  pub fn controller(&self, id: ClientId) -> Result<Option<String>> {
    let sessions = self
      .sessions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(sessions.get(&id).cloned().flatten())
  }

  /// Take control of every open session. Returns how many were claimed.
  pub fn claim(&self, version: &str) -> Result<usize> {
    let mut sessions = self
      .sessions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    for controller in sessions.values_mut() {
      *controller = Some(version.to_string());
    }
    Ok(sessions.len())
  }
}

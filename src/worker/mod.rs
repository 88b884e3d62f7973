//! The interceptor and the lifecycle model it runs under.
//!
//! One `Interceptor` per deployed version reacts to three signals:
//! - `install`: open the version's store and seed it with static assets
//! - `activate`: delete stores of every other version, claim open sessions
//! - `handle_fetch`: network-first routing with offline fallback

mod interceptor;
mod lifecycle;

pub use interceptor::{
  ActivateReport, FetchOutcome, InstallReport, Intercepted, Interceptor, ResponseSource,
};
pub use lifecycle::{ClientId, Clients, Registration, Worker, WorkerState};

//! Request/response snapshots and the outbound network.

mod client;
mod types;

pub use client::{HttpNetwork, Network};
pub use types::{CacheMode, Request, Response};

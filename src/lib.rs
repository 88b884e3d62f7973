//! Network-first request interception with versioned offline stores.

pub mod cache;
pub mod config;
pub mod net;
pub mod worker;

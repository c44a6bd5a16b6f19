//! Display terminal agent library
//!
//! Core modules of the signage edge agent: remote state watching, media
//! cache reconciliation, sync coordination and heartbeats.

pub mod app;
pub mod browser;
pub mod cache;
pub mod diagnostic;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod utils;
pub mod watcher;
pub mod workers;

//! # Stratus
//!
//! Index directories backed by a remote object store, with a local cache kept
//! coherent with the remote, and near-real-time search management on top.
//!
//! ## Features
//!
//! - Pluggable storage: local filesystem and in-memory directories
//! - Pluggable remote object stores: filesystem and in-memory
//! - Cache coherence keyed on the latest commit generation
//! - Optional zstd compression of segment files in the remote store
//! - Lease-based and marker-based distributed locks
//! - Near-real-time reader management with generation waiting
//! - Background reopen and commit threads

pub mod config;
pub mod engine;
pub mod error;
pub mod nrt;
pub mod remote;
pub mod storage;
pub mod sync;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

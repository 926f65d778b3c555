//! Portal5 Storage - SQLite persistence and transient state.
//!
//! This crate provides the storage layer of the proxy worker. It handles:
//!
//! - Configuration key-value storage (including the persisted worker settings)
//! - Transient namespaced entries with optional expiry (parked requests,
//!   client context records)
//! - Client context tracking with a record cap and liveness sweeps
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use portal5_storage::{ClientContextTracker, Database, TransientStore};
//!
//! let db = Arc::new(Database::in_memory().unwrap());
//! let store = Arc::new(TransientStore::new(db));
//! let tracker = ClientContextTracker::new(store);
//!
//! let url = url::Url::parse("https://target.example/").unwrap();
//! tracker.record("context-1", &url);
//! assert_eq!(tracker.represented("context-1"), Some(url));
//! ```

mod backend;
pub mod client_records;
mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;
pub mod transient;

pub use backend::{KvBackend, NoopBackend};
pub use client_records::{ClientContextRecord, ClientContextTracker};
pub use database::{Database, SETTINGS_KEY};
pub use error::{Result, StorageError};
pub use models::{Config, TransientEntry};
pub use pool::ConnectionPool;
pub use transient::TransientStore;

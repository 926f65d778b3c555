//! Database repositories for each table.

pub mod config;
pub mod entries;

pub use config::ConfigRepo;
pub use entries::EntriesRepo;

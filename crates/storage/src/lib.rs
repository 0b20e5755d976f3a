//! Storage abstraction and implementations for DevPulse.
//!
//! This crate provides a trait-based storage interface with a SQLite
//! implementation.

#![warn(missing_docs)]

pub mod trait_;
pub mod sqlite_storage;

pub use trait_::{Storage, StorageError, Result, SyncBatch};
pub use sqlite_storage::{SqliteBatch, SqliteStorage};

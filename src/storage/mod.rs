//! Storage module for host list persistence

pub mod persistence;

pub use persistence::{Storage, StorageConfig, StorageError};

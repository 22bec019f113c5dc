//! Key-value persistence capability used by the registry.
//!
//! # Responsibility
//! - Define the minimal `get/put/get_all/delete/clear` contract.
//! - Provide SQLite-backed and in-memory implementations.
//!
//! # Invariants
//! - Values are opaque UTF-8 strings; encoding belongs to the caller.
//! - Failures are reported as `StorageError` and never panic.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, REGISTRY_NAMESPACE};

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable key-value capability.
///
/// Reads take `&self`; writes take `&mut self` because the owning registry
/// serializes every mutation behind its own lock.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn put(&mut self, key: &str, value: &str) -> StorageResult<()>;
    /// Returns every `(key, value)` pair ordered by key.
    fn get_all(&self) -> StorageResult<Vec<(String, String)>>;
    fn delete(&mut self, key: &str) -> StorageResult<()>;
    fn clear(&mut self) -> StorageResult<()>;
}

/// Storage layer errors. Callers treat all of them as non-fatal.
#[derive(Debug)]
pub enum StorageError {
    Unavailable(String),
    Db(DbError),
    Codec(serde_json::Error),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "storage unavailable: {reason}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "stored value is malformed: {err}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Unavailable(_) => None,
            Self::Db(err) => Some(err),
            Self::Codec(err) => Some(err),
        }
    }
}

impl From<DbError> for StorageError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}

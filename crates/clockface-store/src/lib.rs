//! clockface-store: SQLite persistence for the clockface engine.
//!
//! One [`Database`] implements the core's [`Directory`], [`EmbeddingBackend`]
//! and [`AttendanceRepository`] seams over a single connection. The
//! connection mutex is held for one statement or transaction at a time.
//!
//! [`Directory`]: clockface_core::Directory
//! [`EmbeddingBackend`]: clockface_core::EmbeddingBackend
//! [`AttendanceRepository`]: clockface_core::AttendanceRepository

mod attendance;
pub mod cipher;
mod embeddings;
mod employees;
mod schema;

#[cfg(test)]
mod testutil;

pub use cipher::EmbeddingCipher;

use chrono::{DateTime, SecondsFormat, Utc};
use clockface_core::{DirectoryError, EmployeeId, RepositoryError, StoreError};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("employee {0} or its email is already registered")]
    DuplicateEmployee(EmployeeId),
    #[error("embedding cipher: {0}")]
    Crypto(String),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<DbError> for RepositoryError {
    fn from(err: DbError) -> Self {
        RepositoryError::Unavailable(err.to_string())
    }
}

impl From<DbError> for DirectoryError {
    fn from(err: DbError) -> Self {
        DirectoryError::Unavailable(err.to_string())
    }
}

pub struct Database {
    conn: Mutex<Connection>,
    cipher: Option<EmbeddingCipher>,
}

impl Database {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: None,
        })
    }

    /// Seal embedding vectors written from now on. Plaintext rows already
    /// on disk remain readable.
    pub fn with_cipher(mut self, cipher: EmbeddingCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// True for UNIQUE / PRIMARY KEY violations, false for every other failure
/// (including foreign key violations).
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

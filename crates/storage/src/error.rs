use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Which uniqueness rule a rejected write ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    UserEmail,
    Token,
    DeviceHandle,
    DeviceGroup,
    EncryptionKey,
    MessageId,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::UserEmail => "user email",
            Self::Token => "session token",
            Self::DeviceHandle => "device registration handle",
            Self::DeviceGroup => "device group",
            Self::EncryptionKey => "encryption key",
            Self::MessageId => "message id",
        };
        f.write_str(what)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0} already exists")]
    Conflict(ConflictKind),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("failed to create parent directory '{}': {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_conflict(&self, kind: ConflictKind) -> bool {
        matches!(self, Self::Conflict(k) if *k == kind)
    }

    pub(crate) fn corrupt(table: &'static str, detail: impl fmt::Display) -> Self {
        Self::Corrupt {
            table,
            detail: detail.to_string(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Maps a unique-constraint violation onto a typed conflict and passes every
/// other database error through unchanged.
pub(crate) fn conflict_or_db(err: sqlx::Error, kind: ConflictKind) -> StorageError {
    let unique = err
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if unique {
        StorageError::Conflict(kind)
    } else {
        StorageError::Database(err)
    }
}

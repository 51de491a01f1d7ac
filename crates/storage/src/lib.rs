use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite, SqliteConnection, Transaction,
};
use tracing::debug;

mod devices;
mod error;
mod groups;
mod messages;
mod tokens;
mod users;

pub use devices::{NewDevice, StoredDevice};
pub use error::{ConflictKind, StorageError, StorageResult};
pub use groups::{StoredDeviceGroup, StoredEncryptionKey};
pub use messages::{MessageFilter, NewMessage, StoredMessage};
pub use tokens::StoredToken;
pub use users::StoredUser;

const MEMORY_URL: &str = "sqlite::memory:";

/// Handle to the relay's SQLite database. Cheap to clone; every clone shares
/// one connection pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// An open write transaction. Dropping it without `commit` rolls back.
pub struct StorageTx {
    tx: Transaction<'static, Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> StorageResult<Self> {
        if database_url.starts_with(MEMORY_URL) {
            return Self::in_memory().await;
        }
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        Self::migrated(pool).await
    }

    /// In-memory database behind a single connection. Transactions queue on
    /// the pool, so concurrent writers are fully serialized.
    pub async fn in_memory() -> StorageResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(MEMORY_URL)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> StorageResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("storage migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> StorageResult<StorageTx> {
        Ok(StorageTx {
            tx: self.pool.begin().await?,
        })
    }

    async fn conn(&self) -> StorageResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }
}

impl StorageTx {
    pub async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> StorageResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> StorageResult<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|source| StorageError::Path {
        path: parent.to_path_buf(),
        source,
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

// This file is part of Bundler.
//
// Bundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Bundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Bundler.
// If not, see https://www.gnu.org/licenses/.

//! Embedded storage shared by the mempool and the reputation store.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadTransaction, ReadableDatabase, TableDefinition, WriteTransaction};

/// Mempool entries by op hash, JSON encoded.
pub(crate) const ENTRIES: TableDefinition<'static, &[u8], &[u8]> =
    TableDefinition::new("mempool_entries");
/// Insertion sequence number by op hash.
pub(crate) const SEQUENCE: TableDefinition<'static, &[u8], u64> =
    TableDefinition::new("mempool_sequence");
/// Pending entries ordered for selection: `(u128::MAX - priority) ‖ sequence ‖ op hash`.
pub(crate) const PENDING: TableDefinition<'static, &[u8], ()> =
    TableDefinition::new("mempool_pending");
/// `sender ‖ op hash`
pub(crate) const BY_SENDER: TableDefinition<'static, &[u8], ()> =
    TableDefinition::new("mempool_by_sender");
/// `paymaster ‖ op hash`
pub(crate) const BY_PAYMASTER: TableDefinition<'static, &[u8], ()> =
    TableDefinition::new("mempool_by_paymaster");
/// `state tag ‖ op hash`
pub(crate) const BY_STATE: TableDefinition<'static, &[u8], ()> =
    TableDefinition::new("mempool_by_state");
/// `bundle tx hash ‖ op hash`, submitted entries only.
pub(crate) const BY_TX: TableDefinition<'static, &[u8], ()> =
    TableDefinition::new("mempool_by_tx");
/// Named counters.
pub(crate) const META: TableDefinition<'static, &str, u64> =
    TableDefinition::new("mempool_meta");
/// Reputation entries by address, JSON encoded.
pub(crate) const REPUTATION: TableDefinition<'static, &[u8], &[u8]> =
    TableDefinition::new("reputation");

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database reported an error
    #[error("database error: {0}")]
    Database(#[from] redb::Error),
    /// A stored record could not be encoded or decoded
    #[error("corrupt record: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The blocking storage task panicked or was cancelled
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

macro_rules! from_redb_error {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(err: $err) -> Self {
                    StoreError::Database(err.into())
                }
            }
        )*
    };
}

from_redb_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Handle to the on-disk database.
///
/// Cheap to clone; all clones share one database. Every call runs on the
/// blocking thread pool inside a single transaction. redb admits one write
/// transaction at a time, so each `write` is atomic and serialized with
/// respect to every other `write`.
#[derive(Clone, Debug)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens the database at `path`, creating it and its tables if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(ENTRIES)?;
            txn.open_table(SEQUENCE)?;
            txn.open_table(PENDING)?;
            txn.open_table(BY_SENDER)?;
            txn.open_table(BY_PAYMASTER)?;
            txn.open_table(BY_STATE)?;
            txn.open_table(BY_TX)?;
            txn.open_table(META)?;
            txn.open_table(REPUTATION)?;
        }
        txn.commit()?;

        tracing::info!("Opened store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) async fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTransaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(StoreError::from)?;
            f(&txn)
        })
        .await
        .map_err(StoreError::from)?
    }

    /// Runs `f` in a write transaction, committing only if it succeeds.
    pub(crate) async fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&WriteTransaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(StoreError::from)?;
            let out = f(&txn)?;
            txn.commit().map_err(StoreError::from)?;
            Ok(out)
        })
        .await
        .map_err(StoreError::from)?
    }
}

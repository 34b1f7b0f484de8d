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

mod error;
pub use error::{MempoolError, MempoolResult};

mod persistent;
pub use persistent::PersistentMempool;

use alloy_primitives::{Address, B256, U256};
use bundler_types::{MempoolEntry, MempoolStats, Timestamp};
#[cfg(feature = "test-utils")]
use mockall::automock;

/// Durable store of user operations awaiting inclusion.
///
/// Batch transitions are best effort: hashes that are unknown or not in
/// the required source state are skipped, and the number of entries that
/// actually moved is returned.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait::async_trait]
pub trait Mempool: Send + Sync + 'static {
    /// Inserts a new pending entry. Returns `false`, leaving the stored entry
    /// untouched, if an entry with the same hash exists in any state.
    ///
    /// Lifecycle fields are reset; `added_at` is kept as stamped by
    /// `MempoolEntry::new`.
    async fn add(&self, entry: MempoolEntry) -> MempoolResult<bool>;

    /// Returns the entry with the given hash.
    async fn get(&self, hash: B256) -> MempoolResult<Option<MempoolEntry>>;

    /// Returns up to `limit` pending entries that are currently valid,
    /// highest priority first and then in insertion order.
    async fn get_pending(&self, limit: usize) -> MempoolResult<Vec<MempoolEntry>>;

    /// Like `get_pending`, skipping entries that would push the summed
    /// operation gas above `max_gas`.
    async fn get_pending_within_gas(
        &self,
        limit: usize,
        max_gas: U256,
    ) -> MempoolResult<Vec<MempoolEntry>>;

    /// Returns all entries from `sender`, in any state.
    async fn get_by_sender(&self, sender: Address) -> MempoolResult<Vec<MempoolEntry>>;

    /// Returns all entries sponsored by `paymaster`, in any state.
    async fn get_by_paymaster(&self, paymaster: Address) -> MempoolResult<Vec<MempoolEntry>>;

    /// Returns the entries submitted in `tx_hash`.
    async fn get_by_transaction(&self, tx_hash: B256) -> MempoolResult<Vec<MempoolEntry>>;

    /// Moves pending entries to submitted, bound to `tx_hash`.
    async fn mark_submitted(&self, hashes: Vec<B256>, tx_hash: B256) -> MempoolResult<usize>;

    /// Moves entries submitted in `tx_hash` to included.
    async fn mark_included(
        &self,
        hashes: Vec<B256>,
        tx_hash: B256,
        block_number: u64,
    ) -> MempoolResult<usize>;

    /// Moves pending or submitted entries to failed.
    async fn mark_failed(&self, hashes: Vec<B256>, error: String) -> MempoolResult<usize>;

    /// Returns every entry submitted in `tx_hash` to pending, incrementing
    /// its retry count. Entries past the retry bound are dropped instead.
    /// Returns the updated entries.
    async fn revert_submitted(&self, tx_hash: B256) -> MempoolResult<Vec<MempoolEntry>>;

    /// Distinct bundle transactions that still carry submitted entries.
    async fn submitted_transactions(&self) -> MempoolResult<Vec<B256>>;

    /// Deletes an entry in any state. Returns whether it existed.
    async fn remove(&self, hash: B256) -> MempoolResult<bool>;

    /// Number of entries in any state.
    async fn count(&self) -> MempoolResult<u64>;

    /// Aggregates over the stored entries.
    async fn get_stats(&self) -> MempoolResult<MempoolStats>;

    /// Deletes stale pending entries and old terminal entries. Returns the
    /// number deleted.
    async fn prune(&self, now: Timestamp) -> MempoolResult<usize>;

    /// Deletes every entry.
    async fn clear(&self) -> MempoolResult<()>;
}

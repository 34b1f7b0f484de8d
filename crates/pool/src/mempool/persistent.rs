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

use alloy_primitives::{Address, B256, U256};
use bundler_types::{EntryState, MempoolConfig, MempoolEntry, MempoolStats, Timestamp};
use metrics::Counter;
use metrics_derive::Metrics;
use redb::{
    Key, ReadOnlyTable, ReadTransaction, ReadableTable, ReadableTableMetadata, Table,
    TableDefinition, Value, WriteTransaction,
};
use tracing::{debug, info};

use super::{error::MempoolResult, Mempool, MempoolError};
use crate::store::{
    Store, StoreError, BY_PAYMASTER, BY_SENDER, BY_STATE, BY_TX, ENTRIES, META, PENDING, SEQUENCE,
};

const SEQUENCE_COUNTER: &str = "next_sequence";
const HASH_LEN: usize = 32;
const ADDRESS_LEN: usize = 20;

/// Mempool persisted in the embedded store.
///
/// Each entry is stored once by hash. Secondary indices for selection
/// order, sender, paymaster, state and bundle transaction are written in
/// the same transaction as the entry, so they never disagree with it.
pub struct PersistentMempool {
    store: Store,
    config: MempoolConfig,
    metrics: MempoolMetrics,
}

impl PersistentMempool {
    /// Creates a mempool over `store`.
    pub fn new(store: Store, config: MempoolConfig) -> Self {
        Self {
            store,
            config,
            metrics: MempoolMetrics::default(),
        }
    }

    async fn select_pending(
        &self,
        limit: usize,
        max_gas: Option<U256>,
    ) -> MempoolResult<Vec<MempoolEntry>> {
        let now = Timestamp::now();
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                Ok(select_pending(&snapshot, limit, max_gas, now)?)
            })
            .await
    }

    async fn transition<F>(&self, hashes: Vec<B256>, f: F) -> MempoolResult<Vec<MempoolEntry>>
    where
        F: Fn(&MempoolEntry) -> Option<MempoolEntry> + Send + 'static,
    {
        self.store
            .write(move |txn| {
                let mut tables = Tables::open(txn)?;
                Ok(tables.transition(&hashes, f)?)
            })
            .await
    }
}

#[async_trait::async_trait]
impl Mempool for PersistentMempool {
    async fn add(&self, entry: MempoolEntry) -> MempoolResult<bool> {
        let entry = MempoolEntry {
            state: EntryState::Pending,
            submitted_tx_hash: None,
            submitted_at: None,
            block_number: None,
            retry_count: 0,
            error: None,
            ..entry
        };
        let hash = entry.user_op_hash;
        let max_pending = self.config.max_pending;

        let added = self
            .store
            .write(move |txn| {
                let mut tables = Tables::open(txn)?;
                if tables.entry(&hash)?.is_some() {
                    return Ok(false);
                }
                if let Some(max_pending) = max_pending {
                    if tables.count_in_state(EntryState::Pending)? >= max_pending {
                        return Err(MempoolError::PoolFull(max_pending));
                    }
                }
                let seq = tables.next_sequence()?;
                tables.insert(&entry, seq)?;
                Ok(true)
            })
            .await?;

        if added {
            debug!("Added op {hash} to mempool");
            self.metrics.ops_added.increment(1);
        } else {
            debug!("Op {hash} already in mempool");
            self.metrics.ops_duplicate.increment(1);
        }
        Ok(added)
    }

    async fn get(&self, hash: B256) -> MempoolResult<Option<MempoolEntry>> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                Ok(load_entry(&snapshot.entries, &hash)?)
            })
            .await
    }

    async fn get_pending(&self, limit: usize) -> MempoolResult<Vec<MempoolEntry>> {
        self.select_pending(limit, None).await
    }

    async fn get_pending_within_gas(
        &self,
        limit: usize,
        max_gas: U256,
    ) -> MempoolResult<Vec<MempoolEntry>> {
        self.select_pending(limit, Some(max_gas)).await
    }

    async fn get_by_sender(&self, sender: Address) -> MempoolResult<Vec<MempoolEntry>> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                let hashes = scan_prefix(&snapshot.by_sender, sender.as_slice())?;
                Ok(load_entries(&snapshot.entries, hashes)?)
            })
            .await
    }

    async fn get_by_paymaster(&self, paymaster: Address) -> MempoolResult<Vec<MempoolEntry>> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                let hashes = scan_prefix(&snapshot.by_paymaster, paymaster.as_slice())?;
                Ok(load_entries(&snapshot.entries, hashes)?)
            })
            .await
    }

    async fn get_by_transaction(&self, tx_hash: B256) -> MempoolResult<Vec<MempoolEntry>> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                let hashes = scan_prefix(&snapshot.by_tx, tx_hash.as_slice())?;
                Ok(load_entries(&snapshot.entries, hashes)?)
            })
            .await
    }

    async fn mark_submitted(&self, hashes: Vec<B256>, tx_hash: B256) -> MempoolResult<usize> {
        let now = Timestamp::now();
        let updated = self
            .transition(hashes, move |entry| {
                (entry.state == EntryState::Pending).then(|| MempoolEntry {
                    state: EntryState::Submitted,
                    submitted_tx_hash: Some(tx_hash),
                    submitted_at: Some(now),
                    ..entry.clone()
                })
            })
            .await?;
        Ok(updated.len())
    }

    async fn mark_included(
        &self,
        hashes: Vec<B256>,
        tx_hash: B256,
        block_number: u64,
    ) -> MempoolResult<usize> {
        let updated = self
            .transition(hashes, move |entry| {
                (entry.state == EntryState::Submitted && entry.submitted_tx_hash == Some(tx_hash))
                    .then(|| MempoolEntry {
                        state: EntryState::Included,
                        block_number: Some(block_number),
                        ..entry.clone()
                    })
            })
            .await?;
        Ok(updated.len())
    }

    async fn mark_failed(&self, hashes: Vec<B256>, error: String) -> MempoolResult<usize> {
        let updated = self
            .transition(hashes, move |entry| {
                matches!(entry.state, EntryState::Pending | EntryState::Submitted).then(|| {
                    MempoolEntry {
                        state: EntryState::Failed,
                        error: Some(error.clone()),
                        ..entry.clone()
                    }
                })
            })
            .await?;
        Ok(updated.len())
    }

    async fn revert_submitted(&self, tx_hash: B256) -> MempoolResult<Vec<MempoolEntry>> {
        let max_retries = self.config.max_retries;
        let updated = self
            .store
            .write(move |txn| {
                let mut tables = Tables::open(txn)?;
                let hashes = scan_prefix(&tables.by_tx, tx_hash.as_slice())?;
                Ok::<_, MempoolError>(tables.transition(&hashes, |entry| {
                    if entry.state != EntryState::Submitted
                        || entry.submitted_tx_hash != Some(tx_hash)
                    {
                        return None;
                    }
                    let retry_count = entry.retry_count.saturating_add(1);
                    let exhausted = max_retries.is_some_and(|max| retry_count > max);
                    Some(MempoolEntry {
                        state: if exhausted {
                            EntryState::Dropped
                        } else {
                            EntryState::Pending
                        },
                        submitted_tx_hash: None,
                        submitted_at: None,
                        retry_count,
                        error: exhausted
                            .then(|| format!("dropped after {retry_count} reverted submissions")),
                        ..entry.clone()
                    })
                })?)
            })
            .await?;

        let dropped = updated
            .iter()
            .filter(|e| e.state == EntryState::Dropped)
            .count();
        self.metrics
            .ops_reverted
            .increment((updated.len() - dropped) as u64);
        self.metrics.ops_dropped.increment(dropped as u64);
        Ok(updated)
    }

    async fn submitted_transactions(&self) -> MempoolResult<Vec<B256>> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                Ok(distinct_prefixes(&snapshot.by_tx, HASH_LEN)?
                    .into_iter()
                    .map(|prefix| B256::from_slice(&prefix))
                    .collect())
            })
            .await
    }

    async fn remove(&self, hash: B256) -> MempoolResult<bool> {
        self.store
            .write(move |txn| {
                let mut tables = Tables::open(txn)?;
                match tables.entry(&hash)? {
                    Some(entry) => {
                        tables.delete(&entry)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await
    }

    async fn count(&self) -> MempoolResult<u64> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                Ok(snapshot.entries.len().map_err(StoreError::from)?)
            })
            .await
    }

    async fn get_stats(&self) -> MempoolResult<MempoolStats> {
        self.store
            .read(move |txn| {
                let snapshot = Snapshot::open(txn)?;
                Ok(stats(&snapshot)?)
            })
            .await
    }

    async fn prune(&self, now: Timestamp) -> MempoolResult<usize> {
        let pending_ttl = self.config.pending_ttl;
        let retention = self.config.terminal_retention;

        let pruned = self
            .store
            .write(move |txn| {
                let mut tables = Tables::open(txn)?;
                let mut stale = vec![];
                for state in EntryState::ALL {
                    if state == EntryState::Submitted {
                        continue;
                    }
                    let hashes = scan_prefix(&tables.by_state, &[state.tag()])?;
                    for entry in load_entries(&tables.entries, hashes)? {
                        let age = now.elapsed_since(entry.added_at);
                        let is_stale = if state == EntryState::Pending {
                            age >= pending_ttl || entry.is_expired_at(now)
                        } else {
                            age >= retention
                        };
                        if is_stale {
                            stale.push(entry);
                        }
                    }
                }
                for entry in &stale {
                    tables.delete(entry)?;
                }
                Ok::<_, MempoolError>(stale.len())
            })
            .await?;

        if pruned > 0 {
            info!("Pruned {pruned} ops from mempool");
            self.metrics.ops_pruned.increment(pruned as u64);
        }
        Ok(pruned)
    }

    async fn clear(&self) -> MempoolResult<()> {
        self.store
            .write(move |txn| {
                reset_table(txn, ENTRIES)?;
                reset_table(txn, SEQUENCE)?;
                reset_table(txn, PENDING)?;
                reset_table(txn, BY_SENDER)?;
                reset_table(txn, BY_PAYMASTER)?;
                reset_table(txn, BY_STATE)?;
                reset_table(txn, BY_TX)?;
                Ok(())
            })
            .await
    }
}

/// Index keys derived from an entry. Each is suffixed by the op hash.
struct IndexKeys {
    sender: Vec<u8>,
    paymaster: Option<Vec<u8>>,
    state: Vec<u8>,
    pending: Option<Vec<u8>>,
    tx: Option<Vec<u8>>,
}

impl IndexKeys {
    fn of(entry: &MempoolEntry, seq: u64) -> Self {
        let hash = entry.user_op_hash.as_slice();
        Self {
            sender: [entry.sender().as_slice(), hash].concat(),
            paymaster: entry.paymaster.map(|p| [p.as_slice(), hash].concat()),
            state: [&[entry.state.tag()][..], hash].concat(),
            pending: (entry.state == EntryState::Pending).then(|| {
                [
                    &(u128::MAX - entry.priority).to_be_bytes()[..],
                    &seq.to_be_bytes()[..],
                    hash,
                ]
                .concat()
            }),
            tx: entry
                .submitted_tx_hash
                .filter(|_| entry.state == EntryState::Submitted)
                .map(|tx| [tx.as_slice(), hash].concat()),
        }
    }
}

/// Tables opened in a write transaction.
struct Tables<'txn> {
    entries: Table<'txn, &'static [u8], &'static [u8]>,
    sequence: Table<'txn, &'static [u8], u64>,
    pending: Table<'txn, &'static [u8], ()>,
    by_sender: Table<'txn, &'static [u8], ()>,
    by_paymaster: Table<'txn, &'static [u8], ()>,
    by_state: Table<'txn, &'static [u8], ()>,
    by_tx: Table<'txn, &'static [u8], ()>,
    meta: Table<'txn, &'static str, u64>,
}

impl<'txn> Tables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self, StoreError> {
        Ok(Self {
            entries: txn.open_table(ENTRIES)?,
            sequence: txn.open_table(SEQUENCE)?,
            pending: txn.open_table(PENDING)?,
            by_sender: txn.open_table(BY_SENDER)?,
            by_paymaster: txn.open_table(BY_PAYMASTER)?,
            by_state: txn.open_table(BY_STATE)?,
            by_tx: txn.open_table(BY_TX)?,
            meta: txn.open_table(META)?,
        })
    }

    fn entry(&self, hash: &B256) -> Result<Option<MempoolEntry>, StoreError> {
        load_entry(&self.entries, hash)
    }

    fn count_in_state(&self, state: EntryState) -> Result<usize, StoreError> {
        Ok(scan_prefix(&self.by_state, &[state.tag()])?.len())
    }

    fn next_sequence(&mut self) -> Result<u64, StoreError> {
        let seq = self
            .meta
            .get(SEQUENCE_COUNTER)?
            .map(|v| v.value())
            .unwrap_or_default();
        self.meta.insert(SEQUENCE_COUNTER, seq + 1)?;
        Ok(seq)
    }

    fn sequence_of(&self, hash: &B256) -> Result<u64, StoreError> {
        Ok(self
            .sequence
            .get(hash.as_slice())?
            .map(|v| v.value())
            .unwrap_or_default())
    }

    fn insert(&mut self, entry: &MempoolEntry, seq: u64) -> Result<(), StoreError> {
        let hash = entry.user_op_hash;
        self.entries
            .insert(hash.as_slice(), serde_json::to_vec(entry)?.as_slice())?;
        self.sequence.insert(hash.as_slice(), seq)?;
        self.index(entry, seq)
    }

    fn replace(&mut self, old: &MempoolEntry, new: &MempoolEntry) -> Result<(), StoreError> {
        let seq = self.sequence_of(&old.user_op_hash)?;
        self.unindex(old, seq)?;
        self.entries
            .insert(new.user_op_hash.as_slice(), serde_json::to_vec(new)?.as_slice())?;
        self.index(new, seq)
    }

    fn delete(&mut self, entry: &MempoolEntry) -> Result<(), StoreError> {
        let hash = entry.user_op_hash;
        let seq = self.sequence_of(&hash)?;
        self.unindex(entry, seq)?;
        self.entries.remove(hash.as_slice())?;
        self.sequence.remove(hash.as_slice())?;
        Ok(())
    }

    fn transition<F>(&mut self, hashes: &[B256], f: F) -> Result<Vec<MempoolEntry>, StoreError>
    where
        F: Fn(&MempoolEntry) -> Option<MempoolEntry>,
    {
        let mut updated = vec![];
        for hash in hashes {
            let Some(entry) = self.entry(hash)? else {
                continue;
            };
            let Some(next) = f(&entry) else {
                continue;
            };
            self.replace(&entry, &next)?;
            updated.push(next);
        }
        Ok(updated)
    }

    fn index(&mut self, entry: &MempoolEntry, seq: u64) -> Result<(), StoreError> {
        let keys = IndexKeys::of(entry, seq);
        self.by_sender.insert(keys.sender.as_slice(), ())?;
        self.by_state.insert(keys.state.as_slice(), ())?;
        if let Some(key) = &keys.paymaster {
            self.by_paymaster.insert(key.as_slice(), ())?;
        }
        if let Some(key) = &keys.pending {
            self.pending.insert(key.as_slice(), ())?;
        }
        if let Some(key) = &keys.tx {
            self.by_tx.insert(key.as_slice(), ())?;
        }
        Ok(())
    }

    fn unindex(&mut self, entry: &MempoolEntry, seq: u64) -> Result<(), StoreError> {
        let keys = IndexKeys::of(entry, seq);
        self.by_sender.remove(keys.sender.as_slice())?;
        self.by_state.remove(keys.state.as_slice())?;
        if let Some(key) = &keys.paymaster {
            self.by_paymaster.remove(key.as_slice())?;
        }
        if let Some(key) = &keys.pending {
            self.pending.remove(key.as_slice())?;
        }
        if let Some(key) = &keys.tx {
            self.by_tx.remove(key.as_slice())?;
        }
        Ok(())
    }
}

/// Tables opened in a read transaction.
struct Snapshot {
    entries: ReadOnlyTable<&'static [u8], &'static [u8]>,
    pending: ReadOnlyTable<&'static [u8], ()>,
    by_sender: ReadOnlyTable<&'static [u8], ()>,
    by_paymaster: ReadOnlyTable<&'static [u8], ()>,
    by_state: ReadOnlyTable<&'static [u8], ()>,
    by_tx: ReadOnlyTable<&'static [u8], ()>,
}

impl Snapshot {
    fn open(txn: &ReadTransaction) -> Result<Self, StoreError> {
        Ok(Self {
            entries: txn.open_table(ENTRIES)?,
            pending: txn.open_table(PENDING)?,
            by_sender: txn.open_table(BY_SENDER)?,
            by_paymaster: txn.open_table(BY_PAYMASTER)?,
            by_state: txn.open_table(BY_STATE)?,
            by_tx: txn.open_table(BY_TX)?,
        })
    }
}

fn load_entry(
    entries: &impl ReadableTable<&'static [u8], &'static [u8]>,
    hash: &B256,
) -> Result<Option<MempoolEntry>, StoreError> {
    match entries.get(hash.as_slice())? {
        Some(row) => Ok(Some(serde_json::from_slice(row.value())?)),
        None => Ok(None),
    }
}

fn load_entries(
    entries: &impl ReadableTable<&'static [u8], &'static [u8]>,
    hashes: impl IntoIterator<Item = B256>,
) -> Result<Vec<MempoolEntry>, StoreError> {
    let mut out = vec![];
    for hash in hashes {
        if let Some(entry) = load_entry(entries, &hash)? {
            out.push(entry);
        }
    }
    Ok(out)
}

/// Op hashes of all index keys starting with `prefix`.
fn scan_prefix(
    index: &impl ReadableTable<&'static [u8], ()>,
    prefix: &[u8],
) -> Result<Vec<B256>, StoreError> {
    let mut hashes = vec![];
    for row in index.range(prefix..)? {
        let (key, _) = row?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        hashes.push(B256::from_slice(&key[key.len() - HASH_LEN..]));
    }
    Ok(hashes)
}

/// Distinct leading `len` byte prefixes of an index, in key order.
fn distinct_prefixes(
    index: &impl ReadableTable<&'static [u8], ()>,
    len: usize,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut prefixes: Vec<Vec<u8>> = vec![];
    for row in index.iter()? {
        let (key, _) = row?;
        let prefix = &key.value()[..len];
        if prefixes.last().map(Vec::as_slice) != Some(prefix) {
            prefixes.push(prefix.to_vec());
        }
    }
    Ok(prefixes)
}

fn select_pending(
    snapshot: &Snapshot,
    limit: usize,
    max_gas: Option<U256>,
    now: Timestamp,
) -> Result<Vec<MempoolEntry>, StoreError> {
    let mut selected = vec![];
    let mut gas = U256::ZERO;

    for row in snapshot.pending.iter()? {
        if selected.len() >= limit {
            break;
        }
        let (key, _) = row?;
        let key = key.value();
        let hash = B256::from_slice(&key[key.len() - HASH_LEN..]);
        let Some(entry) = load_entry(&snapshot.entries, &hash)? else {
            continue;
        };
        if !entry.is_valid_at(now) {
            continue;
        }
        if let Some(max_gas) = max_gas {
            let total = gas.saturating_add(entry.user_operation.operation_gas());
            if total > max_gas {
                continue;
            }
            gas = total;
        }
        selected.push(entry);
    }

    Ok(selected)
}

fn stats(snapshot: &Snapshot) -> Result<MempoolStats, StoreError> {
    let in_state = |state: EntryState| scan_prefix(&snapshot.by_state, &[state.tag()]);

    let pending = in_state(EntryState::Pending)?;
    let submitted = in_state(EntryState::Submitted)?;
    let (pending_count, submitted_count) = (pending.len() as u64, submitted.len() as u64);
    let total_prefund = load_entries(&snapshot.entries, pending.into_iter().chain(submitted))?
        .iter()
        .fold(U256::ZERO, |acc, entry| acc.saturating_add(entry.prefund));

    Ok(MempoolStats {
        total_count: snapshot.entries.len()?,
        pending_count,
        submitted_count,
        included_count: in_state(EntryState::Included)?.len() as u64,
        failed_count: in_state(EntryState::Failed)?.len() as u64,
        dropped_count: in_state(EntryState::Dropped)?.len() as u64,
        unique_senders: distinct_prefixes(&snapshot.by_sender, ADDRESS_LEN)?.len() as u64,
        unique_paymasters: distinct_prefixes(&snapshot.by_paymaster, ADDRESS_LEN)?.len() as u64,
        total_prefund,
    })
}

fn reset_table<K: Key + 'static, V: Value + 'static>(
    txn: &WriteTransaction,
    table: TableDefinition<'_, K, V>,
) -> Result<(), StoreError> {
    txn.delete_table(table)?;
    txn.open_table(table)?;
    Ok(())
}

#[derive(Metrics)]
#[metrics(scope = "mempool")]
struct MempoolMetrics {
    #[metric(describe = "the count of ops added to the mempool.")]
    ops_added: Counter,
    #[metric(describe = "the count of ops rejected as duplicates.")]
    ops_duplicate: Counter,
    #[metric(describe = "the count of ops returned to pending after a reverted bundle.")]
    ops_reverted: Counter,
    #[metric(describe = "the count of ops dropped after exhausting their retries.")]
    ops_dropped: Counter,
    #[metric(describe = "the count of ops pruned from the mempool.")]
    ops_pruned: Counter,
}

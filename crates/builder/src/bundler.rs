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

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{Address, B256, U256};
use bundler_pool::{Mempool, MempoolError, ReputationError, ReputationStore};
use bundler_types::{
    Bundle, BundleExecutionResult, BundlerConfig, EntryState, MempoolEntry, ReputationStatus,
    Timestamp,
};
use bundler_utils::{emit::WithEntryPoint, log::LogOnError};
use metrics::Counter;
use metrics_derive::Metrics;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{
    emit::BuilderEvent,
    executor::{estimate_gas, op_gas, BundleExecutor, Simulation, BUNDLE_BASE_GAS},
};

/// Bundler error
#[derive(Debug, thiserror::Error)]
pub enum BundlerError {
    /// The operation targets an entry point this bundler does not serve
    #[error("unsupported entry point {0}")]
    UnsupportedEntryPoint(Address),
    /// An entity of the operation is on the blocklist
    #[error("entity {0} is blocked")]
    Blocked(Address),
    /// An entity of the operation is banned
    #[error("entity {0} is banned")]
    Banned(Address),
    /// An entity of the operation is throttled and has enough ops in flight
    #[error("entity {0} is throttled")]
    Throttled(Address),
    /// The operation is already known
    #[error("operation {0} already in mempool")]
    Duplicate(B256),
    /// The given hash is not the hash of the operation
    #[error("operation hash {actual} does not match computed hash {expected}")]
    HashMismatch {
        /// Hash computed from the operation, entry point and chain id
        expected: B256,
        /// Hash supplied with the operation
        actual: B256,
    },
    /// The operation relies on a signature aggregator
    #[error("signature aggregator {0} is not supported")]
    AggregatorUnsupported(Address),
    /// Mempool failure
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    /// Reputation store failure
    #[error(transparent)]
    Reputation(#[from] ReputationError),
}

/// Admits operations and turns pending operations into bundles.
///
/// Cheap to clone; clones share the same mempool, reputation store and
/// executor.
pub struct Bundler<M, R, E> {
    mempool: Arc<M>,
    reputation: Arc<R>,
    executor: Arc<E>,
    config: Arc<BundlerConfig>,
    event_sender: broadcast::Sender<WithEntryPoint<BuilderEvent>>,
    metrics: Arc<BundlerMetrics>,
}

impl<M, R, E> Clone for Bundler<M, R, E> {
    fn clone(&self) -> Self {
        Self {
            mempool: Arc::clone(&self.mempool),
            reputation: Arc::clone(&self.reputation),
            executor: Arc::clone(&self.executor),
            config: Arc::clone(&self.config),
            event_sender: self.event_sender.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<M, R, E> Bundler<M, R, E>
where
    M: Mempool,
    R: ReputationStore,
    E: BundleExecutor,
{
    /// Creates a bundler
    pub fn new(
        mempool: Arc<M>,
        reputation: Arc<R>,
        executor: Arc<E>,
        config: BundlerConfig,
        event_sender: broadcast::Sender<WithEntryPoint<BuilderEvent>>,
    ) -> Self {
        Self {
            mempool,
            reputation,
            executor,
            config: Arc::new(config),
            event_sender,
            metrics: Arc::new(BundlerMetrics::default()),
        }
    }

    /// Bundler configuration
    pub fn config(&self) -> &BundlerConfig {
        &self.config
    }

    /// Admits `entry` to the mempool, returning its hash.
    pub async fn submit(&self, entry: MempoolEntry) -> Result<B256, BundlerError> {
        let hash = entry.user_op_hash;
        let entry_point = entry.entry_point;
        let sender = entry.sender();

        match self.admit(entry).await {
            Ok(()) => {
                debug!("Admitted op {hash} from {sender}");
                self.metrics.ops_admitted.increment(1);
                self.emit(entry_point, BuilderEvent::op_admitted(hash, sender));
                Ok(hash)
            }
            Err(error) => {
                debug!("Rejected op {hash}: {error}");
                self.metrics.ops_rejected.increment(1);
                self.emit(entry_point, BuilderEvent::op_rejected(hash, &error));
                Err(error)
            }
        }
    }

    async fn admit(&self, entry: MempoolEntry) -> Result<(), BundlerError> {
        if !self.is_supported(entry.entry_point) {
            return Err(BundlerError::UnsupportedEntryPoint(entry.entry_point));
        }
        let expected = entry
            .user_operation
            .hash(entry.entry_point, self.config.chain_id);
        if expected != entry.user_op_hash {
            return Err(BundlerError::HashMismatch {
                expected,
                actual: entry.user_op_hash,
            });
        }
        if let Some(aggregator) = entry.aggregator {
            return Err(BundlerError::AggregatorUnsupported(aggregator));
        }

        let entities = [Some(entry.sender()), entry.paymaster, entry.factory];
        if let Some(blocked) = entities
            .into_iter()
            .flatten()
            .find(|addr| self.config.blocklist.contains(addr))
        {
            return Err(BundlerError::Blocked(blocked));
        }

        for addr in entry.accountable_entities() {
            match self.reputation.status(addr).await? {
                ReputationStatus::Banned => return Err(BundlerError::Banned(addr)),
                ReputationStatus::Throttled => {
                    if self.ops_in_flight(addr, addr == entry.sender()).await?
                        >= self.config.throttled_entity_mempool_count
                    {
                        return Err(BundlerError::Throttled(addr));
                    }
                }
                ReputationStatus::Ok => {}
            }
        }

        let hash = entry.user_op_hash;
        if !self.mempool.add(entry).await? {
            return Err(BundlerError::Duplicate(hash));
        }
        Ok(())
    }

    async fn ops_in_flight(&self, addr: Address, is_sender: bool) -> Result<usize, BundlerError> {
        let entries = if is_sender {
            self.mempool.get_by_sender(addr).await?
        } else {
            self.mempool.get_by_paymaster(addr).await?
        };
        Ok(entries.iter().filter(|e| !e.state.is_terminal()).count())
    }

    /// Settles earlier submissions, then selects pending operations, bundles
    /// them per entry point and submits each bundle. Returns the outcome of
    /// every bundle sent or attempted in this round.
    #[instrument(skip_all)]
    pub async fn bundle_once(&self) -> Result<Vec<BundleExecutionResult>, BundlerError> {
        self.settle_submitted().await?;

        let candidates = self
            .mempool
            .get_pending(self.config.max_bundle_size.saturating_mul(4))
            .await?;
        if candidates.is_empty() {
            debug!("No pending ops to bundle");
            return Ok(vec![]);
        }

        let mut groups = self.select(candidates).await?;
        let mut results = vec![];

        for entry_point in &self.config.supported_entry_points {
            let Some(entries) = groups.remove(entry_point) else {
                continue;
            };
            let Some(bundle) = self.simulated_bundle(*entry_point, entries).await? else {
                continue;
            };

            info!(
                "Executing bundle of {} ops for entry point {entry_point}",
                bundle.len()
            );
            self.metrics.bundles_attempted.increment(1);
            let result = match self.executor.send(&bundle).await {
                Ok(tx_hash) => {
                    self.mempool
                        .mark_submitted(bundle.user_op_hashes(), tx_hash)
                        .await?;
                    self.executor.confirm(&bundle, tx_hash).await
                }
                Err(result) => result,
            };
            self.apply(&bundle, &result).await?;
            results.push(result);
        }

        Ok(results)
    }

    /// Applies reputation rules to `candidates` and groups the survivors by
    /// entry point, at most `max_bundle_size` ops and `max_bundle_gas` gas
    /// per group.
    async fn select(
        &self,
        candidates: Vec<MempoolEntry>,
    ) -> Result<HashMap<Address, Vec<MempoolEntry>>, BundlerError> {
        let max_gas = U256::from(self.config.max_bundle_gas);
        let mut statuses = HashMap::<Address, ReputationStatus>::new();
        let mut throttled_counts = HashMap::<Address, usize>::new();
        let mut groups = HashMap::<Address, Vec<MempoolEntry>>::new();
        let mut group_gas = HashMap::<Address, U256>::new();

        'candidates: for entry in candidates {
            if !self.is_supported(entry.entry_point) {
                continue;
            }
            if let Some(aggregator) = entry.aggregator {
                debug!(
                    "Skipping op {} using aggregator {aggregator}",
                    entry.user_op_hash
                );
                continue;
            }
            if groups
                .get(&entry.entry_point)
                .is_some_and(|group| group.len() >= self.config.max_bundle_size)
            {
                continue;
            }

            let mut throttled = vec![];
            for addr in entry.accountable_entities() {
                let status = match statuses.get(&addr) {
                    Some(status) => *status,
                    None => {
                        let status = self.reputation.status(addr).await?;
                        statuses.insert(addr, status);
                        status
                    }
                };
                match status {
                    ReputationStatus::Banned => {
                        debug!("Skipping op {} from banned {addr}", entry.user_op_hash);
                        continue 'candidates;
                    }
                    ReputationStatus::Throttled => {
                        if throttled_counts.get(&addr).copied().unwrap_or_default()
                            >= self.config.throttled_entity_bundle_count
                        {
                            debug!("Skipping op {} from throttled {addr}", entry.user_op_hash);
                            continue 'candidates;
                        }
                        throttled.push(addr);
                    }
                    ReputationStatus::Ok => {}
                }
            }

            let gas = group_gas
                .entry(entry.entry_point)
                .or_insert(U256::from(BUNDLE_BASE_GAS));
            let with_op = gas.saturating_add(op_gas(&entry));
            if with_op > max_gas {
                debug!("Skipping op {} over the bundle gas limit", entry.user_op_hash);
                continue;
            }
            *gas = with_op;

            for addr in throttled {
                *throttled_counts.entry(addr).or_default() += 1;
            }
            groups.entry(entry.entry_point).or_default().push(entry);
        }

        Ok(groups)
    }

    /// Builds a bundle from `entries` and simulates it, failing and removing
    /// each op the entry point rejects until the rest passes. Returns `None`
    /// if nothing is left to send.
    async fn simulated_bundle(
        &self,
        entry_point: Address,
        mut entries: Vec<MempoolEntry>,
    ) -> Result<Option<Bundle>, BundlerError> {
        while !entries.is_empty() {
            let bundle = match self.executor.build_bundle(entries) {
                Ok(bundle) => bundle,
                Err(error) => {
                    warn!("Failed to build bundle for {entry_point}: {error}");
                    return Ok(None);
                }
            };

            let error = match self.executor.simulate(&bundle).await {
                Simulation::Passed => return Ok(Some(bundle)),
                Simulation::Reverted(revert) => {
                    match revert.op_index().filter(|index| *index < bundle.len()) {
                        Some(index) => {
                            let mut remaining = bundle.entries;
                            let failed = remaining.remove(index);
                            self.fail_op(entry_point, &failed, revert.to_string())
                                .await?;
                            entries = remaining;
                            continue;
                        }
                        None => revert.to_string(),
                    }
                }
                Simulation::Error(error) => error,
            };

            warn!("Skipping bundle for {entry_point}, simulation failed: {error}");
            self.emit(
                entry_point,
                BuilderEvent::bundle_failed(None, Some(error), bundle.user_op_hashes()),
            );
            return Ok(None);
        }

        debug!("Every op for {entry_point} failed simulation");
        Ok(None)
    }

    /// Marks `entry` failed and charges its entities.
    async fn fail_op(
        &self,
        entry_point: Address,
        entry: &MempoolEntry,
        reason: String,
    ) -> Result<(), BundlerError> {
        warn!("Op {} failed in bundle: {reason}", entry.user_op_hash);
        self.mempool
            .mark_failed(vec![entry.user_op_hash], reason.clone())
            .await?;
        for addr in entry.accountable_entities() {
            let _ = self
                .reputation
                .record_failed(addr)
                .await
                .log_on_error("should have recorded failure");
        }
        self.emit(entry_point, BuilderEvent::op_failed(entry.user_op_hash, reason));
        Ok(())
    }

    /// Records the outcome of a bundle in the mempool and the reputation
    /// store. Entries of a sent bundle are already submitted.
    async fn apply(
        &self,
        bundle: &Bundle,
        result: &BundleExecutionResult,
    ) -> Result<(), BundlerError> {
        let hashes = bundle.user_op_hashes();

        if result.success {
            let Some(tx_hash) = result.transaction_hash else {
                warn!("Successful bundle result without a transaction hash");
                return Ok(());
            };
            let block_number = result
                .receipt
                .as_ref()
                .and_then(|r| r.block_number)
                .unwrap_or_default();

            self.mempool
                .mark_included(hashes.clone(), tx_hash, block_number)
                .await?;

            for op_result in &result.user_op_results {
                let Some(entry) = bundle
                    .entries
                    .iter()
                    .find(|e| e.user_op_hash == op_result.user_op_hash)
                else {
                    continue;
                };
                for addr in entry.accountable_entities() {
                    if op_result.success {
                        let _ = self
                            .reputation
                            .record_included(addr)
                            .await
                            .log_on_error("should have recorded inclusion");
                    } else {
                        let _ = self
                            .reputation
                            .record_failed(addr)
                            .await
                            .log_on_error("should have recorded failure");
                    }
                }
            }

            self.emit(
                bundle.entry_point,
                BuilderEvent::bundle_mined(tx_hash, block_number, result.gas_used, hashes),
            );
        } else if result.is_unconfirmed() {
            warn!(
                "Bundle transaction {:?} unconfirmed, ops stay submitted: {}",
                result.transaction_hash,
                result.error.as_deref().unwrap_or_default()
            );
        } else if let Some(tx_hash) = result.transaction_hash {
            let reverted = self.mempool.revert_submitted(tx_hash).await?;
            self.emit_dropped(bundle.entry_point, &reverted);
            self.emit(
                bundle.entry_point,
                BuilderEvent::bundle_failed(Some(tx_hash), result.error.clone(), hashes),
            );
        } else {
            let failed = result
                .revert
                .as_ref()
                .and_then(|revert| revert.op_index())
                .and_then(|index| bundle.entries.get(index));

            match failed {
                Some(entry) => {
                    let reason = result.error.clone().unwrap_or_default();
                    self.fail_op(bundle.entry_point, entry, reason).await?;
                }
                None => warn!(
                    "Bundle for {} failed: {}",
                    bundle.entry_point,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            }
            self.emit(
                bundle.entry_point,
                BuilderEvent::bundle_failed(None, result.error.clone(), hashes),
            );
        }

        Ok(())
    }

    /// Resolves entries left `Submitted`. Transactions that have been mined
    /// are applied. Transactions still unknown after `submitted_timeout` are
    /// returned to pending. Returns the number of entries moved.
    pub async fn settle_submitted(&self) -> Result<usize, BundlerError> {
        let now = Timestamp::now();
        let mut settled = 0;

        for tx_hash in self.mempool.submitted_transactions().await? {
            let entries = self.mempool.get_by_transaction(tx_hash).await?;
            let Some(entry_point) = entries.first().map(|e| e.entry_point) else {
                continue;
            };
            let submitted_at = entries.iter().filter_map(|e| e.submitted_at).min();
            let bundle = Bundle {
                estimated_gas: estimate_gas(&entries),
                entries,
                entry_point,
                beneficiary: self.config.beneficiary_address,
                created_at: now,
            };

            if let Some(result) = self.executor.check(&bundle, tx_hash).await {
                settled += bundle.len();
                self.apply(&bundle, &result).await?;
                continue;
            }

            let expired = submitted_at
                .is_none_or(|at| now.elapsed_since(at) >= self.config.submitted_timeout);
            if expired {
                warn!("Bundle transaction {tx_hash} not mined in time, returning its ops");
                let reverted = self.mempool.revert_submitted(tx_hash).await?;
                self.emit_dropped(entry_point, &reverted);
                settled += reverted.len();
            }
        }

        Ok(settled)
    }

    /// Settles entries left `Submitted` by a previous run. Returns the number
    /// of entries moved.
    pub async fn recover_submitted(&self) -> Result<usize, BundlerError> {
        let recovered = self.settle_submitted().await?;
        if recovered > 0 {
            info!("Recovered {recovered} submitted ops");
        }
        Ok(recovered)
    }

    /// Decays reputation counters by the configured factor.
    pub async fn decay_reputation(&self) -> Result<usize, BundlerError> {
        Ok(self
            .reputation
            .decay(self.config.reputation_decay_factor)
            .await?)
    }

    /// Prunes stale entries from the mempool.
    pub async fn prune_mempool(&self) -> Result<usize, BundlerError> {
        Ok(self.mempool.prune(Timestamp::now()).await?)
    }

    fn is_supported(&self, entry_point: Address) -> bool {
        self.config.supported_entry_points.contains(&entry_point)
    }

    fn emit_dropped(&self, entry_point: Address, entries: &[MempoolEntry]) {
        for entry in entries.iter().filter(|e| e.state == EntryState::Dropped) {
            warn!(
                "Dropped op {} after {} reverted submissions",
                entry.user_op_hash, entry.retry_count
            );
            self.emit(
                entry_point,
                BuilderEvent::op_dropped(entry.user_op_hash, entry.retry_count),
            );
        }
    }

    fn emit(&self, entry_point: Address, event: BuilderEvent) {
        let _ = self.event_sender.send(WithEntryPoint { entry_point, event });
    }
}

#[derive(Metrics)]
#[metrics(scope = "bundler")]
struct BundlerMetrics {
    #[metric(describe = "the count of ops admitted to the mempool.")]
    ops_admitted: Counter,
    #[metric(describe = "the count of ops rejected at admission.")]
    ops_rejected: Counter,
    #[metric(describe = "the count of bundles attempted.")]
    bundles_attempted: Counter,
}

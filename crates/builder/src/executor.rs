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

use std::collections::HashMap;

use alloy_primitives::{Address, B256, U256};
use bundler_contracts::v0_7::PackedUserOperation;
use bundler_provider::{BundleHandler, ProviderError};
use bundler_types::{
    Bundle, BundleExecutionResult, BundleReceipt, EntryPointRevert, MempoolEntry, Timestamp,
};
use metrics::{Counter, Histogram};
use metrics_derive::Metrics;
#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

use crate::reconcile;

/// Intrinsic gas of the bundle transaction itself.
pub(crate) const BUNDLE_BASE_GAS: u64 = 21_000;
/// Per-operation entry point overhead.
const PER_OP_OVERHEAD_GAS: u64 = 5_000;

/// Bundle construction error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BundleError {
    /// No operations were given
    #[error("cannot build an empty bundle")]
    Empty,
    /// Operations target more than one entry point
    #[error("operations target different entry points")]
    MixedEntryPoints,
    /// No handler is configured for the entry point
    #[error("unsupported entry point {0}")]
    UnsupportedEntryPoint(Address),
    /// An operation relies on a signature aggregator
    #[error("signature aggregator {0} is not supported")]
    AggregatorUnsupported(Address),
}

/// Outcome of running a bundle as an `eth_call` before sending it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Simulation {
    /// `handleOps` would succeed
    Passed,
    /// The entry point reverted
    Reverted(EntryPointRevert),
    /// The call could not be made
    Error(String),
}

/// Builds bundles and submits them to their entry point.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait::async_trait]
pub trait BundleExecutor: Send + Sync + 'static {
    /// Groups `entries` into a bundle. All entries must target the same
    /// supported entry point and none may use a signature aggregator.
    fn build_bundle(&self, entries: Vec<MempoolEntry>) -> Result<Bundle, BundleError>;

    /// Runs `bundle` against the latest block without sending it.
    async fn simulate(&self, bundle: &Bundle) -> Simulation;

    /// Sends `bundle` and returns the transaction hash. A bundle that could
    /// not be sent is reported as a failed result without a transaction.
    async fn send(&self, bundle: &Bundle) -> Result<B256, BundleExecutionResult>;

    /// Waits for the receipt of `tx_hash`, which carries `bundle`. If no
    /// receipt arrives the result is unconfirmed and keeps `tx_hash`.
    async fn confirm(&self, bundle: &Bundle, tx_hash: B256) -> BundleExecutionResult;

    /// Looks up the receipt of `tx_hash` once. Returns `None` while it is
    /// not mined or cannot be fetched.
    async fn check(&self, bundle: &Bundle, tx_hash: B256) -> Option<BundleExecutionResult>;

    /// Sends `bundle` and waits for its receipt. Every failure is reported
    /// in the returned result.
    async fn execute(&self, bundle: &Bundle) -> BundleExecutionResult {
        match self.send(bundle).await {
            Ok(tx_hash) => self.confirm(bundle, tx_hash).await,
            Err(result) => result,
        }
    }

    /// Asks the entry point for the gas `bundle` needs, falling back to the
    /// bundle's own estimate.
    async fn estimate_bundle_gas(&self, bundle: &Bundle) -> U256;
}

/// Executor holding one handler per supported entry point.
pub struct BundleExecutorImpl<H> {
    handlers: HashMap<Address, H>,
    beneficiary: Address,
    metrics: ExecutorMetrics,
}

struct Prepared<'a, H> {
    handler: &'a H,
    ops: Vec<PackedUserOperation>,
    gas_limit: u64,
}

impl<H: BundleHandler> BundleExecutorImpl<H> {
    /// Creates an executor for `handlers`, keyed by their entry point address.
    pub fn new(handlers: impl IntoIterator<Item = H>, beneficiary: Address) -> Self {
        Self {
            handlers: handlers
                .into_iter()
                .map(|handler| (handler.address(), handler))
                .collect(),
            beneficiary,
            metrics: ExecutorMetrics::default(),
        }
    }

    fn prepare(&self, bundle: &Bundle) -> Result<Prepared<'_, H>, String> {
        if bundle.is_empty() {
            return Err("Empty bundle".to_string());
        }
        let Some(handler) = self.handlers.get(&bundle.entry_point) else {
            return Err(format!("Unsupported EntryPoint: {}", bundle.entry_point));
        };
        let Ok(gas_limit) = u64::try_from(bundle.estimated_gas) else {
            return Err(format!(
                "Execution error: gas limit {} does not fit in a u64",
                bundle.estimated_gas
            ));
        };

        Ok(Prepared {
            handler,
            ops: bundle
                .entries
                .iter()
                .map(|e| e.user_operation.pack())
                .collect(),
            gas_limit,
        })
    }

    fn provider_error(&self, error: ProviderError) -> BundleExecutionResult {
        self.metrics.bundle_txns_failed.increment(1);
        match error {
            ProviderError::Revert(data) => {
                let revert = EntryPointRevert::decode(&data);
                warn!("Bundle reverted: {revert}");
                BundleExecutionResult::reverted(revert)
            }
            other => {
                warn!("Bundle execution error: {other}");
                BundleExecutionResult::failed(format!("Execution error: {other}"))
            }
        }
    }

    fn settle(&self, bundle: &Bundle, receipt: BundleReceipt) -> BundleExecutionResult {
        let tx_hash = receipt.transaction_hash;
        self.metrics.bundle_gas_used.record(receipt.gas_used as f64);

        if !receipt.status {
            warn!("Bundle transaction {tx_hash} reverted");
            self.metrics.bundle_txns_reverted.increment(1);
            return BundleExecutionResult::reverted_on_chain(receipt);
        }

        debug!(
            "Bundle transaction {tx_hash} mined in block {:?}",
            receipt.block_number
        );
        self.metrics.bundle_txns_success.increment(1);
        let results = reconcile::reconcile(bundle, &receipt.logs);
        BundleExecutionResult::succeeded(receipt, results)
    }
}

/// Gas an operation adds to a bundle.
pub(crate) fn op_gas(entry: &MempoolEntry) -> U256 {
    entry
        .user_operation
        .operation_gas()
        .saturating_add(U256::from(PER_OP_OVERHEAD_GAS))
}

/// Static gas estimate for `entries`.
pub fn estimate_gas(entries: &[MempoolEntry]) -> U256 {
    entries
        .iter()
        .fold(U256::from(BUNDLE_BASE_GAS), |acc, e| acc.saturating_add(op_gas(e)))
}

#[async_trait::async_trait]
impl<H: BundleHandler> BundleExecutor for BundleExecutorImpl<H> {
    fn build_bundle(&self, entries: Vec<MempoolEntry>) -> Result<Bundle, BundleError> {
        let entry_point = entries.first().ok_or(BundleError::Empty)?.entry_point;
        if entries.iter().any(|e| e.entry_point != entry_point) {
            return Err(BundleError::MixedEntryPoints);
        }
        if !self.handlers.contains_key(&entry_point) {
            return Err(BundleError::UnsupportedEntryPoint(entry_point));
        }
        if let Some(aggregator) = entries.iter().find_map(|e| e.aggregator) {
            return Err(BundleError::AggregatorUnsupported(aggregator));
        }

        Ok(Bundle {
            estimated_gas: estimate_gas(&entries),
            entries,
            entry_point,
            beneficiary: self.beneficiary,
            created_at: Timestamp::now(),
        })
    }

    #[instrument(skip_all, fields(entry_point = %bundle.entry_point, ops = bundle.len()))]
    async fn simulate(&self, bundle: &Bundle) -> Simulation {
        let prepared = match self.prepare(bundle) {
            Ok(prepared) => prepared,
            Err(error) => return Simulation::Error(error),
        };

        match prepared
            .handler
            .call_handle_ops(prepared.ops, bundle.beneficiary, prepared.gas_limit)
            .await
        {
            Ok(()) => Simulation::Passed,
            Err(ProviderError::Revert(data)) => {
                self.metrics.bundle_simulations_reverted.increment(1);
                let revert = EntryPointRevert::decode(&data);
                debug!("Bundle simulation reverted: {revert}");
                Simulation::Reverted(revert)
            }
            Err(other) => Simulation::Error(format!("Simulation error: {other}")),
        }
    }

    #[instrument(skip_all, fields(entry_point = %bundle.entry_point, ops = bundle.len()))]
    async fn send(&self, bundle: &Bundle) -> Result<B256, BundleExecutionResult> {
        let prepared = self.prepare(bundle).map_err(BundleExecutionResult::failed)?;

        let tx_hash = prepared
            .handler
            .send_handle_ops(prepared.ops, bundle.beneficiary, prepared.gas_limit)
            .await
            .map_err(|error| self.provider_error(error))?;

        info!("Sent bundle transaction {tx_hash}");
        self.metrics.bundle_txns_sent.increment(1);
        self.metrics.bundle_gas_limit.record(prepared.gas_limit as f64);
        Ok(tx_hash)
    }

    #[instrument(skip(self, bundle))]
    async fn confirm(&self, bundle: &Bundle, tx_hash: B256) -> BundleExecutionResult {
        let Some(handler) = self.handlers.get(&bundle.entry_point) else {
            return BundleExecutionResult::unconfirmed(
                tx_hash,
                format!("Unsupported EntryPoint: {}", bundle.entry_point),
            );
        };

        match handler.wait_for_receipt(tx_hash).await {
            Ok(receipt) => self.settle(bundle, receipt),
            Err(error) => {
                warn!("No receipt for bundle transaction {tx_hash}: {error}");
                self.metrics.bundle_txns_unconfirmed.increment(1);
                BundleExecutionResult::unconfirmed(tx_hash, format!("Execution error: {error}"))
            }
        }
    }

    async fn check(&self, bundle: &Bundle, tx_hash: B256) -> Option<BundleExecutionResult> {
        let handler = self.handlers.get(&bundle.entry_point)?;
        match handler.get_receipt(tx_hash).await {
            Ok(receipt) => receipt.map(|receipt| self.settle(bundle, receipt)),
            Err(error) => {
                debug!("Failed to fetch receipt of {tx_hash}: {error}");
                None
            }
        }
    }

    async fn estimate_bundle_gas(&self, bundle: &Bundle) -> U256 {
        let prepared = match self.prepare(bundle) {
            Ok(prepared) => prepared,
            Err(_) if bundle.is_empty() => return U256::ZERO,
            Err(_) => return bundle.estimated_gas,
        };

        match prepared
            .handler
            .estimate_handle_ops_gas(prepared.ops, bundle.beneficiary)
            .await
        {
            Ok(gas) => U256::from(gas),
            Err(error) => {
                debug!("Gas estimation failed, using static estimate: {error}");
                bundle.estimated_gas
            }
        }
    }
}

#[derive(Metrics)]
#[metrics(scope = "builder")]
struct ExecutorMetrics {
    #[metric(describe = "the count of bundle simulations that reverted.")]
    bundle_simulations_reverted: Counter,
    #[metric(describe = "the count of bundle transactions sent.")]
    bundle_txns_sent: Counter,
    #[metric(describe = "the count of bundle transactions mined successfully.")]
    bundle_txns_success: Counter,
    #[metric(describe = "the count of bundle transactions mined but reverted.")]
    bundle_txns_reverted: Counter,
    #[metric(describe = "the count of bundles that failed before being sent.")]
    bundle_txns_failed: Counter,
    #[metric(describe = "the count of sent bundle transactions with no receipt in time.")]
    bundle_txns_unconfirmed: Counter,
    #[metric(describe = "the gas limit of sent bundles.")]
    bundle_gas_limit: Histogram,
    #[metric(describe = "the gas used by mined bundles.")]
    bundle_gas_used: Histogram,
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, Bytes, B256};
    use alloy_sol_types::SolError;
    use bundler_contracts::v0_7::IEntryPoint;
    use bundler_provider::MockBundleHandler;
    use bundler_types::{pack_u128_pair, UserOperation};

    use super::*;

    const ENTRY_POINT: Address = address!("0x0000000071727De22E5E9d8BAf0edAc6f37da032");

    fn handler() -> MockBundleHandler {
        let mut handler = MockBundleHandler::new();
        handler.expect_address().return_const(ENTRY_POINT);
        handler
    }

    fn entry(entry_point: Address) -> MempoolEntry {
        let uo = UserOperation {
            sender: Address::random(),
            account_gas_limits: pack_u128_pair(100_000, 200_000),
            pre_verification_gas: U256::from(50_000),
            ..Default::default()
        };
        MempoolEntry::new(B256::random(), entry_point, uo)
    }

    fn executor(handler: MockBundleHandler) -> BundleExecutorImpl<MockBundleHandler> {
        BundleExecutorImpl::new([handler], Address::random())
    }

    fn receipt(tx_hash: B256, status: bool) -> BundleReceipt {
        BundleReceipt {
            transaction_hash: tx_hash,
            block_number: Some(12345),
            status,
            gas_used: 300_000,
            logs: vec![],
        }
    }

    #[test]
    fn test_build_bundle() {
        let executor = executor(handler());
        let entries = vec![entry(ENTRY_POINT), entry(ENTRY_POINT)];

        let bundle = executor.build_bundle(entries.clone()).unwrap();

        assert_eq!(bundle.entry_point, ENTRY_POINT);
        assert_eq!(bundle.len(), 2);
        assert_eq!(
            bundle.estimated_gas,
            U256::from(2 * 350_000 + 21_000 + 2 * 5_000)
        );
    }

    #[test]
    fn test_build_bundle_errors() {
        let executor = executor(handler());

        assert_eq!(executor.build_bundle(vec![]), Err(BundleError::Empty));
        assert_eq!(
            executor.build_bundle(vec![entry(ENTRY_POINT), entry(Address::random())]),
            Err(BundleError::MixedEntryPoints)
        );
        let other = Address::random();
        assert_eq!(
            executor.build_bundle(vec![entry(other)]),
            Err(BundleError::UnsupportedEntryPoint(other))
        );
        let aggregator = Address::random();
        assert_eq!(
            executor.build_bundle(vec![
                entry(ENTRY_POINT),
                entry(ENTRY_POINT).with_aggregator(aggregator)
            ]),
            Err(BundleError::AggregatorUnsupported(aggregator))
        );
    }

    #[test]
    fn test_estimate_gas_adds_base_and_overhead() {
        let uo = UserOperation {
            account_gas_limits: pack_u128_pair(0, 1000),
            pre_verification_gas: U256::from(2000),
            ..Default::default()
        };
        let entry = MempoolEntry::new(B256::random(), ENTRY_POINT, uo);

        assert_eq!(estimate_gas(&[entry]), U256::from(29_000));
        assert_eq!(estimate_gas(&[]), U256::from(21_000));
    }

    #[tokio::test]
    async fn test_simulate() {
        let mut handler = handler();
        let mut calls = 0;
        handler
            .expect_call_handle_ops()
            .withf(|ops, _, gas| ops.len() == 2 && *gas == 2 * 355_000 + 21_000)
            .times(3)
            .returning(move |_, _, _| {
                calls += 1;
                match calls {
                    1 => Ok(()),
                    2 => Err(ProviderError::Revert(Bytes::from(
                        IEntryPoint::FailedOp {
                            opIndex: U256::from(1),
                            reason: "AA25 invalid account nonce".to_string(),
                        }
                        .abi_encode(),
                    ))),
                    _ => Err(ProviderError::Rpc("connection refused".to_string())),
                }
            });
        handler.expect_send_handle_ops().never();
        let executor = executor(handler);
        let bundle = executor
            .build_bundle(vec![entry(ENTRY_POINT), entry(ENTRY_POINT)])
            .unwrap();

        assert_eq!(executor.simulate(&bundle).await, Simulation::Passed);
        assert_eq!(
            executor.simulate(&bundle).await,
            Simulation::Reverted(EntryPointRevert::FailedOp {
                op_index: 1,
                reason: "AA25 invalid account nonce".to_string(),
            })
        );
        assert_eq!(
            executor.simulate(&bundle).await,
            Simulation::Error("Simulation error: RPC error: connection refused".to_string())
        );

        let unknown = Bundle {
            entry_point: Address::random(),
            ..bundle
        };
        assert!(matches!(
            executor.simulate(&unknown).await,
            Simulation::Error(error) if error.starts_with("Unsupported EntryPoint")
        ));
    }

    #[tokio::test]
    async fn test_execute_success() {
        let tx_hash = B256::random();
        let mut handler = handler();
        handler
            .expect_send_handle_ops()
            .withf(|ops, _, gas| ops.len() == 1 && *gas == 371_000 + 5_000)
            .times(1)
            .returning(move |_, _, _| Ok(tx_hash));
        handler
            .expect_wait_for_receipt()
            .times(1)
            .returning(move |hash| Ok(receipt(hash, true)));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        let result = executor.execute(&bundle).await;

        assert!(result.success);
        assert_eq!(result.transaction_hash, Some(tx_hash));
        assert_eq!(result.gas_used, 300_000);
        assert_eq!(result.user_op_results.len(), 1);
        assert!(result.user_op_results[0].success);
    }

    #[tokio::test]
    async fn test_execute_reverted_on_chain() {
        let tx_hash = B256::random();
        let mut handler = handler();
        handler
            .expect_send_handle_ops()
            .returning(move |_, _, _| Ok(tx_hash));
        handler
            .expect_wait_for_receipt()
            .returning(move |hash| Ok(receipt(hash, false)));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        let result = executor.execute(&bundle).await;

        assert!(!result.success);
        assert_eq!(result.transaction_hash, Some(tx_hash));
        assert!(result.receipt.is_some());
        assert_eq!(
            result.error,
            Some(format!("Transaction reverted: {tx_hash}"))
        );
    }

    #[tokio::test]
    async fn test_execute_decodes_failed_op() {
        let mut handler = handler();
        handler.expect_send_handle_ops().returning(|_, _, _| {
            let data = IEntryPoint::FailedOp {
                opIndex: U256::from(1),
                reason: "AA21 didn't pay prefund".to_string(),
            }
            .abi_encode();
            Err(ProviderError::Revert(Bytes::from(data)))
        });
        let executor = executor(handler);
        let bundle = executor
            .build_bundle(vec![entry(ENTRY_POINT), entry(ENTRY_POINT)])
            .unwrap();

        let result = executor.execute(&bundle).await;

        assert!(!result.success);
        assert_eq!(result.transaction_hash, None);
        assert_eq!(
            result.error.as_deref(),
            Some("FailedOp: opIndex=1, reason=AA21 didn't pay prefund")
        );
        assert_eq!(result.revert.and_then(|r| r.op_index()), Some(1));
    }

    #[tokio::test]
    async fn test_execute_rpc_error() {
        let mut handler = handler();
        handler
            .expect_send_handle_ops()
            .returning(|_, _, _| Err(ProviderError::Rpc("connection refused".to_string())));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        let result = executor.execute(&bundle).await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Execution error: RPC error: connection refused")
        );
    }

    #[tokio::test]
    async fn test_execute_receipt_timeout_keeps_tx_hash() {
        let tx_hash = B256::random();
        let mut handler = handler();
        handler
            .expect_send_handle_ops()
            .returning(move |_, _, _| Ok(tx_hash));
        handler
            .expect_wait_for_receipt()
            .returning(|hash| Err(ProviderError::ReceiptTimeout(hash)));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        let result = executor.execute(&bundle).await;

        assert!(!result.success);
        assert!(result.is_unconfirmed());
        assert_eq!(result.transaction_hash, Some(tx_hash));
        assert!(result.revert.is_none());
        assert!(result.error.unwrap().starts_with("Execution error: "));
    }

    #[tokio::test]
    async fn test_send_then_confirm() {
        let tx_hash = B256::random();
        let mut handler = handler();
        handler
            .expect_send_handle_ops()
            .times(1)
            .returning(move |_, _, _| Ok(tx_hash));
        handler
            .expect_wait_for_receipt()
            .withf(move |hash| *hash == tx_hash)
            .times(1)
            .returning(move |hash| Ok(receipt(hash, true)));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        assert_eq!(executor.send(&bundle).await, Ok(tx_hash));
        let result = executor.confirm(&bundle, tx_hash).await;
        assert!(result.success);
        assert!(!result.is_unconfirmed());
    }

    #[tokio::test]
    async fn test_check_polls_once() {
        let mined = B256::random();
        let pending = B256::random();
        let mut handler = handler();
        handler
            .expect_get_receipt()
            .withf(move |hash| *hash == mined)
            .times(1)
            .returning(|hash| Ok(Some(receipt(hash, false))));
        handler
            .expect_get_receipt()
            .withf(move |hash| *hash == pending)
            .times(1)
            .returning(|_| Ok(None));
        handler.expect_wait_for_receipt().never();
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        let result = executor.check(&bundle, mined).await.unwrap();
        assert!(!result.success);
        assert!(result.receipt.is_some());
        assert_eq!(executor.check(&bundle, pending).await, None);
    }

    #[tokio::test]
    async fn test_execute_rejects_without_sending() {
        let mut handler = handler();
        handler.expect_send_handle_ops().never();
        let executor = executor(handler);

        let mut bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();
        bundle.estimated_gas = U256::MAX;
        let result = executor.execute(&bundle).await;
        assert!(result.error.unwrap().starts_with("Execution error: "));

        bundle.entry_point = Address::random();
        let result = executor.execute(&bundle).await;
        assert_eq!(
            result.error,
            Some(format!("Unsupported EntryPoint: {}", bundle.entry_point))
        );

        bundle.entries.clear();
        let result = executor.execute(&bundle).await;
        assert_eq!(result.error.as_deref(), Some("Empty bundle"));
    }

    #[tokio::test]
    async fn test_estimate_bundle_gas() {
        let mut handler = handler();
        handler
            .expect_estimate_handle_ops_gas()
            .returning(|_, _| Ok(123_456));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        assert_eq!(
            executor.estimate_bundle_gas(&bundle).await,
            U256::from(123_456)
        );

        let empty = Bundle {
            entries: vec![],
            ..bundle
        };
        assert_eq!(executor.estimate_bundle_gas(&empty).await, U256::ZERO);
    }

    #[tokio::test]
    async fn test_estimate_bundle_gas_falls_back() {
        let mut handler = handler();
        handler
            .expect_estimate_handle_ops_gas()
            .returning(|_, _| Err(ProviderError::Rpc("boom".to_string())));
        let executor = executor(handler);
        let bundle = executor.build_bundle(vec![entry(ENTRY_POINT)]).unwrap();

        assert_eq!(
            executor.estimate_bundle_gas(&bundle).await,
            bundle.estimated_gas
        );

        let unknown = Bundle {
            entry_point: Address::random(),
            ..bundle.clone()
        };
        assert_eq!(
            executor.estimate_bundle_gas(&unknown).await,
            bundle.estimated_gas
        );
    }
}

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

use alloy_primitives::{Address, B256};
use bundler_contracts::v0_7::PackedUserOperation;
use bundler_types::BundleReceipt;
#[cfg(feature = "test-utils")]
use mockall::automock;

use super::error::ProviderResult;

/// Submits `handleOps` transactions to a single entry point contract.
///
/// A revert with data surfaces as [`ProviderError::Revert`](super::ProviderError::Revert)
/// so that callers can decode the entry point's custom errors.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait::async_trait]
pub trait BundleHandler: Send + Sync + 'static {
    /// Address of the entry point contract
    fn address(&self) -> Address;

    /// Sends `handleOps(ops, beneficiary)` with the given gas limit and
    /// returns the transaction hash.
    async fn send_handle_ops(
        &self,
        ops: Vec<PackedUserOperation>,
        beneficiary: Address,
        gas_limit: u64,
    ) -> ProviderResult<B256>;

    /// Runs `handleOps(ops, beneficiary)` as an `eth_call` against the latest
    /// block. A `FailedOp` revert comes back as `ProviderError::Revert`.
    async fn call_handle_ops(
        &self,
        ops: Vec<PackedUserOperation>,
        beneficiary: Address,
        gas_limit: u64,
    ) -> ProviderResult<()>;

    /// Returns the receipt of `tx_hash` if it has been mined.
    async fn get_receipt(&self, tx_hash: B256) -> ProviderResult<Option<BundleReceipt>>;

    /// Waits until `tx_hash` is mined and returns its receipt.
    async fn wait_for_receipt(&self, tx_hash: B256) -> ProviderResult<BundleReceipt>;

    /// Estimates the gas of `handleOps(ops, beneficiary)` without a gas limit.
    async fn estimate_handle_ops_gas(
        &self,
        ops: Vec<PackedUserOperation>,
        beneficiary: Address,
    ) -> ProviderResult<u64>;
}

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

use std::time::Duration;

use alloy_primitives::{Address, B256};
use alloy_provider::Provider as AlloyProvider;
use bundler_contracts::v0_7::{IEntryPoint::IEntryPointInstance, PackedUserOperation};
use bundler_types::BundleReceipt;
use tracing::{debug, instrument};

use crate::{BundleHandler, ProviderError, ProviderResult};

const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RECEIPT_POLLS: u32 = 90;

/// v0.7 entry point contract accessed through an alloy provider.
#[derive(Clone)]
pub struct AlloyEntryPoint<AP> {
    i_entry_point: IEntryPointInstance<AP>,
    receipt_poll_interval: Duration,
    max_receipt_polls: u32,
}

impl<AP> AlloyEntryPoint<AP>
where
    AP: AlloyProvider,
{
    /// Binds the entry point at `address` to `provider`.
    pub fn new(address: Address, provider: AP) -> Self {
        Self {
            i_entry_point: IEntryPointInstance::new(address, provider),
            receipt_poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
            max_receipt_polls: DEFAULT_MAX_RECEIPT_POLLS,
        }
    }

    /// Sets how often and how many times a receipt is polled for before
    /// `wait_for_receipt` gives up.
    pub fn with_receipt_polling(self, poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            receipt_poll_interval: poll_interval,
            max_receipt_polls: max_polls,
            ..self
        }
    }
}

#[async_trait::async_trait]
impl<AP> BundleHandler for AlloyEntryPoint<AP>
where
    AP: AlloyProvider + Send + Sync + 'static,
{
    fn address(&self) -> Address {
        *self.i_entry_point.address()
    }

    #[instrument(skip_all, fields(entry_point = %self.address(), ops = ops.len()))]
    async fn send_handle_ops(
        &self,
        ops: Vec<PackedUserOperation>,
        beneficiary: Address,
        gas_limit: u64,
    ) -> ProviderResult<B256> {
        let pending = self
            .i_entry_point
            .handleOps(ops, beneficiary)
            .gas(gas_limit)
            .send()
            .await?;
        Ok(*pending.tx_hash())
    }

    #[instrument(skip_all, fields(entry_point = %self.address(), ops = ops.len()))]
    async fn call_handle_ops(
        &self,
        ops: Vec<PackedUserOperation>,
        beneficiary: Address,
        gas_limit: u64,
    ) -> ProviderResult<()> {
        self.i_entry_point
            .handleOps(ops, beneficiary)
            .gas(gas_limit)
            .call()
            .await?;
        Ok(())
    }

    async fn get_receipt(&self, tx_hash: B256) -> ProviderResult<Option<BundleReceipt>> {
        let receipt = self
            .i_entry_point
            .provider()
            .get_transaction_receipt(tx_hash)
            .await?;

        Ok(receipt.map(|receipt| BundleReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            status: receipt.status(),
            gas_used: receipt.gas_used,
            logs: receipt
                .inner
                .logs()
                .iter()
                .map(|log| log.inner.clone())
                .collect(),
        }))
    }

    #[instrument(skip(self))]
    async fn wait_for_receipt(&self, tx_hash: B256) -> ProviderResult<BundleReceipt> {
        for _ in 0..self.max_receipt_polls {
            if let Some(receipt) = self.get_receipt(tx_hash).await? {
                return Ok(receipt);
            }

            debug!("receipt for {tx_hash} not available yet");
            tokio::time::sleep(self.receipt_poll_interval).await;
        }

        Err(ProviderError::ReceiptTimeout(tx_hash))
    }

    #[instrument(skip_all, fields(entry_point = %self.address(), ops = ops.len()))]
    async fn estimate_handle_ops_gas(
        &self,
        ops: Vec<PackedUserOperation>,
        beneficiary: Address,
    ) -> ProviderResult<u64> {
        Ok(self
            .i_entry_point
            .handleOps(ops, beneficiary)
            .estimate_gas()
            .await?)
    }
}

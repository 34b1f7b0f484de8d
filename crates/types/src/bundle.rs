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

use alloy_primitives::{Address, Log, B256, U256};

use crate::{EntryPointRevert, MempoolEntry, Timestamp};

/// A batch of operations for a single entry point, ready to submit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    /// Operations in submission order
    pub entries: Vec<MempoolEntry>,
    /// Entry point shared by every operation
    pub entry_point: Address,
    /// Recipient of the bundle fees
    pub beneficiary: Address,
    /// Gas limit for the bundle transaction
    pub estimated_gas: U256,
    /// When the bundle was built
    pub created_at: Timestamp,
}

impl Bundle {
    /// Hashes of the bundled operations, in order.
    pub fn user_op_hashes(&self) -> Vec<B256> {
        self.entries.iter().map(|e| e.user_op_hash).collect()
    }

    /// Number of operations in the bundle
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the bundle has no operations
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The parts of a transaction receipt the bundler consumes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleReceipt {
    /// Hash of the bundle transaction
    pub transaction_hash: B256,
    /// Block the transaction was mined in
    pub block_number: Option<u64>,
    /// False if the transaction reverted
    pub status: bool,
    /// Gas used by the transaction
    pub gas_used: u64,
    /// Logs emitted by the transaction
    pub logs: Vec<Log>,
}

/// Outcome of a single operation inside a mined bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOpExecutionResult {
    /// Hash of the operation
    pub user_op_hash: B256,
    /// Whether the operation's execution succeeded
    pub success: bool,
    /// Revert reason for failed operations
    pub error: Option<String>,
    /// Gas charged to the operation
    pub actual_gas_used: U256,
    /// Wei charged to the operation
    pub actual_gas_cost: U256,
}

impl UserOpExecutionResult {
    /// A successful result with no gas information.
    pub fn assumed_success(user_op_hash: B256) -> Self {
        Self {
            user_op_hash,
            success: true,
            error: None,
            actual_gas_used: U256::ZERO,
            actual_gas_cost: U256::ZERO,
        }
    }
}

/// Outcome of one bundle submission attempt.
///
/// Every failure mode of bundle execution is reported through this type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleExecutionResult {
    /// Whether the bundle transaction was mined successfully
    pub success: bool,
    /// Hash of the bundle transaction, if one was sent
    pub transaction_hash: Option<B256>,
    /// Receipt of the bundle transaction, if one was observed
    pub receipt: Option<BundleReceipt>,
    /// Human readable failure description
    pub error: Option<String>,
    /// Gas used by the bundle transaction
    pub gas_used: u64,
    /// Per operation outcomes of a successful bundle
    pub user_op_results: Vec<UserOpExecutionResult>,
    /// Decoded entry point error, when one caused the failure
    pub revert: Option<EntryPointRevert>,
}

impl BundleExecutionResult {
    /// A failure before or during submission.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A failure caused by a decoded entry point revert.
    pub fn reverted(revert: EntryPointRevert) -> Self {
        Self {
            error: Some(revert.to_string()),
            revert: Some(revert),
            ..Default::default()
        }
    }

    /// A sent bundle transaction whose outcome is not yet known.
    pub fn unconfirmed(tx_hash: B256, error: impl Into<String>) -> Self {
        Self {
            transaction_hash: Some(tx_hash),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// True if a transaction was sent but no receipt was observed.
    pub fn is_unconfirmed(&self) -> bool {
        !self.success && self.transaction_hash.is_some() && self.receipt.is_none()
    }

    /// A bundle transaction that was mined but reverted.
    pub fn reverted_on_chain(receipt: BundleReceipt) -> Self {
        Self {
            error: Some(format!(
                "Transaction reverted: {}",
                receipt.transaction_hash
            )),
            transaction_hash: Some(receipt.transaction_hash),
            gas_used: receipt.gas_used,
            receipt: Some(receipt),
            ..Default::default()
        }
    }

    /// A mined, successful bundle.
    pub fn succeeded(receipt: BundleReceipt, user_op_results: Vec<UserOpExecutionResult>) -> Self {
        Self {
            success: true,
            transaction_hash: Some(receipt.transaction_hash),
            gas_used: receipt.gas_used,
            receipt: Some(receipt),
            user_op_results,
            ..Default::default()
        }
    }
}

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

use std::{fmt::Display, sync::Arc};

use alloy_primitives::{Address, B256};

/// Builder event
#[derive(Clone, Debug)]
pub struct BuilderEvent {
    /// Event kind
    pub kind: BuilderEventKind,
}

impl BuilderEvent {
    pub(crate) fn new(kind: BuilderEventKind) -> Self {
        Self { kind }
    }

    pub(crate) fn op_admitted(op_hash: B256, sender: Address) -> Self {
        Self::new(BuilderEventKind::OpAdmitted { op_hash, sender })
    }

    pub(crate) fn op_rejected(op_hash: B256, reason: impl Display) -> Self {
        Self::new(BuilderEventKind::OpRejected {
            op_hash,
            reason: Arc::new(reason.to_string()),
        })
    }

    pub(crate) fn bundle_mined(
        tx_hash: B256,
        block_number: u64,
        gas_used: u64,
        op_hashes: Vec<B256>,
    ) -> Self {
        Self::new(BuilderEventKind::BundleMined {
            tx_hash,
            block_number,
            gas_used,
            op_hashes: Arc::new(op_hashes),
        })
    }

    pub(crate) fn bundle_failed(
        tx_hash: Option<B256>,
        error: Option<String>,
        op_hashes: Vec<B256>,
    ) -> Self {
        Self::new(BuilderEventKind::BundleFailed {
            tx_hash,
            error: Arc::new(error.unwrap_or_default()),
            op_hashes: Arc::new(op_hashes),
        })
    }

    pub(crate) fn op_failed(op_hash: B256, reason: impl Display) -> Self {
        Self::new(BuilderEventKind::OpFailed {
            op_hash,
            reason: Arc::new(reason.to_string()),
        })
    }

    pub(crate) fn op_dropped(op_hash: B256, retry_count: u32) -> Self {
        Self::new(BuilderEventKind::OpDropped {
            op_hash,
            retry_count,
        })
    }
}

/// BuilderEventKind
#[derive(Clone, Debug)]
pub enum BuilderEventKind {
    /// An operation was admitted to the mempool
    OpAdmitted {
        /// Operation hash
        op_hash: B256,
        /// Sending account
        sender: Address,
    },
    /// An operation was refused at admission
    OpRejected {
        /// Operation hash
        op_hash: B256,
        /// Reason for rejection
        reason: Arc<String>,
    },
    /// A bundle transaction was mined successfully
    BundleMined {
        /// Transaction hash
        tx_hash: B256,
        /// Block number containing the transaction
        block_number: u64,
        /// Gas used by the transaction
        gas_used: u64,
        /// Operations carried by the bundle
        op_hashes: Arc<Vec<B256>>,
    },
    /// A bundle could not be sent, or its transaction reverted
    BundleFailed {
        /// Transaction hash, if a transaction was sent
        tx_hash: Option<B256>,
        /// Failure description
        error: Arc<String>,
        /// Operations carried by the bundle
        op_hashes: Arc<Vec<B256>>,
    },
    /// An operation was rejected by the entry point and marked failed
    OpFailed {
        /// Operation hash
        op_hash: B256,
        /// Failure reason
        reason: Arc<String>,
    },
    /// An operation exhausted its retries and was dropped
    OpDropped {
        /// Operation hash
        op_hash: B256,
        /// Number of reverted submissions
        retry_count: u32,
    },
}

impl Display for BuilderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BuilderEventKind::OpAdmitted { op_hash, sender } => write!(
                f,
                "Op admitted to mempool.    Op hash: {op_hash:?}    Sender: {sender:?}"
            ),
            BuilderEventKind::OpRejected { op_hash, reason } => write!(
                f,
                "Op rejected at admission.    Op hash: {op_hash:?}    Reason: {reason}"
            ),
            BuilderEventKind::BundleMined {
                tx_hash,
                block_number,
                gas_used,
                op_hashes,
            } => write!(
                f,
                concat!(
                    "Bundle transaction mined!",
                    "    Transaction hash: {:?}",
                    "    Block number: {}",
                    "    Gas used: {}",
                    "    Ops: {:?}",
                ),
                tx_hash, block_number, gas_used, op_hashes,
            ),
            BuilderEventKind::BundleFailed {
                tx_hash,
                error,
                op_hashes,
            } => match tx_hash {
                Some(tx_hash) => write!(
                    f,
                    concat!(
                        "Bundle transaction failed.",
                        "    Transaction hash: {:?}",
                        "    Error: {}",
                        "    Ops: {:?}",
                    ),
                    tx_hash, error, op_hashes,
                ),
                None => write!(
                    f,
                    "Bundle was not sent.    Error: {error}    Ops: {op_hashes:?}"
                ),
            },
            BuilderEventKind::OpFailed { op_hash, reason } => write!(
                f,
                "Op failed in bundle and removed from selection.    Op hash: {op_hash:?}    Reason: {reason}"
            ),
            BuilderEventKind::OpDropped {
                op_hash,
                retry_count,
            } => write!(
                f,
                "Op dropped after {retry_count} reverted submissions.    Op hash: {op_hash:?}"
            ),
        }
    }
}

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

use std::fmt::{self, Display, Formatter};

use alloy_primitives::{Address, Bytes, FixedBytes};
use alloy_sol_types::{Revert, SolError, SolInterface};
use bundler_contracts::v0_7::IEntryPoint::{
    FailedOp, FailedOpWithRevert, IEntryPointErrors, SignatureValidationFailed,
};

/// Decoded revert data from a `handleOps` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryPointRevert {
    /// An operation failed validation
    FailedOp {
        /// Index of the failing operation in the bundle
        op_index: usize,
        /// Entry point error code and message, e.g. `AA21 didn't pay prefund`
        reason: String,
    },
    /// An operation failed validation with an inner revert
    FailedOpWithRevert {
        /// Index of the failing operation in the bundle
        op_index: usize,
        /// Entry point error code and message
        reason: String,
        /// Revert data from the account or paymaster
        inner: Bytes,
    },
    /// The aggregator rejected the aggregated signature
    SignatureValidationFailed {
        /// The aggregator
        aggregator: Address,
    },
    /// A plain `Error(string)` revert
    Reverted {
        /// The revert message
        reason: String,
    },
    /// Revert data with a selector outside the entry point's error table
    Unknown {
        /// Leading four bytes of the revert data
        selector: FixedBytes<4>,
        /// The full revert data
        data: Bytes,
    },
    /// Revert without enough data to carry a selector
    Empty,
}

impl EntryPointRevert {
    /// Decodes revert data against the entry point's error table.
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 4 {
            return EntryPointRevert::Empty;
        }

        if let Ok(err) = IEntryPointErrors::abi_decode(data) {
            return match err {
                IEntryPointErrors::FailedOp(FailedOp { opIndex, reason }) => {
                    EntryPointRevert::FailedOp {
                        op_index: opIndex.try_into().unwrap_or(usize::MAX),
                        reason,
                    }
                }
                IEntryPointErrors::FailedOpWithRevert(FailedOpWithRevert {
                    opIndex,
                    reason,
                    inner,
                }) => EntryPointRevert::FailedOpWithRevert {
                    op_index: opIndex.try_into().unwrap_or(usize::MAX),
                    reason,
                    inner,
                },
                IEntryPointErrors::SignatureValidationFailed(SignatureValidationFailed {
                    aggregator,
                }) => EntryPointRevert::SignatureValidationFailed { aggregator },
            };
        }

        if let Ok(Revert { reason }) = Revert::abi_decode(data) {
            return EntryPointRevert::Reverted { reason };
        }

        EntryPointRevert::Unknown {
            selector: FixedBytes::from_slice(&data[..4]),
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Index of the operation the revert blames, if any.
    pub fn op_index(&self) -> Option<usize> {
        match self {
            EntryPointRevert::FailedOp { op_index, .. }
            | EntryPointRevert::FailedOpWithRevert { op_index, .. } => Some(*op_index),
            _ => None,
        }
    }
}

impl Display for EntryPointRevert {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EntryPointRevert::FailedOp { op_index, reason } => {
                write!(f, "FailedOp: opIndex={op_index}, reason={reason}")
            }
            EntryPointRevert::FailedOpWithRevert {
                op_index, reason, ..
            } => write!(f, "FailedOpWithRevert: opIndex={op_index}, reason={reason}"),
            EntryPointRevert::SignatureValidationFailed { aggregator } => {
                write!(f, "SignatureValidationFailed: aggregator={aggregator}")
            }
            EntryPointRevert::Reverted { reason } => write!(f, "Execution reverted: {reason}"),
            EntryPointRevert::Unknown { selector, .. } => {
                write!(f, "Execution reverted: unknown selector {selector}")
            }
            EntryPointRevert::Empty => f.write_str("Execution reverted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{bytes, U256};

    use super::*;

    #[test]
    fn test_decode_failed_op() {
        let data = FailedOp {
            opIndex: U256::from(2),
            reason: "AA21 didn't pay prefund".to_string(),
        }
        .abi_encode();

        let revert = EntryPointRevert::decode(&data);
        assert_eq!(
            revert,
            EntryPointRevert::FailedOp {
                op_index: 2,
                reason: "AA21 didn't pay prefund".to_string()
            }
        );
        assert_eq!(revert.op_index(), Some(2));
        assert_eq!(
            revert.to_string(),
            "FailedOp: opIndex=2, reason=AA21 didn't pay prefund"
        );
    }

    #[test]
    fn test_decode_failed_op_with_revert() {
        let data = FailedOpWithRevert {
            opIndex: U256::from(0),
            reason: "AA23 reverted".to_string(),
            inner: bytes!("0xdeadbeef"),
        }
        .abi_encode();

        let revert = EntryPointRevert::decode(&data);
        assert_eq!(
            revert,
            EntryPointRevert::FailedOpWithRevert {
                op_index: 0,
                reason: "AA23 reverted".to_string(),
                inner: bytes!("0xdeadbeef"),
            }
        );
        assert_eq!(
            revert.to_string(),
            "FailedOpWithRevert: opIndex=0, reason=AA23 reverted"
        );
    }

    #[test]
    fn test_decode_signature_validation_failed() {
        let aggregator = Address::random();
        let data = SignatureValidationFailed { aggregator }.abi_encode();
        assert_eq!(
            EntryPointRevert::decode(&data),
            EntryPointRevert::SignatureValidationFailed { aggregator }
        );
    }

    #[test]
    fn test_decode_error_string() {
        let data = Revert::from("out of funds").abi_encode();
        assert_eq!(
            EntryPointRevert::decode(&data),
            EntryPointRevert::Reverted {
                reason: "out of funds".to_string()
            }
        );
    }

    #[test]
    fn test_decode_unknown_selector() {
        let data = bytes!("0x12345678aabbccdd");
        let revert = EntryPointRevert::decode(&data);
        assert_eq!(
            revert,
            EntryPointRevert::Unknown {
                selector: FixedBytes::from([0x12, 0x34, 0x56, 0x78]),
                data: data.clone(),
            }
        );
        assert_eq!(revert.op_index(), None);
        assert_eq!(
            revert.to_string(),
            "Execution reverted: unknown selector 0x12345678"
        );
    }

    #[test]
    fn test_decode_short_data() {
        assert_eq!(EntryPointRevert::decode(&[0x01]), EntryPointRevert::Empty);
    }
}

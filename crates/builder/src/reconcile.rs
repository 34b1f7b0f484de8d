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

//! Per-operation outcomes of a mined bundle, recovered from entry point logs.

use std::collections::HashMap;

use alloy_primitives::{Address, Log, B256};
use alloy_sol_types::{Revert, SolError, SolEvent};
use bundler_contracts::v0_7::IEntryPoint::{UserOperationEvent, UserOperationRevertReason};
use bundler_types::{Bundle, UserOpExecutionResult};
use tracing::warn;

/// Matches the entry point's logs to the bundle's operations.
///
/// Operations without an inclusion event are reported successful. If any
/// selected log fails to decode, every operation is reported successful.
pub(crate) fn reconcile(bundle: &Bundle, logs: &[Log]) -> Vec<UserOpExecutionResult> {
    let outcomes = match OpOutcomes::decode(bundle.entry_point, logs) {
        Ok(outcomes) => outcomes,
        Err(error) => {
            warn!(
                "Failed to decode logs of entry point {}, assuming all ops succeeded: {error}",
                bundle.entry_point
            );
            OpOutcomes::default()
        }
    };

    bundle
        .entries
        .iter()
        .map(|entry| outcomes.result(entry.user_op_hash))
        .collect()
}

#[derive(Default)]
struct OpOutcomes {
    events: HashMap<B256, UserOperationEvent>,
    revert_reasons: HashMap<B256, String>,
}

impl OpOutcomes {
    fn decode(entry_point: Address, logs: &[Log]) -> Result<Self, alloy_sol_types::Error> {
        let mut outcomes = Self::default();

        for log in logs.iter().filter(|log| log.address == entry_point) {
            let Some(topic) = log.data.topics().first() else {
                continue;
            };
            if *topic == UserOperationEvent::SIGNATURE_HASH {
                let event = UserOperationEvent::decode_log_data(&log.data)?;
                outcomes.events.insert(event.userOpHash, event);
            } else if *topic == UserOperationRevertReason::SIGNATURE_HASH {
                let event = UserOperationRevertReason::decode_log_data(&log.data)?;
                outcomes
                    .revert_reasons
                    .insert(event.userOpHash, revert_reason(&event.revertReason));
            }
        }

        Ok(outcomes)
    }

    fn result(&self, user_op_hash: B256) -> UserOpExecutionResult {
        let mut result = match self.events.get(&user_op_hash) {
            Some(event) => UserOpExecutionResult {
                user_op_hash,
                success: event.success,
                error: None,
                actual_gas_used: event.actualGasUsed,
                actual_gas_cost: event.actualGasCost,
            },
            None => UserOpExecutionResult::assumed_success(user_op_hash),
        };

        if let Some(reason) = self.revert_reasons.get(&user_op_hash) {
            result.success = false;
            result.error = Some(reason.clone());
        }
        result
    }
}

fn revert_reason(data: &[u8]) -> String {
    if data.is_empty() {
        return "Reverted".to_string();
    }
    match Revert::abi_decode(data) {
        Ok(revert) => revert.reason,
        Err(_) => const_hex::encode_prefixed(data),
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{bytes, Bytes, LogData, U256};
    use bundler_types::{MempoolEntry, Timestamp, UserOperation};

    use super::*;

    fn bundle(entry_point: Address, n: usize) -> Bundle {
        Bundle {
            entries: (0..n)
                .map(|_| MempoolEntry::new(B256::random(), entry_point, UserOperation::default()))
                .collect(),
            entry_point,
            beneficiary: Address::random(),
            estimated_gas: U256::from(100_000),
            created_at: Timestamp::now(),
        }
    }

    fn event_log(entry_point: Address, hash: B256, success: bool) -> Log {
        let event = UserOperationEvent {
            userOpHash: hash,
            sender: Address::random(),
            paymaster: Address::ZERO,
            nonce: U256::ZERO,
            success,
            actualGasCost: U256::from(42_000),
            actualGasUsed: U256::from(21_000),
        };
        Log {
            address: entry_point,
            data: event.encode_log_data(),
        }
    }

    fn revert_log(entry_point: Address, hash: B256, reason: Bytes) -> Log {
        let event = UserOperationRevertReason {
            userOpHash: hash,
            sender: Address::random(),
            nonce: U256::ZERO,
            revertReason: reason,
        };
        Log {
            address: entry_point,
            data: event.encode_log_data(),
        }
    }

    #[test]
    fn test_events_map_to_ops() {
        let ep = Address::random();
        let bundle = bundle(ep, 3);
        let hashes = bundle.user_op_hashes();
        let reason = Revert {
            reason: "insufficient balance".to_string(),
        }
        .abi_encode();
        let logs = vec![
            event_log(ep, hashes[0], true),
            event_log(ep, hashes[1], false),
            revert_log(ep, hashes[1], reason.into()),
        ];

        let results = reconcile(&bundle, &logs);

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(results[0].actual_gas_used, U256::from(21_000));
        assert_eq!(results[0].actual_gas_cost, U256::from(42_000));
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("insufficient balance"));
        // no event for the third op
        assert_eq!(results[2], UserOpExecutionResult::assumed_success(hashes[2]));
    }

    #[test]
    fn test_undecodable_reason_is_hex() {
        let ep = Address::random();
        let bundle = bundle(ep, 2);
        let hashes = bundle.user_op_hashes();
        let logs = vec![
            revert_log(ep, hashes[0], bytes!("0xdeadbeef")),
            revert_log(ep, hashes[1], Bytes::new()),
        ];

        let results = reconcile(&bundle, &logs);

        assert_eq!(results[0].error.as_deref(), Some("0xdeadbeef"));
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("Reverted"));
    }

    #[test]
    fn test_other_contracts_ignored() {
        let ep = Address::random();
        let bundle = bundle(ep, 1);
        let hash = bundle.user_op_hashes()[0];
        let logs = vec![event_log(Address::random(), hash, false)];

        let results = reconcile(&bundle, &logs);

        assert!(results[0].success);
    }

    #[test]
    fn test_malformed_log_assumes_success() {
        let ep = Address::random();
        let bundle = bundle(ep, 2);
        let hashes = bundle.user_op_hashes();
        let logs = vec![
            event_log(ep, hashes[0], false),
            Log {
                address: ep,
                data: LogData::new_unchecked(
                    vec![UserOperationEvent::SIGNATURE_HASH],
                    bytes!("0x0102"),
                ),
            },
        ];

        let results = reconcile(&bundle, &logs);

        assert!(results.iter().all(|r| r.success));
    }
}

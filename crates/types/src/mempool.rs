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
use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::{Timestamp, UserOperation};

/// Lifecycle state of a mempool entry.
///
/// `Pending` is the only initial state. `Included`, `Failed` and `Dropped`
/// are terminal.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting to be bundled
    Pending,
    /// Carried by a bundle transaction that has not been confirmed
    Submitted,
    /// Mined in a successful bundle transaction
    Included,
    /// Rejected by the entry point
    Failed,
    /// Evicted after exhausting its retries or its time to live
    Dropped,
}

impl EntryState {
    /// Every state, in tag order.
    pub const ALL: [EntryState; 5] = [
        EntryState::Pending,
        EntryState::Submitted,
        EntryState::Included,
        EntryState::Failed,
        EntryState::Dropped,
    ];

    /// True for states with no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryState::Included | EntryState::Failed | EntryState::Dropped
        )
    }

    /// Stable single byte tag, used in storage keys.
    pub fn tag(self) -> u8 {
        match self {
            EntryState::Pending => 0,
            EntryState::Submitted => 1,
            EntryState::Included => 2,
            EntryState::Failed => 3,
            EntryState::Dropped => 4,
        }
    }
}

/// A user operation held by the mempool, along with its lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolEntry {
    /// Hash of the operation, unique across the mempool
    pub user_op_hash: B256,
    /// Entry point the operation targets
    pub entry_point: Address,
    /// The operation itself
    pub user_operation: UserOperation,
    /// Selection priority, higher is bundled first
    pub priority: u128,
    /// Sponsoring paymaster
    pub paymaster: Option<Address>,
    /// Account factory
    pub factory: Option<Address>,
    /// Maximum cost the operation can be charged
    pub prefund: U256,
    /// The operation may not be bundled before this time
    pub valid_after: Option<Timestamp>,
    /// The operation may not be bundled at or after this time
    pub valid_until: Option<Timestamp>,
    /// Lifecycle state
    pub state: EntryState,
    /// Bundle transaction carrying the entry, set while `Submitted`
    pub submitted_tx_hash: Option<B256>,
    /// When the entry was last submitted
    #[serde(default)]
    pub submitted_at: Option<Timestamp>,
    /// Block the entry was included in
    pub block_number: Option<u64>,
    /// Number of times the entry returned from `Submitted` to `Pending`
    pub retry_count: u32,
    /// When the entry was admitted
    pub added_at: Timestamp,
    /// Failure reason for `Failed` and `Dropped` entries
    pub error: Option<String>,
    /// Signature aggregator reported by validation, if any
    #[serde(default)]
    pub aggregator: Option<Address>,
}

impl MempoolEntry {
    /// Creates a pending entry. Priority, paymaster, factory and prefund are
    /// derived from the operation.
    pub fn new(user_op_hash: B256, entry_point: Address, user_operation: UserOperation) -> Self {
        Self {
            user_op_hash,
            entry_point,
            priority: user_operation.max_priority_fee_per_gas(),
            paymaster: user_operation.paymaster(),
            factory: user_operation.factory(),
            prefund: user_operation.max_gas_cost(),
            user_operation,
            valid_after: None,
            valid_until: None,
            state: EntryState::Pending,
            submitted_tx_hash: None,
            submitted_at: None,
            block_number: None,
            retry_count: 0,
            added_at: Timestamp::now(),
            error: None,
            aggregator: None,
        }
    }

    /// Overrides the derived priority.
    pub fn with_priority(self, priority: u128) -> Self {
        Self { priority, ..self }
    }

    /// Restricts when the entry may be bundled.
    pub fn with_valid_window(
        self,
        valid_after: Option<Timestamp>,
        valid_until: Option<Timestamp>,
    ) -> Self {
        Self {
            valid_after,
            valid_until,
            ..self
        }
    }

    /// Marks the operation as validated by `aggregator`.
    pub fn with_aggregator(self, aggregator: Address) -> Self {
        Self {
            aggregator: Some(aggregator),
            ..self
        }
    }

    /// Sending account.
    pub fn sender(&self) -> Address {
        self.user_operation.sender
    }

    /// Addresses whose reputation this entry affects: the sender and, if
    /// present, the paymaster.
    pub fn accountable_entities(&self) -> impl Iterator<Item = Address> {
        std::iter::once(self.sender()).chain(self.paymaster)
    }

    /// Whether the entry's validity window contains `now`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.valid_after.map_or(true, |after| after <= now) && !self.is_expired_at(now)
    }

    /// Whether the entry's validity window has closed.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}

/// Aggregate counts over the stored mempool entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolStats {
    /// Entries in any state
    pub total_count: u64,
    /// Entries waiting to be bundled
    pub pending_count: u64,
    /// Entries carried by an unconfirmed bundle
    pub submitted_count: u64,
    /// Entries mined successfully
    pub included_count: u64,
    /// Entries rejected by the entry point
    pub failed_count: u64,
    /// Entries evicted by retry or age limits
    pub dropped_count: u64,
    /// Distinct senders across all entries
    pub unique_senders: u64,
    /// Distinct paymasters across all entries
    pub unique_paymasters: u64,
    /// Sum of prefunds of pending and submitted entries
    pub total_prefund: U256,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::address;

    use super::*;
    use crate::pack_u128_pair;

    #[test]
    fn test_new_derives_fields() {
        let paymaster = address!("0x2222222222222222222222222222222222222222");
        let factory = address!("0x3333333333333333333333333333333333333333");
        let uo = UserOperation {
            sender: Address::random(),
            init_code: factory.to_vec().into(),
            paymaster_and_data: paymaster.to_vec().into(),
            gas_fees: pack_u128_pair(7, 100),
            account_gas_limits: pack_u128_pair(1, 1),
            ..Default::default()
        };
        let entry = MempoolEntry::new(B256::random(), Address::random(), uo);

        assert_eq!(entry.priority, 7);
        assert_eq!(entry.paymaster, Some(paymaster));
        assert_eq!(entry.factory, Some(factory));
        assert_eq!(entry.prefund, U256::from(200));
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.aggregator, None);
        assert_eq!(
            entry.accountable_entities().collect::<Vec<_>>(),
            vec![entry.sender(), paymaster]
        );
    }

    #[test]
    fn test_valid_window() {
        let now = Timestamp::new(1_000);
        let entry = MempoolEntry::new(B256::random(), Address::random(), Default::default());
        assert!(entry.is_valid_at(now));

        let later = entry
            .clone()
            .with_valid_window(Some(now + Duration::from_secs(10)), None);
        assert!(!later.is_valid_at(now));
        assert!(!later.is_expired_at(now));

        let expired = entry.with_valid_window(None, Some(now));
        assert!(!expired.is_valid_at(now));
        assert!(expired.is_expired_at(now));
    }

    #[test]
    fn test_lifecycle_fields_default_when_absent() {
        let entry = MempoolEntry::new(B256::random(), Address::random(), Default::default());
        let mut json = serde_json::to_value(&entry).unwrap();
        let fields = json.as_object_mut().unwrap();
        fields.remove("submittedAt");
        fields.remove("aggregator");

        let decoded: MempoolEntry = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_state_tags_are_distinct() {
        let mut tags = EntryState::ALL.map(EntryState::tag).to_vec();
        tags.dedup();
        assert_eq!(tags.len(), EntryState::ALL.len());
        assert!(EntryState::Dropped.is_terminal());
        assert!(!EntryState::Submitted.is_terminal());
        assert_eq!(EntryState::Submitted.to_string(), "submitted");
    }
}

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

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// Settings for the bundling orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundlerConfig {
    /// Entry points this bundler submits to
    pub supported_entry_points: Vec<Address>,
    /// Recipient of bundle fees
    pub beneficiary_address: Address,
    /// Chain the bundler submits to
    pub chain_id: u64,
    /// Maximum operations per bundle
    pub max_bundle_size: usize,
    /// Maximum summed operation gas per bundle
    pub max_bundle_gas: u64,
    /// Time between bundling cycles
    #[serde(with = "secs")]
    pub bundle_interval: Duration,
    /// Time between reputation decay passes
    #[serde(with = "secs")]
    pub reputation_decay_interval: Duration,
    /// Multiplier applied to reputation counters on each decay pass
    pub reputation_decay_factor: f64,
    /// Time between mempool prune passes
    #[serde(with = "secs")]
    pub prune_interval: Duration,
    /// Time a sent bundle may stay unconfirmed before its operations are
    /// returned to pending
    #[serde(with = "secs")]
    pub submitted_timeout: Duration,
    /// Senders, paymasters and factories that are never admitted
    pub blocklist: Vec<Address>,
    /// Non-terminal operations a throttled entity may hold in the mempool
    pub throttled_entity_mempool_count: usize,
    /// Operations a throttled entity may place in a single bundle
    pub throttled_entity_bundle_count: usize,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            supported_entry_points: vec![],
            beneficiary_address: Address::ZERO,
            chain_id: 1,
            max_bundle_size: 10,
            max_bundle_gas: 15_000_000,
            bundle_interval: Duration::from_secs(10),
            reputation_decay_interval: Duration::from_secs(60 * 60),
            reputation_decay_factor: 0.5,
            prune_interval: Duration::from_secs(60),
            submitted_timeout: Duration::from_secs(10 * 60),
            blocklist: vec![],
            throttled_entity_mempool_count: 4,
            throttled_entity_bundle_count: 1,
        }
    }
}

/// Thresholds and penalty lengths for the reputation store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReputationConfig {
    /// Failures that trigger a throttle
    pub throttle_threshold: u64,
    /// Failures that trigger a ban
    pub ban_threshold: u64,
    /// Failure fraction that triggers a throttle once `throttle_threshold`
    /// operations have been observed
    pub throttle_fail_rate: f64,
    /// Length of a throttle
    #[serde(with = "secs")]
    pub throttle_duration: Duration,
    /// Length of a ban
    #[serde(with = "secs")]
    pub ban_duration: Duration,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            throttle_threshold: 10,
            ban_threshold: 50,
            throttle_fail_rate: 0.5,
            throttle_duration: Duration::from_secs(60 * 60),
            ban_duration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Capacity and retention limits for the mempool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MempoolConfig {
    /// Maximum number of pending entries, unbounded if unset
    pub max_pending: Option<usize>,
    /// Reverts an entry survives before it is dropped, unbounded if unset
    pub max_retries: Option<u32>,
    /// Age after which a pending entry is pruned
    #[serde(with = "secs")]
    pub pending_ttl: Duration,
    /// Age after which an included, failed or dropped entry is pruned
    #[serde(with = "secs")]
    pub terminal_retention: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_pending: Some(10_000),
            max_retries: Some(3),
            pending_ttl: Duration::from_secs(3 * 60 * 60),
            terminal_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

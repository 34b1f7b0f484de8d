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

use crate::{ReputationConfig, Timestamp};

/// Reputation status for an entity
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationStatus {
    /// Entity is not throttled or banned
    Ok,
    /// Entity is throttled
    Throttled,
    /// Entity is banned
    Banned,
}

/// Admission ledger for a sender or paymaster.
///
/// The stored `status` is only authoritative while its deadline is in the
/// future; use [`ReputationEntry::effective`] to get the status as of a
/// given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationEntry {
    /// The entity's address
    pub address: Address,
    /// Operations from this entity that were included
    pub ops_included: u64,
    /// Operations from this entity that failed
    pub ops_failed: u64,
    /// Stored status, possibly stale
    pub status: ReputationStatus,
    /// End of the current throttle
    pub throttled_until: Option<Timestamp>,
    /// End of the current ban
    pub banned_until: Option<Timestamp>,
}

impl ReputationEntry {
    /// A fresh entry with no history.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ops_included: 0,
            ops_failed: 0,
            status: ReputationStatus::Ok,
            throttled_until: None,
            banned_until: None,
        }
    }

    /// True while a ban is in force.
    pub fn is_banned_at(&self, now: Timestamp) -> bool {
        self.status == ReputationStatus::Banned && self.banned_until.is_some_and(|t| t > now)
    }

    /// True while a throttle is in force.
    pub fn is_throttled_at(&self, now: Timestamp) -> bool {
        self.status == ReputationStatus::Throttled && self.throttled_until.is_some_and(|t| t > now)
    }

    /// Status with expired penalties removed.
    pub fn status_at(&self, now: Timestamp) -> ReputationStatus {
        if self.is_banned_at(now) {
            ReputationStatus::Banned
        } else if self.is_throttled_at(now)
            || (self.status == ReputationStatus::Banned
                && self.throttled_until.is_some_and(|t| t > now))
        {
            ReputationStatus::Throttled
        } else {
            ReputationStatus::Ok
        }
    }

    /// The entry with its status re-derived as of `now`.
    pub fn effective(mut self, now: Timestamp) -> Self {
        self.status = self.status_at(now);
        self
    }

    /// Counts a successful inclusion. Penalties are left to expire on their own.
    pub fn record_included(&mut self) {
        self.ops_included = self.ops_included.saturating_add(1);
    }

    /// Counts a failure and applies any penalty it triggers. A ban takes
    /// precedence over a throttle.
    pub fn record_failed(&mut self, config: &ReputationConfig, now: Timestamp) {
        self.ops_failed = self.ops_failed.saturating_add(1);

        if self.ops_failed >= config.ban_threshold {
            self.ban(now, now + config.ban_duration);
        } else if self.ops_failed >= config.throttle_threshold || self.fail_rate_exceeded(config) {
            self.throttle(now, now + config.throttle_duration);
        }
    }

    /// Forces a throttle until `now + duration`, replacing any other status.
    pub fn set_throttled(&mut self, now: Timestamp, duration: Duration) {
        self.status = ReputationStatus::Throttled;
        self.throttled_until = Some(now + duration);
    }

    /// Forces a ban until `now + duration`.
    pub fn set_banned(&mut self, now: Timestamp, duration: Duration) {
        self.status = ReputationStatus::Banned;
        self.banned_until = Some(now + duration);
    }

    /// Scales both counters by `factor`, rounding toward zero.
    pub fn decay(&mut self, factor: f64) {
        self.ops_included = (self.ops_included as f64 * factor) as u64;
        self.ops_failed = (self.ops_failed as f64 * factor) as u64;
    }

    /// An entry with no counts and no active penalty carries no information.
    pub fn is_idle_at(&self, now: Timestamp) -> bool {
        self.ops_included == 0
            && self.ops_failed == 0
            && self.status_at(now) == ReputationStatus::Ok
    }

    fn fail_rate_exceeded(&self, config: &ReputationConfig) -> bool {
        let total = self.ops_failed.saturating_add(self.ops_included);
        total >= config.throttle_threshold
            && (self.ops_failed as f64 / total as f64) >= config.throttle_fail_rate
    }

    fn ban(&mut self, now: Timestamp, until: Timestamp) {
        let until = match self.banned_until {
            Some(current) if self.is_banned_at(now) => current.max(until),
            _ => until,
        };
        self.status = ReputationStatus::Banned;
        self.banned_until = Some(until);
    }

    fn throttle(&mut self, now: Timestamp, until: Timestamp) {
        if self.is_banned_at(now) {
            return;
        }
        let until = match self.throttled_until {
            Some(current) if self.is_throttled_at(now) => current.max(until),
            _ => until,
        };
        self.status = ReputationStatus::Throttled;
        self.throttled_until = Some(until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReputationConfig {
        ReputationConfig {
            throttle_threshold: 3,
            ban_threshold: 6,
            throttle_fail_rate: 0.5,
            throttle_duration: Duration::from_secs(60),
            ban_duration: Duration::from_secs(3600),
        }
    }

    #[test]
    fn throttled_at_threshold() {
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        for _ in 0..2 {
            entry.record_failed(&config(), now);
        }
        assert_eq!(entry.status_at(now), ReputationStatus::Ok);

        entry.record_failed(&config(), now);
        assert_eq!(entry.status, ReputationStatus::Throttled);
        assert_eq!(entry.throttled_until, Some(Timestamp::new(1_060)));
        assert!(entry.is_throttled_at(now));
    }

    #[test]
    fn banned_at_threshold() {
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        for _ in 0..6 {
            entry.record_failed(&config(), now);
        }
        assert_eq!(entry.status, ReputationStatus::Banned);
        assert_eq!(entry.banned_until, Some(Timestamp::new(4_600)));
        assert!(entry.is_banned_at(now));
        assert!(!entry.is_throttled_at(now));
    }

    #[test]
    fn ban_wins_when_thresholds_coincide() {
        let config = ReputationConfig {
            throttle_threshold: 1,
            ban_threshold: 1,
            ..config()
        };
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        entry.record_failed(&config, now);
        assert_eq!(entry.status, ReputationStatus::Banned);
    }

    #[test]
    fn fail_rate_throttles_below_failure_threshold() {
        let config = ReputationConfig {
            throttle_threshold: 4,
            ..config()
        };
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        entry.record_included();
        entry.record_included();
        entry.record_failed(&config, now);
        assert_eq!(entry.status_at(now), ReputationStatus::Ok);

        // 2 failed of 4 observed
        entry.record_failed(&config, now);
        assert_eq!(entry.status_at(now), ReputationStatus::Throttled);
    }

    #[test]
    fn penalties_expire_lazily() {
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        entry.set_throttled(now, Duration::from_secs(10));
        assert!(entry.is_throttled_at(now));

        let later = now + Duration::from_secs(10);
        assert!(!entry.is_throttled_at(later));
        assert_eq!(entry.clone().effective(later).status, ReputationStatus::Ok);
        assert_eq!(entry.status, ReputationStatus::Throttled);
    }

    #[test]
    fn inclusion_does_not_lift_ban() {
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        entry.set_banned(now, Duration::from_secs(100));
        for _ in 0..100 {
            entry.record_included();
        }
        assert!(entry.is_banned_at(now));
    }

    #[test]
    fn throttle_never_downgrades_ban() {
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        entry.set_banned(now, Duration::from_secs(100));
        entry.ops_failed = 3;
        entry.record_failed(&config(), now);
        assert!(entry.is_banned_at(now));
    }

    #[test]
    fn new_penalty_does_not_shorten_active_one() {
        let now = Timestamp::new(1_000);
        let mut entry = ReputationEntry::new(Address::random());
        entry.set_throttled(now, Duration::from_secs(10_000));
        entry.ops_failed = 4;
        entry.record_failed(&config(), now);
        assert_eq!(entry.throttled_until, Some(Timestamp::new(11_000)));
    }

    #[test]
    fn decay_rounds_toward_zero() {
        let mut entry = ReputationEntry::new(Address::random());
        entry.ops_included = 10;
        entry.ops_failed = 3;
        entry.decay(0.5);
        assert_eq!(entry.ops_included, 5);
        assert_eq!(entry.ops_failed, 1);

        entry.decay(0.0);
        assert!(entry.is_idle_at(Timestamp::new(0)));
    }

    #[test]
    fn status_serde() {
        assert_eq!(
            serde_json::to_string(&ReputationStatus::Throttled).unwrap(),
            "\"throttled\""
        );
        let status: ReputationStatus = serde_json::from_str("\"banned\"").unwrap();
        assert_eq!(status, ReputationStatus::Banned);
    }
}

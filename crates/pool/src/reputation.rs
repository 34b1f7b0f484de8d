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
use bundler_types::{ReputationConfig, ReputationEntry, ReputationStatus, Timestamp};
#[cfg(feature = "test-utils")]
use mockall::automock;
use redb::{ReadableTable, Table};
use tracing::{debug, info};

use crate::store::{Store, StoreError, REPUTATION};

/// Reputation result
pub type ReputationResult<T> = std::result::Result<T, ReputationError>;

/// Reputation error
#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    /// The underlying store failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Decay factors must lie in `[0, 1]`
    #[error("invalid decay factor {0}, must be between 0 and 1")]
    InvalidDecayFactor(f64),
}

/// Per-address ledger of inclusion outcomes used for admission control.
///
/// Statuses are always reported as of the current time: a throttle or ban
/// whose deadline has passed reads as `Ok` without being rewritten.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait::async_trait]
pub trait ReputationStore: Send + Sync + 'static {
    /// Counts an operation from `address` that was included successfully.
    async fn record_included(&self, address: Address) -> ReputationResult<()>;

    /// Counts an operation from `address` that failed, applying any
    /// throttle or ban it triggers. Returns the resulting status.
    async fn record_failed(&self, address: Address) -> ReputationResult<ReputationStatus>;

    /// Whether a throttle is in force for `address`.
    async fn is_throttled(&self, address: Address) -> ReputationResult<bool>;

    /// Whether a ban is in force for `address`.
    async fn is_banned(&self, address: Address) -> ReputationResult<bool>;

    /// Current status of `address`, `Ok` if unknown.
    async fn status(&self, address: Address) -> ReputationResult<ReputationStatus>;

    /// Throttles `address` for `duration` from now.
    async fn set_throttled(&self, address: Address, duration: Duration) -> ReputationResult<()>;

    /// Bans `address` for `duration` from now.
    async fn set_banned(&self, address: Address, duration: Duration) -> ReputationResult<()>;

    /// Forgets `address`. Returns whether it was known.
    async fn clear(&self, address: Address) -> ReputationResult<bool>;

    /// Scales every counter by `factor` and forgets entries left with no
    /// history. Returns the number of entries forgotten.
    async fn decay(&self, factor: f64) -> ReputationResult<usize>;

    /// Entry for `address` with its current status.
    async fn get(&self, address: Address) -> ReputationResult<Option<ReputationEntry>>;

    /// Every known entry with its current status.
    async fn get_all(&self) -> ReputationResult<Vec<ReputationEntry>>;
}

/// Reputation store persisted in the embedded store.
pub struct PersistentReputation {
    store: Store,
    config: ReputationConfig,
}

impl PersistentReputation {
    /// Creates a reputation store over `store`.
    pub fn new(store: Store, config: ReputationConfig) -> Self {
        Self { store, config }
    }

    /// Loads the entry for `address`, applies `f` and writes it back, all in
    /// one write transaction.
    async fn update<T, F>(&self, address: Address, f: F) -> ReputationResult<T>
    where
        F: FnOnce(&mut ReputationEntry) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.store
            .write(move |txn| {
                let mut table = txn.open_table(REPUTATION).map_err(StoreError::from)?;
                let mut entry =
                    load(&table, &address)?.unwrap_or_else(|| ReputationEntry::new(address));
                let out = f(&mut entry);
                save(&mut table, &entry)?;
                Ok(out)
            })
            .await
    }
}

#[async_trait::async_trait]
impl ReputationStore for PersistentReputation {
    async fn record_included(&self, address: Address) -> ReputationResult<()> {
        self.update(address, ReputationEntry::record_included).await
    }

    async fn record_failed(&self, address: Address) -> ReputationResult<ReputationStatus> {
        let config = self.config.clone();
        let status = self
            .update(address, move |entry| {
                let now = Timestamp::now();
                entry.record_failed(&config, now);
                entry.status_at(now)
            })
            .await?;
        if status != ReputationStatus::Ok {
            info!("Entity {address} is now {status:?}");
        }
        Ok(status)
    }

    async fn is_throttled(&self, address: Address) -> ReputationResult<bool> {
        Ok(self.status(address).await? == ReputationStatus::Throttled)
    }

    async fn is_banned(&self, address: Address) -> ReputationResult<bool> {
        Ok(self.status(address).await? == ReputationStatus::Banned)
    }

    async fn status(&self, address: Address) -> ReputationResult<ReputationStatus> {
        Ok(self
            .get(address)
            .await?
            .map_or(ReputationStatus::Ok, |entry| entry.status))
    }

    async fn set_throttled(&self, address: Address, duration: Duration) -> ReputationResult<()> {
        debug!("Throttling {address} for {duration:?}");
        self.update(address, move |entry| {
            entry.set_throttled(Timestamp::now(), duration)
        })
        .await
    }

    async fn set_banned(&self, address: Address, duration: Duration) -> ReputationResult<()> {
        debug!("Banning {address} for {duration:?}");
        self.update(address, move |entry| entry.set_banned(Timestamp::now(), duration))
            .await
    }

    async fn clear(&self, address: Address) -> ReputationResult<bool> {
        self.store
            .write(move |txn| {
                let mut table = txn.open_table(REPUTATION).map_err(StoreError::from)?;
                let removed = table
                    .remove(address.as_slice())
                    .map_err(StoreError::from)?
                    .is_some();
                Ok(removed)
            })
            .await
    }

    async fn decay(&self, factor: f64) -> ReputationResult<usize> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(ReputationError::InvalidDecayFactor(factor));
        }

        let removed = self
            .store
            .write(move |txn| {
                let mut table = txn.open_table(REPUTATION).map_err(StoreError::from)?;
                let now = Timestamp::now();
                let mut removed = 0;
                for mut entry in load_all(&table)? {
                    entry.decay(factor);
                    if entry.is_idle_at(now) {
                        table
                            .remove(entry.address.as_slice())
                            .map_err(StoreError::from)?;
                        removed += 1;
                    } else {
                        save(&mut table, &entry)?;
                    }
                }
                Ok::<_, ReputationError>(removed)
            })
            .await?;

        debug!("Decayed reputation by {factor}, forgot {removed} entities");
        Ok(removed)
    }

    async fn get(&self, address: Address) -> ReputationResult<Option<ReputationEntry>> {
        let entry = self
            .store
            .read(move |txn| {
                let table = txn.open_table(REPUTATION).map_err(StoreError::from)?;
                Ok::<_, ReputationError>(load(&table, &address)?)
            })
            .await?;
        Ok(entry.map(|entry| entry.effective(Timestamp::now())))
    }

    async fn get_all(&self) -> ReputationResult<Vec<ReputationEntry>> {
        let entries = self
            .store
            .read(move |txn| {
                let table = txn.open_table(REPUTATION).map_err(StoreError::from)?;
                Ok::<_, ReputationError>(load_all(&table)?)
            })
            .await?;
        let now = Timestamp::now();
        Ok(entries.into_iter().map(|e| e.effective(now)).collect())
    }
}

fn load(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    address: &Address,
) -> Result<Option<ReputationEntry>, StoreError> {
    match table.get(address.as_slice())? {
        Some(row) => Ok(Some(serde_json::from_slice(row.value())?)),
        None => Ok(None),
    }
}

fn load_all(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<Vec<ReputationEntry>, StoreError> {
    let mut entries = vec![];
    for row in table.iter()? {
        let (_, value) = row?;
        entries.push(serde_json::from_slice(value.value())?);
    }
    Ok(entries)
}

fn save(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    entry: &ReputationEntry,
) -> Result<(), StoreError> {
    table.insert(entry.address.as_slice(), serde_json::to_vec(entry)?.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn open(dir: &TempDir) -> PersistentReputation {
        let store = Store::open(dir.path().join("bundler.redb")).unwrap();
        PersistentReputation::new(store, ReputationConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_address_is_ok() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let addr = Address::random();

        assert_eq!(rep.status(addr).await.unwrap(), ReputationStatus::Ok);
        assert!(!rep.is_throttled(addr).await.unwrap());
        assert!(!rep.is_banned(addr).await.unwrap());
        assert_eq!(rep.get(addr).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_included() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let addr = Address::random();

        rep.record_included(addr).await.unwrap();
        rep.record_included(addr).await.unwrap();

        let entry = rep.get(addr).await.unwrap().unwrap();
        assert_eq!(entry.ops_included, 2);
        assert_eq!(entry.ops_failed, 0);
        assert_eq!(entry.status, ReputationStatus::Ok);
    }

    #[tokio::test]
    async fn test_failures_throttle_then_ban() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let addr = Address::random();
        let config = ReputationConfig::default();

        for _ in 0..config.throttle_threshold - 1 {
            rep.record_included(addr).await.unwrap();
            rep.record_included(addr).await.unwrap();
            assert_eq!(
                rep.record_failed(addr).await.unwrap(),
                ReputationStatus::Ok
            );
        }
        assert_eq!(
            rep.record_failed(addr).await.unwrap(),
            ReputationStatus::Throttled
        );
        assert!(rep.is_throttled(addr).await.unwrap());

        for _ in config.throttle_threshold..config.ban_threshold - 1 {
            rep.record_failed(addr).await.unwrap();
        }
        assert_eq!(
            rep.record_failed(addr).await.unwrap(),
            ReputationStatus::Banned
        );
        assert!(rep.is_banned(addr).await.unwrap());
        assert!(!rep.is_throttled(addr).await.unwrap());
        assert_eq!(
            rep.get(addr).await.unwrap().unwrap().ops_failed,
            config.ban_threshold
        );
    }

    #[tokio::test]
    async fn test_fail_rate_throttles() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("bundler.redb")).unwrap();
        let rep = PersistentReputation::new(
            store,
            ReputationConfig {
                throttle_threshold: 4,
                ..Default::default()
            },
        );
        let addr = Address::random();

        rep.record_included(addr).await.unwrap();
        rep.record_failed(addr).await.unwrap();
        rep.record_failed(addr).await.unwrap();
        assert_eq!(rep.status(addr).await.unwrap(), ReputationStatus::Ok);

        // 3 failed of 4 observed
        assert_eq!(
            rep.record_failed(addr).await.unwrap(),
            ReputationStatus::Throttled
        );
    }

    #[tokio::test]
    async fn test_overrides_and_clear() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let addr = Address::random();

        rep.set_throttled(addr, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(rep.is_throttled(addr).await.unwrap());

        rep.set_banned(addr, Duration::from_secs(60)).await.unwrap();
        assert!(rep.is_banned(addr).await.unwrap());

        assert!(rep.clear(addr).await.unwrap());
        assert!(!rep.clear(addr).await.unwrap());
        assert_eq!(rep.status(addr).await.unwrap(), ReputationStatus::Ok);
    }

    #[tokio::test]
    async fn test_expired_penalty_reads_ok() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let addr = Address::random();

        rep.set_banned(addr, Duration::ZERO).await.unwrap();
        assert!(!rep.is_banned(addr).await.unwrap());
        assert_eq!(
            rep.get(addr).await.unwrap().unwrap().status,
            ReputationStatus::Ok
        );
    }

    #[tokio::test]
    async fn test_decay() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let busy = Address::random();
        let quiet = Address::random();

        for _ in 0..5 {
            rep.record_included(busy).await.unwrap();
        }
        rep.record_included(quiet).await.unwrap();

        assert_eq!(rep.decay(0.5).await.unwrap(), 1);
        assert_eq!(rep.get(busy).await.unwrap().unwrap().ops_included, 2);
        assert_eq!(rep.get(quiet).await.unwrap(), None);
        assert_eq!(rep.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decay_keeps_penalized() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);
        let addr = Address::random();

        rep.set_banned(addr, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(rep.decay(0.0).await.unwrap(), 0);
        assert!(rep.is_banned(addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_decay_rejects_bad_factor() {
        let dir = TempDir::new().unwrap();
        let rep = open(&dir);

        for factor in [-0.1, 1.5, f64::NAN] {
            assert!(matches!(
                rep.decay(factor).await,
                Err(ReputationError::InvalidDecayFactor(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let banned = Address::random();
        let trusted = Address::random();
        {
            let rep = open(&dir);
            rep.set_banned(banned, Duration::from_secs(3600))
                .await
                .unwrap();
            rep.record_included(trusted).await.unwrap();
        }

        let rep = open(&dir);
        assert!(rep.is_banned(banned).await.unwrap());
        assert_eq!(rep.status(banned).await.unwrap(), ReputationStatus::Banned);
        let entry = rep.get(trusted).await.unwrap().unwrap();
        assert_eq!(entry.ops_included, 1);
        assert_eq!(entry.status, ReputationStatus::Ok);
        assert_eq!(rep.get_all().await.unwrap().len(), 2);
    }
}

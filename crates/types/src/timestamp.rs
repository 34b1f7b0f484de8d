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

//! Wall-clock timestamps used for entry ages and reputation penalties.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, Sub},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch.
///
/// Shifting by a `Duration` saturates instead of overflowing, so penalty
/// deadlines computed from very long durations clamp to `Timestamp::MAX`.
/// Serializes as a plain integer.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Minimum timestamp value
    pub const MIN: Timestamp = Timestamp(u64::MIN);
    /// Maximum timestamp value
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Create a new timestamp from seconds since the epoch.
    pub const fn new(seconds_since_epoch: u64) -> Self {
        Self(seconds_since_epoch)
    }

    /// The current wall-clock time. Clocks set before the epoch read as `MIN`.
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        )
    }

    /// Returns the number of seconds since the epoch of this timestamp.
    pub fn seconds_since_epoch(self) -> u64 {
        self.0
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        Duration::from_secs(self.0.saturating_sub(earlier.0))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, duration: Duration) -> Self::Output {
        Self(self.0.saturating_add(duration.as_secs()))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, duration: Duration) -> Self::Output {
        Self(self.0.saturating_sub(duration.as_secs()))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let datetime = i64::try_from(self.0)
            .ok()
            .and_then(|secs| match Utc.timestamp_opt(secs, 0) {
                LocalResult::Single(datetime) => Some(datetime),
                _ => None,
            });
        match datetime {
            Some(datetime) => Display::fmt(&datetime, f),
            None => write!(f, "later than {}", DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({} = {})", self.0, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_saturates() {
        assert_eq!(Timestamp::MAX + Duration::from_secs(10), Timestamp::MAX);
        assert_eq!(Timestamp::new(5) - Duration::from_secs(10), Timestamp::MIN);
        assert_eq!(
            Timestamp::new(100) + Duration::from_secs(20),
            Timestamp::new(120)
        );
    }

    #[test]
    fn test_elapsed_since() {
        let t = Timestamp::new(1_000);
        assert_eq!(
            t.elapsed_since(Timestamp::new(400)),
            Duration::from_secs(600)
        );
        assert_eq!(t.elapsed_since(Timestamp::new(2_000)), Duration::ZERO);
    }

    #[test]
    fn test_serde_is_a_number() {
        let json = serde_json::to_string(&Timestamp::new(1_700_000_000)).unwrap();
        assert_eq!(json, "1700000000");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Timestamp::new(1_700_000_000));
    }

    #[test]
    fn test_display_huge_timestamp() {
        assert!(Timestamp::MAX.to_string().starts_with("later than"));
    }
}

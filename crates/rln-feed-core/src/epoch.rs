//! Epochs and protocol-wide timing parameters
//!
//! Two independent clocks exist: the membership epoch gates renewal and
//! expiry, the event epoch is the rate-limit slot width for posting.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default membership epoch width (seconds)
pub const DEFAULT_MEMBERSHIP_EPOCH_SECS: u64 = 3600;
/// Default event (rate-limit) epoch width (seconds)
pub const DEFAULT_EVENT_EPOCH_SECS: u64 = 60;
/// Default tolerated clock skew for live event timestamps (seconds)
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 60;
/// Grace window for renewal broadcast latency (seconds)
pub const RENEWAL_GRACE_SECS: u64 = 600;
/// Window for the active-member count, relative to latest activity (seconds)
pub const ACTIVITY_WINDOW_SECS: u64 = 600;

/// Timing parameters shared by every component of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    pub membership_epoch_secs: u64,
    pub event_epoch_secs: u64,
    pub clock_skew_secs: u64,
    pub renewal_grace_secs: u64,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            membership_epoch_secs: DEFAULT_MEMBERSHIP_EPOCH_SECS,
            event_epoch_secs: DEFAULT_EVENT_EPOCH_SECS,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
            renewal_grace_secs: RENEWAL_GRACE_SECS,
        }
    }
}

impl ProtocolParams {
    /// `floor(unix_secs / membership_epoch_secs)`
    pub fn membership_epoch(&self, unix_secs: u64) -> u64 {
        unix_secs / self.membership_epoch_secs
    }

    /// First second of a membership epoch
    pub fn membership_epoch_start(&self, epoch: u64) -> u64 {
        epoch.saturating_mul(self.membership_epoch_secs)
    }

    /// Rate-limit slot of an event timestamp
    pub fn event_epoch(&self, timestamp: u64) -> u64 {
        timestamp / self.event_epoch_secs
    }

    /// Time after an epoch boundary before expired members are purged
    pub fn purge_delay_secs(&self) -> u64 {
        2 * self.renewal_grace_secs
    }

    /// Membership epochs a freshly received proof may claim at `now`.
    ///
    /// The previous epoch is accepted only until its members are purged,
    /// so a late renewal can never revive a purged member.
    pub fn acceptable_membership_epochs(&self, now: u64) -> impl Iterator<Item = u64> {
        let current = self.membership_epoch(now);
        let purge_due = self
            .membership_epoch_start(current)
            .saturating_add(self.purge_delay_secs());
        let previous = current.checked_sub(1).filter(|_| now < purge_due);
        [Some(current), previous, current.checked_add(1)]
            .into_iter()
            .flatten()
    }
}

/// Current unix time in whole seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in fractional seconds
pub fn unix_now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

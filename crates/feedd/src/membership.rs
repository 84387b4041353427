//! Epoch-gated membership tracking
//!
//! Members are admitted by proofs, never by registration: every valid
//! renewal or event raises a member's epoch, and members still on an old
//! epoch are purged once the renewal grace period of a new epoch has passed.

use crate::timeline::Timeline;
use rln_feed_core::epoch::{ProtocolParams, ACTIVITY_WINDOW_SECS};
use rln_feed_core::MemberId;
use std::collections::HashMap;
use tracing::{debug, info};

/// Membership set with self-expiring entries and an activity index
#[derive(Debug)]
pub struct MemberTracker {
    params: ProtocolParams,
    /// Latest proven membership epoch per member
    epochs: HashMap<MemberId, u64>,
    /// Last activity per member
    activity: Timeline<MemberId>,
    /// Membership epoch of the last purge that ran
    last_purge_epoch: Option<u64>,
}

impl MemberTracker {
    pub fn new(params: ProtocolParams) -> Self {
        Self {
            params,
            epochs: HashMap::new(),
            activity: Timeline::new(),
            last_purge_epoch: None,
        }
    }

    /// Record that `member` proved membership for `epoch`.
    ///
    /// Returns true when the member is new or the epoch is strictly newer
    /// than the stored one; otherwise nothing changes. Epochs already
    /// purged are refused.
    pub fn add(&mut self, member: MemberId, epoch: u64) -> bool {
        if self.last_purge_epoch.is_some_and(|purged| epoch < purged) {
            debug!(%member, epoch, "refused membership on a purged epoch");
            return false;
        }
        match self.epochs.get(&member) {
            Some(stored) if epoch <= *stored => false,
            Some(stored) => {
                debug!(%member, from = *stored, to = epoch, "membership renewed");
                self.epochs.insert(member, epoch);
                true
            }
            None => {
                info!(%member, epoch, "tracking new member");
                self.epochs.insert(member, epoch);
                true
            }
        }
    }

    /// Record activity by `member` at `now`, then run the purge check.
    pub fn receive_event_timestamp(&mut self, member: MemberId, now: u64) -> usize {
        self.activity.unset_time(&member);
        self.activity.set_time(member, now);
        self.execute_purge(now)
    }

    /// Periodic tick; runs the purge check.
    pub fn update_member_list(&mut self, now: u64) -> usize {
        self.execute_purge(now)
    }

    /// Purge members on an old epoch, at most once per membership epoch.
    ///
    /// Nothing happens until `purge_delay_secs` have elapsed since the start
    /// of the current membership epoch. Returns the number of members
    /// removed.
    pub fn execute_purge(&mut self, now: u64) -> usize {
        let current = self.params.membership_epoch(now);
        if self.last_purge_epoch == Some(current) {
            return 0;
        }
        let due = self.params.membership_epoch_start(current) + self.params.purge_delay_secs();
        if now < due {
            return 0;
        }

        self.last_purge_epoch = Some(current);
        let before = self.epochs.len();
        self.epochs.retain(|_, epoch| *epoch >= current);
        let purged = before - self.epochs.len();

        let epochs = &self.epochs;
        self.activity.retain(|member| epochs.contains_key(member));

        if purged > 0 {
            info!(epoch = current, purged, remaining = self.epochs.len(), "purged expired members");
        }
        purged
    }

    /// True iff `member` has a tracked, non-purged epoch
    pub fn is_member(&self, member: &MemberId) -> bool {
        self.epochs.contains_key(member)
    }

    /// Stored epoch of `member`
    pub fn epoch_of(&self, member: &MemberId) -> Option<u64> {
        self.epochs.get(member).copied()
    }

    /// Members active within the window before the most recent activity.
    pub fn n_active_members(&self) -> usize {
        match self.activity.most_recent() {
            Some((latest, _)) => self
                .activity
                .count_since(latest.saturating_sub(ACTIVITY_WINDOW_SECS)),
            None => 0,
        }
    }

    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            tracked: self.epochs.len(),
            active: self.n_active_members(),
            last_purge_epoch: self.last_purge_epoch,
        }
    }
}

/// Membership statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipStats {
    pub tracked: usize,
    pub active: usize,
    pub last_purge_epoch: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u8) -> MemberId {
        MemberId([n; 32])
    }

    fn tracker() -> (MemberTracker, ProtocolParams) {
        let params = ProtocolParams::default();
        (MemberTracker::new(params), params)
    }

    #[test]
    fn test_add_is_monotonic() {
        let (mut tracker, _) = tracker();
        let a = member(1);

        assert!(tracker.add(a, 100));
        assert!(!tracker.add(a, 99));
        assert!(!tracker.add(a, 100));
        assert_eq!(tracker.epoch_of(&a), Some(100));
        assert!(tracker.add(a, 102));
        assert_eq!(tracker.epoch_of(&a), Some(102));
    }

    #[test]
    fn test_renewal_and_purge_scenario() {
        let (mut tracker, params) = tracker();
        let a = member(1);

        assert!(tracker.add(a, 100));
        assert!(!tracker.add(a, 99));
        assert_eq!(tracker.epoch_of(&a), Some(100));

        let start = params.membership_epoch_start(101);
        assert_eq!(tracker.update_member_list(start + 1199), 0);
        assert!(tracker.is_member(&a));

        assert_eq!(tracker.update_member_list(start + 1201), 1);
        assert!(!tracker.is_member(&a));
        assert_eq!(tracker.stats().last_purge_epoch, Some(101));
    }

    #[test]
    fn test_purge_runs_once_per_epoch() {
        let (mut tracker, params) = tracker();
        let start = params.membership_epoch_start(200);

        tracker.add(member(1), 199);
        assert_eq!(tracker.update_member_list(start + 1300), 1);

        // A late straggler on the purged epoch is refused
        assert!(!tracker.add(member(2), 199));
        assert!(!tracker.is_member(&member(2)));

        tracker.add(member(3), 200);
        assert_eq!(tracker.update_member_list(start + 1400), 0);

        let next = params.membership_epoch_start(201);
        assert_eq!(tracker.update_member_list(next + 1200), 1);
        assert!(!tracker.is_member(&member(3)));
        assert_eq!(tracker.stats().last_purge_epoch, Some(201));
    }

    #[test]
    fn test_purge_order_does_not_matter() {
        let params = ProtocolParams::default();
        let start = params.membership_epoch_start(500);
        let a = member(1);

        // Renewal first, purge triggered by the activity afterwards
        let mut early = MemberTracker::new(params);
        assert!(early.add(a, 499));
        early.receive_event_timestamp(a, start + 1300);

        // Purge first, renewal delivered after it
        let mut late = MemberTracker::new(params);
        late.update_member_list(start + 1250);
        assert!(!late.add(a, 499));
        late.receive_event_timestamp(a, start + 1300);

        assert!(!early.is_member(&a));
        assert!(!late.is_member(&a));
        assert_eq!(early.stats().tracked, late.stats().tracked);
    }

    #[test]
    fn test_current_members_survive_purge() {
        let (mut tracker, params) = tracker();
        let start = params.membership_epoch_start(50);

        tracker.add(member(1), 50);
        tracker.add(member(2), 51);
        tracker.add(member(3), 49);
        tracker.receive_event_timestamp(member(3), start + 10);

        assert_eq!(tracker.receive_event_timestamp(member(1), start + 1500), 1);
        assert!(tracker.is_member(&member(1)));
        assert!(tracker.is_member(&member(2)));
        assert!(!tracker.is_member(&member(3)));
        assert_eq!(tracker.n_active_members(), 1);
    }

    #[test]
    fn test_active_members_window() {
        let (mut tracker, params) = tracker();
        let base = params.membership_epoch_start(10);

        assert_eq!(tracker.n_active_members(), 0);

        for n in 1..=3 {
            tracker.add(member(n), 10);
        }
        tracker.receive_event_timestamp(member(1), base + 100);
        tracker.receive_event_timestamp(member(2), base + 500);
        tracker.receive_event_timestamp(member(3), base + 700);
        // Window is [700 - 600, 700]
        assert_eq!(tracker.n_active_members(), 3);

        tracker.receive_event_timestamp(member(3), base + 701);
        assert_eq!(tracker.n_active_members(), 2);

        // Re-recording replaces the old entry
        tracker.receive_event_timestamp(member(1), base + 702);
        assert_eq!(tracker.n_active_members(), 3);
        assert_eq!(tracker.stats().active, 3);
    }
}

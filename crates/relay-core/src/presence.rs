//! Per-channel presence set.
//!
//! Tracks which subscriber identities are attached to a channel, with a
//! per-entry liveness timestamp. Entries that are not refreshed within the
//! liveness window are considered dead even without an explicit remove,
//! which covers ungraceful disconnects.

use relay_proto::ClientInfo;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Presence state of a single subscriber connection.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// Subscriber identity.
    pub info: ClientInfo,
    /// When the subscriber first joined.
    pub joined_at: Instant,
    /// Last refresh time.
    pub last_seen: Instant,
}

impl PresenceEntry {
    fn new(info: ClientInfo, now: Instant) -> Self {
        Self {
            info,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Whether the entry has outlived the liveness window.
    #[must_use]
    pub fn is_stale(&self, liveness: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) > liveness
    }
}

/// Presence set of one channel, keyed by connection id.
#[derive(Debug, Default)]
pub struct ChannelPresence {
    members: HashMap<String, PresenceEntry>,
}

impl ChannelPresence {
    /// Create an empty presence set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked entries, stale ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection is tracked.
    #[must_use]
    pub fn is_present(&self, client: &str) -> bool {
        self.members.contains_key(client)
    }

    /// Add a subscriber or refresh its liveness timestamp.
    ///
    /// Idempotent; a refresh keeps the original join time. Returns `true`
    /// for a new member.
    pub fn add_or_refresh(&mut self, info: ClientInfo, now: Instant) -> bool {
        match self.members.entry(info.client.clone()) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.info = info;
                entry.last_seen = now;
                false
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                debug!(client = %info.client, "Presence: member joined");
                vacant.insert(PresenceEntry::new(info, now));
                true
            }
        }
    }

    /// Refresh a member's liveness timestamp.
    ///
    /// Returns `false` if the connection is not tracked.
    pub fn touch(&mut self, client: &str, now: Instant) -> bool {
        if let Some(entry) = self.members.get_mut(client) {
            entry.last_seen = now;
            true
        } else {
            false
        }
    }

    /// Remove a member. Idempotent; absent entries are a no-op.
    pub fn remove(&mut self, client: &str) -> Option<PresenceEntry> {
        let entry = self.members.remove(client);
        if entry.is_some() {
            debug!(client = %client, "Presence: member left");
        }
        entry
    }

    /// All members still within the liveness window.
    ///
    /// Does not evict; stale entries are filtered out, never returned.
    #[must_use]
    pub fn snapshot(&self, liveness: Duration, now: Instant) -> Vec<PresenceEntry> {
        self.members
            .values()
            .filter(|entry| !entry.is_stale(liveness, now))
            .cloned()
            .collect()
    }

    /// Remove members outside the liveness window.
    ///
    /// Returns the removed connection ids.
    pub fn prune_stale(&mut self, liveness: Duration, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .members
            .iter()
            .filter(|(_, entry)| entry.is_stale(liveness, now))
            .map(|(client, _)| client.clone())
            .collect();

        for client in &stale {
            self.members.remove(client);
            debug!(client = %client, "Presence: pruned stale member");
        }

        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVENESS: Duration = Duration::from_secs(30);

    fn info(user: &str, client: &str) -> ClientInfo {
        ClientInfo::new(user, client)
    }

    #[test]
    fn test_add_or_refresh_is_idempotent() {
        let mut presence = ChannelPresence::new();
        let now = Instant::now();

        assert!(presence.add_or_refresh(info("42", "conn-1"), now));
        assert!(!presence.add_or_refresh(info("42", "conn-1"), now));

        assert_eq!(presence.count(), 1);
        assert_eq!(presence.snapshot(LIVENESS, now).len(), 1);
    }

    #[test]
    fn test_refresh_preserves_join_time() {
        let mut presence = ChannelPresence::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(10);

        presence.add_or_refresh(info("42", "conn-1"), start);
        presence.add_or_refresh(info("42", "conn-1"), later);

        let snapshot = presence.snapshot(LIVENESS, later);
        assert_eq!(snapshot[0].joined_at, start);
        assert_eq!(snapshot[0].last_seen, later);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut presence = ChannelPresence::new();
        let now = Instant::now();

        presence.add_or_refresh(info("42", "conn-1"), now);
        assert!(presence.remove("conn-1").is_some());
        assert!(presence.remove("conn-1").is_none());
        assert!(presence.remove("never-there").is_none());
    }

    #[test]
    fn test_snapshot_filters_stale_entries() {
        // Liveness window 30s: an entry added at t=0 and never refreshed
        // is absent from a snapshot at t=31s.
        let mut presence = ChannelPresence::new();
        let start = Instant::now();

        presence.add_or_refresh(info("42", "conn-1"), start);
        presence.add_or_refresh(info("7", "conn-2"), start + Duration::from_secs(20));

        let at_31 = start + Duration::from_secs(31);
        let snapshot = presence.snapshot(LIVENESS, at_31);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].info.client, "conn-2");

        // Not evicted, only filtered
        assert_eq!(presence.count(), 2);
    }

    #[test]
    fn test_touch_keeps_entry_alive() {
        let mut presence = ChannelPresence::new();
        let start = Instant::now();

        presence.add_or_refresh(info("42", "conn-1"), start);
        assert!(presence.touch("conn-1", start + Duration::from_secs(25)));

        let at_40 = start + Duration::from_secs(40);
        assert_eq!(presence.snapshot(LIVENESS, at_40).len(), 1);

        assert!(!presence.touch("unknown", start));
    }

    #[test]
    fn test_prune_stale() {
        let mut presence = ChannelPresence::new();
        let start = Instant::now();

        presence.add_or_refresh(info("42", "conn-1"), start);
        presence.add_or_refresh(info("7", "conn-2"), start + Duration::from_secs(20));

        let pruned = presence.prune_stale(LIVENESS, start + Duration::from_secs(31));
        assert_eq!(pruned, vec!["conn-1".to_string()]);
        assert_eq!(presence.count(), 1);

        // Remove after expiry-based prune is a no-op, not an error
        assert!(presence.remove("conn-1").is_none());
    }
}

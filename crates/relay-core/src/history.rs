//! Per-channel history log.
//!
//! A bounded, ordered log of publications with monotonically increasing
//! sequence numbers. The retained set is always a contiguous suffix of
//! sequence numbers: eviction only ever drops from the front.

use relay_proto::Publication;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Retention limits applied to a channel's history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRetention {
    /// Maximum number of retained entries.
    pub max_entries: usize,
    /// Maximum age of a retained entry.
    pub lifetime: Duration,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    publication: Publication,
    inserted_at: Instant,
}

/// Bounded, ordered log of the publications of one channel.
///
/// Sequence numbers start at 1, increase by exactly 1 per append, and are
/// never reused even after eviction. Callers serialize appends per channel;
/// the structure itself is not synchronized.
#[derive(Debug, Default)]
pub struct ChannelHistory {
    entries: VecDeque<HistoryEntry>,
    last_seq: u64,
}

impl ChannelHistory {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently assigned sequence number (0 before any append).
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log retains no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number of the oldest retained entry.
    #[must_use]
    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.publication.seq)
    }

    /// Assign the next sequence number to `publication`, retain it, and
    /// evict entries beyond the retention limits.
    ///
    /// Returns the sequenced publication.
    pub fn append(
        &mut self,
        mut publication: Publication,
        retention: &HistoryRetention,
        now: Instant,
    ) -> Publication {
        self.last_seq += 1;
        publication.seq = self.last_seq;
        trace!(channel = %publication.channel, seq = publication.seq, "History append");

        self.entries.push_back(HistoryEntry {
            publication: publication.clone(),
            inserted_at: now,
        });
        self.evict(retention, now);

        publication
    }

    /// Return the retained publications with sequence number greater than
    /// `since`, in ascending order, plus whether the gap could be closed.
    ///
    /// `false` means the caller must treat the subscription as fresh: the
    /// cursor is either ahead of the log or older than the oldest retained
    /// entry. An empty list with `true` means the subscriber is caught up.
    pub fn recover(
        &mut self,
        since: u64,
        retention: &HistoryRetention,
        now: Instant,
    ) -> (Vec<Publication>, bool) {
        self.evict(retention, now);

        if since > self.last_seq {
            return (Vec::new(), false);
        }
        if since == self.last_seq {
            return (Vec::new(), true);
        }

        // since < last_seq: the gap is closable only if everything after
        // `since` is still retained.
        let Some(oldest) = self.oldest_seq() else {
            return (Vec::new(), false);
        };
        if since + 1 < oldest {
            return (Vec::new(), false);
        }

        let publications = self
            .entries
            .iter()
            .filter(|e| e.publication.seq > since)
            .map(|e| e.publication.clone())
            .collect();
        (publications, true)
    }

    // Size first, then age: both orders drop only from the front, keeping
    // the retained set a contiguous suffix.
    fn evict(&mut self, retention: &HistoryRetention, now: Instant) {
        while self.entries.len() > retention.max_entries {
            self.entries.pop_front();
        }
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.inserted_at) > retention.lifetime {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::NodeId;

    fn publication(payload: &[u8]) -> Publication {
        Publication::new("test", payload.to_vec(), NodeId::new("n1"))
    }

    fn retention(max_entries: usize, lifetime_secs: u64) -> HistoryRetention {
        HistoryRetention {
            max_entries,
            lifetime: Duration::from_secs(lifetime_secs),
        }
    }

    #[test]
    fn test_sequences_are_monotonic_and_gapless() {
        let mut history = ChannelHistory::new();
        let retention = retention(100, 60);
        let now = Instant::now();

        for i in 1..=10u64 {
            let p = history.append(publication(b"x"), &retention, now);
            assert_eq!(p.seq, i);
        }
        assert_eq!(history.last_seq(), 10);
        assert_eq!(history.oldest_seq(), Some(1));
    }

    #[test]
    fn test_recover_roundtrip() {
        let mut history = ChannelHistory::new();
        let retention = retention(100, 60);
        let now = Instant::now();

        for _ in 0..5 {
            history.append(publication(b"x"), &retention, now);
        }

        let (all, recovered) = history.recover(0, &retention, now);
        assert!(recovered);
        assert_eq!(all.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        // Fully caught up: empty but meaningful
        let (empty, recovered) = history.recover(5, &retention, now);
        assert!(recovered);
        assert!(empty.is_empty());

        // Cursor ahead of the log
        let (none, recovered) = history.recover(105, &retention, now);
        assert!(!recovered);
        assert!(none.is_empty());
    }

    #[test]
    fn test_size_eviction_keeps_contiguous_suffix() {
        let mut history = ChannelHistory::new();
        let retention = retention(3, 60);
        let now = Instant::now();

        for _ in 0..10 {
            history.append(publication(b"x"), &retention, now);
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest_seq(), Some(8));
        assert_eq!(history.last_seq(), 10);

        // Gap below the retained suffix cannot be closed
        let (none, recovered) = history.recover(5, &retention, now);
        assert!(!recovered);
        assert!(none.is_empty());

        // Boundary: since + 1 == oldest retained
        let (tail, recovered) = history.recover(7, &retention, now);
        assert!(recovered);
        assert_eq!(tail.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![8, 9, 10]);
    }

    #[test]
    fn test_age_eviction() {
        let mut history = ChannelHistory::new();
        let retention = retention(100, 60);
        let start = Instant::now();

        history.append(publication(b"old"), &retention, start);
        history.append(publication(b"new"), &retention, start + Duration::from_secs(45));

        // At t=75 the first entry is past its lifetime, the second is not
        let later = start + Duration::from_secs(75);
        let (tail, recovered) = history.recover(0, &retention, later);
        assert!(!recovered, "oldest entry was evicted, gap from 0 is open");
        assert!(tail.is_empty());

        let (tail, recovered) = history.recover(1, &retention, later);
        assert!(recovered);
        assert_eq!(tail.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_size_then_age_tiebreak() {
        let mut history = ChannelHistory::new();
        let retention = retention(2, 60);
        let start = Instant::now();

        // Three entries, the first already expired: size eviction drops
        // seq 1, age eviction then drops seq 2 - front-only either way.
        history.append(publication(b"a"), &retention, start);
        history.append(publication(b"b"), &retention, start);
        let late = start + Duration::from_secs(61);
        history.append(publication(b"c"), &retention, late);

        assert_eq!(history.oldest_seq(), Some(3));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_recover_after_everything_expired() {
        let mut history = ChannelHistory::new();
        let retention = retention(100, 60);
        let start = Instant::now();

        for _ in 0..3 {
            history.append(publication(b"x"), &retention, start);
        }

        let later = start + Duration::from_secs(120);

        // Caught-up cursor still recovers (empty)
        let (empty, recovered) = history.recover(3, &retention, later);
        assert!(recovered);
        assert!(empty.is_empty());

        // Anything older is a gap now
        let (none, recovered) = history.recover(2, &retention, later);
        assert!(!recovered);
        assert!(none.is_empty());
    }

    #[test]
    fn test_chat_scenario() {
        // historySize=3, lifetime=60s: publish a,b,c,d then recover from 1
        let mut history = ChannelHistory::new();
        let retention = retention(3, 60);
        let now = Instant::now();

        for payload in [b"a", b"b", b"c", b"d"] {
            history.append(publication(payload), &retention, now);
        }

        let (backlog, recovered) = history.recover(1, &retention, now);
        assert!(recovered);
        assert_eq!(backlog.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(
            backlog.iter().map(|p| &p.payload[..]).collect::<Vec<_>>(),
            vec![b"b", b"c", b"d"]
        );
    }
}

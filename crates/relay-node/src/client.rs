//! Local client registry types.
//!
//! A `LocalClient` is one connected client on this node: its identity, its
//! bounded event queue, and its per-channel delivery state. The queue is the
//! single path to the connection layer; overflow means the subscriber is too
//! slow and gets disconnected instead of backpressuring publishers.

use relay_proto::{ClientInfo, Publication};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Events delivered to a connected client's event stream.
///
/// The connection layer reads these from the receiver returned by
/// `Node::connect` and writes them to its socket.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A channel publication.
    Publication(Publication),
    /// A subscriber joined a channel with join/leave events enabled.
    Join {
        /// Channel that was joined.
        channel: String,
        /// Joining subscriber.
        info: ClientInfo,
    },
    /// A subscriber left a channel with join/leave events enabled.
    Leave {
        /// Channel that was left.
        channel: String,
        /// Leaving subscriber.
        info: ClientInfo,
    },
    /// The server removed this client's subscription.
    Unsubscribed {
        /// Channel the client was unsubscribed from.
        channel: String,
    },
    /// The server is disconnecting this client.
    Disconnect {
        /// Human-readable reason.
        reason: String,
    },
}

/// Delivery state of one local subscription.
///
/// A subscription starts out buffering: envelopes that race the subscribe
/// call are parked until the recovered backlog is flushed, then merged in
/// sequence order. Live delivery suppresses at-least-once duplicates with a
/// monotonic sequence gate.
#[derive(Debug)]
pub(crate) enum DeliveryState {
    /// Set up but not yet live; racing publications park here.
    Buffering { pending: Vec<Publication> },
    /// Live delivery with duplicate suppression.
    Live { last_seq: u64 },
}

/// One local subscription's shared delivery state.
#[derive(Debug)]
pub(crate) struct Subscription {
    state: Mutex<DeliveryState>,
}

impl Subscription {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DeliveryState::Buffering {
                pending: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of pushing one event at a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Queued for the connection layer.
    Delivered,
    /// Dropped as an at-least-once duplicate.
    Suppressed,
    /// Queue full or closed; the subscriber must be disconnected.
    Overflow,
}

/// A connected client on this node.
#[derive(Debug)]
pub(crate) struct LocalClient {
    pub(crate) info: ClientInfo,
    sender: mpsc::Sender<ServerEvent>,
    /// Channels this client is subscribed to.
    pub(crate) subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl LocalClient {
    pub(crate) fn new(
        info: ClientInfo,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        (
            Arc::new(Self {
                info,
                sender,
                subscriptions: Mutex::new(HashMap::new()),
            }),
            receiver,
        )
    }

    pub(crate) fn id(&self) -> &str {
        &self.info.client
    }

    pub(crate) fn user(&self) -> &str {
        &self.info.user
    }

    pub(crate) fn subscription(&self, channel: &str) -> Option<Arc<Subscription>> {
        self.lock_subscriptions().get(channel).cloned()
    }

    pub(crate) fn lock_subscriptions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a control event, bypassing sequence gating.
    pub(crate) fn send_control(&self, event: ServerEvent) -> Delivery {
        match self.sender.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Overflow,
        }
    }

    /// Push a publication through the subscription's delivery state.
    pub(crate) fn deliver_publication(
        &self,
        subscription: &Subscription,
        publication: Publication,
        buffer_capacity: usize,
    ) -> Delivery {
        let mut state = subscription.lock();
        match &mut *state {
            DeliveryState::Buffering { pending } => {
                if pending.len() >= buffer_capacity {
                    return Delivery::Overflow;
                }
                trace!(client = %self.id(), seq = publication.seq, "Buffering mid-subscribe publication");
                pending.push(publication);
                Delivery::Delivered
            }
            DeliveryState::Live { last_seq } => {
                if publication.seq != 0 {
                    if publication.seq <= *last_seq {
                        return Delivery::Suppressed;
                    }
                    *last_seq = publication.seq;
                }
                match self.sender.try_send(ServerEvent::Publication(publication)) {
                    Ok(()) => Delivery::Delivered,
                    Err(_) => Delivery::Overflow,
                }
            }
        }
    }

    /// Flush the recovered backlog, then the publications buffered while
    /// subscribing, deduplicated by sequence number, and switch to live
    /// delivery.
    ///
    /// Backlog always precedes live traffic; the two never interleave.
    /// Returns the sequence position after the flush, or `Err` on queue
    /// overflow.
    pub(crate) fn activate(
        &self,
        subscription: &Subscription,
        backlog: Vec<Publication>,
        start_seq: u64,
    ) -> Result<u64, Delivery> {
        let mut state = subscription.lock();
        let pending = match &mut *state {
            DeliveryState::Buffering { pending } => std::mem::take(pending),
            DeliveryState::Live { last_seq } => return Ok(*last_seq),
        };

        let mut last_seq = start_seq;
        for publication in backlog.into_iter().chain(pending) {
            if publication.seq != 0 {
                if publication.seq <= last_seq {
                    continue;
                }
                last_seq = publication.seq;
            }
            if self
                .sender
                .try_send(ServerEvent::Publication(publication))
                .is_err()
            {
                return Err(Delivery::Overflow);
            }
        }

        *state = DeliveryState::Live { last_seq };
        Ok(last_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::NodeId;

    fn publication(seq: u64) -> Publication {
        let mut p = Publication::new("test", vec![seq as u8], NodeId::new("n1"));
        p.seq = seq;
        p
    }

    fn client(capacity: usize) -> (Arc<LocalClient>, mpsc::Receiver<ServerEvent>) {
        LocalClient::new(ClientInfo::new("42", "conn-1"), capacity)
    }

    fn received_seqs(receiver: &mut mpsc::Receiver<ServerEvent>) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let ServerEvent::Publication(p) = event {
                seqs.push(p.seq);
            }
        }
        seqs
    }

    #[test]
    fn test_live_delivery_suppresses_duplicates() {
        let (client, mut receiver) = client(16);
        let subscription = Subscription::new();
        client.activate(&subscription, Vec::new(), 0).unwrap();

        assert_eq!(
            client.deliver_publication(&subscription, publication(1), 16),
            Delivery::Delivered
        );
        assert_eq!(
            client.deliver_publication(&subscription, publication(1), 16),
            Delivery::Suppressed
        );
        assert_eq!(
            client.deliver_publication(&subscription, publication(2), 16),
            Delivery::Delivered
        );

        assert_eq!(received_seqs(&mut receiver), vec![1, 2]);
    }

    #[test]
    fn test_unsequenced_publications_bypass_the_gate() {
        let (client, mut receiver) = client(16);
        let subscription = Subscription::new();
        client.activate(&subscription, Vec::new(), 0).unwrap();

        for _ in 0..3 {
            assert_eq!(
                client.deliver_publication(&subscription, publication(0), 16),
                Delivery::Delivered
            );
        }
        assert_eq!(received_seqs(&mut receiver), vec![0, 0, 0]);
    }

    #[test]
    fn test_activate_merges_backlog_and_buffered_live() {
        let (client, mut receiver) = client(16);
        let subscription = Subscription::new();

        // Publications raced the subscribe call and were buffered
        client.deliver_publication(&subscription, publication(3), 16);
        client.deliver_publication(&subscription, publication(4), 16);

        // The recovered backlog overlaps with the buffered traffic
        let backlog = vec![publication(2), publication(3)];
        let position = client.activate(&subscription, backlog, 1).unwrap();

        assert_eq!(position, 4);
        assert_eq!(received_seqs(&mut receiver), vec![2, 3, 4]);

        // Subsequent duplicates stay suppressed
        assert_eq!(
            client.deliver_publication(&subscription, publication(4), 16),
            Delivery::Suppressed
        );
    }

    #[test]
    fn test_buffer_capacity_overflow() {
        let (client, _receiver) = client(16);
        let subscription = Subscription::new();

        assert_eq!(
            client.deliver_publication(&subscription, publication(1), 1),
            Delivery::Delivered
        );
        assert_eq!(
            client.deliver_publication(&subscription, publication(2), 1),
            Delivery::Overflow
        );
    }

    #[test]
    fn test_queue_overflow() {
        let (client, _receiver) = client(1);
        let subscription = Subscription::new();
        client.activate(&subscription, Vec::new(), 0).unwrap();

        assert_eq!(
            client.deliver_publication(&subscription, publication(1), 16),
            Delivery::Delivered
        );
        assert_eq!(
            client.deliver_publication(&subscription, publication(2), 16),
            Delivery::Overflow
        );
    }
}

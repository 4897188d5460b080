//! In-memory engine.
//!
//! Implements all three capability traits in process. Sharing one
//! `MemoryEngine` between several nodes turns it into an in-process
//! cluster: every attached sink receives every envelope, origin included,
//! in per-origin publish order.

use crate::traits::{
    Broker, BrokerError, BrokerSink, HistoryStore, PresenceStore, RecoveredHistory, StoreError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{ChannelHistory, ChannelPresence, HistoryRetention, PresenceEntry};
use relay_proto::{ClientInfo, Envelope, NodeId, Publication};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default presence liveness window.
const DEFAULT_LIVENESS: Duration = Duration::from_secs(60);

/// In-memory broker, history, and presence engine.
pub struct MemoryEngine {
    /// Attached node sinks, in attach order.
    sinks: RwLock<Vec<(NodeId, Arc<dyn BrokerSink>)>>,
    /// History logs indexed by channel.
    history: DashMap<String, ChannelHistory>,
    /// Presence sets indexed by channel.
    presence: DashMap<String, ChannelPresence>,
    /// Presence liveness window.
    liveness: Duration,
    closed: AtomicBool,
}

impl MemoryEngine {
    /// Create an engine with the given presence liveness window.
    #[must_use]
    pub fn new(liveness: Duration) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            history: DashMap::new(),
            presence: DashMap::new(),
            liveness,
            closed: AtomicBool::new(false),
        }
    }

    /// The configured presence liveness window.
    #[must_use]
    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    fn check_open_broker(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_open_store(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<(), BrokerError> {
        self.check_open_broker()?;
        let sinks = self.sinks.read().await;
        trace!(channel = %envelope.channel(), nodes = sinks.len(), "Dispatching envelope");
        for (_, sink) in sinks.iter() {
            sink.handle(envelope.clone());
        }
        Ok(())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS)
    }
}

#[async_trait]
impl Broker for MemoryEngine {
    async fn attach(&self, node: NodeId, sink: Arc<dyn BrokerSink>) -> Result<(), BrokerError> {
        self.check_open_broker()?;
        let mut sinks = self.sinks.write().await;
        sinks.retain(|(id, _)| *id != node);
        sinks.push((node.clone(), sink));
        debug!(node = %node, nodes = sinks.len(), "Node attached to broker");
        Ok(())
    }

    async fn detach(&self, node: &NodeId) -> Result<(), BrokerError> {
        let mut sinks = self.sinks.write().await;
        sinks.retain(|(id, _)| id != node);
        debug!(node = %node, nodes = sinks.len(), "Node detached from broker");
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        self.dispatch(Envelope::Publication(publication)).await
    }

    async fn publish_join(&self, channel: &str, info: ClientInfo) -> Result<(), BrokerError> {
        self.dispatch(Envelope::Join {
            channel: channel.to_string(),
            info,
        })
        .await
    }

    async fn publish_leave(&self, channel: &str, info: ClientInfo) -> Result<(), BrokerError> {
        self.dispatch(Envelope::Leave {
            channel: channel.to_string(),
            info,
        })
        .await
    }

    async fn publish_unsubscribe(&self, channel: &str, user: &str) -> Result<(), BrokerError> {
        self.dispatch(Envelope::Unsubscribe {
            channel: channel.to_string(),
            user: user.to_string(),
        })
        .await
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.sinks.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryEngine {
    async fn append(
        &self,
        publication: Publication,
        retention: HistoryRetention,
    ) -> Result<Publication, StoreError> {
        self.check_open_store()?;
        let now = Instant::now();
        // The exclusive map entry is the per-channel serialization point.
        let mut entry = self.history.entry(publication.channel.clone()).or_default();
        Ok(entry.append(publication, &retention, now))
    }

    async fn recover(
        &self,
        channel: &str,
        since: u64,
        retention: HistoryRetention,
    ) -> Result<RecoveredHistory, StoreError> {
        self.check_open_store()?;
        let now = Instant::now();
        match self.history.get_mut(channel) {
            Some(mut entry) => {
                let (publications, recovered) = entry.recover(since, &retention, now);
                Ok(RecoveredHistory {
                    publications,
                    recovered,
                })
            }
            // Nothing was ever published: a zero cursor is caught up,
            // anything else is a gap.
            None => Ok(RecoveredHistory {
                publications: Vec::new(),
                recovered: since == 0,
            }),
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryEngine {
    async fn add_or_refresh(&self, channel: &str, info: ClientInfo) -> Result<(), StoreError> {
        self.check_open_store()?;
        let now = Instant::now();
        self.presence
            .entry(channel.to_string())
            .or_default()
            .add_or_refresh(info, now);
        Ok(())
    }

    async fn remove(&self, channel: &str, client: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.presence.get_mut(channel) {
            entry.remove(client);
            if entry.is_empty() {
                drop(entry);
                self.presence.remove(channel);
            }
        }
        Ok(())
    }

    async fn snapshot(&self, channel: &str) -> Result<Vec<PresenceEntry>, StoreError> {
        self.check_open_store()?;
        let now = Instant::now();
        Ok(self
            .presence
            .get(channel)
            .map(|entry| entry.snapshot(self.liveness, now))
            .unwrap_or_default())
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        self.check_open_store()?;
        let now = Instant::now();
        let mut evicted = 0;
        let mut emptied = Vec::new();

        for mut entry in self.presence.iter_mut() {
            evicted += entry.prune_stale(self.liveness, now).len();
            if entry.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for channel in emptied {
            self.presence.remove_if(&channel, |_, p| p.is_empty());
        }

        if evicted > 0 {
            debug!(evicted, "Presence sweep evicted stale members");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        envelopes: Mutex<Vec<Envelope>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                envelopes: Mutex::new(Vec::new()),
            })
        }

        fn seqs(&self) -> Vec<u64> {
            self.envelopes
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    Envelope::Publication(p) => Some(p.seq),
                    _ => None,
                })
                .collect()
        }
    }

    impl BrokerSink for RecordingSink {
        fn handle(&self, envelope: Envelope) {
            self.envelopes.lock().unwrap().push(envelope);
        }
    }

    fn retention() -> HistoryRetention {
        HistoryRetention {
            max_entries: 100,
            lifetime: Duration::from_secs(60),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_gapless() {
        let engine = Arc::new(MemoryEngine::default());
        let mut handles = Vec::new();

        for _ in 0..50 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let p = Publication::new("busy", b"x".to_vec(), NodeId::new("n1"));
                engine.append(p, retention()).await.unwrap().seq
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_channels_sequence_independently() {
        let engine = MemoryEngine::default();

        for channel in ["a", "b"] {
            let p = Publication::new(channel, b"x".to_vec(), NodeId::new("n1"));
            let sequenced = engine.append(p, retention()).await.unwrap();
            assert_eq!(sequenced.seq, 1);
        }
    }

    #[tokio::test]
    async fn test_broker_fans_out_to_all_nodes_in_order() {
        let engine = MemoryEngine::default();
        let local = RecordingSink::new();
        let remote = RecordingSink::new();

        engine.attach(NodeId::new("n1"), local.clone()).await.unwrap();
        engine.attach(NodeId::new("n2"), remote.clone()).await.unwrap();

        for _ in 0..3 {
            let p = Publication::new("chat:lobby", b"x".to_vec(), NodeId::new("n1"));
            let sequenced = engine.append(p, retention()).await.unwrap();
            engine.publish(sequenced).await.unwrap();
        }

        // Both nodes, origin included, observe publish order
        assert_eq!(local.seqs(), vec![1, 2, 3]);
        assert_eq!(remote.seqs(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let engine = MemoryEngine::default();
        let sink = RecordingSink::new();
        let node = NodeId::new("n1");

        engine.attach(node.clone(), sink.clone()).await.unwrap();
        engine
            .publish(Publication::new("c", b"1".to_vec(), node.clone()))
            .await
            .unwrap();

        engine.detach(&node).await.unwrap();
        engine
            .publish(Publication::new("c", b"2".to_vec(), node.clone()))
            .await
            .unwrap();

        assert_eq!(sink.envelopes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_publish() {
        let engine = MemoryEngine::default();
        Broker::close(&engine).await.unwrap();

        let result = engine
            .publish(Publication::new("c", b"x".to_vec(), NodeId::new("n1")))
            .await;
        assert!(matches!(result, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_recover_on_untouched_channel() {
        let engine = MemoryEngine::default();

        let fresh = engine.recover("nowhere", 0, retention()).await.unwrap();
        assert!(fresh.recovered);
        assert!(fresh.publications.is_empty());

        let stale = engine.recover("nowhere", 5, retention()).await.unwrap();
        assert!(!stale.recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_sweep_evicts_stale_members() {
        let engine = MemoryEngine::new(Duration::from_secs(30));

        engine
            .add_or_refresh("chat:lobby", ClientInfo::new("42", "conn-1"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        // Stale entries are invisible before the sweep and gone after it
        assert!(engine.snapshot("chat:lobby").await.unwrap().is_empty());
        assert_eq!(engine.sweep().await.unwrap(), 1);
        assert_eq!(engine.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_presence_remove_is_idempotent() {
        let engine = MemoryEngine::default();

        engine
            .add_or_refresh("c", ClientInfo::new("42", "conn-1"))
            .await
            .unwrap();
        engine.remove("c", "conn-1").await.unwrap();
        engine.remove("c", "conn-1").await.unwrap();

        assert!(engine.snapshot("c").await.unwrap().is_empty());
    }
}

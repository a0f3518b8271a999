//! Topic fan-out: one broadcast sender per topic (e.g. "chat:42").

use crate::envelope::Envelope;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const DEFAULT_CAPACITY: usize = 64;

/// Shared across the gateway; each streaming subscription holds a receiver.
pub struct Broadcaster {
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the per-topic backlog before slow receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Receiver for `topic`, creating the topic on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        let mut g = self.topics.write().await;
        g.entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send to every receiver of `topic`. Returns how many received it; a topic whose
    /// receivers are all gone is dropped.
    pub async fn broadcast(&self, topic: &str, envelope: Envelope) -> usize {
        let sent = {
            let g = self.topics.read().await;
            match g.get(topic) {
                Some(tx) => tx.send(envelope).unwrap_or(0),
                None => return 0,
            }
        };
        if sent == 0 {
            self.release(topic).await;
        }
        sent
    }

    /// Drop `topic` once nobody receives it. Returns true when it was removed.
    pub async fn release(&self, topic: &str) -> bool {
        let mut g = self.topics.write().await;
        if g.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            g.remove(topic);
            log::debug!("broadcaster: dropped idle topic {}", topic);
            return true;
        }
        false
    }

    /// Live receivers of `topic` (0 when the topic does not exist).
    pub async fn receiver_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}

pub mod events;

pub use events::{ElectionUpdate, ElectionUpdateEvent};

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Topic-based publish/subscribe transport.
///
/// Delivery is best-effort: a subscriber only sees messages published after it
/// subscribed, in publish order.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns how many subscribers the message was handed to.
    async fn publish(&self, topic: &str, message: String) -> Result<usize, PublishError>;

    fn subscribe(&self, topic: &str) -> BoxStream<'static, String>;
}

/// In-process transport backed by one broadcast channel per topic.
pub struct LocalPubSub {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, topic: &str, message: String) -> Result<usize, PublishError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = topics.get(topic) else {
            return Ok(0);
        };
        match sender.send(message) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                // Everyone hung up.
                topics.remove(topic);
                Ok(0)
            }
        }
    }

    fn subscribe(&self, topic: &str) -> BoxStream<'static, String> {
        let receiver = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop channels whose subscribers all went away.
            topics.retain(|_, sender| sender.receiver_count() > 0);
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let topic = topic.to_string();
        stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, receiver)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} fell behind, skipped {} message(s)", topic, skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

/// Entry point to the per-election update channels.
pub struct UpdateHub {
    transport: Arc<dyn PubSub>,
}

impl UpdateHub {
    pub fn new(transport: Arc<dyn PubSub>) -> Self {
        Self { transport }
    }

    pub fn for_election(&self, election_id: &str) -> ElectionUpdateStream {
        ElectionUpdateStream {
            election_id: election_id.to_string(),
            topic: format!("election:{}", election_id),
            transport: Arc::clone(&self.transport),
        }
    }
}

pub struct ElectionUpdateStream {
    election_id: String,
    topic: String,
    transport: Arc<dyn PubSub>,
}

impl ElectionUpdateStream {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, event: &ElectionUpdateEvent) -> Result<usize, PublishError> {
        let message = serde_json::to_string(event)?;
        let delivered = self.transport.publish(&self.topic, message).await?;
        debug!(
            "Published {} for election {} to {} subscriber(s)",
            event.id, self.election_id, delivered
        );
        Ok(delivered)
    }

    /// Events published from now on. The stream ends when the transport closes
    /// the topic; dropping it unsubscribes.
    pub fn subscribe(&self) -> BoxStream<'static, ElectionUpdateEvent> {
        let topic = self.topic.clone();
        self.transport
            .subscribe(&self.topic)
            .filter_map(move |message| {
                let decoded = match serde_json::from_str::<ElectionUpdateEvent>(&message) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!("Dropping undecodable message on {}: {}", topic, e);
                        None
                    }
                };
                future::ready(decoded)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ElectionStatus;
    use std::time::Duration;
    use tokio::time::timeout;

    fn hub() -> UpdateHub {
        UpdateHub::new(Arc::new(LocalPubSub::new(16)))
    }

    async fn next(stream: &mut BoxStream<'static, ElectionUpdateEvent>) -> ElectionUpdateEvent {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let hub = hub();
        let channel = hub.for_election("e1");
        let mut first = channel.subscribe();
        let mut second = hub.for_election("e1").subscribe();

        let voting = ElectionUpdateEvent::status_changed(ElectionStatus::Voting);
        let added = ElectionUpdateEvent::candidate_added("b", "Bistro", "kim");
        assert_eq!(channel.publish(&added).await.unwrap(), 2);
        assert_eq!(channel.publish(&voting).await.unwrap(), 2);

        for stream in [&mut first, &mut second] {
            assert_eq!(next(stream).await, added);
            assert_eq!(next(stream).await, voting);
        }
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let hub = hub();
        let channel = hub.for_election("e1");
        let mut early = channel.subscribe();

        let first = ElectionUpdateEvent::status_changed(ElectionStatus::Voting);
        channel.publish(&first).await.unwrap();

        let mut late = channel.subscribe();
        let second = ElectionUpdateEvent::status_changed(ElectionStatus::Complete);
        channel.publish(&second).await.unwrap();

        assert_eq!(next(&mut early).await, first);
        assert_eq!(next(&mut early).await, second);
        assert_eq!(next(&mut late).await, second);
    }

    #[tokio::test]
    async fn topics_are_isolated_per_election() {
        let hub = hub();
        let mut other = hub.for_election("e2").subscribe();
        assert_eq!(hub.for_election("e2").topic(), "election:e2");

        let event = ElectionUpdateEvent::status_changed(ElectionStatus::Voting);
        assert_eq!(hub.for_election("e1").publish(&event).await.unwrap(), 0);

        assert!(timeout(Duration::from_millis(50), other.next()).await.is_err());
    }

    #[tokio::test]
    async fn publishing_after_unsubscribe_is_harmless() {
        let transport = LocalPubSub::new(4);
        drop(transport.subscribe("t"));
        assert_eq!(transport.publish("t", "x".to_string()).await.unwrap(), 0);
        assert_eq!(transport.publish("t", "y".to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn abandoned_topics_are_pruned_on_subscribe() {
        let transport = LocalPubSub::new(4);
        drop(transport.subscribe("gone"));
        let _kept = transport.subscribe("kept");

        let topics = transport.topics.lock().unwrap();
        assert!(!topics.contains_key("gone"));
        assert!(topics.contains_key("kept"));
    }
}

//! In-memory fleet message queue

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, instrument, warn};

use crate::error::StreamError;
use crate::traits::EventStream;
use crate::types::Delivery;

/// Default time `receive` waits for a message
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);
/// Default number of deliveries before a message is dead-lettered
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

#[derive(Default)]
struct TopicQueue {
    pending: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    dead_letters: Vec<Delivery>,
}

/// Per-topic FIFO queue with peek-lock semantics
///
/// `receive` locks a message until it is completed or abandoned. Abandoned
/// messages go back to the front of their queue; after `max_delivery_count`
/// deliveries they are moved to the dead-letter list instead.
pub struct InMemoryStream {
    topics: Mutex<HashMap<String, TopicQueue>>,
    notify: Notify,
    receive_wait: Duration,
    max_delivery_count: u32,
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStream {
    /// Create a stream with default receive wait and delivery limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            receive_wait: DEFAULT_RECEIVE_WAIT,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
        }
    }

    /// Set how long `receive` waits before returning `None`
    #[must_use]
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Set the delivery limit before dead-lettering
    #[must_use]
    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count.max(1);
        self
    }

    /// Enqueue a message body on a topic, returning its id
    pub async fn publish(&self, topic: &str, body: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let delivery = Delivery {
            id: id.clone(),
            topic: topic.to_string(),
            body: body.into(),
            delivery_count: 0,
            enqueued_at: Utc::now(),
        };

        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .pending
            .push_back(delivery);
        self.notify.notify_waiters();

        debug!(topic = %topic, id = %id, "message published");
        id
    }

    /// Messages waiting to be received
    pub async fn pending_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |q| q.pending.len())
    }

    /// Messages received but neither completed nor abandoned
    pub async fn in_flight_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |q| q.in_flight.len())
    }

    /// Messages that exceeded the delivery limit
    pub async fn dead_letters(&self, topic: &str) -> Vec<Delivery> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    async fn take(&self, topic: &str) -> Option<Delivery> {
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic.to_string()).or_default();
        let mut delivery = queue.pending.pop_front()?;
        delivery.delivery_count += 1;
        queue.in_flight.insert(delivery.id.clone(), delivery.clone());
        Some(delivery)
    }
}

fn unknown_delivery(delivery: &Delivery) -> StreamError {
    StreamError::UnknownDelivery {
        topic: delivery.topic.clone(),
        id: delivery.id.clone(),
    }
}

#[async_trait]
impl EventStream for InMemoryStream {
    async fn receive(&self, topic: &str) -> Result<Option<Delivery>, StreamError> {
        let deadline = Instant::now() + self.receive_wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.take(topic).await {
                return Ok(Some(delivery));
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    #[instrument(skip(self, delivery), fields(topic = %delivery.topic, id = %delivery.id), level = "debug")]
    async fn complete(&self, delivery: &Delivery) -> Result<(), StreamError> {
        let mut topics = self.topics.lock().await;
        topics
            .get_mut(&delivery.topic)
            .and_then(|q| q.in_flight.remove(&delivery.id))
            .map(|_| ())
            .ok_or_else(|| unknown_delivery(delivery))
    }

    #[instrument(skip(self, delivery), fields(topic = %delivery.topic, id = %delivery.id), level = "debug")]
    async fn abandon(&self, delivery: &Delivery) -> Result<(), StreamError> {
        {
            let mut topics = self.topics.lock().await;
            let queue = topics
                .get_mut(&delivery.topic)
                .ok_or_else(|| unknown_delivery(delivery))?;
            let released = queue
                .in_flight
                .remove(&delivery.id)
                .ok_or_else(|| unknown_delivery(delivery))?;

            if released.delivery_count >= self.max_delivery_count {
                warn!(
                    topic = %released.topic,
                    id = %released.id,
                    deliveries = released.delivery_count,
                    "delivery limit reached, message dead-lettered"
                );
                queue.dead_letters.push(released);
                return Ok(());
            }

            queue.pending.push_front(released);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

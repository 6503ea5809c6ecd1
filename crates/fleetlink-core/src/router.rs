//! Event routing from the fleet stream to the policy engine
//!
//! One loop per topic receives deliveries, hands the body to the topic's
//! handler and acknowledges the delivery on success. Failed deliveries are
//! abandoned so the stream can redeliver them, and every fault is logged and
//! broadcast to subscribers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use fleetlink_api::{ErrorCountMessage, FleetEvent, KpiMessage};
use fleetlink_transport::{Delivery, EventStream, StreamError};

use crate::config::RouterConfig;
use crate::error::CoreError;
use crate::policy::FleetPolicyEngine;

const FAULT_CHANNEL_CAPACITY: usize = 256;
/// Pause after a failed receive before trying again
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// Handler for the messages of one topic
#[async_trait]
pub trait FleetHandler: Send + Sync {
    async fn handle(&self, topic: &str, body: &str) -> Result<(), CoreError>;
}

/// Parse a JSON message body
///
/// # Errors
/// Returns [`CoreError::MalformedEvent`] if the body does not match `T`
pub fn parse_body<T: DeserializeOwned>(topic: &str, body: &str) -> Result<T, CoreError> {
    serde_json::from_str(body).map_err(|e| CoreError::MalformedEvent {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

/// Feeds KPI messages to the policy engine
pub struct KpiHandler {
    policy: Arc<FleetPolicyEngine>,
}

impl KpiHandler {
    pub fn new(policy: Arc<FleetPolicyEngine>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl FleetHandler for KpiHandler {
    async fn handle(&self, topic: &str, body: &str) -> Result<(), CoreError> {
        let message: KpiMessage = parse_body(topic, body)?;
        self.policy.on_event(&FleetEvent::from(message)).await?;
        Ok(())
    }
}

/// Feeds error-count messages to the policy engine
pub struct ErrorCountHandler {
    policy: Arc<FleetPolicyEngine>,
}

impl ErrorCountHandler {
    pub fn new(policy: Arc<FleetPolicyEngine>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl FleetHandler for ErrorCountHandler {
    async fn handle(&self, topic: &str, body: &str) -> Result<(), CoreError> {
        let message: ErrorCountMessage = parse_body(topic, body)?;
        self.policy.on_event(&FleetEvent::from(message)).await?;
        Ok(())
    }
}

/// Stage of delivery processing a fault occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSource {
    Receive,
    Handler,
    Complete,
    Abandon,
}

impl fmt::Display for FaultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultSource::Receive => write!(f, "receive"),
            FaultSource::Handler => write!(f, "handler"),
            FaultSource::Complete => write!(f, "complete"),
            FaultSource::Abandon => write!(f, "abandon"),
        }
    }
}

/// Fault reported on the router's error channel
#[derive(Debug, Clone)]
pub struct RouterFault {
    pub topic: String,
    /// `None` when no delivery was received
    pub delivery_id: Option<String>,
    pub source: FaultSource,
    pub error: CoreError,
}

/// Outcome of processing at most one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Nothing arrived in time
    Idle,
    /// Handled and removed from the stream
    Completed(String),
    /// Released back to the stream
    Abandoned(String),
    /// Delivery layer failed; see the error channel
    Faulted,
}

/// Topic router over an [`EventStream`]
pub struct EventRouter {
    stream: Arc<dyn EventStream>,
    routes: BTreeMap<String, Arc<dyn FleetHandler>>,
    fault_tx: broadcast::Sender<RouterFault>,
}

impl EventRouter {
    /// Router without routes
    pub fn new(stream: Arc<dyn EventStream>) -> Self {
        let (fault_tx, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self {
            stream,
            routes: BTreeMap::new(),
            fault_tx,
        }
    }

    /// Router sending the configured KPI and error topics to the policy engine
    pub fn with_policy(
        stream: Arc<dyn EventStream>,
        policy: Arc<FleetPolicyEngine>,
        config: &RouterConfig,
    ) -> Self {
        Self::new(stream)
            .route(
                config.kpi_topic.clone(),
                Arc::new(KpiHandler::new(policy.clone())),
            )
            .route(
                config.error_topic.clone(),
                Arc::new(ErrorCountHandler::new(policy)),
            )
    }

    /// Add or replace the handler for a topic
    #[must_use]
    pub fn route(mut self, topic: impl Into<String>, handler: Arc<dyn FleetHandler>) -> Self {
        self.routes.insert(topic.into(), handler);
        self
    }

    /// Routed topics, in lexicographic order
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Receive faults reported from now on
    #[must_use]
    pub fn subscribe_faults(&self) -> broadcast::Receiver<RouterFault> {
        self.fault_tx.subscribe()
    }

    /// Receive and process at most one delivery from `topic`
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownTopic`] if no handler is registered; other
    /// failures go to the error channel
    pub async fn process_next(&self, topic: &str) -> Result<Processed, CoreError> {
        let handler = self.handler(topic)?;
        let received = self.stream.receive(topic).await;
        Ok(self.process(topic, handler, received).await)
    }

    /// Run one loop per routed topic until `shutdown` turns true
    ///
    /// A delivery that is already being handled when the signal arrives is
    /// finished first.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();
        for topic in self.routes.keys() {
            let router = self.clone();
            let topic = topic.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { router.topic_loop(topic, shutdown).await });
        }

        info!(topics = ?self.topics(), "event router started");
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "router loop panicked");
            }
        }
        info!("event router stopped");
    }

    async fn topic_loop(&self, topic: String, mut shutdown: watch::Receiver<bool>) {
        let Ok(handler) = self.handler(&topic) else {
            return;
        };

        while !*shutdown.borrow() {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.stream.receive(&topic) => received,
            };

            if self.process(&topic, handler.clone(), received).await == Processed::Faulted {
                tokio::time::sleep(RECEIVE_BACKOFF).await;
            }
        }
        debug!(topic = %topic, "topic loop stopped");
    }

    fn handler(&self, topic: &str) -> Result<Arc<dyn FleetHandler>, CoreError> {
        self.routes
            .get(topic)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTopic(topic.to_string()))
    }

    async fn process(
        &self,
        topic: &str,
        handler: Arc<dyn FleetHandler>,
        received: Result<Option<Delivery>, StreamError>,
    ) -> Processed {
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Processed::Idle,
            Err(e) => {
                self.report(topic, None, FaultSource::Receive, e.into());
                return Processed::Faulted;
            }
        };

        debug!(
            topic = %topic,
            id = %delivery.id,
            attempt = delivery.delivery_count,
            "delivery received"
        );

        match handler.handle(topic, &delivery.body).await {
            Ok(()) => match self.stream.complete(&delivery).await {
                Ok(()) => Processed::Completed(delivery.id),
                Err(e) => {
                    self.report(topic, Some(&delivery), FaultSource::Complete, e.into());
                    Processed::Faulted
                }
            },
            Err(e) => {
                self.report(topic, Some(&delivery), FaultSource::Handler, e);
                match self.stream.abandon(&delivery).await {
                    Ok(()) => Processed::Abandoned(delivery.id),
                    Err(e) => {
                        self.report(topic, Some(&delivery), FaultSource::Abandon, e.into());
                        Processed::Faulted
                    }
                }
            }
        }
    }

    fn report(&self, topic: &str, delivery: Option<&Delivery>, source: FaultSource, error: CoreError) {
        error!(
            topic = %topic,
            id = delivery.map_or("-", |d| d.id.as_str()),
            source = %source,
            error = %error,
            "event delivery fault"
        );
        // No subscribers is fine
        let _ = self.fault_tx.send(RouterFault {
            topic: topic.to_string(),
            delivery_id: delivery.map(|d| d.id.clone()),
            source,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use fleetlink_api::ReportedProperties;
    use fleetlink_transport::{InMemoryRegistry, InMemoryStream, ShadowRegistry};

    use super::*;
    use crate::config::PolicyConfig;

    async fn setup() -> (Arc<InMemoryStream>, Arc<InMemoryRegistry>, EventRouter) {
        let stream = Arc::new(InMemoryStream::new().with_receive_wait(Duration::from_millis(20)));
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register_device("device-1").await;
        registry
            .update_reported("device-1", &ReportedProperties::rate(45))
            .await
            .unwrap();
        let policy = Arc::new(FleetPolicyEngine::new(
            registry.clone(),
            PolicyConfig::default(),
        ));
        let router = EventRouter::with_policy(stream.clone(), policy, &RouterConfig::default());
        (stream, registry, router)
    }

    #[tokio::test]
    async fn test_default_topics() {
        let (_, _, router) = setup().await;
        assert_eq!(router.topics(), vec!["device-errors", "kpi"]);
    }

    #[tokio::test]
    async fn test_handled_message_is_completed() {
        let (stream, registry, router) = setup().await;
        let id = stream
            .publish("kpi", r#"{"ConnectionDeviceId":"device-1","KPI":80.0}"#)
            .await;

        let processed = router.process_next("kpi").await.unwrap();
        assert_eq!(processed, Processed::Completed(id));
        assert_eq!(stream.pending_count("kpi").await, 0);
        assert_eq!(stream.in_flight_count("kpi").await, 0);

        let twin = registry.get_twin("device-1").await.unwrap().unwrap();
        assert_eq!(twin.desired.production_rate, Some(35));
    }

    #[tokio::test]
    async fn test_malformed_body_is_abandoned_and_reported() {
        let (stream, _, router) = setup().await;
        let mut faults = router.subscribe_faults();
        let id = stream.publish("device-errors", "not json").await;

        let processed = router.process_next("device-errors").await.unwrap();
        assert_eq!(processed, Processed::Abandoned(id.clone()));
        assert_eq!(stream.pending_count("device-errors").await, 1);

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.delivery_id, Some(id));
        assert_eq!(fault.source, FaultSource::Handler);
        assert!(matches!(fault.error, CoreError::MalformedEvent { ref topic, .. } if topic == "device-errors"));
    }

    #[tokio::test]
    async fn test_idle_and_unknown_topic() {
        let (_, _, router) = setup().await;
        assert_eq!(router.process_next("kpi").await.unwrap(), Processed::Idle);
        assert!(matches!(
            router.process_next("telemetry").await,
            Err(CoreError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_run_drains_and_stops() {
        let (stream, registry, router) = setup().await;
        stream
            .publish("device-errors", r#"{"ConnectionDeviceId":"device-1","sumErrors":4}"#)
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(Arc::new(router).run(shutdown_rx));

        for _ in 0..50 {
            if stream.pending_count("device-errors").await == 0
                && stream.in_flight_count("device-errors").await == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();

        let twin = registry.get_twin("device-1").await.unwrap().unwrap();
        assert_eq!(twin.desired.emergency_trigger, Some(1));
    }
}

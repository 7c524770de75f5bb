//! Seams to the outside world.
//!
//! The broker channel, the events exchange, and the broker-plugin RPC are
//! all injected as trait objects so the pipeline can run against any AMQP
//! client (or a recording double in tests).

use async_trait::async_trait;
use dataplant_error::DupResult;
use uuid::Uuid;

/// Where an in-flight message came from.
///
/// `Injected` entries are plant-internal bookkeeping and never touch the
/// broker; `Requeued` marks a delivery already handed back after a crash,
/// waiting for its redelivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryTag {
    Broker(u64),
    Injected(Uuid),
    Requeued(u64),
}

/// Acknowledgement surface of one consumer channel.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, delivery_tag: u64) -> DupResult<()>;
    /// Reject without requeue.
    async fn discard(&self, delivery_tag: u64) -> DupResult<()>;
    /// Reject with requeue.
    async fn requeue(&self, delivery_tag: u64) -> DupResult<()>;
}

/// Publisher on the outbound events exchange.
#[async_trait]
pub trait EventsPublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        headers: &[(String, String)],
    ) -> DupResult<()>;
}

/// RPC surface of the broker plugin that owns device MQTT sessions.
#[async_trait]
pub trait ClientSessionBridge: Send + Sync + 'static {
    /// Publish a payload to a device topic at the given QoS.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> DupResult<()>;
    /// Disconnect a client, optionally discarding its session state.
    async fn disconnect(&self, client_id: &str, discard_session: bool) -> DupResult<()>;
}

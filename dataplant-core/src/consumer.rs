//! Broker-side consumer worker.
//!
//! One worker per queue/channel. The AMQP adapter feeds decoded deliveries
//! into the worker's channel; the worker validates headers, resolves the
//! device, and hands the message to the per-device pipeline. Messages with
//! missing or malformed required headers are rejected without requeue.

use crate::bridge::{Acknowledger, DeliveryTag};
use crate::registry::DeviceRegistry;
use crate::updater::UpdaterMessage;
use bytes::Bytes;
use dataplant_error::storage::StorageError;
use dataplant_error::{DupError, DupResult};
use dataplant_models::{DeviceId, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One decoded broker delivery.
#[derive(Debug)]
pub struct Delivery {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
    pub message_id: Bytes,
    pub delivery_tag: u64,
    /// Broker timestamp in milliseconds, when present.
    pub timestamp_ms: Option<i64>,
}

enum RouteError {
    /// Malformed delivery: reject without requeue.
    Reject(&'static str),
    Fatal(DupError),
}

pub struct AmqpDataConsumer {
    queue: String,
    deliveries: mpsc::Receiver<Delivery>,
    acknowledger: Arc<dyn Acknowledger>,
    registry: Arc<DeviceRegistry>,
    shutdown: CancellationToken,
}

impl AmqpDataConsumer {
    pub fn new(
        queue: String,
        deliveries: mpsc::Receiver<Delivery>,
        acknowledger: Arc<dyn Acknowledger>,
        registry: Arc<DeviceRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        AmqpDataConsumer {
            queue,
            deliveries,
            acknowledger,
            registry,
            shutdown,
        }
    }

    /// Consume until shutdown. Returns an error when the pipeline below is
    /// gone (tracker or delivery channel failure) so the supervisor can
    /// restart the worker on a fresh channel.
    pub async fn run(mut self) -> DupResult<()> {
        info!(queue = %self.queue, "data consumer started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(queue = %self.queue, "data consumer stopped");
                    return Ok(());
                }
                maybe = self.deliveries.recv() => match maybe {
                    Some(delivery) => self.handle_delivery(delivery).await?,
                    None => {
                        return Err(DupError::BrokerError(format!(
                            "delivery stream for {} closed",
                            self.queue
                        )));
                    }
                },
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) -> DupResult<()> {
        let delivery_tag = delivery.delivery_tag;
        match self.route(delivery).await {
            Ok(()) => Ok(()),
            Err(RouteError::Reject(reason)) => {
                warn!(queue = %self.queue, delivery_tag, reason, "rejecting delivery");
                self.acknowledger.discard(delivery_tag).await
            }
            Err(RouteError::Fatal(e)) => Err(e),
        }
    }

    async fn route(&self, delivery: Delivery) -> Result<(), RouteError> {
        let headers = &delivery.headers;
        let header = |name: &'static str| {
            headers
                .get(name)
                .cloned()
                .ok_or(RouteError::Reject(name))
        };

        let realm = header("x_astarte_realm")?;
        let device: DeviceId = header("x_astarte_device_id")?
            .parse()
            .map_err(|_| RouteError::Reject("x_astarte_device_id"))?;
        let msg_type = header("x_astarte_msg_type")?;

        let timestamp = match delivery.timestamp_ms {
            Some(ms) => Timestamp::from_millis(ms),
            None => Timestamp::now(),
        };
        let message_id = delivery.message_id.clone();

        let msg = match msg_type.as_str() {
            "connection" => UpdaterMessage::Connection {
                ip: header("x_astarte_remote_ip")?,
                message_id: message_id.clone(),
                timestamp,
            },
            "disconnection" => UpdaterMessage::Disconnection {
                message_id: message_id.clone(),
                timestamp,
            },
            "introspection" => UpdaterMessage::Introspection {
                payload: delivery.payload,
                message_id: message_id.clone(),
                timestamp,
            },
            "data" => UpdaterMessage::Data {
                interface: header("x_astarte_interface")?,
                path: header("x_astarte_path")?,
                payload: delivery.payload,
                message_id: message_id.clone(),
                timestamp,
            },
            "control" => UpdaterMessage::Control {
                path: header("x_astarte_control_path")?,
                payload: delivery.payload,
                message_id: message_id.clone(),
                timestamp,
            },
            _ => return Err(RouteError::Reject("x_astarte_msg_type")),
        };

        match self
            .registry
            .deliver(
                &realm,
                device,
                &self.acknowledger,
                message_id,
                DeliveryTag::Broker(delivery.delivery_tag),
                msg,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DupError::StorageError(StorageError::DeviceNotFound { .. })) => {
                Err(RouteError::Reject("unknown device"))
            }
            Err(e) => Err(RouteError::Fatal(e)),
        }
    }
}

/// Build a delivery from raw adapter parts; used by broker adapters and
/// tests.
pub fn delivery(
    headers: &[(&str, &str)],
    payload: impl Into<Bytes>,
    message_id: impl Into<Bytes>,
    delivery_tag: u64,
    timestamp_ms: Option<i64>,
) -> Delivery {
    Delivery {
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        payload: payload.into(),
        message_id: message_id.into(),
        delivery_tag,
        timestamp_ms,
    }
}

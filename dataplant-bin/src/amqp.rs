//! Lapin-backed implementations of the broker seams.

use async_trait::async_trait;
use bytes::Bytes;
use dataplant_core::bridge::{Acknowledger, ClientSessionBridge, EventsPublisher};
use dataplant_core::consumer::Delivery;
use dataplant_error::{DupError, DupResult};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ExchangeKind};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, warn};

fn broker_err(e: lapin::Error) -> DupError {
    DupError::BrokerError(e.to_string())
}

/// Ack surface of one consumer channel.
pub struct AmqpChannelAcknowledger {
    channel: Channel,
}

impl AmqpChannelAcknowledger {
    pub fn new(channel: Channel) -> Self {
        AmqpChannelAcknowledger { channel }
    }
}

#[async_trait]
impl Acknowledger for AmqpChannelAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> DupResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker_err)
    }

    async fn discard(&self, delivery_tag: u64) -> DupResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(broker_err)
    }

    async fn requeue(&self, delivery_tag: u64) -> DupResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await
            .map_err(broker_err)
    }
}

/// Publisher on the events exchange.
pub struct AmqpEventsPublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpEventsPublisher {
    pub async fn new(channel: Channel, exchange: String) -> DupResult<Self> {
        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(AmqpEventsPublisher { channel, exchange })
    }
}

fn header_table(headers: &[(String, String)]) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

#[async_trait]
impl EventsPublisher for AmqpEventsPublisher {
    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        headers: &[(String, String)],
    ) -> DupResult<()> {
        let properties = BasicProperties::default().with_headers(header_table(headers));
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(broker_err)?;
        Ok(())
    }
}

/// Broker-plugin RPC over AMQP: one command message per side effect, with
/// the command in headers and the device payload as the body.
pub struct AmqpSessionBridge {
    channel: Channel,
    routing_key: String,
}

impl AmqpSessionBridge {
    pub fn new(channel: Channel, routing_key: String) -> Self {
        AmqpSessionBridge {
            channel,
            routing_key,
        }
    }

    async fn send(&self, headers: &[(String, String)], body: Vec<u8>) -> DupResult<()> {
        let properties = BasicProperties::default().with_headers(header_table(headers));
        self.channel
            .basic_publish(
                "",
                &self.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(broker_err)?;
        Ok(())
    }
}

#[async_trait]
impl ClientSessionBridge for AmqpSessionBridge {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> DupResult<()> {
        self.send(
            &[
                ("x_dataplant_command".to_string(), "publish".to_string()),
                ("x_dataplant_topic".to_string(), topic.to_string()),
                ("x_dataplant_qos".to_string(), qos.to_string()),
            ],
            payload,
        )
        .await
    }

    async fn disconnect(&self, client_id: &str, discard_session: bool) -> DupResult<()> {
        self.send(
            &[
                ("x_dataplant_command".to_string(), "disconnect".to_string()),
                ("x_dataplant_client_id".to_string(), client_id.to_string()),
                (
                    "x_dataplant_discard_session".to_string(),
                    discard_session.to_string(),
                ),
            ],
            Vec::new(),
        )
        .await
    }
}

fn header_value_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// Open a dedicated channel on `queue` and pump decoded deliveries into a
/// bounded pipe. Deliveries without a message id are malformed and get
/// rejected right here, without requeue.
pub async fn consume_queue(
    conn: &Connection,
    queue: &str,
    prefetch_count: u16,
) -> DupResult<(Channel, mpsc::Receiver<Delivery>)> {
    let channel = conn.create_channel().await.map_err(broker_err)?;
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(broker_err)?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(broker_err)?;
    let mut consumer = channel
        .basic_consume(
            queue,
            "dataplant",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(broker_err)?;

    let (tx, rx) = mpsc::channel(64);
    let pump_channel = channel.clone();
    let queue_name = queue.to_string();
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(queue = %queue_name, error = %e, "consume stream failed");
                    break;
                }
            };

            let headers: HashMap<String, String> = delivery
                .properties
                .headers()
                .as_ref()
                .map(|table| {
                    table
                        .inner()
                        .iter()
                        .filter_map(|(k, v)| {
                            header_value_to_string(v).map(|v| (k.as_str().to_string(), v))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let Some(message_id) = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| Bytes::copy_from_slice(id.as_str().as_bytes()))
            else {
                warn!(queue = %queue_name, "delivery without message id, rejecting");
                if let Err(e) = pump_channel
                    .basic_reject(delivery.delivery_tag, BasicRejectOptions { requeue: false })
                    .await
                {
                    error!(queue = %queue_name, error = %e, "reject failed");
                    break;
                }
                continue;
            };

            let item = Delivery {
                headers,
                payload: Bytes::from(delivery.data),
                message_id,
                delivery_tag: delivery.delivery_tag,
                timestamp_ms: delivery.properties.timestamp().as_ref().map(|ts| *ts as i64),
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    Ok((channel, rx))
}

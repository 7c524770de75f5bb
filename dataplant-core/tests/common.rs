#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dataplant_core::bridge::{Acknowledger, ClientSessionBridge, EventsPublisher};
use dataplant_core::consumer::{AmqpDataConsumer, Delivery};
use dataplant_core::registry::DeviceRegistry;
use dataplant_core::triggers::TriggersHandler;
use dataplant_error::DupResult;
use dataplant_models::automaton::EndpointsAutomaton;
use dataplant_models::events::SimpleEvent;
use dataplant_models::ids;
use dataplant_models::interface::{
    Aggregation, InterfaceDescriptor, InterfaceType, Mapping, MappingValueType, Ownership,
    Reliability, Retention, StorageType,
};
use dataplant_models::triggers::{
    DataTriggerType, DeviceTriggerType, IntrospectionTriggerType, SimpleTrigger,
    SimpleTriggerRow, TriggerObjectType, ValueMatchOperator,
};
use dataplant_models::DeviceId;
use dataplant_storage::{DataStore, DeviceRow, MemoryStore};
use prost::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const REALM: &str = "acme";

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AckOp {
    Ack(u64),
    Discard(u64),
    Requeue(u64),
}

#[derive(Default)]
pub struct RecordingAcknowledger {
    ops: Mutex<Vec<AckOp>>,
}

impl RecordingAcknowledger {
    pub fn ops(&self) -> Vec<AckOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> DupResult<()> {
        self.ops.lock().unwrap().push(AckOp::Ack(delivery_tag));
        Ok(())
    }
    async fn discard(&self, delivery_tag: u64) -> DupResult<()> {
        self.ops.lock().unwrap().push(AckOp::Discard(delivery_tag));
        Ok(())
    }
    async fn requeue(&self, delivery_tag: u64) -> DupResult<()> {
        self.ops.lock().unwrap().push(AckOp::Requeue(delivery_tag));
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PublishedEvent {
    pub routing_key: String,
    pub event: SimpleEvent,
    pub headers: Vec<(String, String)>,
}

impl PublishedEvent {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<PublishedEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.header("x_astarte_event_type").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl EventsPublisher for RecordingPublisher {
    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        headers: &[(String, String)],
    ) -> DupResult<()> {
        let event = SimpleEvent::decode(payload.as_slice())
            .map_err(|e| dataplant_error::DupError::Msg(e.to_string()))?;
        self.events.lock().unwrap().push(PublishedEvent {
            routing_key: routing_key.to_string(),
            event,
            headers: headers.to_vec(),
        });
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BridgeOp {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
    },
    Disconnect {
        client_id: String,
        discard_session: bool,
    },
}

#[derive(Default)]
pub struct RecordingBridge {
    ops: Mutex<Vec<BridgeOp>>,
}

impl RecordingBridge {
    pub fn ops(&self) -> Vec<BridgeOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientSessionBridge for RecordingBridge {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> DupResult<()> {
        self.ops.lock().unwrap().push(BridgeOp::Publish {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
    async fn disconnect(&self, client_id: &str, discard_session: bool) -> DupResult<()> {
        self.ops.lock().unwrap().push(BridgeOp::Disconnect {
            client_id: client_id.to_string(),
            discard_session,
        });
        Ok(())
    }
}

/// A whole pipeline against recording doubles: consumer worker, registry,
/// and memory store.
pub struct TestPlant {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<DeviceRegistry>,
    pub acknowledger: Arc<RecordingAcknowledger>,
    pub publisher: Arc<RecordingPublisher>,
    pub bridge: Arc<RecordingBridge>,
    pub deliveries: mpsc::Sender<Delivery>,
    pub shutdown: CancellationToken,
}

impl TestPlant {
    pub fn start() -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let acknowledger = Arc::new(RecordingAcknowledger::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let bridge = Arc::new(RecordingBridge::default());
        let registry = Arc::new(DeviceRegistry::new(
            store.clone() as Arc<dyn DataStore>,
            TriggersHandler::new(publisher.clone()),
            bridge.clone(),
            16,
        ));

        let (tx, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let consumer = AmqpDataConsumer::new(
            "dataplant_data_0".to_string(),
            rx,
            acknowledger.clone() as Arc<dyn Acknowledger>,
            registry.clone(),
            shutdown.clone(),
        );
        tokio::spawn(consumer.run());

        TestPlant {
            store,
            registry,
            acknowledger,
            publisher,
            bridge,
            deliveries: tx,
            shutdown,
        }
    }

    pub async fn deliver(
        &self,
        headers: &[(&str, &str)],
        payload: impl Into<Bytes>,
        message_id: &str,
        delivery_tag: u64,
        timestamp_ms: i64,
    ) {
        self.deliveries
            .send(dataplant_core::consumer::delivery(
                headers,
                payload,
                message_id.as_bytes().to_vec(),
                delivery_tag,
                Some(timestamp_ms),
            ))
            .await
            .unwrap();
    }

    /// Poll until the acknowledger settled `count` deliveries.
    pub async fn settled(&self, count: usize) {
        for _ in 0..400 {
            if self.acknowledger.ops().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} settled deliveries, got {:?}",
            self.acknowledger.ops()
        );
    }
}

pub fn device() -> DeviceId {
    DeviceId::from_bytes([0x42; 16])
}

pub fn seed_device(store: &MemoryStore, device: DeviceId, interfaces: &[(&str, i32, i32)]) {
    let mut introspection = HashMap::new();
    let mut minors = HashMap::new();
    for (name, major, minor) in interfaces {
        introspection.insert(name.to_string(), *major);
        minors.insert(name.to_string(), *minor);
    }
    store.add_device(
        REALM,
        device,
        DeviceRow {
            introspection,
            introspection_minor: minors,
            ..Default::default()
        },
    );
}

pub struct InterfaceSpec {
    pub name: &'static str,
    pub major: i32,
    pub interface_type: InterfaceType,
    pub aggregation: Aggregation,
    pub ownership: Ownership,
    pub endpoints: Vec<EndpointSpec>,
}

pub struct EndpointSpec {
    pub endpoint: &'static str,
    pub value_type: MappingValueType,
    pub reliability: Reliability,
    pub retention: Retention,
    pub allow_unset: bool,
    pub explicit_timestamp: bool,
}

impl EndpointSpec {
    pub fn new(endpoint: &'static str, value_type: MappingValueType) -> Self {
        EndpointSpec {
            endpoint,
            value_type,
            reliability: Reliability::Unreliable,
            retention: Retention::Discard,
            allow_unset: false,
            explicit_timestamp: false,
        }
    }
}

pub fn build_interface(spec: InterfaceSpec) -> (InterfaceDescriptor, Vec<Mapping>) {
    let interface_id = ids::interface_id(spec.name, spec.major);
    let mappings: Vec<Mapping> = spec
        .endpoints
        .iter()
        .map(|e| Mapping {
            endpoint_id: ids::endpoint_id(spec.name, spec.major, e.endpoint),
            interface_id,
            endpoint: e.endpoint.to_string(),
            value_type: e.value_type,
            reliability: e.reliability,
            retention: e.retention,
            allow_unset: e.allow_unset,
            explicit_timestamp: e.explicit_timestamp,
        })
        .collect();
    let storage_type = match (spec.interface_type, spec.aggregation) {
        (InterfaceType::Properties, _) => StorageType::MultiInterfaceIndividualPropertiesDbTable,
        (InterfaceType::Datastream, Aggregation::Individual) => {
            StorageType::MultiInterfaceIndividualDatastreamDbTable
        }
        (InterfaceType::Datastream, Aggregation::Object) => {
            StorageType::OneObjectDatastreamDbTable
        }
    };
    let storage = match storage_type {
        StorageType::MultiInterfaceIndividualPropertiesDbTable => "individual_properties",
        StorageType::MultiInterfaceIndividualDatastreamDbTable => "individual_datastreams",
        StorageType::OneObjectDatastreamDbTable => "object_datastreams",
    };
    let descriptor = InterfaceDescriptor {
        interface_id,
        name: spec.name.to_string(),
        major_version: spec.major,
        minor_version: 0,
        interface_type: spec.interface_type,
        aggregation: spec.aggregation,
        ownership: spec.ownership,
        storage: storage.to_string(),
        storage_type,
        automaton: EndpointsAutomaton::from_mappings(&mappings),
    };
    (descriptor, mappings)
}

pub fn data_trigger_row(
    id: u128,
    trigger_type: DataTriggerType,
    interface_name: &str,
    match_path: &str,
) -> SimpleTriggerRow {
    SimpleTriggerRow {
        simple_trigger_id: Uuid::from_u128(id),
        parent_trigger_id: Uuid::from_u128(id | (0xffff_u128 << 64)),
        trigger: SimpleTrigger::Data {
            trigger_type,
            interface_name: interface_name.to_string(),
            interface_major: 1,
            match_path: match_path.to_string(),
            value_match_operator: ValueMatchOperator::Any,
            known_value: None,
        },
        routing_key: "trigger_engine".to_string(),
        static_headers: vec![],
    }
}

pub fn device_trigger_row(id: u128, event: DeviceTriggerType) -> SimpleTriggerRow {
    SimpleTriggerRow {
        simple_trigger_id: Uuid::from_u128(id),
        parent_trigger_id: Uuid::from_u128(id),
        trigger: SimpleTrigger::Device { event },
        routing_key: "trigger_engine".to_string(),
        static_headers: vec![],
    }
}

pub fn introspection_trigger_row(
    id: u128,
    event: IntrospectionTriggerType,
) -> SimpleTriggerRow {
    SimpleTriggerRow {
        simple_trigger_id: Uuid::from_u128(id),
        parent_trigger_id: Uuid::from_u128(id),
        trigger: SimpleTrigger::Introspection {
            event,
            interface_name: None,
        },
        routing_key: "trigger_engine".to_string(),
        static_headers: vec![],
    }
}

pub fn any_interface_scope() -> (Uuid, TriggerObjectType) {
    (Uuid::nil(), TriggerObjectType::AnyInterface)
}

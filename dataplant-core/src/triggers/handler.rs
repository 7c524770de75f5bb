//! Outbound event dispatch.
//!
//! One compiled trigger firing means one published message per target:
//! the prost-encoded [`SimpleEvent`] envelope, routed by the target's
//! routing key, carrying the target's static headers plus the dynamic
//! plant headers.

use crate::bridge::EventsPublisher;
use dataplant_error::DupResult;
use dataplant_models::events::simple_event::Event;
use dataplant_models::events::{
    DeviceConnectedEvent, DeviceDisconnectedEvent, IncomingDataEvent,
    IncomingIntrospectionEvent, InterfaceAddedEvent, InterfaceRemovedEvent, PathCreatedEvent,
    PathRemovedEvent, SimpleEvent, ValueChangeAppliedEvent, ValueChangeEvent,
};
use dataplant_models::triggers::TriggerTarget;
use dataplant_models::DeviceId;
use prost::Message;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct TriggersHandler {
    publisher: Arc<dyn EventsPublisher>,
}

impl TriggersHandler {
    pub fn new(publisher: Arc<dyn EventsPublisher>) -> Self {
        TriggersHandler { publisher }
    }

    async fn publish_event(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        timestamp_ms: i64,
        event: Event,
    ) -> DupResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let device_id = device.encode();
        let event_type = event.type_name();

        for target in targets {
            let envelope = SimpleEvent {
                realm: realm.to_string(),
                device_id: device_id.clone(),
                simple_trigger_id: Some(target.simple_trigger_id.as_bytes().to_vec()),
                parent_trigger_id: Some(target.parent_trigger_id.as_bytes().to_vec()),
                timestamp_ms: Some(timestamp_ms),
                event: Some(event.clone()),
            };

            let mut headers: Vec<(String, String)> = target.static_headers.clone();
            headers.push(("x_astarte_realm".to_string(), realm.to_string()));
            headers.push(("x_astarte_device_id".to_string(), device_id.clone()));
            headers.push(("x_astarte_event_type".to_string(), event_type.to_string()));
            if event.is_data_path() {
                headers.push((
                    "x_astarte_simple_trigger_id".to_string(),
                    target.simple_trigger_id.to_string(),
                ));
                headers.push((
                    "x_astarte_parent_trigger_id".to_string(),
                    target.parent_trigger_id.to_string(),
                ));
            }

            debug!(
                realm,
                device = %device_id,
                event_type,
                routing_key = %target.routing_key,
                "publishing trigger event"
            );
            self.publisher
                .publish(&target.routing_key, envelope.encode_to_vec(), &headers)
                .await?;
        }
        Ok(())
    }

    pub async fn device_connected(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        ip: IpAddr,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::DeviceConnected(DeviceConnectedEvent {
                device_ip_address: ip.to_string(),
            }),
        )
        .await
    }

    pub async fn device_disconnected(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::DeviceDisconnected(DeviceDisconnectedEvent {}),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn incoming_data(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        path: &str,
        bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::IncomingData(IncomingDataEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                bson_value,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn value_change(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        path: &str,
        old_bson_value: Vec<u8>,
        new_bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::ValueChange(ValueChangeEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                old_bson_value,
                new_bson_value,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn value_change_applied(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        path: &str,
        old_bson_value: Vec<u8>,
        new_bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::ValueChangeApplied(ValueChangeAppliedEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                old_bson_value,
                new_bson_value,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn path_created(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        path: &str,
        bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::PathCreated(PathCreatedEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                bson_value,
            }),
        )
        .await
    }

    pub async fn path_removed(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        path: &str,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::PathRemoved(PathRemovedEvent {
                interface: interface.to_string(),
                path: path.to_string(),
            }),
        )
        .await
    }

    pub async fn incoming_introspection(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        introspection: &str,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::IncomingIntrospection(IncomingIntrospectionEvent {
                introspection: introspection.to_string(),
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn interface_added(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        major_version: i32,
        minor_version: i32,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::InterfaceAdded(InterfaceAddedEvent {
                interface: interface.to_string(),
                major_version,
                minor_version,
            }),
        )
        .await
    }

    pub async fn interface_removed(
        &self,
        targets: &[TriggerTarget],
        realm: &str,
        device: &DeviceId,
        interface: &str,
        major_version: i32,
        timestamp_ms: i64,
    ) -> DupResult<()> {
        self.publish_event(
            targets,
            realm,
            device,
            timestamp_ms,
            Event::InterfaceRemoved(InterfaceRemovedEvent {
                interface: interface.to_string(),
                major_version,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>, Vec<(String, String)>)>>,
    }

    #[async_trait]
    impl EventsPublisher for RecordingPublisher {
        async fn publish(
            &self,
            routing_key: &str,
            payload: Vec<u8>,
            headers: &[(String, String)],
        ) -> DupResult<()> {
            self.published.lock().unwrap().push((
                routing_key.to_string(),
                payload,
                headers.to_vec(),
            ));
            Ok(())
        }
    }

    fn target() -> TriggerTarget {
        TriggerTarget {
            simple_trigger_id: Uuid::from_u128(1),
            parent_trigger_id: Uuid::from_u128(2),
            routing_key: "trigger_engine".to_string(),
            static_headers: vec![("x_custom".to_string(), "yes".to_string())],
        }
    }

    #[tokio::test]
    async fn data_path_events_carry_trigger_id_headers() {
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = TriggersHandler::new(publisher.clone());
        let device = DeviceId::from_bytes([1; 16]);

        handler
            .incoming_data(
                &[target()],
                "acme",
                &device,
                "org.test.Values",
                "/v",
                vec![],
                1_000,
            )
            .await
            .unwrap();

        let published = publisher.published.lock().unwrap();
        let (routing_key, payload, headers) = &published[0];
        assert_eq!(routing_key, "trigger_engine");

        let decoded = SimpleEvent::decode(payload.as_slice()).unwrap();
        assert_eq!(decoded.realm, "acme");
        assert_eq!(decoded.timestamp_ms, Some(1_000));

        let find = |k: &str| headers.iter().find(|(h, _)| h == k).map(|(_, v)| v.clone());
        assert_eq!(find("x_custom").as_deref(), Some("yes"));
        assert_eq!(find("x_astarte_event_type").as_deref(), Some("incoming_data"));
        assert!(find("x_astarte_simple_trigger_id").is_some());
        assert!(find("x_astarte_parent_trigger_id").is_some());
    }

    #[tokio::test]
    async fn lifecycle_events_omit_trigger_id_headers() {
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = TriggersHandler::new(publisher.clone());
        let device = DeviceId::from_bytes([1; 16]);

        handler
            .device_connected(
                &[target()],
                "acme",
                &device,
                "10.1.2.3".parse().unwrap(),
                2_000,
            )
            .await
            .unwrap();

        let published = publisher.published.lock().unwrap();
        let (_, _, headers) = &published[0];
        assert!(!headers.iter().any(|(h, _)| h == "x_astarte_simple_trigger_id"));
        assert!(headers
            .iter()
            .any(|(h, v)| h == "x_astarte_event_type" && v == "device_connected"));
    }

    #[tokio::test]
    async fn no_targets_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = TriggersHandler::new(publisher.clone());
        let device = DeviceId::from_bytes([1; 16]);
        handler
            .device_disconnected(&[], "acme", &device, 0)
            .await
            .unwrap();
        assert!(publisher.published.lock().unwrap().is_empty());
    }
}

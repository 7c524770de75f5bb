//! Typed events published to the events exchange.
//!
//! The wire format is Protocol Buffers. The messages are hand-written
//! prost types so the crate carries no build-time codegen; tags are part of
//! the public contract and must never be renumbered.

use prost::{Message, Oneof};

/// Envelope around every published event.
#[derive(Clone, PartialEq, Message)]
pub struct SimpleEvent {
    #[prost(string, tag = "1")]
    pub realm: String,
    /// Encoded device id (base64-url, no padding).
    #[prost(string, tag = "2")]
    pub device_id: String,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub simple_trigger_id: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub parent_trigger_id: Option<Vec<u8>>,
    /// Event timestamp in Unix milliseconds.
    #[prost(int64, optional, tag = "5")]
    pub timestamp_ms: Option<i64>,
    #[prost(
        oneof = "simple_event::Event",
        tags = "6, 7, 8, 9, 10, 11, 12, 13, 14, 15"
    )]
    pub event: Option<simple_event::Event>,
}

pub mod simple_event {
    use super::*;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Event {
        #[prost(message, tag = "6")]
        DeviceConnected(DeviceConnectedEvent),
        #[prost(message, tag = "7")]
        DeviceDisconnected(DeviceDisconnectedEvent),
        #[prost(message, tag = "8")]
        IncomingData(IncomingDataEvent),
        #[prost(message, tag = "9")]
        ValueChange(ValueChangeEvent),
        #[prost(message, tag = "10")]
        ValueChangeApplied(ValueChangeAppliedEvent),
        #[prost(message, tag = "11")]
        PathCreated(PathCreatedEvent),
        #[prost(message, tag = "12")]
        PathRemoved(PathRemovedEvent),
        #[prost(message, tag = "13")]
        IncomingIntrospection(IncomingIntrospectionEvent),
        #[prost(message, tag = "14")]
        InterfaceAdded(InterfaceAddedEvent),
        #[prost(message, tag = "15")]
        InterfaceRemoved(InterfaceRemovedEvent),
    }

    impl Event {
        /// Snake-case tag carried in the `x_astarte_event_type` header.
        pub fn type_name(&self) -> &'static str {
            match self {
                Event::DeviceConnected(_) => "device_connected",
                Event::DeviceDisconnected(_) => "device_disconnected",
                Event::IncomingData(_) => "incoming_data",
                Event::ValueChange(_) => "value_change",
                Event::ValueChangeApplied(_) => "value_change_applied",
                Event::PathCreated(_) => "path_created",
                Event::PathRemoved(_) => "path_removed",
                Event::IncomingIntrospection(_) => "incoming_introspection",
                Event::InterfaceAdded(_) => "interface_added",
                Event::InterfaceRemoved(_) => "interface_removed",
            }
        }

        /// Data-path events carry the trigger-id headers on the wire.
        pub fn is_data_path(&self) -> bool {
            matches!(
                self,
                Event::IncomingData(_)
                    | Event::ValueChange(_)
                    | Event::ValueChangeApplied(_)
                    | Event::PathCreated(_)
                    | Event::PathRemoved(_)
            )
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceConnectedEvent {
    #[prost(string, tag = "1")]
    pub device_ip_address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceDisconnectedEvent {}

#[derive(Clone, PartialEq, Message)]
pub struct IncomingDataEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    /// BSON document `{v: <value>}`; empty for unset.
    #[prost(bytes = "vec", tag = "3")]
    pub bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueChangeEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub old_bson_value: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub new_bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueChangeAppliedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub old_bson_value: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub new_bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PathCreatedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PathRemovedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct IncomingIntrospectionEvent {
    #[prost(string, tag = "1")]
    pub introspection: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct InterfaceAddedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(int32, tag = "2")]
    pub major_version: i32,
    #[prost(int32, tag = "3")]
    pub minor_version: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct InterfaceRemovedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(int32, tag = "2")]
    pub major_version: i32,
}

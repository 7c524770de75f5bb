//! Logical queries layer of the data updater plant.
//!
//! [`DataStore`] is the seam between the updater and the wide-column
//! database: every operation the plant performs is a method here, typed in
//! domain terms. A production deployment plugs a Cassandra/Scylla session
//! implementation into this trait; [`MemoryStore`] is the complete
//! reference implementation used by tests and single-node runs.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use bson::Bson;
use dataplant_error::StorageResult;
use dataplant_models::triggers::{SimpleTriggerRow, TriggerObjectType};
use dataplant_models::{DeviceId, InterfaceDescriptor, Mapping, Timestamp};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Write consistency requested for a storage operation.
///
/// Properties want cross-datacenter agreement, guaranteed stored
/// datastreams settle for local quorum, and unreliable values are
/// fire-and-forget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consistency {
    Any,
    One,
    Quorum,
    LocalQuorum,
}

/// The device row as the updater loads it at actor start.
#[derive(Clone, Debug, Default)]
pub struct DeviceRow {
    /// Declared interfaces, `name -> major`.
    pub introspection: HashMap<String, i32>,
    /// Declared minors, `name -> minor`.
    pub introspection_minor: HashMap<String, i32>,
    /// Previously declared interfaces no longer in the introspection,
    /// `(name, major) -> minor`.
    pub old_introspection: HashMap<(String, i32), i32>,
    pub connected: bool,
    pub pending_empty_cache: bool,
    pub total_received_msgs: i64,
    pub total_received_bytes: i64,
}

/// Remaining lifetime of a registered path row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathExpiry {
    /// The row never expires.
    Never,
    /// The row expires at this Unix timestamp (seconds).
    At(i64),
}

#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    // --- devices ---

    async fn fetch_device(
        &self,
        realm: &str,
        device: &DeviceId,
    ) -> StorageResult<Option<DeviceRow>>;

    async fn set_device_connected(
        &self,
        realm: &str,
        device: &DeviceId,
        ts_ms: i64,
        ip: IpAddr,
    ) -> StorageResult<()>;

    async fn set_device_disconnected(
        &self,
        realm: &str,
        device: &DeviceId,
        ts_ms: i64,
        total_received_msgs: i64,
        total_received_bytes: i64,
    ) -> StorageResult<()>;

    async fn set_pending_empty_cache(
        &self,
        realm: &str,
        device: &DeviceId,
        pending: bool,
    ) -> StorageResult<()>;

    /// The major version the device declared for an interface name.
    async fn fetch_interface_major(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_name: &str,
    ) -> StorageResult<Option<i32>>;

    async fn update_introspection(
        &self,
        realm: &str,
        device: &DeviceId,
        introspection: &HashMap<String, i32>,
        minors: &HashMap<String, i32>,
    ) -> StorageResult<()>;

    /// Merge entries into `old_introspection`.
    async fn merge_old_introspection(
        &self,
        realm: &str,
        device: &DeviceId,
        entries: &HashMap<(String, i32), i32>,
    ) -> StorageResult<()>;

    /// Drop re-added interfaces from `old_introspection`.
    async fn remove_old_introspection_entries(
        &self,
        realm: &str,
        device: &DeviceId,
        keys: &[(String, i32)],
    ) -> StorageResult<()>;

    // --- realm configuration ---

    /// Realm-level datastream TTL in seconds; `None` means keep forever.
    async fn fetch_datastream_maximum_storage_retention(
        &self,
        realm: &str,
    ) -> StorageResult<Option<i64>>;

    // --- interface schema ---

    async fn fetch_interface(
        &self,
        realm: &str,
        interface_name: &str,
        major: i32,
    ) -> StorageResult<Option<(InterfaceDescriptor, Vec<Mapping>)>>;

    // --- individual properties ---

    async fn insert_property(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        mapping: &Mapping,
        path: &str,
        reception: Timestamp,
        value: &Bson,
        consistency: Consistency,
    ) -> StorageResult<()>;

    async fn delete_property(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        endpoint_id: Uuid,
        path: &str,
        consistency: Consistency,
    ) -> StorageResult<()>;

    async fn fetch_property(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        mapping: &Mapping,
        path: &str,
    ) -> StorageResult<Option<Bson>>;

    /// All stored `(endpoint_id, path)` pairs of one interface.
    async fn fetch_property_paths(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
    ) -> StorageResult<Vec<(Uuid, String)>>;

    /// All stored `(path, value)` pairs of one interface.
    async fn fetch_property_values(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
    ) -> StorageResult<Vec<(String, Bson)>>;

    // --- datastreams ---

    #[allow(clippy::too_many_arguments)]
    async fn insert_individual_datastream(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        mapping: &Mapping,
        path: &str,
        value: &Bson,
        value_ts_ms: i64,
        reception: Timestamp,
        ttl_secs: Option<i64>,
        consistency: Consistency,
    ) -> StorageResult<()>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_object_datastream(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        path: &str,
        columns: &[(String, Bson)],
        value_ts_ms: Option<i64>,
        reception: Timestamp,
        ttl_secs: Option<i64>,
        consistency: Consistency,
    ) -> StorageResult<()>;

    // --- path registry ---

    async fn fetch_path_expiry(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        path: &str,
    ) -> StorageResult<Option<PathExpiry>>;

    #[allow(clippy::too_many_arguments)]
    async fn register_path(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        endpoint_id: Uuid,
        path: &str,
        datetime_value_ms: i64,
        ttl_secs: Option<i64>,
        consistency: Consistency,
    ) -> StorageResult<()>;

    // --- triggers ---

    async fn fetch_simple_triggers(
        &self,
        realm: &str,
        object_id: Uuid,
        object_type: TriggerObjectType,
    ) -> StorageResult<Vec<SimpleTriggerRow>>;

    // --- device-by-interface registry ---

    async fn register_device_with_interface(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_name: &str,
        major: i32,
    ) -> StorageResult<()>;

    async fn unregister_device_with_interface(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_name: &str,
        major: i32,
    ) -> StorageResult<()>;
}

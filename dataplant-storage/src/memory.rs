use crate::{Consistency, DataStore, DeviceRow, PathExpiry};
use async_trait::async_trait;
use bson::Bson;
use dataplant_error::StorageResult;
use dataplant_models::triggers::{SimpleTriggerRow, TriggerObjectType};
use dataplant_models::{DeviceId, InterfaceDescriptor, Mapping, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

/// One stored individual-datastream row, kept verbatim for inspection.
#[derive(Clone, Debug)]
pub struct IndividualDatastreamRow {
    pub interface_id: Uuid,
    pub endpoint_id: Uuid,
    pub path: String,
    pub value: Bson,
    pub value_ts_ms: i64,
    pub reception_ms: i64,
    pub reception_submillis: i64,
    pub ttl_secs: Option<i64>,
    pub consistency: Consistency,
}

/// One stored object-datastream row.
#[derive(Clone, Debug)]
pub struct ObjectDatastreamRow {
    pub interface_id: Uuid,
    pub path: String,
    pub columns: Vec<(String, Bson)>,
    pub value_ts_ms: Option<i64>,
    pub reception_ms: i64,
    pub ttl_secs: Option<i64>,
}

#[derive(Clone, Debug)]
struct StoredProperty {
    endpoint_id: Uuid,
    value: Bson,
}

#[derive(Clone, Debug)]
struct PathRow {
    #[allow(dead_code)]
    endpoint_id: Uuid,
    #[allow(dead_code)]
    datetime_value_ms: i64,
    expire_at_secs: Option<i64>,
}

#[derive(Clone, Debug, Default)]
struct StoredDevice {
    row: DeviceRow,
    last_connection_ms: Option<i64>,
    last_disconnection_ms: Option<i64>,
    last_seen_ip: Option<IpAddr>,
}

#[derive(Default)]
struct RealmState {
    devices: HashMap<DeviceId, StoredDevice>,
    interfaces: HashMap<(String, i32), (InterfaceDescriptor, Vec<Mapping>)>,
    /// `(device, interface_id) -> path -> property`
    properties: HashMap<(DeviceId, Uuid), BTreeMap<String, StoredProperty>>,
    individual_datastreams: Vec<(DeviceId, IndividualDatastreamRow)>,
    object_datastreams: Vec<(DeviceId, ObjectDatastreamRow)>,
    path_registry: HashMap<(DeviceId, Uuid, String), PathRow>,
    simple_triggers: HashMap<(Uuid, TriggerObjectType), Vec<SimpleTriggerRow>>,
    devices_by_interface: HashMap<(String, i32), HashSet<DeviceId>>,
    datastream_maximum_storage_retention: Option<i64>,
}

/// Complete in-memory [`DataStore`] implementation.
///
/// TTLs are realized as absolute expiry stamps computed at write time; the
/// rows themselves are never reaped, which keeps every write observable.
#[derive(Default)]
pub struct MemoryStore {
    realms: Mutex<HashMap<String, RealmState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_realm<T>(&self, realm: &str, f: impl FnOnce(&mut RealmState) -> T) -> T {
        let mut realms = self.realms.lock().unwrap();
        f(realms.entry(realm.to_string()).or_default())
    }

    // --- seeding (test and bootstrap surface) ---

    pub fn add_device(&self, realm: &str, device: DeviceId, row: DeviceRow) {
        self.with_realm(realm, |state| {
            state.devices.insert(
                device,
                StoredDevice {
                    row,
                    ..Default::default()
                },
            );
        });
    }

    pub fn add_interface(
        &self,
        realm: &str,
        descriptor: InterfaceDescriptor,
        mappings: Vec<Mapping>,
    ) {
        self.with_realm(realm, |state| {
            state.interfaces.insert(
                (descriptor.name.clone(), descriptor.major_version),
                (descriptor, mappings),
            );
        });
    }

    pub fn set_datastream_maximum_storage_retention(&self, realm: &str, ttl_secs: Option<i64>) {
        self.with_realm(realm, |state| {
            state.datastream_maximum_storage_retention = ttl_secs;
        });
    }

    pub fn add_simple_trigger(
        &self,
        realm: &str,
        object_id: Uuid,
        object_type: TriggerObjectType,
        row: SimpleTriggerRow,
    ) {
        self.with_realm(realm, |state| {
            state
                .simple_triggers
                .entry((object_id, object_type))
                .or_default()
                .push(row);
        });
    }

    pub fn seed_property(
        &self,
        realm: &str,
        device: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        value: Bson,
    ) {
        self.with_realm(realm, |state| {
            state
                .properties
                .entry((device, interface_id))
                .or_default()
                .insert(path.to_string(), StoredProperty { endpoint_id, value });
        });
    }

    // --- inspection (test surface) ---

    pub fn device_row(&self, realm: &str, device: &DeviceId) -> Option<DeviceRow> {
        self.with_realm(realm, |state| state.devices.get(device).map(|d| d.row.clone()))
    }

    pub fn last_seen_ip(&self, realm: &str, device: &DeviceId) -> Option<IpAddr> {
        self.with_realm(realm, |state| {
            state.devices.get(device).and_then(|d| d.last_seen_ip)
        })
    }

    pub fn property_value(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_id: Uuid,
        path: &str,
    ) -> Option<Bson> {
        self.with_realm(realm, |state| {
            state
                .properties
                .get(&(*device, interface_id))
                .and_then(|paths| paths.get(path))
                .map(|p| p.value.clone())
        })
    }

    pub fn individual_datastream_rows(
        &self,
        realm: &str,
        device: &DeviceId,
    ) -> Vec<IndividualDatastreamRow> {
        self.with_realm(realm, |state| {
            state
                .individual_datastreams
                .iter()
                .filter(|(d, _)| d == device)
                .map(|(_, row)| row.clone())
                .collect()
        })
    }

    pub fn object_datastream_rows(
        &self,
        realm: &str,
        device: &DeviceId,
    ) -> Vec<ObjectDatastreamRow> {
        self.with_realm(realm, |state| {
            state
                .object_datastreams
                .iter()
                .filter(|(d, _)| d == device)
                .map(|(_, row)| row.clone())
                .collect()
        })
    }

    pub fn registered_paths(&self, realm: &str, device: &DeviceId) -> Vec<String> {
        self.with_realm(realm, |state| {
            state
                .path_registry
                .keys()
                .filter(|(d, _, _)| d == device)
                .map(|(_, _, path)| path.clone())
                .collect()
        })
    }

    pub fn devices_for_interface(&self, realm: &str, interface_name: &str, major: i32) -> usize {
        self.with_realm(realm, |state| {
            state
                .devices_by_interface
                .get(&(interface_name.to_string(), major))
                .map(|set| set.len())
                .unwrap_or(0)
        })
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn fetch_device(
        &self,
        realm: &str,
        device: &DeviceId,
    ) -> StorageResult<Option<DeviceRow>> {
        Ok(self.device_row(realm, device))
    }

    async fn set_device_connected(
        &self,
        realm: &str,
        device: &DeviceId,
        ts_ms: i64,
        ip: IpAddr,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            let entry = state.devices.entry(*device).or_default();
            entry.row.connected = true;
            entry.last_connection_ms = Some(ts_ms);
            entry.last_seen_ip = Some(ip);
        });
        Ok(())
    }

    async fn set_device_disconnected(
        &self,
        realm: &str,
        device: &DeviceId,
        ts_ms: i64,
        total_received_msgs: i64,
        total_received_bytes: i64,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            let entry = state.devices.entry(*device).or_default();
            entry.row.connected = false;
            entry.last_disconnection_ms = Some(ts_ms);
            entry.row.total_received_msgs = total_received_msgs;
            entry.row.total_received_bytes = total_received_bytes;
        });
        Ok(())
    }

    async fn set_pending_empty_cache(
        &self,
        realm: &str,
        device: &DeviceId,
        pending: bool,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            state.devices.entry(*device).or_default().row.pending_empty_cache = pending;
        });
        Ok(())
    }

    async fn fetch_interface_major(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_name: &str,
    ) -> StorageResult<Option<i32>> {
        Ok(self.with_realm(realm, |state| {
            state
                .devices
                .get(device)
                .and_then(|d| d.row.introspection.get(interface_name).copied())
        }))
    }

    async fn update_introspection(
        &self,
        realm: &str,
        device: &DeviceId,
        introspection: &HashMap<String, i32>,
        minors: &HashMap<String, i32>,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            let entry = state.devices.entry(*device).or_default();
            entry.row.introspection = introspection.clone();
            entry.row.introspection_minor = minors.clone();
        });
        Ok(())
    }

    async fn merge_old_introspection(
        &self,
        realm: &str,
        device: &DeviceId,
        entries: &HashMap<(String, i32), i32>,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            let entry = state.devices.entry(*device).or_default();
            entry
                .row
                .old_introspection
                .extend(entries.iter().map(|(k, v)| (k.clone(), *v)));
        });
        Ok(())
    }

    async fn remove_old_introspection_entries(
        &self,
        realm: &str,
        device: &DeviceId,
        keys: &[(String, i32)],
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            let entry = state.devices.entry(*device).or_default();
            for key in keys {
                entry.row.old_introspection.remove(key);
            }
        });
        Ok(())
    }

    async fn fetch_datastream_maximum_storage_retention(
        &self,
        realm: &str,
    ) -> StorageResult<Option<i64>> {
        Ok(self.with_realm(realm, |state| state.datastream_maximum_storage_retention))
    }

    async fn fetch_interface(
        &self,
        realm: &str,
        interface_name: &str,
        major: i32,
    ) -> StorageResult<Option<(InterfaceDescriptor, Vec<Mapping>)>> {
        Ok(self.with_realm(realm, |state| {
            state
                .interfaces
                .get(&(interface_name.to_string(), major))
                .cloned()
        }))
    }

    async fn insert_property(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        mapping: &Mapping,
        path: &str,
        _reception: Timestamp,
        value: &Bson,
        _consistency: Consistency,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            state
                .properties
                .entry((*device, interface.interface_id))
                .or_default()
                .insert(
                    path.to_string(),
                    StoredProperty {
                        endpoint_id: mapping.endpoint_id,
                        value: value.clone(),
                    },
                );
        });
        Ok(())
    }

    async fn delete_property(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        _endpoint_id: Uuid,
        path: &str,
        _consistency: Consistency,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            if let Some(paths) = state.properties.get_mut(&(*device, interface.interface_id)) {
                paths.remove(path);
            }
            state
                .path_registry
                .remove(&(*device, interface.interface_id, path.to_string()));
        });
        Ok(())
    }

    async fn fetch_property(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        _mapping: &Mapping,
        path: &str,
    ) -> StorageResult<Option<Bson>> {
        Ok(self.property_value(realm, device, interface.interface_id, path))
    }

    async fn fetch_property_paths(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
    ) -> StorageResult<Vec<(Uuid, String)>> {
        Ok(self.with_realm(realm, |state| {
            state
                .properties
                .get(&(*device, interface.interface_id))
                .map(|paths| {
                    paths
                        .iter()
                        .map(|(path, prop)| (prop.endpoint_id, path.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn fetch_property_values(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
    ) -> StorageResult<Vec<(String, Bson)>> {
        Ok(self.with_realm(realm, |state| {
            state
                .properties
                .get(&(*device, interface.interface_id))
                .map(|paths| {
                    paths
                        .iter()
                        .map(|(path, prop)| (path.clone(), prop.value.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

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
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            state.individual_datastreams.push((
                *device,
                IndividualDatastreamRow {
                    interface_id: interface.interface_id,
                    endpoint_id: mapping.endpoint_id,
                    path: path.to_string(),
                    value: value.clone(),
                    value_ts_ms,
                    reception_ms: reception.as_millis(),
                    reception_submillis: reception.submillis(),
                    ttl_secs,
                    consistency,
                },
            ));
        });
        Ok(())
    }

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
        _consistency: Consistency,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            state.object_datastreams.push((
                *device,
                ObjectDatastreamRow {
                    interface_id: interface.interface_id,
                    path: path.to_string(),
                    columns: columns.to_vec(),
                    value_ts_ms,
                    reception_ms: reception.as_millis(),
                    ttl_secs,
                },
            ));
        });
        Ok(())
    }

    async fn fetch_path_expiry(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        path: &str,
    ) -> StorageResult<Option<PathExpiry>> {
        Ok(self.with_realm(realm, |state| {
            state
                .path_registry
                .get(&(*device, interface.interface_id, path.to_string()))
                .map(|row| match row.expire_at_secs {
                    Some(at) => PathExpiry::At(at),
                    None => PathExpiry::Never,
                })
        }))
    }

    async fn register_path(
        &self,
        realm: &str,
        device: &DeviceId,
        interface: &InterfaceDescriptor,
        endpoint_id: Uuid,
        path: &str,
        datetime_value_ms: i64,
        ttl_secs: Option<i64>,
        _consistency: Consistency,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            state.path_registry.insert(
                (*device, interface.interface_id, path.to_string()),
                PathRow {
                    endpoint_id,
                    datetime_value_ms,
                    expire_at_secs: ttl_secs.map(|ttl| Timestamp::now().as_secs() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn fetch_simple_triggers(
        &self,
        realm: &str,
        object_id: Uuid,
        object_type: TriggerObjectType,
    ) -> StorageResult<Vec<SimpleTriggerRow>> {
        Ok(self.with_realm(realm, |state| {
            state
                .simple_triggers
                .get(&(object_id, object_type))
                .cloned()
                .unwrap_or_default()
        }))
    }

    async fn register_device_with_interface(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_name: &str,
        major: i32,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            state
                .devices_by_interface
                .entry((interface_name.to_string(), major))
                .or_default()
                .insert(*device);
        });
        Ok(())
    }

    async fn unregister_device_with_interface(
        &self,
        realm: &str,
        device: &DeviceId,
        interface_name: &str,
        major: i32,
    ) -> StorageResult<()> {
        self.with_realm(realm, |state| {
            if let Some(set) = state
                .devices_by_interface
                .get_mut(&(interface_name.to_string(), major))
            {
                set.remove(device);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplant_models::automaton::EndpointsAutomaton;
    use dataplant_models::ids;
    use dataplant_models::interface::{
        Aggregation, InterfaceType, MappingValueType, Ownership, Reliability, Retention,
        StorageType,
    };

    fn device() -> DeviceId {
        DeviceId::from_bytes([7; 16])
    }

    fn interface() -> (InterfaceDescriptor, Vec<Mapping>) {
        let name = "org.test.Props";
        let mapping = Mapping {
            endpoint_id: ids::endpoint_id(name, 1, "/value"),
            interface_id: ids::interface_id(name, 1),
            endpoint: "/value".to_string(),
            value_type: MappingValueType::Integer,
            reliability: Reliability::Guaranteed,
            retention: Retention::Stored,
            allow_unset: true,
            explicit_timestamp: false,
        };
        let descriptor = InterfaceDescriptor {
            interface_id: ids::interface_id(name, 1),
            name: name.to_string(),
            major_version: 1,
            minor_version: 0,
            interface_type: InterfaceType::Properties,
            aggregation: Aggregation::Individual,
            ownership: Ownership::Device,
            storage: "individual_properties".to_string(),
            storage_type: StorageType::MultiInterfaceIndividualPropertiesDbTable,
            automaton: EndpointsAutomaton::from_mappings(std::slice::from_ref(&mapping)),
        };
        (descriptor, vec![mapping])
    }

    #[tokio::test]
    async fn property_insert_fetch_delete() {
        let store = MemoryStore::new();
        let (descriptor, mappings) = interface();
        let dev = device();

        store
            .insert_property(
                "acme",
                &dev,
                &descriptor,
                &mappings[0],
                "/value",
                Timestamp::from_millis(1),
                &Bson::Int32(42),
                Consistency::Quorum,
            )
            .await
            .unwrap();

        let fetched = store
            .fetch_property("acme", &dev, &descriptor, &mappings[0], "/value")
            .await
            .unwrap();
        assert_eq!(fetched, Some(Bson::Int32(42)));

        store
            .delete_property(
                "acme",
                &dev,
                &descriptor,
                mappings[0].endpoint_id,
                "/value",
                Consistency::Quorum,
            )
            .await
            .unwrap();
        assert_eq!(
            store
                .fetch_property("acme", &dev, &descriptor, &mappings[0], "/value")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn datastream_rows_record_reception_split() {
        let store = MemoryStore::new();
        let (descriptor, mappings) = interface();
        let dev = device();
        let reception = Timestamp::from_ticks(1_000 * 10_000 + 123);

        store
            .insert_individual_datastream(
                "acme",
                &dev,
                &descriptor,
                &mappings[0],
                "/value",
                &Bson::Int32(1),
                999,
                reception,
                Some(3600),
                Consistency::LocalQuorum,
            )
            .await
            .unwrap();

        let rows = store.individual_datastream_rows("acme", &dev);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reception_ms, 1_000);
        assert_eq!(rows[0].reception_submillis, 123);
        assert_eq!(rows[0].ttl_secs, Some(3600));
    }

    #[tokio::test]
    async fn old_introspection_merge_and_remove() {
        let store = MemoryStore::new();
        let dev = device();
        store.add_device("acme", dev, DeviceRow::default());

        let mut entries = HashMap::new();
        entries.insert(("org.test.Gone".to_string(), 2), 1);
        store
            .merge_old_introspection("acme", &dev, &entries)
            .await
            .unwrap();
        assert_eq!(
            store.device_row("acme", &dev).unwrap().old_introspection.len(),
            1
        );

        store
            .remove_old_introspection_entries("acme", &dev, &[("org.test.Gone".to_string(), 2)])
            .await
            .unwrap();
        assert!(store
            .device_row("acme", &dev)
            .unwrap()
            .old_introspection
            .is_empty());
    }
}

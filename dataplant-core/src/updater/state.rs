use crate::triggers::TriggerTables;
use dataplant_models::constants::{INTERFACE_LIFESPAN, PATHS_CACHE_CAP};
use dataplant_models::{DeviceId, InterfaceDescriptor, Mapping, Timestamp};
use moka::{sync::Cache, Expiry};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Per-entry TTL for the paths cache: the entry value is its own TTL, and
/// entries without one never expire.
struct PathsExpiry;

impl Expiry<(String, String), Option<Duration>> for PathsExpiry {
    fn expire_after_create(
        &self,
        _key: &(String, String),
        ttl: &Option<Duration>,
        _now: Instant,
    ) -> Option<Duration> {
        *ttl
    }

    fn expire_after_update(
        &self,
        _key: &(String, String),
        ttl: &Option<Duration>,
        _now: Instant,
        _current: Option<Duration>,
    ) -> Option<Duration> {
        *ttl
    }
}

/// The mutable state of one device actor.
pub(super) struct DeviceState {
    pub realm: String,
    pub device: DeviceId,
    pub connected: bool,
    pub last_seen_message: Timestamp,
    pub last_device_triggers_refresh: Timestamp,
    /// Declared interfaces, `name -> major`.
    pub introspection: HashMap<String, i32>,
    pub introspection_minor: HashMap<String, i32>,
    /// Loaded interface schemas.
    pub interfaces: HashMap<String, Arc<InterfaceDescriptor>>,
    /// Monotonic queue of `(expiry, name)`; the head expires first.
    pub interfaces_by_expiry: VecDeque<(Timestamp, String)>,
    /// Expiry currently recorded per loaded interface; a queue entry is
    /// stale when it no longer matches.
    interface_expiry: HashMap<String, Timestamp>,
    pub interface_ids_to_name: HashMap<Uuid, String>,
    /// Every endpoint of every loaded interface.
    pub mappings: HashMap<Uuid, Mapping>,
    paths_cache: Cache<(String, String), Option<Duration>>,
    pub triggers: TriggerTables,
    pub total_received_msgs: i64,
    pub total_received_bytes: i64,
    /// Realm-level datastream TTL in seconds, if configured.
    pub datastream_maximum_storage_retention: Option<i64>,
}

impl DeviceState {
    pub fn new(realm: String, device: DeviceId) -> Self {
        DeviceState {
            realm,
            device,
            connected: false,
            last_seen_message: Timestamp::now(),
            last_device_triggers_refresh: Timestamp::from_ticks(0),
            introspection: HashMap::new(),
            introspection_minor: HashMap::new(),
            interfaces: HashMap::new(),
            interfaces_by_expiry: VecDeque::new(),
            interface_expiry: HashMap::new(),
            interface_ids_to_name: HashMap::new(),
            mappings: HashMap::new(),
            paths_cache: Cache::builder()
                .max_capacity(PATHS_CACHE_CAP)
                .expire_after(PathsExpiry)
                .build(),
            triggers: TriggerTables::default(),
            total_received_msgs: 0,
            total_received_bytes: 0,
            datastream_maximum_storage_retention: None,
        }
    }

    /// Insert a freshly loaded interface into every cache.
    pub fn add_interface(&mut self, descriptor: Arc<InterfaceDescriptor>, mappings: Vec<Mapping>) {
        let expiry = self.last_seen_message + INTERFACE_LIFESPAN;
        self.interfaces_by_expiry
            .push_back((expiry, descriptor.name.clone()));
        self.interface_expiry.insert(descriptor.name.clone(), expiry);
        self.interface_ids_to_name
            .insert(descriptor.interface_id, descriptor.name.clone());
        for mapping in mappings {
            self.mappings.insert(mapping.endpoint_id, mapping);
        }
        self.interfaces.insert(descriptor.name.clone(), descriptor);
    }

    /// Drop every expired interface. The queue is sorted by construction,
    /// so this walks the prefix with expiry <= now; stale entries (their
    /// interface was reloaded or already forgotten) pop without effect.
    pub fn purge_expired_interfaces(&mut self, now: Timestamp) {
        while let Some((expiry, _)) = self.interfaces_by_expiry.front() {
            if *expiry > now {
                break;
            }
            let (expiry, name) = self.interfaces_by_expiry.pop_front().unwrap();
            if self.interface_expiry.get(&name) == Some(&expiry) {
                debug!(interface = %name, "interface cache entry expired");
                self.forget_interface(&name);
            }
        }
    }

    /// Forget one loaded interface: descriptor, mappings, id index, and the
    /// triggers keyed by its id.
    pub fn forget_interface(&mut self, name: &str) {
        let Some(descriptor) = self.interfaces.remove(name) else {
            return;
        };
        self.interface_expiry.remove(name);
        self.interface_ids_to_name.remove(&descriptor.interface_id);
        self.mappings
            .retain(|_, mapping| mapping.interface_id != descriptor.interface_id);
        self.triggers.forget_interface(descriptor.interface_id);
    }

    pub fn paths_cache_contains(&self, interface: &str, path: &str) -> bool {
        self.paths_cache
            .contains_key(&(interface.to_string(), path.to_string()))
    }

    pub fn paths_cache_put(&self, interface: &str, path: &str, ttl: Option<Duration>) {
        self.paths_cache
            .insert((interface.to_string(), path.to_string()), ttl);
    }

    pub fn reset_paths_cache(&self) {
        self.paths_cache.invalidate_all();
    }
}

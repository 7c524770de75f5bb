use super::state::DeviceState;
use crate::bridge::ClientSessionBridge;
use crate::tracker::{MessageTracker, TrackerGuard};
use crate::triggers::{TriggersHandler, VolatileTrigger};
use bytes::Bytes;
use dataplant_error::message::MessageError;
use dataplant_error::{DupError, DupResult};
use dataplant_models::constants::DEVICE_TRIGGERS_LIFESPAN;
use dataplant_models::triggers::{DeviceTriggerType, TriggerObjectType};
use dataplant_models::{DeviceId, InterfaceDescriptor, Timestamp};
use dataplant_storage::DataStore;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work items posted to a device actor's mailbox.
pub enum UpdaterMessage {
    Connection {
        ip: String,
        message_id: Bytes,
        timestamp: Timestamp,
    },
    Disconnection {
        message_id: Bytes,
        timestamp: Timestamp,
    },
    Data {
        interface: String,
        path: String,
        payload: Bytes,
        message_id: Bytes,
        timestamp: Timestamp,
    },
    Introspection {
        payload: Bytes,
        message_id: Bytes,
        timestamp: Timestamp,
    },
    Control {
        path: String,
        payload: Bytes,
        message_id: Bytes,
        timestamp: Timestamp,
    },
    InstallVolatileTrigger {
        trigger: Box<VolatileTrigger>,
        reply: oneshot::Sender<DupResult<()>>,
    },
    DeleteVolatileTrigger {
        trigger_id: Uuid,
        reply: oneshot::Sender<DupResult<()>>,
    },
}

/// Cloneable handle to a running device actor.
#[derive(Clone)]
pub struct UpdaterHandle {
    tx: mpsc::Sender<UpdaterMessage>,
}

impl UpdaterHandle {
    /// Post a work item; a closed mailbox (dead actor) hands the item back
    /// so the caller can respawn and retry.
    pub async fn send(&self, msg: UpdaterMessage) -> Result<(), Box<UpdaterMessage>> {
        self.tx.send(msg).await.map_err(|e| Box::new(e.0))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn install_volatile_trigger(&self, trigger: VolatileTrigger) -> DupResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(UpdaterMessage::InstallVolatileTrigger {
            trigger: Box::new(trigger),
            reply: reply_tx,
        })
        .await
        .map_err(|_| DupError::ActorUnavailable)?;
        reply_rx.await.map_err(|_| DupError::ActorUnavailable)?
    }

    pub async fn delete_volatile_trigger(&self, trigger_id: Uuid) -> DupResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(UpdaterMessage::DeleteVolatileTrigger {
            trigger_id,
            reply: reply_tx,
        })
        .await
        .map_err(|_| DupError::ActorUnavailable)?;
        reply_rx.await.map_err(|_| DupError::ActorUnavailable)?
    }
}

/// How a processed message leaves the tracker queue.
pub(super) enum Settle {
    Ack,
    Discard,
}

pub struct DataUpdater {
    pub(super) state: DeviceState,
    pub(super) store: Arc<dyn DataStore>,
    pub(super) tracker: MessageTracker,
    pub(super) triggers_handler: TriggersHandler,
    pub(super) session: Arc<dyn ClientSessionBridge>,
    _guard: TrackerGuard,
}

impl DataUpdater {
    /// Register with the tracker, load the device row and realm config,
    /// build the trigger tables, and start the actor task.
    pub async fn spawn(
        realm: String,
        device: DeviceId,
        store: Arc<dyn DataStore>,
        tracker: MessageTracker,
        triggers_handler: TriggersHandler,
        session: Arc<dyn ClientSessionBridge>,
        mailbox_capacity: usize,
    ) -> DupResult<UpdaterHandle> {
        let guard = tracker.register_data_updater().await?;

        let row = store
            .fetch_device(&realm, &device)
            .await
            .map_err(DupError::from)?
            .ok_or_else(|| {
                DupError::StorageError(dataplant_error::storage::StorageError::DeviceNotFound {
                    device: device.encode(),
                })
            })?;

        let mut state = DeviceState::new(realm.clone(), device);
        state.connected = row.connected;
        state.introspection = row.introspection;
        state.introspection_minor = row.introspection_minor;
        state.total_received_msgs = row.total_received_msgs;
        state.total_received_bytes = row.total_received_bytes;
        state.datastream_maximum_storage_retention = store
            .fetch_datastream_maximum_storage_retention(&realm)
            .await
            .map_err(DupError::from)?;

        let mut updater = DataUpdater {
            state,
            store,
            tracker,
            triggers_handler,
            session,
            _guard: guard,
        };
        updater.refresh_device_triggers(Timestamp::now()).await?;

        let (tx, rx) = mpsc::channel(mailbox_capacity);
        info!(realm, device = %device, "data updater started");
        tokio::spawn(updater.run(rx));
        Ok(UpdaterHandle { tx })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<UpdaterMessage>) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.handle(msg).await {
                error!(
                    realm = %self.state.realm,
                    device = %self.state.device,
                    error = %e,
                    "data updater aborting, in-flight messages will be requeued"
                );
                return;
            }
        }
        debug!(
            realm = %self.state.realm,
            device = %self.state.device,
            "data updater mailbox closed"
        );
    }

    async fn handle(&mut self, msg: UpdaterMessage) -> DupResult<()> {
        self.execute_time_based_actions().await?;

        match msg {
            UpdaterMessage::Connection {
                ip,
                message_id,
                timestamp,
            } => {
                self.state.last_seen_message = timestamp;
                if !self.can_process(&message_id).await? {
                    return Ok(());
                }
                self.handle_connection(&ip, message_id, timestamp).await
            }
            UpdaterMessage::Disconnection {
                message_id,
                timestamp,
            } => {
                self.state.last_seen_message = timestamp;
                if !self.can_process(&message_id).await? {
                    return Ok(());
                }
                self.handle_disconnection(message_id, timestamp).await
            }
            UpdaterMessage::Data {
                interface,
                path,
                payload,
                message_id,
                timestamp,
            } => {
                self.state.last_seen_message = timestamp;
                if !self.can_process(&message_id).await? {
                    return Ok(());
                }
                match self.do_handle_data(&interface, &path, &payload, timestamp).await {
                    Ok(Settle::Ack) => {
                        self.tracker.ack_delivery(message_id)?;
                        self.state.total_received_msgs += 1;
                        self.state.total_received_bytes +=
                            (payload.len() + interface.len() + path.len()) as i64;
                        Ok(())
                    }
                    Ok(Settle::Discard) => self.tracker.discard(message_id),
                    Err(e) => self.handle_message_error(e, message_id).await,
                }
            }
            UpdaterMessage::Introspection {
                payload,
                message_id,
                timestamp,
            } => {
                self.state.last_seen_message = timestamp;
                if !self.can_process(&message_id).await? {
                    return Ok(());
                }
                match self.do_handle_introspection(&payload, timestamp).await {
                    Ok(()) => self.tracker.ack_delivery(message_id),
                    Err(e) => self.handle_message_error(e, message_id).await,
                }
            }
            UpdaterMessage::Control {
                path,
                payload,
                message_id,
                timestamp,
            } => {
                self.state.last_seen_message = timestamp;
                if !self.can_process(&message_id).await? {
                    return Ok(());
                }
                match self.do_handle_control(&path, &payload, timestamp).await {
                    Ok(Settle::Ack) => self.tracker.ack_delivery(message_id),
                    Ok(Settle::Discard) => self.tracker.discard(message_id),
                    Err(e) => self.handle_message_error(e, message_id).await,
                }
            }
            UpdaterMessage::InstallVolatileTrigger { trigger, reply } => {
                let result = self.do_install_volatile_trigger(*trigger).await;
                let _ = reply.send(result);
                Ok(())
            }
            UpdaterMessage::DeleteVolatileTrigger { trigger_id, reply } => {
                let result = self.do_delete_volatile_trigger(trigger_id);
                let _ = reply.send(result);
                Ok(())
            }
        }
    }

    /// Expire stale interface-cache entries and refresh device-level
    /// triggers when their lifespan elapsed.
    async fn execute_time_based_actions(&mut self) -> DupResult<()> {
        let now = Timestamp::now();
        self.state.purge_expired_interfaces(now);

        let refresh_ticks = DEVICE_TRIGGERS_LIFESPAN.as_nanos() as i64 / 100;
        if now - self.state.last_device_triggers_refresh >= refresh_ticks {
            self.refresh_device_triggers(now).await?;
        }
        Ok(())
    }

    async fn can_process(&self, message_id: &Bytes) -> DupResult<bool> {
        let ok = self.tracker.can_process_message(message_id.clone()).await?;
        if !ok {
            debug!(
                realm = %self.state.realm,
                device = %self.state.device,
                "out-of-order duplicate, skipping"
            );
        }
        Ok(ok)
    }

    async fn handle_connection(
        &mut self,
        ip: &str,
        message_id: Bytes,
        timestamp: Timestamp,
    ) -> DupResult<()> {
        let parsed: IpAddr = ip.parse().unwrap_or_else(|_| {
            warn!(
                realm = %self.state.realm,
                device = %self.state.device,
                ip,
                "unparsable remote ip, falling back to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });

        self.store
            .set_device_connected(
                &self.state.realm,
                &self.state.device,
                timestamp.as_millis(),
                parsed,
            )
            .await
            .map_err(DupError::from)?;

        let targets = self
            .state
            .triggers
            .device_targets(DeviceTriggerType::DeviceConnected)
            .to_vec();
        self.triggers_handler
            .device_connected(
                &targets,
                &self.state.realm,
                &self.state.device,
                parsed,
                timestamp.as_millis(),
            )
            .await?;

        self.tracker.ack_delivery(message_id)?;
        self.state.connected = true;
        info!(
            realm = %self.state.realm,
            device = %self.state.device,
            ip = %parsed,
            "device connected"
        );
        Ok(())
    }

    async fn handle_disconnection(
        &mut self,
        message_id: Bytes,
        timestamp: Timestamp,
    ) -> DupResult<()> {
        self.store
            .set_device_disconnected(
                &self.state.realm,
                &self.state.device,
                timestamp.as_millis(),
                self.state.total_received_msgs,
                self.state.total_received_bytes,
            )
            .await
            .map_err(DupError::from)?;

        let targets = self
            .state
            .triggers
            .device_targets(DeviceTriggerType::DeviceDisconnected)
            .to_vec();
        self.triggers_handler
            .device_disconnected(
                &targets,
                &self.state.realm,
                &self.state.device,
                timestamp.as_millis(),
            )
            .await?;

        self.tracker.ack_delivery(message_id)?;
        self.state.connected = false;
        info!(
            realm = %self.state.realm,
            device = %self.state.device,
            "device disconnected"
        );
        Ok(())
    }

    /// Apply the error policy: payload violations warn, force a clean
    /// session, and discard; infrastructure errors abort the actor.
    pub(super) async fn handle_message_error(
        &mut self,
        error: MessageError,
        message_id: Bytes,
    ) -> DupResult<()> {
        if !error.is_payload_violation() {
            return Err(error.into());
        }
        warn!(
            realm = %self.state.realm,
            device = %self.state.device,
            tag = error.tag(),
            error = %error,
            "msg_handling_error"
        );
        self.ask_clean_session().await?;
        self.tracker.discard(message_id)
    }

    /// Flag the device for an `/emptyCache` round and drop its session so
    /// it reconnects clean.
    pub(super) async fn ask_clean_session(&mut self) -> DupResult<()> {
        self.store
            .set_pending_empty_cache(&self.state.realm, &self.state.device, true)
            .await
            .map_err(DupError::from)?;

        let client_id = format!("{}/{}", self.state.realm, self.state.device);
        if let Err(e) = self.session.disconnect(&client_id, true).await {
            warn!(
                realm = %self.state.realm,
                device = %self.state.device,
                error = %e,
                "failed to disconnect client for clean session"
            );
        }
        Ok(())
    }

    /// Resolve an interface by name, loading it from the store on a cache
    /// miss. Loading also pulls the interface-scoped triggers.
    pub(super) async fn resolve_interface(
        &mut self,
        interface_name: &str,
    ) -> Result<Arc<InterfaceDescriptor>, MessageError> {
        if let Some(descriptor) = self.state.interfaces.get(interface_name) {
            return Ok(descriptor.clone());
        }

        let major = self
            .store
            .fetch_interface_major(&self.state.realm, &self.state.device, interface_name)
            .await?
            .ok_or_else(|| MessageError::InterfaceLoadingFailed {
                interface: interface_name.to_string(),
            })?;

        let (descriptor, mappings) = self
            .store
            .fetch_interface(&self.state.realm, interface_name, major)
            .await?
            .ok_or_else(|| MessageError::InterfaceLoadingFailed {
                interface: interface_name.to_string(),
            })?;

        let descriptor = Arc::new(descriptor);
        self.state.add_interface(descriptor.clone(), mappings);
        self.populate_interface_triggers(&descriptor).await?;
        debug!(
            realm = %self.state.realm,
            device = %self.state.device,
            interface = interface_name,
            major,
            "interface loaded"
        );
        Ok(descriptor)
    }

    async fn populate_interface_triggers(
        &mut self,
        descriptor: &Arc<InterfaceDescriptor>,
    ) -> Result<(), MessageError> {
        let rows = self
            .store
            .fetch_simple_triggers(
                &self.state.realm,
                descriptor.interface_id,
                TriggerObjectType::Interface,
            )
            .await?;
        for row in &rows {
            if let Err(e) = self.state.triggers.install_row(row, Some(descriptor)) {
                warn!(
                    interface = %descriptor.name,
                    trigger = %row.simple_trigger_id,
                    error = %e,
                    "skipping uninstallable trigger"
                );
            }
        }

        let volatile: Vec<_> = self
            .state
            .triggers
            .volatile
            .iter()
            .filter(|v| {
                v.object_type == TriggerObjectType::Interface
                    && v.object_id == descriptor.interface_id
            })
            .map(|v| v.row.clone())
            .collect();
        for row in &volatile {
            if let Err(e) = self.state.triggers.install_row(row, Some(descriptor)) {
                warn!(
                    interface = %descriptor.name,
                    trigger = %row.simple_trigger_id,
                    error = %e,
                    "skipping uninstallable volatile trigger"
                );
            }
        }
        Ok(())
    }

    /// Rebuild device-scoped trigger tables from the store plus the
    /// surviving volatile triggers.
    pub(super) async fn refresh_device_triggers(&mut self, now: Timestamp) -> DupResult<()> {
        self.state.triggers.clear_device_scoped();

        let scopes = [
            (self.state.device.to_uuid(), TriggerObjectType::Device),
            (Uuid::nil(), TriggerObjectType::AnyDevice),
            (Uuid::nil(), TriggerObjectType::AnyInterface),
        ];
        for (object_id, object_type) in scopes {
            let rows = self
                .store
                .fetch_simple_triggers(&self.state.realm, object_id, object_type)
                .await
                .map_err(DupError::from)?;
            for row in &rows {
                if let Err(e) = self.state.triggers.install_row(row, None) {
                    warn!(
                        trigger = %row.simple_trigger_id,
                        error = %e,
                        "skipping uninstallable trigger"
                    );
                }
            }
        }

        let volatile: Vec<_> = self
            .state
            .triggers
            .volatile
            .iter()
            .filter(|v| v.object_type != TriggerObjectType::Interface)
            .map(|v| v.row.clone())
            .collect();
        for row in &volatile {
            if let Err(e) = self.state.triggers.install_row(row, None) {
                warn!(
                    trigger = %row.simple_trigger_id,
                    error = %e,
                    "skipping uninstallable volatile trigger"
                );
            }
        }

        self.state.last_device_triggers_refresh = now;
        Ok(())
    }
}

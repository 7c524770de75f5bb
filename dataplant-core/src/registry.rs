//! Device registry: lazily spawned `{realm, device}` actor/tracker pairs.
//!
//! The tracker outlives its actor. When an actor aborts, the next delivery
//! respawns only the actor and re-registers it with the surviving tracker,
//! which is what turns crash recovery into plain broker redelivery.

use crate::bridge::{Acknowledger, ClientSessionBridge, DeliveryTag};
use crate::tracker::MessageTracker;
use crate::triggers::{TriggersHandler, VolatileTrigger};
use crate::updater::{DataUpdater, UpdaterHandle, UpdaterMessage};
use bytes::Bytes;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use dataplant_error::{DupError, DupResult};
use dataplant_models::DeviceId;
use dataplant_storage::DataStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

struct DeviceEntry {
    tracker: MessageTracker,
    updater: Mutex<UpdaterHandle>,
}

pub struct DeviceRegistry {
    store: Arc<dyn DataStore>,
    triggers_handler: TriggersHandler,
    session: Arc<dyn ClientSessionBridge>,
    mailbox_capacity: usize,
    entries: DashMap<(String, DeviceId), Arc<DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<dyn DataStore>,
        triggers_handler: TriggersHandler,
        session: Arc<dyn ClientSessionBridge>,
        mailbox_capacity: usize,
    ) -> Self {
        DeviceRegistry {
            store,
            triggers_handler,
            session,
            mailbox_capacity,
            entries: DashMap::new(),
        }
    }

    /// Track one broker delivery and post it to the device actor,
    /// respawning the actor if it died since the last delivery.
    pub async fn deliver(
        &self,
        realm: &str,
        device: DeviceId,
        acknowledger: &Arc<dyn Acknowledger>,
        message_id: Bytes,
        delivery_tag: DeliveryTag,
        msg: UpdaterMessage,
    ) -> DupResult<()> {
        let entry = self.get_or_create(realm, device, acknowledger).await?;
        entry.tracker.track_delivery(message_id, delivery_tag)?;

        let mut updater = entry.updater.lock().await;
        if updater.is_closed() {
            *updater = self.respawn(realm, device, &entry.tracker).await?;
        }
        match updater.send(msg).await {
            Ok(()) => Ok(()),
            Err(msg) => {
                // Lost the race with an actor abort; one respawn is enough
                // because we hold the entry lock.
                *updater = self.respawn(realm, device, &entry.tracker).await?;
                updater
                    .send(*msg)
                    .await
                    .map_err(|_| DupError::ActorUnavailable)
            }
        }
    }

    /// Route a volatile-trigger installation to a live device actor.
    pub async fn install_volatile_trigger(
        &self,
        realm: &str,
        device: DeviceId,
        trigger: VolatileTrigger,
    ) -> DupResult<()> {
        let entry = self
            .entries
            .get(&(realm.to_string(), device))
            .map(|e| e.value().clone())
            .ok_or(DupError::ActorUnavailable)?;
        let updater = entry.updater.lock().await.clone();
        updater.install_volatile_trigger(trigger).await
    }

    pub async fn delete_volatile_trigger(
        &self,
        realm: &str,
        device: DeviceId,
        trigger_id: Uuid,
    ) -> DupResult<()> {
        let entry = self
            .entries
            .get(&(realm.to_string(), device))
            .map(|e| e.value().clone())
            .ok_or(DupError::ActorUnavailable)?;
        let updater = entry.updater.lock().await.clone();
        updater.delete_volatile_trigger(trigger_id).await
    }

    async fn get_or_create(
        &self,
        realm: &str,
        device: DeviceId,
        acknowledger: &Arc<dyn Acknowledger>,
    ) -> DupResult<Arc<DeviceEntry>> {
        let key = (realm.to_string(), device);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.value().clone());
        }

        let tracker = MessageTracker::spawn(acknowledger.clone());
        let updater = self.respawn(realm, device, &tracker).await?;
        let entry = Arc::new(DeviceEntry {
            tracker,
            updater: Mutex::new(updater),
        });

        match self.entries.entry(key) {
            DashEntry::Occupied(existing) => {
                // Lost a spawn race; the spare pair shuts itself down when
                // its handles drop here.
                Ok(existing.get().clone())
            }
            DashEntry::Vacant(slot) => {
                info!(realm, device = %device, "device entry created");
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    async fn respawn(
        &self,
        realm: &str,
        device: DeviceId,
        tracker: &MessageTracker,
    ) -> DupResult<UpdaterHandle> {
        DataUpdater::spawn(
            realm.to_string(),
            device,
            self.store.clone(),
            tracker.clone(),
            self.triggers_handler.clone(),
            self.session.clone(),
            self.mailbox_capacity,
        )
        .await
    }
}

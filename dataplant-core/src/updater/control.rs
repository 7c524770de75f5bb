//! Control-channel handling: producer-properties pruning and the
//! `/emptyCache` resend protocol.

use super::actor::{DataUpdater, Settle};
use super::publish_err;
use crate::payload::{
    decode_device_properties_payload, encode_bson_value, encode_properties_payload,
};
use dataplant_error::message::MessageError;
use dataplant_models::interface::{InterfaceType, Ownership};
use dataplant_models::triggers::DataTriggerType;
use dataplant_models::Timestamp;
use dataplant_storage::Consistency;
use tracing::{info, warn};

impl DataUpdater {
    pub(super) async fn do_handle_control(
        &mut self,
        path: &str,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<Settle, MessageError> {
        match path {
            "/producer/properties" => {
                self.prune_device_properties(payload, timestamp).await?;
                Ok(Settle::Ack)
            }
            "/emptyCache" => {
                self.handle_empty_cache().await?;
                Ok(Settle::Ack)
            }
            other => {
                warn!(
                    realm = %self.state.realm,
                    device = %self.state.device,
                    control_path = other,
                    "unexpected control path, discarding"
                );
                Ok(Settle::Discard)
            }
        }
    }

    /// Delete every device-owned stored property the device no longer
    /// lists, emitting `path_removed` for each.
    async fn prune_device_properties(
        &mut self,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), MessageError> {
        let keep = decode_device_properties_payload(payload)
            .map_err(|_| MessageError::InvalidProperties)?;
        let ts_ms = timestamp.as_millis();

        let interfaces: Vec<String> = self.state.introspection.keys().cloned().collect();
        for name in interfaces {
            let descriptor = match self.resolve_interface(&name).await {
                Ok(descriptor) => descriptor,
                Err(MessageError::DatabaseError(e)) => {
                    return Err(MessageError::DatabaseError(e));
                }
                Err(e) => {
                    warn!(
                        interface = %name,
                        error = %e,
                        "skipping unloadable interface during prune"
                    );
                    continue;
                }
            };
            if descriptor.interface_type != InterfaceType::Properties
                || descriptor.ownership != Ownership::Device
            {
                continue;
            }

            let stored = self
                .store
                .fetch_property_paths(&self.state.realm, &self.state.device, &descriptor)
                .await?;
            for (endpoint_id, path) in stored {
                if keep.contains(&(name.clone(), path.clone())) {
                    continue;
                }
                self.store
                    .delete_property(
                        &self.state.realm,
                        &self.state.device,
                        &descriptor,
                        endpoint_id,
                        &path,
                        Consistency::Quorum,
                    )
                    .await?;
                let targets = self.state.triggers.matching_data_targets(
                    DataTriggerType::PathRemoved,
                    descriptor.interface_id,
                    endpoint_id,
                    &path,
                    None,
                );
                self.triggers_handler
                    .path_removed(
                        &targets,
                        &self.state.realm,
                        &self.state.device,
                        &name,
                        &path,
                        ts_ms,
                    )
                    .await
                    .map_err(publish_err)?;
            }
        }
        Ok(())
    }

    /// `/emptyCache`: ship the device the full server-owned property state,
    /// then clear the pending flag.
    async fn handle_empty_cache(&mut self) -> Result<(), MessageError> {
        let topic_base = format!("{}/{}", self.state.realm, self.state.device);

        let mut all_paths = Vec::new();
        let mut resend = Vec::new();
        let interfaces: Vec<String> = self.state.introspection.keys().cloned().collect();
        for name in interfaces {
            let descriptor = match self.resolve_interface(&name).await {
                Ok(descriptor) => descriptor,
                Err(MessageError::DatabaseError(e)) => {
                    return Err(MessageError::DatabaseError(e));
                }
                Err(e) => {
                    warn!(
                        interface = %name,
                        error = %e,
                        "skipping unloadable interface during empty cache"
                    );
                    continue;
                }
            };
            if descriptor.interface_type != InterfaceType::Properties
                || descriptor.ownership != Ownership::Server
            {
                continue;
            }
            for (path, value) in self
                .store
                .fetch_property_values(&self.state.realm, &self.state.device, &descriptor)
                .await?
            {
                all_paths.push(format!("{name}{path}"));
                resend.push((name.clone(), path, value));
            }
        }

        // The consumer-properties list always goes out, even when empty,
        // so the device can drop stale server-owned state.
        let control_payload = encode_properties_payload(&all_paths.join(";"));
        let control_topic = format!("{topic_base}/control/consumer/properties");
        if let Err(e) = self.session.publish(&control_topic, control_payload, 2).await {
            warn!(
                realm = %self.state.realm,
                device = %self.state.device,
                error = %e,
                "failed to send consumer properties list"
            );
        }

        for (interface, path, value) in resend {
            let topic = format!("{topic_base}/{interface}{path}");
            if let Err(e) = self
                .session
                .publish(&topic, encode_bson_value(Some(&value)), 2)
                .await
            {
                warn!(
                    realm = %self.state.realm,
                    device = %self.state.device,
                    topic = %topic,
                    error = %e,
                    "failed to resend server property"
                );
            }
        }

        self.store
            .set_pending_empty_cache(&self.state.realm, &self.state.device, false)
            .await?;
        info!(
            realm = %self.state.realm,
            device = %self.state.device,
            properties = all_paths.len(),
            "empty cache served"
        );
        Ok(())
    }
}

//! The data critical path: one published value in, one storage write and a
//! burst of trigger events out.

use super::actor::{DataUpdater, Settle};
use super::publish_err;
use crate::payload::{decode_bson_payload, encode_bson_value};
use bson::Bson;
use dataplant_error::message::MessageError;
use dataplant_models::automaton::ResolvedPath;
use dataplant_models::constants::MAX_VALUE_SIZE;
use dataplant_models::ids;
use dataplant_models::interface::{
    Aggregation, InterfaceDescriptor, InterfaceType, Mapping, Ownership, Reliability, Retention,
    StorageType,
};
use dataplant_models::triggers::DataTriggerType;
use dataplant_models::Timestamp;
use dataplant_storage::{Consistency, PathExpiry};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Consistency for the value write, by interface kind and mapping QoS.
fn insert_consistency(descriptor: &InterfaceDescriptor, mapping: &Mapping) -> Consistency {
    if descriptor.interface_type == InterfaceType::Properties {
        Consistency::Quorum
    } else if mapping.reliability == Reliability::Guaranteed
        && mapping.retention == Retention::Stored
    {
        Consistency::LocalQuorum
    } else if mapping.reliability == Reliability::Unreliable {
        Consistency::Any
    } else {
        Consistency::One
    }
}

/// Consistency for the path-registry write.
fn path_consistency(mapping: &Mapping) -> Consistency {
    if mapping.reliability == Reliability::Unreliable {
        Consistency::One
    } else {
        Consistency::LocalQuorum
    }
}

fn path_depth(path: &str) -> usize {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .count()
}

impl DataUpdater {
    pub(super) async fn do_handle_data(
        &mut self,
        interface_name: &str,
        path: &str,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<Settle, MessageError> {
        if path.contains("//") {
            return Err(MessageError::InvalidPath {
                path: path.to_string(),
            });
        }

        let descriptor = self.resolve_interface(interface_name).await?;

        if descriptor.ownership == Ownership::Server {
            return Err(MessageError::CannotWriteOnServerOwnedInterface {
                interface: interface_name.to_string(),
            });
        }

        let (endpoint_id, mapping, guessed) = self.resolve_endpoint(&descriptor, path)?;

        if payload.len() > MAX_VALUE_SIZE {
            return Err(MessageError::ValueSizeExceeded {
                interface: interface_name.to_string(),
                path: path.to_string(),
                size: payload.len(),
            });
        }
        let decoded =
            decode_bson_payload(payload).map_err(|_| MessageError::UndecodableBsonPayload {
                interface: interface_name.to_string(),
                path: path.to_string(),
            })?;
        let value = decoded.value;

        if let Some(v) = &value {
            self.check_value_type(&descriptor, &mapping, guessed.as_deref(), path, v)?;
        }

        let reception_ms = timestamp.as_millis();
        let value_timestamp_ms = if mapping.explicit_timestamp {
            decoded.timestamp_ms.unwrap_or(reception_ms)
        } else {
            reception_ms
        };

        // Incoming-data triggers fire before any storage side effect, in
        // any-interface -> any-endpoint -> specific order.
        let targets = self.state.triggers.matching_data_targets(
            DataTriggerType::IncomingData,
            descriptor.interface_id,
            endpoint_id,
            path,
            value.as_ref(),
        );
        self.triggers_handler
            .incoming_data(
                &targets,
                &self.state.realm,
                &self.state.device,
                interface_name,
                path,
                encode_bson_value(value.as_ref()),
                value_timestamp_ms,
            )
            .await
            .map_err(publish_err)?;

        // Change triggers look at the stored property value; reading it is
        // only worth a round trip when one of the value-observing triggers
        // could fire.
        let is_properties = descriptor.interface_type == InterfaceType::Properties;
        let wants_previous = is_properties
            && [
                DataTriggerType::ValueChange,
                DataTriggerType::ValueChangeApplied,
                DataTriggerType::PathCreated,
            ]
            .iter()
            .any(|t| {
                self.state.triggers.has_data_triggers(
                    *t,
                    descriptor.interface_id,
                    endpoint_id,
                    path,
                )
            });
        let previous = if wants_previous {
            self.store
                .fetch_property(
                    &self.state.realm,
                    &self.state.device,
                    &descriptor,
                    &mapping,
                    path,
                )
                .await?
        } else {
            None
        };

        if is_properties && previous != value {
            let targets = self.state.triggers.matching_data_targets(
                DataTriggerType::ValueChange,
                descriptor.interface_id,
                endpoint_id,
                path,
                value.as_ref(),
            );
            self.triggers_handler
                .value_change(
                    &targets,
                    &self.state.realm,
                    &self.state.device,
                    interface_name,
                    path,
                    encode_bson_value(previous.as_ref()),
                    encode_bson_value(value.as_ref()),
                    value_timestamp_ms,
                )
                .await
                .map_err(publish_err)?;
        }

        let is_datastream = descriptor.interface_type == InterfaceType::Datastream;
        if is_datastream {
            if value.is_none() {
                warn!(
                    realm = %self.state.realm,
                    device = %self.state.device,
                    interface = interface_name,
                    path,
                    "unset value on a datastream path, discarding"
                );
                return Ok(Settle::Discard);
            }
            self.ensure_path_registered(&descriptor, &mapping, endpoint_id, path, value_timestamp_ms)
                .await?;
        }

        match descriptor.storage_type {
            StorageType::MultiInterfaceIndividualPropertiesDbTable => match &value {
                Some(v) => {
                    self.store
                        .insert_property(
                            &self.state.realm,
                            &self.state.device,
                            &descriptor,
                            &mapping,
                            path,
                            timestamp,
                            v,
                            insert_consistency(&descriptor, &mapping),
                        )
                        .await?;
                }
                None => {
                    if !mapping.allow_unset {
                        return Err(MessageError::UnexpectedValueType {
                            interface: interface_name.to_string(),
                            path: path.to_string(),
                            expected: "a value on a mapping without allow_unset".to_string(),
                        });
                    }
                    self.store
                        .delete_property(
                            &self.state.realm,
                            &self.state.device,
                            &descriptor,
                            mapping.endpoint_id,
                            path,
                            insert_consistency(&descriptor, &mapping),
                        )
                        .await?;
                }
            },
            StorageType::MultiInterfaceIndividualDatastreamDbTable => {
                let Some(v) = &value else {
                    return Ok(Settle::Discard);
                };
                self.store
                    .insert_individual_datastream(
                        &self.state.realm,
                        &self.state.device,
                        &descriptor,
                        &mapping,
                        path,
                        v,
                        value_timestamp_ms,
                        timestamp,
                        self.state.datastream_maximum_storage_retention,
                        insert_consistency(&descriptor, &mapping),
                    )
                    .await?;
            }
            StorageType::OneObjectDatastreamDbTable => {
                let Some(Bson::Document(doc)) = &value else {
                    return Ok(Settle::Discard);
                };
                let guessed = guessed.as_deref().unwrap_or(&[]);
                let mut columns = Vec::with_capacity(doc.len());
                for (key, v) in doc {
                    let known = guessed
                        .iter()
                        .filter_map(|id| self.state.mappings.get(id))
                        .any(|m| m.last_segment() == key);
                    if known {
                        columns.push((ids::endpoint_to_db_column_name(key), v.clone()));
                    } else {
                        warn!(
                            interface = interface_name,
                            key, "unknown object key, skipping column"
                        );
                    }
                }
                let explicit_ts = mapping.explicit_timestamp.then_some(value_timestamp_ms);
                self.store
                    .insert_object_datastream(
                        &self.state.realm,
                        &self.state.device,
                        &descriptor,
                        path,
                        &columns,
                        explicit_ts,
                        timestamp,
                        self.state.datastream_maximum_storage_retention,
                        insert_consistency(&descriptor, &mapping),
                    )
                    .await?;
            }
        }

        if is_properties {
            if previous.is_none() && value.is_some() {
                let targets = self.state.triggers.matching_data_targets(
                    DataTriggerType::PathCreated,
                    descriptor.interface_id,
                    endpoint_id,
                    path,
                    value.as_ref(),
                );
                self.triggers_handler
                    .path_created(
                        &targets,
                        &self.state.realm,
                        &self.state.device,
                        interface_name,
                        path,
                        encode_bson_value(value.as_ref()),
                        value_timestamp_ms,
                    )
                    .await
                    .map_err(publish_err)?;
            }
            if previous.is_some() && value.is_none() {
                let targets = self.state.triggers.matching_data_targets(
                    DataTriggerType::PathRemoved,
                    descriptor.interface_id,
                    endpoint_id,
                    path,
                    None,
                );
                self.triggers_handler
                    .path_removed(
                        &targets,
                        &self.state.realm,
                        &self.state.device,
                        interface_name,
                        path,
                        value_timestamp_ms,
                    )
                    .await
                    .map_err(publish_err)?;
            }
            if previous != value {
                let targets = self.state.triggers.matching_data_targets(
                    DataTriggerType::ValueChangeApplied,
                    descriptor.interface_id,
                    endpoint_id,
                    path,
                    value.as_ref(),
                );
                self.triggers_handler
                    .value_change_applied(
                        &targets,
                        &self.state.realm,
                        &self.state.device,
                        interface_name,
                        path,
                        encode_bson_value(previous.as_ref()),
                        encode_bson_value(value.as_ref()),
                        value_timestamp_ms,
                    )
                    .await
                    .map_err(publish_err)?;
            }
        }

        if is_datastream {
            let ttl = self
                .state
                .datastream_maximum_storage_retention
                .map(|secs| Duration::from_secs(secs.max(0) as u64));
            self.state.paths_cache_put(interface_name, path, ttl);
        }

        Ok(Settle::Ack)
    }

    /// Resolve the published path to its endpoint.
    ///
    /// Individual aggregation wants an exact endpoint; object aggregation
    /// publishes one level above its leaves, so the automaton must guess
    /// and every guessed endpoint must sit exactly one segment deeper.
    fn resolve_endpoint(
        &self,
        descriptor: &Arc<InterfaceDescriptor>,
        path: &str,
    ) -> Result<(Uuid, Mapping, Option<Vec<Uuid>>), MessageError> {
        match descriptor.aggregation {
            Aggregation::Individual => match descriptor.automaton.resolve(path) {
                ResolvedPath::Exact(endpoint_id) => {
                    let mapping = self
                        .state
                        .mappings
                        .get(&endpoint_id)
                        .cloned()
                        .ok_or_else(|| MessageError::MappingNotFound {
                            interface: descriptor.name.clone(),
                            path: path.to_string(),
                        })?;
                    Ok((endpoint_id, mapping, None))
                }
                _ => Err(MessageError::MappingNotFound {
                    interface: descriptor.name.clone(),
                    path: path.to_string(),
                }),
            },
            Aggregation::Object => match descriptor.automaton.resolve(path) {
                ResolvedPath::Guessed(guessed) => {
                    let expected_depth = path_depth(path) + 1;
                    let all_leaves = guessed.iter().all(|id| {
                        descriptor.automaton.endpoint_depth(*id) == Some(expected_depth)
                    });
                    if !all_leaves {
                        return Err(MessageError::GuessedEndpoints {
                            interface: descriptor.name.clone(),
                            path: path.to_string(),
                        });
                    }
                    let mapping = guessed
                        .iter()
                        .filter_map(|id| self.state.mappings.get(id))
                        .next()
                        .cloned()
                        .ok_or_else(|| MessageError::MappingNotFound {
                            interface: descriptor.name.clone(),
                            path: path.to_string(),
                        })?;
                    let endpoint_id =
                        ids::endpoint_id(&descriptor.name, descriptor.major_version, "");
                    Ok((endpoint_id, mapping, Some(guessed)))
                }
                ResolvedPath::Exact(_) => Err(MessageError::GuessedEndpoints {
                    interface: descriptor.name.clone(),
                    path: path.to_string(),
                }),
                ResolvedPath::NotFound => Err(MessageError::MappingNotFound {
                    interface: descriptor.name.clone(),
                    path: path.to_string(),
                }),
            },
        }
    }

    fn check_value_type(
        &self,
        descriptor: &Arc<InterfaceDescriptor>,
        mapping: &Mapping,
        guessed: Option<&[Uuid]>,
        path: &str,
        value: &Bson,
    ) -> Result<(), MessageError> {
        match guessed {
            None => {
                if !mapping.value_type.conforms(value) {
                    return Err(MessageError::UnexpectedValueType {
                        interface: descriptor.name.clone(),
                        path: path.to_string(),
                        expected: format!("{:?}", mapping.value_type),
                    });
                }
            }
            Some(guessed) => {
                let Bson::Document(doc) = value else {
                    return Err(MessageError::UnexpectedValueType {
                        interface: descriptor.name.clone(),
                        path: path.to_string(),
                        expected: "an aggregated object".to_string(),
                    });
                };
                for (key, v) in doc {
                    let leaf = guessed
                        .iter()
                        .filter_map(|id| self.state.mappings.get(id))
                        .find(|m| m.last_segment() == key)
                        .ok_or_else(|| MessageError::UnexpectedObjectKey {
                            interface: descriptor.name.clone(),
                            path: path.to_string(),
                            key: key.clone(),
                        })?;
                    if !leaf.value_type.conforms(v) {
                        return Err(MessageError::UnexpectedValueType {
                            interface: descriptor.name.clone(),
                            path: path.to_string(),
                            expected: format!("{:?}", leaf.value_type),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Keep the datastream path registry warm: skip when the paths cache
    /// knows the path, re-register when the stored row is missing or too
    /// close to its expiry.
    async fn ensure_path_registered(
        &mut self,
        descriptor: &Arc<InterfaceDescriptor>,
        mapping: &Mapping,
        endpoint_id: Uuid,
        path: &str,
        value_timestamp_ms: i64,
    ) -> Result<(), MessageError> {
        if self.state.paths_cache_contains(&descriptor.name, path) {
            return Ok(());
        }

        let retention = self.state.datastream_maximum_storage_retention;
        let expiry = self
            .store
            .fetch_path_expiry(&self.state.realm, &self.state.device, descriptor, path)
            .await?;

        let now_secs = Timestamp::now().as_secs();
        let still_valid = match expiry {
            Some(PathExpiry::Never) => true,
            Some(PathExpiry::At(at)) => now_secs + retention.unwrap_or(0) + 3600 < at,
            None => false,
        };

        if !still_valid {
            let ttl = retention.map(|t| 2 * t + t / 2);
            self.store
                .register_path(
                    &self.state.realm,
                    &self.state.device,
                    descriptor,
                    endpoint_id,
                    path,
                    value_timestamp_ms,
                    ttl,
                    path_consistency(mapping),
                )
                .await?;
        }
        Ok(())
    }
}

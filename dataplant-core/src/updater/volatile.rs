//! Runtime-installed triggers. They live only in actor memory and are
//! re-applied whenever the tables they landed in are rebuilt.

use super::actor::DataUpdater;
use crate::triggers::VolatileTrigger;
use dataplant_error::message::MessageError;
use dataplant_error::{DupError, DupResult};
use dataplant_models::triggers::SimpleTrigger;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

impl DataUpdater {
    pub(super) async fn do_install_volatile_trigger(
        &mut self,
        trigger: VolatileTrigger,
    ) -> DupResult<()> {
        match &trigger.row.trigger {
            SimpleTrigger::Data {
                interface_name,
                interface_major,
                ..
            } if interface_name != "*" => {
                // Validation needs the interface schema. Prefer the loaded
                // descriptor; an interface the device never declared is
                // still a valid scope, so fall back to the schema table
                // without caching it.
                let (descriptor, cached) = match self.resolve_interface(interface_name).await {
                    Ok(descriptor) => (descriptor, true),
                    Err(MessageError::DatabaseError(e)) => {
                        return Err(DupError::StorageError(e));
                    }
                    Err(_) => {
                        let (descriptor, _mappings) = self
                            .store
                            .fetch_interface(&self.state.realm, interface_name, *interface_major)
                            .await
                            .map_err(DupError::from)?
                            .ok_or_else(|| {
                                DupError::InvalidTrigger(format!(
                                    "unknown interface {interface_name} v{interface_major}"
                                ))
                            })?;
                        (Arc::new(descriptor), false)
                    }
                };
                if !cached {
                    // Only validate; the compiled entry activates once the
                    // interface is actually declared and loaded.
                    let mut scratch = crate::triggers::TriggerTables::default();
                    scratch
                        .install_row(&trigger.row, Some(&descriptor))
                        .map_err(|e| DupError::InvalidTrigger(e.to_string()))?;
                } else {
                    self.state
                        .triggers
                        .install_row(&trigger.row, Some(&descriptor))
                        .map_err(|e| DupError::InvalidTrigger(e.to_string()))?;
                }
            }
            _ => {
                self.state
                    .triggers
                    .install_row(&trigger.row, None)
                    .map_err(|e| DupError::InvalidTrigger(e.to_string()))?;
            }
        }

        info!(
            realm = %self.state.realm,
            device = %self.state.device,
            trigger = %trigger.row.simple_trigger_id,
            "volatile trigger installed"
        );
        self.state.triggers.volatile.push(trigger);
        Ok(())
    }

    pub(super) fn do_delete_volatile_trigger(&mut self, trigger_id: Uuid) -> DupResult<()> {
        let before = self.state.triggers.volatile.len();
        self.state
            .triggers
            .volatile
            .retain(|v| v.row.simple_trigger_id != trigger_id);
        let found_volatile = self.state.triggers.volatile.len() != before;
        let found_compiled = self.state.triggers.remove_target(trigger_id);

        if found_volatile || found_compiled {
            info!(
                realm = %self.state.realm,
                device = %self.state.device,
                trigger = %trigger_id,
                "volatile trigger removed"
            );
            Ok(())
        } else {
            Err(DupError::TriggerNotFound(trigger_id))
        }
    }
}

//! Introspection handling: diff the declared interface inventory and keep
//! the device row, caches, and trigger tables in line with it.

use super::actor::DataUpdater;
use super::publish_err;
use crate::payload::parse_introspection;
use dataplant_error::message::MessageError;
use dataplant_models::ids;
use dataplant_models::triggers::{IntrospectionTriggerType, TriggerObjectType};
use dataplant_models::Timestamp;
use std::collections::HashMap;
use tracing::info;

/// Diff two sorted `(name, major)` sequences into insertions and
/// deletions. A major bump shows up as one deletion plus one insertion.
fn diff_sorted_pairs(
    prev: &[(String, i32)],
    new: &[(String, i32)],
) -> (Vec<(String, i32)>, Vec<(String, i32)>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < prev.len() && j < new.len() {
        match prev[i].cmp(&new[j]) {
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                removed.push(prev[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(new[j].clone());
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&prev[i..]);
    added.extend_from_slice(&new[j..]);
    (added, removed)
}

impl DataUpdater {
    pub(super) async fn do_handle_introspection(
        &mut self,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), MessageError> {
        let entries =
            parse_introspection(payload).map_err(|_| MessageError::InvalidIntrospection)?;
        let payload_str =
            std::str::from_utf8(payload).map_err(|_| MessageError::InvalidIntrospection)?;

        let mut intro_new = HashMap::with_capacity(entries.len());
        let mut minor_new = HashMap::with_capacity(entries.len());
        for entry in &entries {
            intro_new.insert(entry.name.clone(), entry.major);
            minor_new.insert(entry.name.clone(), entry.minor);
        }
        let ts_ms = timestamp.as_millis();

        let targets = self
            .state
            .triggers
            .introspection_targets(IntrospectionTriggerType::IncomingIntrospection, None);
        self.triggers_handler
            .incoming_introspection(
                &targets,
                &self.state.realm,
                &self.state.device,
                payload_str,
                ts_ms,
            )
            .await
            .map_err(publish_err)?;

        let mut prev_pairs: Vec<(String, i32)> = self
            .state
            .introspection
            .iter()
            .map(|(name, major)| (name.clone(), *major))
            .collect();
        prev_pairs.sort();
        let mut new_pairs: Vec<(String, i32)> = intro_new
            .iter()
            .map(|(name, major)| (name.clone(), *major))
            .collect();
        new_pairs.sort();
        let (added, removed) = diff_sorted_pairs(&prev_pairs, &new_pairs);

        for (name, major) in &added {
            let minor = minor_new.get(name).copied().unwrap_or(0);
            let targets = self
                .state
                .triggers
                .introspection_targets(IntrospectionTriggerType::InterfaceAdded, Some(name));
            self.triggers_handler
                .interface_added(
                    &targets,
                    &self.state.realm,
                    &self.state.device,
                    name,
                    *major,
                    minor,
                    ts_ms,
                )
                .await
                .map_err(publish_err)?;
            if *major == 0 {
                self.store
                    .register_device_with_interface(
                        &self.state.realm,
                        &self.state.device,
                        name,
                        *major,
                    )
                    .await?;
            }
        }

        for (name, major) in &removed {
            let targets = self
                .state
                .triggers
                .introspection_targets(IntrospectionTriggerType::InterfaceRemoved, Some(name));
            self.triggers_handler
                .interface_removed(
                    &targets,
                    &self.state.realm,
                    &self.state.device,
                    name,
                    *major,
                    ts_ms,
                )
                .await
                .map_err(publish_err)?;
            if *major == 0 {
                self.store
                    .unregister_device_with_interface(
                        &self.state.realm,
                        &self.state.device,
                        name,
                        *major,
                    )
                    .await?;
            }
        }

        // Removed interfaces move into the old-introspection bag;
        // re-declared ones leave it.
        let removed_entries: HashMap<(String, i32), i32> = removed
            .iter()
            .map(|(name, major)| {
                let minor = self
                    .state
                    .introspection_minor
                    .get(name)
                    .copied()
                    .unwrap_or(0);
                ((name.clone(), *major), minor)
            })
            .collect();
        if !removed_entries.is_empty() {
            self.store
                .merge_old_introspection(&self.state.realm, &self.state.device, &removed_entries)
                .await?;
        }
        if !added.is_empty() {
            self.store
                .remove_old_introspection_entries(&self.state.realm, &self.state.device, &added)
                .await?;
        }
        self.store
            .update_introspection(&self.state.realm, &self.state.device, &intro_new, &minor_new)
            .await?;

        for (name, major) in &removed {
            self.state.forget_interface(name);
            let interface_id = ids::interface_id(name, *major);
            self.state.triggers.volatile.retain(|v| {
                !(v.object_type == TriggerObjectType::Interface && v.object_id == interface_id)
            });
        }
        self.state.reset_paths_cache();
        self.state.introspection = intro_new;
        self.state.introspection_minor = minor_new;

        info!(
            realm = %self.state.realm,
            device = %self.state.device,
            interfaces = self.state.introspection.len(),
            added = added.len(),
            removed = removed.len(),
            "introspection updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(input: &[(&str, i32)]) -> Vec<(String, i32)> {
        input.iter().map(|(n, m)| (n.to_string(), *m)).collect()
    }

    #[test]
    fn diff_detects_add_and_remove() {
        let prev = pairs(&[("A", 1), ("B", 2)]);
        let new = pairs(&[("A", 1), ("C", 1)]);
        let (added, removed) = diff_sorted_pairs(&prev, &new);
        assert_eq!(added, pairs(&[("C", 1)]));
        assert_eq!(removed, pairs(&[("B", 2)]));
    }

    #[test]
    fn major_bump_is_remove_plus_add() {
        let prev = pairs(&[("A", 1)]);
        let new = pairs(&[("A", 2)]);
        let (added, removed) = diff_sorted_pairs(&prev, &new);
        assert_eq!(added, pairs(&[("A", 2)]));
        assert_eq!(removed, pairs(&[("A", 1)]));
    }

    #[test]
    fn identical_inventories_diff_empty() {
        let prev = pairs(&[("A", 1), ("B", 1)]);
        let (added, removed) = diff_sorted_pairs(&prev, &prev);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}

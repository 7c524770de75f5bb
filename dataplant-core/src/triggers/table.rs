//! Compiled trigger tables held by each device actor.

use crate::triggers::matcher::{path_matches, value_matches};
use bson::Bson;
use dataplant_models::triggers::{
    DataTrigger, DataTriggerType, DeviceTriggerType, InterfaceMatch, IntrospectionTriggerType,
    PathMatch, SimpleTrigger, SimpleTriggerRow, TriggerObjectType, TriggerTarget,
};
use dataplant_models::InterfaceDescriptor;
use dataplant_models::Aggregation;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TriggerCompileError {
    #[error("match path {path} does not resolve to an endpoint of {interface}")]
    NoMatchingEndpoint { interface: String, path: String },
    #[error("data triggers on object aggregated interfaces cannot match a specific path")]
    ObjectAggregationPath,
    #[error("interface {0} is required to compile this trigger")]
    MissingInterface(String),
}

/// Endpoint scope of a compiled data trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointMatch {
    Id(Uuid),
    Any,
}

/// Key of one data-trigger table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataTriggerKey {
    pub trigger_type: DataTriggerType,
    pub interface: InterfaceMatch,
    pub endpoint: EndpointMatch,
}

/// A runtime-installed trigger, kept so tables can be rebuilt after
/// refreshes and interface reloads.
#[derive(Clone, Debug)]
pub struct VolatileTrigger {
    pub object_id: Uuid,
    pub object_type: TriggerObjectType,
    pub row: SimpleTriggerRow,
}

#[derive(Default)]
pub struct TriggerTables {
    data: HashMap<DataTriggerKey, Vec<DataTrigger>>,
    device: HashMap<DeviceTriggerType, Vec<TriggerTarget>>,
    introspection: HashMap<(IntrospectionTriggerType, Option<String>), Vec<TriggerTarget>>,
    pub volatile: Vec<VolatileTrigger>,
}

impl TriggerTables {
    /// Compile one stored row into the tables.
    ///
    /// Data triggers scoped to a concrete interface need its loaded
    /// descriptor to resolve the match path; `interface` may be `None` for
    /// every other shape.
    pub fn install_row(
        &mut self,
        row: &SimpleTriggerRow,
        interface: Option<&InterfaceDescriptor>,
    ) -> Result<(), TriggerCompileError> {
        match &row.trigger {
            SimpleTrigger::Data {
                trigger_type,
                interface_name,
                interface_major: _,
                match_path,
                value_match_operator,
                known_value,
            } => {
                let (key, path_match) = if interface_name == "*" {
                    (
                        DataTriggerKey {
                            trigger_type: *trigger_type,
                            interface: InterfaceMatch::Any,
                            endpoint: EndpointMatch::Any,
                        },
                        PathMatch::Any,
                    )
                } else {
                    let descriptor = interface.ok_or_else(|| {
                        TriggerCompileError::MissingInterface(interface_name.clone())
                    })?;
                    let path_match = PathMatch::compile(match_path);
                    match &path_match {
                        PathMatch::Any => (
                            DataTriggerKey {
                                trigger_type: *trigger_type,
                                interface: InterfaceMatch::Id(descriptor.interface_id),
                                endpoint: EndpointMatch::Any,
                            },
                            PathMatch::Any,
                        ),
                        PathMatch::Tokens(tokens) => {
                            if descriptor.aggregation == Aggregation::Object {
                                return Err(TriggerCompileError::ObjectAggregationPath);
                            }
                            let endpoint_id = descriptor
                                .automaton
                                .match_endpoint(tokens)
                                .ok_or_else(|| TriggerCompileError::NoMatchingEndpoint {
                                    interface: interface_name.clone(),
                                    path: match_path.clone(),
                                })?;
                            (
                                DataTriggerKey {
                                    trigger_type: *trigger_type,
                                    interface: InterfaceMatch::Id(descriptor.interface_id),
                                    endpoint: EndpointMatch::Id(endpoint_id),
                                },
                                path_match,
                            )
                        }
                    }
                };

                let trigger = DataTrigger {
                    trigger_type: *trigger_type,
                    interface_match: key.interface,
                    path_match,
                    value_match_operator: *value_match_operator,
                    known_value: known_value.clone(),
                    targets: vec![row.target()],
                };
                self.add_data_trigger(key, trigger);
            }
            SimpleTrigger::Device { event } => {
                push_target(self.device.entry(*event).or_default(), row.target());
            }
            SimpleTrigger::Introspection {
                event,
                interface_name,
            } => {
                push_target(
                    self.introspection
                        .entry((*event, interface_name.clone()))
                        .or_default(),
                    row.target(),
                );
            }
        }
        Ok(())
    }

    fn add_data_trigger(&mut self, key: DataTriggerKey, trigger: DataTrigger) {
        let entry = self.data.entry(key).or_default();
        for existing in entry.iter_mut() {
            if existing.are_congruent(&trigger) {
                existing.merge_targets(trigger);
                return;
            }
        }
        entry.push(trigger);
    }

    /// Remove every target installed by `simple_trigger_id`. Returns true
    /// when at least one target was removed.
    pub fn remove_target(&mut self, simple_trigger_id: Uuid) -> bool {
        let mut found = false;
        for triggers in self.data.values_mut() {
            for trigger in triggers.iter_mut() {
                let before = trigger.targets.len();
                trigger
                    .targets
                    .retain(|t| t.simple_trigger_id != simple_trigger_id);
                found |= trigger.targets.len() != before;
            }
            triggers.retain(|t| !t.targets.is_empty());
        }
        self.data.retain(|_, triggers| !triggers.is_empty());

        for targets in self.device.values_mut() {
            let before = targets.len();
            targets.retain(|t| t.simple_trigger_id != simple_trigger_id);
            found |= targets.len() != before;
        }
        self.device.retain(|_, targets| !targets.is_empty());

        for targets in self.introspection.values_mut() {
            let before = targets.len();
            targets.retain(|t| t.simple_trigger_id != simple_trigger_id);
            found |= targets.len() != before;
        }
        self.introspection.retain(|_, targets| !targets.is_empty());

        found
    }

    /// Drop every data-trigger entry keyed by `interface_id`.
    pub fn forget_interface(&mut self, interface_id: Uuid) {
        self.data
            .retain(|key, _| key.interface != InterfaceMatch::Id(interface_id));
    }

    /// Drop device-scoped entries before a refresh rebuild: device and
    /// introspection tables plus any-interface data triggers.
    pub fn clear_device_scoped(&mut self) {
        self.device.clear();
        self.introspection.clear();
        self.data
            .retain(|key, _| key.interface != InterfaceMatch::Any);
    }

    pub fn device_targets(&self, event: DeviceTriggerType) -> &[TriggerTarget] {
        self.device.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Targets of an introspection trigger: the any-interface entry plus,
    /// when given, the entry scoped to the concrete interface name.
    pub fn introspection_targets(
        &self,
        event: IntrospectionTriggerType,
        interface_name: Option<&str>,
    ) -> Vec<TriggerTarget> {
        let mut targets = Vec::new();
        if let Some(t) = self.introspection.get(&(event, None)) {
            targets.extend(t.iter().cloned());
        }
        if let Some(name) = interface_name {
            if let Some(t) = self.introspection.get(&(event, Some(name.to_string()))) {
                for target in t {
                    push_target(&mut targets, target.clone());
                }
            }
        }
        targets
    }

    /// Collect the targets of every data trigger matching this value, in
    /// precedence order: any-interface, any-endpoint of the interface, then
    /// the specific endpoint.
    pub fn matching_data_targets(
        &self,
        trigger_type: DataTriggerType,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        value: Option<&Bson>,
    ) -> Vec<TriggerTarget> {
        let keys = [
            DataTriggerKey {
                trigger_type,
                interface: InterfaceMatch::Any,
                endpoint: EndpointMatch::Any,
            },
            DataTriggerKey {
                trigger_type,
                interface: InterfaceMatch::Id(interface_id),
                endpoint: EndpointMatch::Any,
            },
            DataTriggerKey {
                trigger_type,
                interface: InterfaceMatch::Id(interface_id),
                endpoint: EndpointMatch::Id(endpoint_id),
            },
        ];

        let mut targets = Vec::new();
        for key in keys {
            let Some(triggers) = self.data.get(&key) else {
                continue;
            };
            for trigger in triggers {
                if path_matches(&trigger.path_match, path)
                    && value_matches(
                        trigger.value_match_operator,
                        trigger.known_value.as_ref(),
                        value,
                    )
                {
                    for target in &trigger.targets {
                        push_target(&mut targets, target.clone());
                    }
                }
            }
        }
        targets
    }

    /// True when any trigger of this type could fire for the endpoint,
    /// regardless of value. Used to decide whether the previous value must
    /// be read before the write.
    pub fn has_data_triggers(
        &self,
        trigger_type: DataTriggerType,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
    ) -> bool {
        let keys = [
            DataTriggerKey {
                trigger_type,
                interface: InterfaceMatch::Any,
                endpoint: EndpointMatch::Any,
            },
            DataTriggerKey {
                trigger_type,
                interface: InterfaceMatch::Id(interface_id),
                endpoint: EndpointMatch::Any,
            },
            DataTriggerKey {
                trigger_type,
                interface: InterfaceMatch::Id(interface_id),
                endpoint: EndpointMatch::Id(endpoint_id),
            },
        ];
        keys.iter().any(|key| {
            self.data
                .get(key)
                .is_some_and(|triggers| {
                    triggers
                        .iter()
                        .any(|t| path_matches(&t.path_match, path))
                })
        })
    }
}

fn push_target(targets: &mut Vec<TriggerTarget>, target: TriggerTarget) {
    if !targets
        .iter()
        .any(|t| t.simple_trigger_id == target.simple_trigger_id)
    {
        targets.push(target);
    }
}

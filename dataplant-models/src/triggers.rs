use bson::Bson;
use uuid::Uuid;

/// Data-path trigger kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataTriggerType {
    IncomingData,
    ValueChange,
    ValueChangeApplied,
    PathCreated,
    PathRemoved,
}

/// Device lifecycle trigger kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceTriggerType {
    DeviceConnected,
    DeviceDisconnected,
}

/// Introspection trigger kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntrospectionTriggerType {
    IncomingIntrospection,
    InterfaceAdded,
    InterfaceRemoved,
}

/// Operator applied to the incoming value before a data trigger fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueMatchOperator {
    /// Fires on any value; the known value is ignored.
    Any,
    EqualTo,
    NotEqualTo,
    GreaterThan,
    GreaterOrEqualTo,
    LessThan,
    LessOrEqualTo,
}

/// Interface scope of a compiled trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterfaceMatch {
    Id(Uuid),
    Any,
}

/// Path scope of a compiled data trigger.
///
/// Tokens use `""` as a single-segment wildcard, compiled from `%{param}`
/// or `*` segments of the source match path. `/*` compiles to `Any`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathMatch {
    Tokens(Vec<String>),
    Any,
}

impl PathMatch {
    /// Compile a source match path into tokens.
    pub fn compile(match_path: &str) -> PathMatch {
        if match_path == "/*" || match_path == "*" {
            return PathMatch::Any;
        }
        let tokens = match_path
            .strip_prefix('/')
            .unwrap_or(match_path)
            .split('/')
            .map(|segment| {
                if segment == "*" || (segment.starts_with("%{") && segment.ends_with('}')) {
                    String::new()
                } else {
                    segment.to_string()
                }
            })
            .collect();
        PathMatch::Tokens(tokens)
    }
}

/// Where a fired trigger event is delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerTarget {
    pub simple_trigger_id: Uuid,
    pub parent_trigger_id: Uuid,
    pub routing_key: String,
    pub static_headers: Vec<(String, String)>,
}

/// A compiled data trigger as held in the updater's dispatch tables.
#[derive(Clone, Debug)]
pub struct DataTrigger {
    pub trigger_type: DataTriggerType,
    pub interface_match: InterfaceMatch,
    pub path_match: PathMatch,
    pub value_match_operator: ValueMatchOperator,
    pub known_value: Option<Bson>,
    pub targets: Vec<TriggerTarget>,
}

impl DataTrigger {
    /// Two triggers are congruent when they describe the same condition and
    /// differ at most in their targets. Congruent triggers are merged to a
    /// single table entry with the union of targets.
    pub fn are_congruent(&self, other: &DataTrigger) -> bool {
        self.trigger_type == other.trigger_type
            && self.interface_match == other.interface_match
            && self.path_match == other.path_match
            && self.value_match_operator == other.value_match_operator
            && self.known_value == other.known_value
    }

    /// Merge `other`'s targets into this trigger, skipping targets already
    /// present (same simple trigger id).
    pub fn merge_targets(&mut self, other: DataTrigger) {
        for target in other.targets {
            if !self
                .targets
                .iter()
                .any(|t| t.simple_trigger_id == target.simple_trigger_id)
            {
                self.targets.push(target);
            }
        }
    }
}

/// Object scopes a simple trigger can be installed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerObjectType {
    Device,
    Interface,
    AnyInterface,
    AnyDevice,
}

/// The condition part of a stored simple trigger, before compilation.
#[derive(Clone, Debug)]
pub enum SimpleTrigger {
    Data {
        trigger_type: DataTriggerType,
        /// `*` scopes the trigger to any interface.
        interface_name: String,
        interface_major: i32,
        match_path: String,
        value_match_operator: ValueMatchOperator,
        known_value: Option<Bson>,
    },
    Device {
        event: DeviceTriggerType,
    },
    Introspection {
        event: IntrospectionTriggerType,
        /// `None` scopes the trigger to any interface.
        interface_name: Option<String>,
    },
}

/// One stored simple-trigger row: condition plus target.
#[derive(Clone, Debug)]
pub struct SimpleTriggerRow {
    pub simple_trigger_id: Uuid,
    pub parent_trigger_id: Uuid,
    pub trigger: SimpleTrigger,
    pub routing_key: String,
    pub static_headers: Vec<(String, String)>,
}

impl SimpleTriggerRow {
    pub fn target(&self) -> TriggerTarget {
        TriggerTarget {
            simple_trigger_id: self.simple_trigger_id,
            parent_trigger_id: self.parent_trigger_id,
            routing_key: self.routing_key.clone(),
            static_headers: self.static_headers.clone(),
        }
    }
}

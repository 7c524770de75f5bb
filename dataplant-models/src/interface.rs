use crate::automaton::EndpointsAutomaton;
use bson::Bson;
use serde::Deserialize;
use uuid::Uuid;

/// Interface kind: persistent key/value properties or append-only
/// datastreams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Properties,
    Datastream,
}

/// How values are grouped under an interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Individual,
    Object,
}

/// Which side of the link is allowed to publish on the interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Device,
    Server,
}

/// Physical layout of the interface's storage table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    MultiInterfaceIndividualPropertiesDbTable,
    MultiInterfaceIndividualDatastreamDbTable,
    OneObjectDatastreamDbTable,
}

/// Delivery guarantee requested by a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Unreliable,
    Guaranteed,
}

/// Whether values published while the device is offline are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    Discard,
    Stored,
}

/// Leaf value types a mapping can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingValueType {
    Double,
    Integer,
    Boolean,
    LongInteger,
    String,
    BinaryBlob,
    DateTime,
    DoubleArray,
    IntegerArray,
    BooleanArray,
    LongIntegerArray,
    StringArray,
    BinaryBlobArray,
    DateTimeArray,
}

impl MappingValueType {
    /// Check a decoded BSON value against this declared type.
    ///
    /// Numeric widening follows the wire reality: devices routinely send
    /// integers on double mappings, and 32-bit integers on longinteger
    /// mappings. `Bson::DateTime` and `Bson::Binary` are the only accepted
    /// struct-like leaves.
    pub fn conforms(&self, value: &Bson) -> bool {
        match self {
            MappingValueType::Double => {
                matches!(value, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_))
            }
            MappingValueType::Integer => match value {
                Bson::Int32(_) => true,
                Bson::Int64(n) => i32::try_from(*n).is_ok(),
                _ => false,
            },
            MappingValueType::Boolean => matches!(value, Bson::Boolean(_)),
            MappingValueType::LongInteger => {
                matches!(value, Bson::Int32(_) | Bson::Int64(_))
            }
            MappingValueType::String => matches!(value, Bson::String(_)),
            MappingValueType::BinaryBlob => matches!(value, Bson::Binary(_)),
            MappingValueType::DateTime => matches!(value, Bson::DateTime(_)),
            MappingValueType::DoubleArray => {
                Self::array_conforms(value, MappingValueType::Double)
            }
            MappingValueType::IntegerArray => {
                Self::array_conforms(value, MappingValueType::Integer)
            }
            MappingValueType::BooleanArray => {
                Self::array_conforms(value, MappingValueType::Boolean)
            }
            MappingValueType::LongIntegerArray => {
                Self::array_conforms(value, MappingValueType::LongInteger)
            }
            MappingValueType::StringArray => {
                Self::array_conforms(value, MappingValueType::String)
            }
            MappingValueType::BinaryBlobArray => {
                Self::array_conforms(value, MappingValueType::BinaryBlob)
            }
            MappingValueType::DateTimeArray => {
                Self::array_conforms(value, MappingValueType::DateTime)
            }
        }
    }

    fn array_conforms(value: &Bson, leaf: MappingValueType) -> bool {
        match value {
            Bson::Array(items) => items.iter().all(|item| leaf.conforms(item)),
            _ => false,
        }
    }
}

/// One compiled endpoint of an interface.
#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub endpoint_id: Uuid,
    pub interface_id: Uuid,
    /// Templated endpoint path, e.g. `/rooms/%{room}/temp`.
    pub endpoint: String,
    pub value_type: MappingValueType,
    pub reliability: Reliability,
    pub retention: Retention,
    pub allow_unset: bool,
    pub explicit_timestamp: bool,
}

impl Mapping {
    /// The last segment of the endpoint template, the key used by object
    /// aggregation payloads.
    pub fn last_segment(&self) -> &str {
        self.endpoint.rsplit('/').next().unwrap_or("")
    }
}

/// A loaded interface schema, as the updater caches it.
#[derive(Clone, Debug)]
pub struct InterfaceDescriptor {
    pub interface_id: Uuid,
    pub name: String,
    pub major_version: i32,
    pub minor_version: i32,
    pub interface_type: InterfaceType,
    pub aggregation: Aggregation,
    pub ownership: Ownership,
    /// Storage table name.
    pub storage: String,
    pub storage_type: StorageType,
    pub automaton: EndpointsAutomaton,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_accepts_small_int64() {
        assert!(MappingValueType::Integer.conforms(&Bson::Int64(41)));
        assert!(!MappingValueType::Integer.conforms(&Bson::Int64(i64::MAX)));
    }

    #[test]
    fn double_widens_integers() {
        assert!(MappingValueType::Double.conforms(&Bson::Int32(3)));
        assert!(MappingValueType::Double.conforms(&Bson::Double(3.5)));
        assert!(!MappingValueType::Double.conforms(&Bson::String("3.5".into())));
    }

    #[test]
    fn datetime_requires_bson_datetime() {
        let dt = Bson::DateTime(bson::DateTime::from_millis(1_000));
        assert!(MappingValueType::DateTime.conforms(&dt));
        assert!(!MappingValueType::DateTime.conforms(&Bson::Int64(1_000)));
    }

    #[test]
    fn arrays_check_every_element() {
        let ok = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let bad = Bson::Array(vec![Bson::Int32(1), Bson::String("two".into())]);
        assert!(MappingValueType::IntegerArray.conforms(&ok));
        assert!(!MappingValueType::IntegerArray.conforms(&bad));
    }

    #[test]
    fn last_segment_of_templated_endpoint() {
        let mapping = Mapping {
            endpoint_id: Uuid::nil(),
            interface_id: Uuid::nil(),
            endpoint: "/rooms/%{room}/temp".to_string(),
            value_type: MappingValueType::Double,
            reliability: Reliability::Unreliable,
            retention: Retention::Discard,
            allow_unset: false,
            explicit_timestamp: false,
        };
        assert_eq!(mapping.last_segment(), "temp");
    }
}

//! Domain model for the data updater plant.
//!
//! Everything here is plain data: device identity, interface schemas and
//! their compiled endpoint automatons, trigger descriptions, the typed
//! event envelope published to the events exchange, and runtime settings.
//! No I/O happens in this crate.

pub mod automaton;
pub mod constants;
pub mod device;
pub mod events;
pub mod ids;
pub mod interface;
pub mod settings;
pub mod time;
pub mod triggers;

pub use automaton::{EndpointsAutomaton, ResolvedPath};
pub use device::DeviceId;
pub use interface::{
    Aggregation, InterfaceDescriptor, Mapping, MappingValueType, InterfaceType, Ownership,
    Reliability, Retention, StorageType,
};
pub use time::Timestamp;

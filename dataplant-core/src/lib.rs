//! Core pipeline of the data updater plant: payload decoding, per-device
//! message tracking, the data updater actor, trigger dispatch, and the
//! broker consumer.

pub mod bridge;
pub mod consumer;
pub mod payload;
pub mod registry;
pub mod tracker;
pub mod triggers;
pub mod updater;

pub use bridge::{Acknowledger, ClientSessionBridge, DeliveryTag, EventsPublisher};
pub use consumer::{AmqpDataConsumer, Delivery};
pub use registry::DeviceRegistry;
pub use tracker::{MessageTracker, TrackerGuard};
pub use triggers::TriggersHandler;
pub use updater::{DataUpdater, UpdaterHandle, UpdaterMessage};

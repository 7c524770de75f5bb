//! Per-device data updater actor.
//!
//! One actor per `{realm, device}` serializes every state mutation for that
//! device. The mailbox is FIFO; the [`crate::tracker::MessageTracker`]
//! gates processing so it follows broker delivery order even across actor
//! crashes.

mod actor;
mod control;
mod data;
mod introspection;
mod state;
mod volatile;

pub use actor::{DataUpdater, UpdaterHandle, UpdaterMessage};

use dataplant_error::message::MessageError;
use dataplant_error::DupError;

/// Trigger publishing is broker I/O; its failures are infrastructure
/// errors, never payload violations.
pub(crate) fn publish_err(e: DupError) -> MessageError {
    MessageError::EventPublishFailed(e.to_string())
}

use config::{Config, File};
use dataplant_error::DupResult;
use serde::Deserialize;
use std::{ops::Deref, sync::Arc};

/// Runtime configuration, shared immutably across the plant.
#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Load from an optional TOML file plus `DUP__`-prefixed environment
    /// overrides (`DUP__AMQP__PREFETCH_COUNT=512`).
    pub fn new(config_path: &str) -> DupResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("DUP")
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner {
            general: General::default(),
            amqp: Amqp::default(),
            updater: Updater::default(),
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub amqp: Amqp,
    #[serde(default)]
    pub updater: Updater,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// `tracing_subscriber` env-filter directive.
    #[serde(default = "General::log_filter_default")]
    pub log_filter: String,
}

impl Default for General {
    fn default() -> Self {
        General {
            log_filter: General::log_filter_default(),
        }
    }
}

impl General {
    fn log_filter_default() -> String {
        "info".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Amqp {
    #[serde(default = "Amqp::url_default")]
    pub url: String,
    /// Per-channel unacked message window.
    #[serde(default = "Amqp::prefetch_count_default")]
    pub prefetch_count: u16,
    /// Queue names are `<prefix><n>` for `n` in `0..data_queue_count`.
    #[serde(default = "Amqp::data_queue_prefix_default")]
    pub data_queue_prefix: String,
    /// Number of data queues, one consumer worker each.
    #[serde(default = "Amqp::data_queue_count_default")]
    pub data_queue_count: u16,
    /// Exchange trigger events are published to.
    #[serde(default = "Amqp::events_exchange_default")]
    pub events_exchange: String,
    /// Routing key of the broker-plugin RPC queue used for device
    /// publish/disconnect side effects.
    #[serde(default = "Amqp::session_rpc_routing_key_default")]
    pub session_rpc_routing_key: String,
}

impl Default for Amqp {
    fn default() -> Self {
        Amqp {
            url: Amqp::url_default(),
            prefetch_count: Amqp::prefetch_count_default(),
            data_queue_prefix: Amqp::data_queue_prefix_default(),
            data_queue_count: Amqp::data_queue_count_default(),
            events_exchange: Amqp::events_exchange_default(),
            session_rpc_routing_key: Amqp::session_rpc_routing_key_default(),
        }
    }
}

impl Amqp {
    fn url_default() -> String {
        "amqp://127.0.0.1:5672".into()
    }

    fn prefetch_count_default() -> u16 {
        300
    }

    fn data_queue_prefix_default() -> String {
        "dataplant_data_".into()
    }

    fn data_queue_count_default() -> u16 {
        8
    }

    fn events_exchange_default() -> String {
        "dataplant_events".into()
    }

    fn session_rpc_routing_key_default() -> String {
        "session_bridge_rpc".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Updater {
    /// Per-device actor mailbox capacity.
    #[serde(default = "Updater::mailbox_capacity_default")]
    pub mailbox_capacity: usize,
}

impl Default for Updater {
    fn default() -> Self {
        Updater {
            mailbox_capacity: Updater::mailbox_capacity_default(),
        }
    }
}

impl Updater {
    fn mailbox_capacity_default() -> usize {
        128
    }
}

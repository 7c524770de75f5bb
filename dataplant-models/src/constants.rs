use std::time::Duration;

/// Default configuration file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "dataplant.toml";

/// Lifespan of a cached interface descriptor, measured from the device's
/// last seen message.
pub const INTERFACE_LIFESPAN: Duration = Duration::from_secs(600);

/// Refresh period for device-level trigger tables.
pub const DEVICE_TRIGGERS_LIFESPAN: Duration = Duration::from_secs(600);

/// Capacity of the per-device `{interface, path}` cache.
pub const PATHS_CACHE_CAP: u64 = 32;

/// Maximum decompressed size accepted by `safe_inflate`.
pub const SAFE_INFLATE_MAX: usize = 10 * 1024 * 1024;

/// Maximum accepted BSON payload size for an individual value.
pub const MAX_VALUE_SIZE: usize = 65_536;

/// Fixed part of the tracker recovery backoff.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound of the uniform random part of the recovery backoff.
pub const RANDOM_BACKOFF_SECS: u64 = 9;

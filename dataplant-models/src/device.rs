use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dataplant_error::DupError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A device identity: 128 raw bits.
///
/// The external form is base64-url without padding (22 characters), the
/// form devices use in topics and the broker uses in headers. Internally the
/// same bits act as the UUID object id for device-scoped trigger lookups.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        DeviceId(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The same bits viewed as a UUID, used as the trigger object id.
    pub fn to_uuid(self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    /// Encoded form used on the wire and in log lines.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| DupError::InvalidDeviceId(s.to_string()))?;
        let bytes: [u8; 16] = decoded
            .try_into()
            .map_err(|_| DupError::InvalidDeviceId(s.to_string()))?;
        Ok(DeviceId(bytes))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.encode())
    }
}

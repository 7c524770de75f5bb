use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Internal plant timestamp: decimicroseconds (100 ns ticks) since the Unix
/// epoch, carried as a signed 64-bit integer.
///
/// The unit survives well past 2262 where nanosecond i64 timestamps wrap,
/// and divides evenly into the millisecond timestamps used at every external
/// boundary (AMQP meta, database columns, event payloads).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

const TICKS_PER_MILLI: i64 = 10_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

impl Timestamp {
    pub const fn from_ticks(ticks: i64) -> Self {
        Timestamp(ticks)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Timestamp(ms * TICKS_PER_MILLI)
    }

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(elapsed.as_nanos() as i64 / 100)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Whole milliseconds, truncated.
    pub const fn as_millis(self) -> i64 {
        self.0 / TICKS_PER_MILLI
    }

    /// Sub-millisecond remainder in decimicroseconds, `0..10_000`.
    pub const fn submillis(self) -> i64 {
        self.0 % TICKS_PER_MILLI
    }

    pub const fn as_secs(self) -> i64 {
        self.0 / TICKS_PER_SECOND
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_nanos() as i64 / 100)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = i64;

    fn sub(self, rhs: Timestamp) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
        assert_eq!(ts.submillis(), 0);
    }

    #[test]
    fn submillis_is_the_decimicro_remainder() {
        let ts = Timestamp::from_ticks(1_700_000_000_123 * 10_000 + 42);
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
        assert_eq!(ts.submillis(), 42);
    }

    #[test]
    fn duration_addition_uses_ticks() {
        let ts = Timestamp::from_millis(1_000);
        let later = ts + Duration::from_secs(600);
        assert_eq!(later - ts, 600 * 10_000_000);
    }
}

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock instant with microsecond resolution.
///
/// Sampled once per poll return and handed to every read dispatch of that
/// iteration, so all messages delivered by one poller wake-up share the same
/// receive time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros: u64,
}

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_micros() as u64)
            .unwrap_or(0);
        Timestamp { micros }
    }

    /// Microseconds since the Unix epoch.
    pub fn micros(self) -> u64 {
        self.micros
    }
}

/// Formats as `seconds.microseconds`, e.g. `1700000000.000123`.
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.micros / 1_000_000, self.micros % 1_000_000)
    }
}

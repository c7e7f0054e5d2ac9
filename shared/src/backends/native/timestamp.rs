use std::time::SystemTime;

/// Wall-clock time in milliseconds since the UNIX epoch, as carried on the wire.
pub struct Timestamp;

impl Timestamp {
    /// Returns the current wall-clock time in milliseconds, or 0 when the
    /// system clock is set before the epoch. Envelopes stamped with 0 fail
    /// the age check on every receiver.
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Monotonic microsecond clock anchored at an arbitrary origin. All pulse
/// scheduling is expressed in ticks of one of these.
#[derive(Debug, Clone, Copy)]
pub struct MonoClock {
    origin: Instant,
}

impl MonoClock {
    #[inline]
    pub fn new() -> MonoClock {
        MonoClock { origin: Instant::now() }
    }

    /// Microseconds elapsed since the clock was created.
    #[inline]
    pub fn now_micros(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros())
    }
}

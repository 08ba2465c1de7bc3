use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source, in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Real-time clock (`CLOCK_REALTIME`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        // A clock set before 1970 reads as zero rather than failing the tick.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

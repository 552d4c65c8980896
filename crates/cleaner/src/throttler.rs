use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

/// A global byte-rate limiter shared by all cleaner threads.
///
/// Callers report work as it happens; once a measurement window closes, the
/// observed rate is compared against the target and the *reporting* thread
/// sleeps long enough to bring the window back under the target. The lock is
/// held across the sleep so concurrent reporters queue behind it, which is
/// what makes the limit global rather than per-thread.
#[derive(Debug)]
pub struct Throttler {
    bytes_per_second: f64,
    check_interval: Duration,
    window: Mutex<ThrottleWindow>,
}

#[derive(Debug)]
struct ThrottleWindow {
    started: Instant,
    observed: f64,
}

impl Throttler {
    pub fn new(bytes_per_second: f64) -> Self {
        Self::with_check_interval(bytes_per_second, Duration::from_millis(100))
    }

    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY)
    }

    pub fn with_check_interval(bytes_per_second: f64, check_interval: Duration) -> Self {
        Self {
            bytes_per_second,
            check_interval,
            window: Mutex::new(ThrottleWindow {
                started: Instant::now(),
                observed: 0.0,
            }),
        }
    }

    pub fn maybe_throttle(&self, bytes: u64) {
        if !self.bytes_per_second.is_finite() {
            return;
        }
        let mut window = self.window.lock().expect("throttler lock poisoned");
        window.observed += bytes as f64;
        let elapsed = window.started.elapsed();
        if elapsed < self.check_interval {
            return;
        }

        let rate = window.observed / elapsed.as_secs_f64();
        if rate > self.bytes_per_second {
            let needed = window.observed / self.bytes_per_second;
            let sleep = needed - elapsed.as_secs_f64();
            if sleep > 0.0 {
                trace!(rate, target = self.bytes_per_second, sleep_secs = sleep, "throttling");
                std::thread::sleep(Duration::from_secs_f64(sleep));
            }
        }
        window.started = Instant::now();
        window.observed = 0.0;
    }
}

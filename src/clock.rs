//! Monotonic time source for loop deadlines.
//!
//! All timer and idle bookkeeping uses milliseconds (or whole seconds)
//! measured from the first call in this process, so deadlines are immune
//! to wall-clock adjustments.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the process timebase origin.
pub fn now_ms() -> i64 {
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// Whole seconds elapsed since the process timebase origin.
pub fn now_s() -> i64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monotonic() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 5);
    }

    #[test]
    fn test_seconds_track_millis() {
        let s = now_s();
        let ms = now_ms();
        assert!(ms / 1000 >= s);
    }
}

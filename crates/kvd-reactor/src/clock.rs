//! Wall-clock helpers for timer deadlines.
//!
//! Deadlines are absolute (seconds, milliseconds) pairs on the realtime
//! clock. Realtime is deliberate: a backward jump must be observable so the
//! dispatcher can fire everything early instead of stalling timers for an
//! arbitrary span (see `reactor::EventLoop::process_time_events`).

/// Current wall-clock time as (unix seconds, millisecond remainder).
pub fn now() -> (i64, i64) {
    let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    (tv.tv_sec as i64, (tv.tv_usec / 1000) as i64)
}

/// Current wall-clock time in whole unix seconds.
pub fn unix_seconds() -> i64 {
    now().0
}

/// Absolute deadline `ms` milliseconds from now.
pub fn after_ms(ms: u64) -> (i64, i64) {
    let (cur_sec, cur_ms) = now();
    let mut when_sec = cur_sec + (ms / 1000) as i64;
    let mut when_ms = cur_ms + (ms % 1000) as i64;
    if when_ms >= 1000 {
        when_sec += 1;
        when_ms -= 1000;
    }
    (when_sec, when_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_ms_carries_into_seconds() {
        let (now_sec, _) = now();
        let (sec, ms) = after_ms(2_500);
        assert!(sec >= now_sec + 2);
        assert!((0..1000).contains(&ms));
    }

    #[test]
    fn test_now_is_monotonic_enough() {
        let a = now();
        let b = now();
        assert!(b.0 > a.0 || (b.0 == a.0 && b.1 >= a.1));
    }
}

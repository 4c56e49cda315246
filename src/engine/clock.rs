/// Nanosecond time source for all engine scheduling.
///
/// Kernel receive timestamps (`SO_TIMESTAMPNS`) are wall-clock based, so
/// the engine reads `CLOCK_REALTIME` to keep both RTT endpoints on the
/// same timescale.
pub trait Clock {
    fn now_ns(&self) -> i64;
}

pub struct WallClock;

impl Clock for WallClock {
    fn now_ns(&self) -> i64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
    }
}

//! Transfer rate monitoring and limiting.
//!
//! Bytes are accumulated into fixed-length samples. When a sample closes its
//! rate feeds an exponential moving average:
//!
//! ```text
//! w     = exp(-sample_secs / window_secs)
//! r_ema = r_sample + w * (r_ema - r_sample)
//! ```
//!
//! Limiting is per sample: at most `rate * sample_secs` bytes may be
//! transferred before the next sample opens.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::clock::{Clock, TickClock, clock_round};
use crate::core::{CLOCK_RATE, DEFAULT_WINDOW_SIZE, MIN_LIMIT_WAIT, TIME_REM_LIMIT};

/// Snapshot of a monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    /// Whether the transfer is still in progress.
    pub active: bool,
    /// Clock reading when the monitor was created.
    pub start: Duration,
    /// Bytes in completed samples.
    pub bytes: i64,
    /// Number of completed samples.
    pub samples: i64,
    /// Rate of the last sample, in bytes per second.
    pub inst_rate: i64,
    /// Moving-average rate, in bytes per second.
    pub cur_rate: i64,
    /// Average rate over the whole transfer.
    pub avg_rate: i64,
    /// Highest sample rate seen.
    pub peak_rate: i64,
    /// Bytes left when a transfer size is set.
    pub bytes_rem: i64,
    /// Time covered by completed samples.
    pub duration: Duration,
    /// Time since the last non-zero update.
    pub idle: Duration,
    /// Estimated time to completion when a transfer size is set.
    pub time_rem: Duration,
    /// Completion percentage when a transfer size is set.
    pub progress: f64,
}

#[derive(Debug)]
struct State {
    active: bool,
    start: Duration,
    bytes: i64,
    samples: i64,

    r_sample: f64,
    r_ema: f64,
    r_peak: f64,
    r_window: f64,

    s_bytes: i64,
    s_last: Duration,
    s_rate: Duration,

    t_bytes: i64,
    t_last: Duration,
}

impl State {
    /// Account `n` bytes and close the sample if it has run its course.
    ///
    /// Returns the current clock reading, or zero once inactive.
    fn update(&mut self, now: Duration, n: usize) -> Duration {
        if !self.active {
            return Duration::ZERO;
        }
        if n > 0 {
            self.t_last = now;
        }
        self.s_bytes += n as i64;

        let s_time = now.saturating_sub(self.s_last);
        if s_time >= self.s_rate {
            let t = s_time.as_secs_f64();
            self.r_sample = self.s_bytes as f64 / t;
            if self.r_sample > self.r_peak {
                self.r_peak = self.r_sample;
            }

            if self.samples > 0 {
                let w = (-t / self.r_window).exp();
                self.r_ema = self.r_sample + w * (self.r_ema - self.r_sample);
            } else {
                self.r_ema = self.r_sample;
            }
            self.reset(now);
        }
        now
    }

    fn reset(&mut self, sample_time: Duration) {
        self.bytes += self.s_bytes;
        self.samples += 1;
        self.s_bytes = 0;
        self.s_last = sample_time;
    }
}

/// Monitors and limits the transfer rate of one direction of a stream.
#[derive(Debug)]
pub struct Monitor {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl Monitor {
    /// Create a monitor on the process-wide clock.
    ///
    /// A zero `sample_rate` defaults to 100ms and a zero `window` to one
    /// second.
    pub fn new(sample_rate: Duration, window: Duration) -> Self {
        Self::with_clock(TickClock::global(), sample_rate, window)
    }

    /// Create a monitor reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>, sample_rate: Duration, window: Duration) -> Self {
        let mut s_rate = clock_round(sample_rate);
        if s_rate.is_zero() {
            s_rate = CLOCK_RATE * 5;
        }
        let window = if window.is_zero() {
            DEFAULT_WINDOW_SIZE
        } else {
            window
        };

        let now = clock.now();
        Self {
            clock,
            state: Mutex::new(State {
                active: true,
                start: now,
                bytes: 0,
                samples: 0,
                r_sample: 0.0,
                r_ema: 0.0,
                r_peak: 0.0,
                r_window: window.as_secs_f64(),
                s_bytes: 0,
                s_last: now,
                s_rate,
                t_bytes: 0,
                t_last: now,
            }),
        }
    }

    /// Record `n` transferred bytes.
    pub fn update(&self, n: usize) -> usize {
        let now = self.clock.now();
        self.state.lock().update(now, n);
        n
    }

    /// Mark the transfer finished and return the total byte count.
    ///
    /// Bytes of the open sample are folded in; later updates are ignored.
    pub fn done(&self) -> i64 {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let now = st.update(now, 0);
        if st.s_bytes > 0 {
            st.reset(now);
        }
        st.active = false;
        st.t_last = Duration::ZERO;
        st.bytes
    }

    /// Set the expected size of the transfer.
    pub fn set_transfer_size(&self, bytes: i64) {
        self.state.lock().t_bytes = bytes.max(0);
    }

    /// Current transfer status.
    pub fn status(&self) -> Status {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let now = st.update(now, 0);

        let mut status = Status {
            active: st.active,
            start: st.start,
            bytes: st.bytes,
            samples: st.samples,
            inst_rate: 0,
            cur_rate: 0,
            avg_rate: 0,
            peak_rate: round(st.r_peak),
            bytes_rem: (st.t_bytes - st.bytes).max(0),
            duration: st.s_last.saturating_sub(st.start),
            idle: now.saturating_sub(st.t_last),
            time_rem: Duration::ZERO,
            progress: percent_of(st.bytes as f64, st.t_bytes as f64),
        };

        if !status.duration.is_zero() {
            let r_avg = status.bytes as f64 / status.duration.as_secs_f64();
            status.avg_rate = round(r_avg);
            if status.active {
                status.inst_rate = round(st.r_sample);
                status.cur_rate = round(st.r_ema);
                if status.bytes_rem > 0 {
                    let t_rate = 0.8 * st.r_ema + 0.2 * r_avg;
                    if t_rate > 0.0 {
                        let secs = (status.bytes_rem as f64 / t_rate)
                            .min(TIME_REM_LIMIT.as_secs_f64());
                        status.time_rem = clock_round(Duration::from_secs_f64(secs));
                    }
                }
            }
        }
        status
    }

    /// Bytes that may be transferred now without exceeding `rate`.
    ///
    /// With `block` set, waits for the next sample while the current one is
    /// exhausted. A `want` or `rate` below one disables limiting.
    pub async fn limit(&self, want: usize, rate: i64, block: bool) -> usize {
        if want < 1 || rate < 1 {
            return want;
        }

        loop {
            let wait = {
                let mut st = self.state.lock();
                let limit = self.sample_limit(&st, rate);
                let now = st.update(self.clock.now(), 0);
                if !block || st.s_bytes < limit || !st.active {
                    return grant(&st, limit, want);
                }
                (st.s_last + st.s_rate).saturating_sub(now).max(MIN_LIMIT_WAIT)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking form of [`limit`](Monitor::limit).
    pub fn try_limit(&self, want: usize, rate: i64) -> usize {
        if want < 1 || rate < 1 {
            return want;
        }
        let mut st = self.state.lock();
        let limit = self.sample_limit(&st, rate);
        st.update(self.clock.now(), 0);
        grant(&st, limit, want)
    }

    fn sample_limit(&self, st: &State, rate: i64) -> i64 {
        round(rate as f64 * st.s_rate.as_secs_f64()).max(1)
    }
}

fn grant(st: &State, limit: i64, want: usize) -> usize {
    let remaining = limit - st.s_bytes;
    if remaining > want as i64 || !st.active {
        want
    } else {
        remaining.max(0) as usize
    }
}

/// Round half up.
fn round(x: f64) -> i64 {
    let floor = x.floor();
    if x - floor >= 0.5 {
        floor as i64 + 1
    } else {
        floor as i64
    }
}

fn percent_of(x: f64, total: f64) -> f64 {
    if x < 0.0 || total <= 0.0 {
        return 0.0;
    }
    x / total * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowrate::ManualClock;

    const MS_100: Duration = Duration::from_millis(100);

    fn monitor() -> (Arc<ManualClock>, Monitor) {
        let clock = ManualClock::new();
        let monitor = Monitor::with_clock(clock.clone(), MS_100, Duration::from_secs(1));
        (clock, monitor)
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round(2.4), 2);
        assert_eq!(round(2.5), 3);
        assert_eq!(round(66.67), 67);
        assert_eq!(round(0.0), 0);
    }

    #[test]
    fn test_defaults_for_zero_rates() {
        let clock = ManualClock::new();
        let monitor = Monitor::with_clock(clock.clone(), Duration::ZERO, Duration::ZERO);
        monitor.update(10);
        clock.advance(Duration::from_millis(99));
        assert_eq!(monitor.status().samples, 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(monitor.status().samples, 1);
    }

    #[test]
    fn test_status_over_samples() {
        let (clock, monitor) = monitor();

        let first = monitor.status();
        assert!(first.active);
        assert_eq!((first.bytes, first.samples), (0, 0));

        monitor.update(10);
        clock.advance(MS_100);
        let s = monitor.status();
        assert_eq!((s.bytes, s.samples), (10, 1));
        assert_eq!((s.inst_rate, s.cur_rate, s.avg_rate, s.peak_rate), (100, 100, 100, 100));
        assert_eq!(s.duration, MS_100);

        monitor.update(10);
        clock.advance(MS_100);
        let s = monitor.status();
        assert_eq!((s.bytes, s.samples), (20, 2));
        assert_eq!(s.idle, MS_100);

        // An idle sample drags the moving average down.
        clock.advance(MS_100);
        let s = monitor.status();
        assert_eq!(s.samples, 3);
        assert_eq!((s.inst_rate, s.cur_rate, s.avg_rate, s.peak_rate), (0, 90, 67, 100));
        assert_eq!(s.idle, Duration::from_millis(200));

        assert_eq!(monitor.done(), 20);
        let s = monitor.status();
        assert!(!s.active);
        assert_eq!((s.inst_rate, s.cur_rate, s.avg_rate), (0, 0, 67));
        assert_eq!(s.duration, Duration::from_millis(300));
        assert_eq!(s.idle, Duration::ZERO);
    }

    #[test]
    fn test_transfer_size() {
        let (clock, monitor) = monitor();
        monitor.set_transfer_size(100);

        monitor.update(20);
        clock.advance(MS_100);
        let s = monitor.status();
        assert_eq!(s.bytes_rem, 80);
        assert!((s.progress - 20.0).abs() < 1e-9);
        assert_eq!(s.time_rem, Duration::from_millis(400));

        monitor.set_transfer_size(-5);
        assert_eq!(monitor.status().bytes_rem, 0);
    }

    #[test]
    fn test_try_limit() {
        let (clock, monitor) = monitor();

        assert_eq!(monitor.try_limit(0, 100), 0);
        assert_eq!(monitor.try_limit(50, 0), 50);

        // 100 B/s over 100ms samples allows 10 bytes per sample.
        assert_eq!(monitor.try_limit(100, 100), 10);
        assert_eq!(monitor.try_limit(4, 100), 4);
        monitor.update(10);
        assert_eq!(monitor.try_limit(100, 100), 0);

        clock.advance(MS_100);
        assert_eq!(monitor.try_limit(100, 100), 10);
    }

    #[test]
    fn test_limit_after_done_is_unbounded() {
        let (_clock, monitor) = monitor();
        monitor.update(10);
        monitor.done();
        assert_eq!(monitor.try_limit(100, 100), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_limit_waits_for_next_sample() {
        let (clock, monitor) = monitor();
        monitor.update(10);

        assert_eq!(monitor.limit(100, 100, false).await, 0);

        let ticker = {
            let clock = clock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                clock.advance(MS_100);
            })
        };

        let start = tokio::time::Instant::now();
        assert_eq!(monitor.limit(100, 100, true).await, 10);
        assert!(start.elapsed() >= Duration::from_millis(50));
        ticker.await.unwrap();
    }
}

//! SYNC scheduler loop.
//!
//! Emits one SYNC plus the RPDO1 setpoints every interval. Deadlines are
//! absolute (`start + n × interval`), so a late tick does not shift the
//! ones after it. A tick that overruns its slot is counted as a timing
//! violation and the schedule resynchronises to the next future slot.
//!
//! With the `rt` feature the thread requests SCHED_FIFO and may be pinned
//! to a CPU core; failures are logged and the loop runs unprivileged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use evo_common::canopen::consts::SCHEDULER_RT_PRIORITY;

use crate::bus::Bus;
use crate::diagnostics::{Counter, Diagnostics};
use crate::error::CanopenResult;
use crate::pdo;
use crate::registry::DeviceRegistry;

/// Timing statistics for the SYNC loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimingStats {
    /// Ticks executed.
    pub tick_count: u64,
    /// Ticks that finished after their slot ended.
    pub timing_violations: u64,
    /// Longest tick in microseconds.
    pub max_tick_time_us: u64,
    /// Sum of tick times, for the average.
    pub total_tick_time_us: u64,
}

impl TimingStats {
    /// Record one tick. Returns true if it overran `interval`.
    pub fn record(&mut self, tick_time: Duration, interval: Duration) -> bool {
        let tick_us = tick_time.as_micros() as u64;
        self.tick_count += 1;
        self.total_tick_time_us += tick_us;
        self.max_tick_time_us = self.max_tick_time_us.max(tick_us);
        let violated = tick_time > interval;
        if violated {
            self.timing_violations += 1;
        }
        violated
    }

    /// Average tick time in microseconds.
    pub fn average_us(&self) -> u64 {
        self.total_tick_time_us.checked_div(self.tick_count).unwrap_or(0)
    }

    /// First ten violations are logged, then every thousandth.
    fn should_warn(&self) -> bool {
        self.timing_violations <= 10 || self.timing_violations % 1000 == 0
    }
}

/// Next absolute deadline strictly after `now`, skipping missed slots.
pub fn next_deadline(deadline: Instant, interval: Duration, now: Instant) -> (Instant, u64) {
    let next = deadline + interval;
    if next > now {
        return (next, 0);
    }
    let behind = now.duration_since(next).as_nanos() / interval.as_nanos().max(1);
    let skipped = behind as u64 + 1;
    (next + interval * skipped as u32, skipped)
}

/// Run ticks every `interval` until `running` is cleared.
///
/// # Errors
/// A failed send ends the loop and is returned.
pub fn run(
    bus: &Bus,
    registry: &DeviceRegistry,
    interval: Duration,
    cpu: Option<usize>,
    diagnostics: &Diagnostics,
    running: &AtomicBool,
) -> CanopenResult<TimingStats> {
    rt_setup(cpu);
    info!(
        "SYNC scheduler started (interval={}ms, {} mode)",
        interval.as_millis(),
        if detect_rt_mode() { "real-time" } else { "standard" }
    );

    let mut stats = TimingStats::default();
    let mut deadline = Instant::now();

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();
        pdo::tick(bus, registry, interval, diagnostics)?;
        let tick_time = tick_start.elapsed();

        if stats.record(tick_time, interval) {
            diagnostics.record(Counter::TimingViolations);
            if stats.should_warn() {
                warn!(
                    "Timing violation #{}: tick took {}us (interval {}us)",
                    stats.timing_violations,
                    tick_time.as_micros(),
                    interval.as_micros()
                );
            }
        }

        if stats.tick_count % 1000 == 0 {
            debug!(
                "SYNC loop: {} ticks, avg={}us, max={}us, violations={}",
                stats.tick_count,
                stats.average_us(),
                stats.max_tick_time_us,
                stats.timing_violations
            );
        }

        let now = Instant::now();
        let (next, skipped) = next_deadline(deadline, interval, now);
        if skipped > 0 {
            debug!("SYNC loop behind schedule, skipped {} slots", skipped);
        }
        deadline = next;
        std::thread::sleep(deadline.saturating_duration_since(now));
    }

    info!(
        "SYNC scheduler stopped after {} ticks (violations: {})",
        stats.tick_count, stats.timing_violations
    );
    Ok(stats)
}

fn rt_setup(cpu: Option<usize>) {
    if let Some(cpu) = cpu {
        if let Err(e) = rt_set_affinity(cpu) {
            warn!("CPU pinning unavailable: {}", e);
        }
    }
    if let Err(e) = rt_set_scheduler(SCHEDULER_RT_PRIORITY) {
        warn!("Real-time scheduling unavailable: {}", e);
    }
}

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), String> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset.set(cpu).map_err(|e| format!("CpuSet::set({cpu}) failed: {e}"))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset).map_err(|e| format!("sched_setaffinity failed: {e}"))
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), String> {
    Ok(())
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), String> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(format!("sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), String> {
    Ok(())
}

/// True if the calling thread runs under a real-time policy.
pub fn detect_rt_mode() -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{SCHED_FIFO, SCHED_RR, sched_getscheduler};
        let policy = unsafe { sched_getscheduler(0) };
        policy == SCHED_FIFO || policy == SCHED_RR
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_track_violations() {
        let mut stats = TimingStats::default();
        let interval = Duration::from_millis(10);
        assert!(!stats.record(Duration::from_micros(200), interval));
        assert!(stats.record(Duration::from_millis(12), interval));
        assert_eq!(stats.tick_count, 2);
        assert_eq!(stats.timing_violations, 1);
        assert_eq!(stats.max_tick_time_us, 12_000);
        assert_eq!(stats.average_us(), 6_100);
    }

    #[test]
    fn warning_rate_limit() {
        let mut stats = TimingStats::default();
        for _ in 0..10 {
            stats.timing_violations += 1;
            assert!(stats.should_warn());
        }
        stats.timing_violations = 11;
        assert!(!stats.should_warn());
        stats.timing_violations = 2000;
        assert!(stats.should_warn());
    }

    #[test]
    fn deadlines_stay_on_grid() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);

        let (next, skipped) = next_deadline(start, interval, start + Duration::from_millis(3));
        assert_eq!(next, start + interval);
        assert_eq!(skipped, 0);

        // 25 ms late: slots at 10 and 20 ms are gone, next is 30 ms
        let (next, skipped) = next_deadline(start, interval, start + Duration::from_millis(25));
        assert_eq!(next, start + Duration::from_millis(30));
        assert_eq!(skipped, 2);
    }
}

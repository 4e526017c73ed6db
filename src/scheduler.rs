//! Drift-correcting collection loop.
//!
//! Each iteration collects first, then sleeps until the next deadline. A tick
//! that finishes past its deadline is logged and rebased to `now + interval`
//! without sleeping, so a slow tick causes at most one immediate extra
//! iteration. Otherwise the deadline advances by exactly one interval, which
//! keeps long-run cadence independent of wake-up jitter.

mod clock;

pub use clock::{Clock, SystemClock};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Stop flag plus the condition the loop sleeps on.
#[derive(Debug)]
pub struct Control {
    running: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the running flag and wake the loop. Does not allocate.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Taking the lock orders the store before a sleeper's re-check.
        drop(self.lock.lock());
        self.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep until `deadline` on `clock`, returning early on stop.
    /// Returns `true` if stopped.
    fn wait_until(&self, deadline: Instant, clock: &dyn Clock) -> bool {
        let timeout = deadline.saturating_duration_since(clock.now());
        let mut guard = self.lock.lock();
        self.wake
            .wait_while_for(&mut guard, |_| self.is_running(), timeout);
        !self.is_running()
    }
}

/// Outcome of pacing one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The deadline had already passed by `late`; no sleep happened.
    Missed { late: Duration },
    /// Slept until the deadline or until a stop request.
    Waited { stopped: bool },
}

/// Runs the read callback once per interval until stopped.
pub struct Scheduler {
    interval: Duration,
    clock: Arc<dyn Clock>,
    control: Arc<Control>,
    ticks: AtomicU64,
    missed: AtomicU64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("interval", &self.interval)
            .field("ticks", &self.ticks())
            .field("missed", &self.missed_ticks())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, Arc::new(SystemClock))
    }

    pub fn with_clock(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            control: Arc::new(Control::new()),
            ticks: AtomicU64::new(0),
            missed: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Shared stop control, for triggers living on other threads.
    pub fn control(&self) -> Arc<Control> {
        Arc::clone(&self.control)
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Completed iterations.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn missed_ticks(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// Collect, then pace, until stopped. `read` never observes a stop
    /// mid-call; the flag is checked at the loop top and after each wait.
    pub fn run<F: FnMut()>(&self, mut read: F) {
        let Some(mut next_wakeup) = self.clock.now().checked_add(self.interval) else {
            self.overflowed();
            return;
        };
        tracing::info!(interval = ?self.interval, "Collection loop started");

        while self.control.is_running() {
            read();
            self.ticks.fetch_add(1, Ordering::Relaxed);
            self.pace(&mut next_wakeup);
        }

        tracing::info!(ticks = self.ticks(), missed = self.missed_ticks(), "Collection loop stopped");
    }

    /// Decide whether to sleep after a tick and advance `next_wakeup`.
    pub fn pace(&self, next_wakeup: &mut Instant) -> Tick {
        let now = self.clock.now();
        if now >= *next_wakeup {
            let late = now - *next_wakeup;
            tracing::warn!(late_ms = late.as_millis() as u64,
                "Not sleeping because the next interval is in the past");
            self.missed.fetch_add(1, Ordering::Relaxed);
            let Some(next) = now.checked_add(self.interval) else {
                return self.overflowed();
            };
            *next_wakeup = next;
            return Tick::Missed { late };
        }

        let stopped = self.control.wait_until(*next_wakeup, self.clock.as_ref());
        let Some(next) = next_wakeup.checked_add(self.interval) else {
            return self.overflowed();
        };
        *next_wakeup = next;
        Tick::Waited { stopped }
    }

    /// The next deadline is not representable; stop instead of panicking.
    fn overflowed(&self) -> Tick {
        tracing::error!(
            interval = ?self.interval,
            "Interval overflows the clock, stopping collection loop"
        );
        self.control.stop();
        Tick::Waited { stopped: true }
    }
}

#[cfg(test)]
mod tests {
    use super::clock::manual::ManualClock;
    use super::*;
    use std::thread;

    #[test]
    fn test_missed_tick_reads_once_without_sleeping() {
        let clock = Arc::new(ManualClock::new());
        let interval = Duration::from_secs(10);
        let scheduler = Scheduler::with_clock(interval, clock.clone());
        let control = scheduler.control();

        let started = Instant::now();
        let mut reads = 0;
        scheduler.run(|| {
            reads += 1;
            match reads {
                // The first read overruns three intervals.
                1 => clock.advance(interval * 3),
                _ => control.stop(),
            }
        });

        assert_eq!(reads, 2);
        assert_eq!(scheduler.missed_ticks(), 1);
        assert_eq!(scheduler.ticks(), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_missed_tick_rebases_deadline() {
        let clock = Arc::new(ManualClock::new());
        let interval = Duration::from_secs(10);
        let scheduler = Scheduler::with_clock(interval, clock.clone());

        let start = clock.now();
        let mut next = start + interval;
        clock.advance(Duration::from_secs(25));

        let tick = scheduler.pace(&mut next);
        assert_eq!(
            tick,
            Tick::Missed {
                late: Duration::from_secs(15)
            }
        );
        assert_eq!(next, start + Duration::from_secs(35));
    }

    #[test]
    fn test_wait_advances_by_exactly_one_interval() {
        let clock = Arc::new(ManualClock::new());
        let interval = Duration::from_millis(20);
        let scheduler = Scheduler::with_clock(interval, clock.clone());

        let start = clock.now();
        let mut next = start + interval;
        clock.advance(Duration::from_millis(5));

        let tick = scheduler.pace(&mut next);
        assert_eq!(tick, Tick::Waited { stopped: false });
        assert_eq!(next, start + interval * 2);
        assert_eq!(scheduler.missed_ticks(), 0);
    }

    #[test]
    fn test_stop_wakes_timed_wait_promptly() {
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(30)));
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.run(|| {}))
        };

        thread::sleep(Duration::from_millis(50));
        let stopped_at = Instant::now();
        scheduler.stop();
        runner.join().unwrap();

        assert!(stopped_at.elapsed() < Duration::from_secs(2));
        assert_eq!(scheduler.ticks(), 1);
    }

    #[test]
    fn test_unrepresentable_interval_stops_loop() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::with_clock(Duration::MAX, clock.clone());

        let mut reads = 0;
        scheduler.run(|| reads += 1);
        assert_eq!(reads, 0);
        assert!(!scheduler.control().is_running());

        // Pacing past a deadline with the same interval stops as well.
        let scheduler = Scheduler::with_clock(Duration::MAX, clock.clone());
        let start = clock.now();
        let mut next = start + Duration::from_secs(10);
        clock.advance(Duration::from_secs(25));
        assert_eq!(scheduler.pace(&mut next), Tick::Waited { stopped: true });
        assert_eq!(next, start + Duration::from_secs(10));
        assert!(!scheduler.control().is_running());
    }

    #[test]
    fn test_stop_before_run_skips_reads() {
        let scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.stop();

        let mut reads = 0;
        scheduler.run(|| reads += 1);
        assert_eq!(reads, 0);
    }
}

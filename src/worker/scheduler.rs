//! Tick scheduling for polling loops
//!
//! Two strategies:
//!
//! - **Busy-wait**: the coarse part of the wait is slept, the last
//!   `threshold` is spun on a monotonic clock. When the loop falls more than
//!   one interval behind, `next_tick` is reset instead of bursting through
//!   catch-up ticks; the abandoned ticks are counted.
//! - **Timer**: fixed delay after every pass. Cheap, with jitter.

use crate::config::PollingConfig;
use std::time::{Duration, Instant};

/// Scheduling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Sleep the coarse part, spin below `threshold`
    BusyWait { threshold: Duration },
    /// Sleep one interval after every pass
    Timer,
}

/// Paces a loop to a target interval
#[derive(Debug, Clone)]
pub struct TickScheduler {
    interval: Duration,
    mode: ScheduleMode,
    next_tick: Instant,
    skipped_ticks: u64,
}

impl TickScheduler {
    /// Scheduler described by a polling config
    pub fn from_config(config: &PollingConfig) -> Self {
        let mode = if config.use_busy_wait {
            ScheduleMode::BusyWait {
                threshold: config.busy_wait_threshold(),
            }
        } else {
            ScheduleMode::Timer
        };
        Self::new(config.target_interval(), mode)
    }

    pub fn new(interval: Duration, mode: ScheduleMode) -> Self {
        let interval = interval.max(Duration::from_nanos(1));
        Self {
            interval,
            mode,
            next_tick: Instant::now() + interval,
            skipped_ticks: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// Ticks abandoned since creation
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    /// Restart the schedule from now (after a pause)
    pub fn reset(&mut self) {
        self.next_tick = Instant::now() + self.interval;
    }

    /// Block until the next tick is due
    pub fn wait(&mut self) {
        match self.mode {
            ScheduleMode::Timer => std::thread::sleep(self.interval),
            ScheduleMode::BusyWait { threshold } => self.wait_busy(threshold),
        }
    }

    fn wait_busy(&mut self, threshold: Duration) {
        let now = Instant::now();

        if now >= self.next_tick {
            let lag = now - self.next_tick;
            if lag > self.interval {
                let behind = (lag.as_nanos() / self.interval.as_nanos()) as u64;
                self.skipped_ticks += behind;
                tracing::trace!("Scheduler {} tick(s) behind, resetting", behind);
                self.next_tick = now + self.interval;
            } else {
                self.next_tick += self.interval;
            }
            return;
        }

        let remaining = self.next_tick - now;
        if remaining > threshold {
            std::thread::sleep(remaining - threshold);
        }
        while Instant::now() < self.next_tick {
            std::hint::spin_loop();
        }
        self.next_tick += self.interval;
    }
}

//! Decides when the next sample is taken.
//!
//! The schedule is a single "next produce time" in epoch milliseconds. After
//! each sample it moves to `now + frequency`; `pause` pushes it further out
//! or suspends sampling until `wakeup`. All state is atomic so a control
//! thread can steer a sampling loop through a shared `Arc<Scheduler>`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::util::now_millis;

pub const MIN_FREQUENCY_SECS: u64 = 1;

const PAUSED: i64 = -1;

#[derive(Debug)]
pub struct Scheduler {
    frequency_secs: AtomicU64,
    next_produce_time: AtomicI64,
    started: AtomicBool,
}

impl Scheduler {
    /// Creates a stopped scheduler; frequencies below the minimum are raised.
    pub fn new(frequency_secs: u64) -> Self {
        Self {
            frequency_secs: AtomicU64::new(frequency_secs.max(MIN_FREQUENCY_SECS)),
            next_produce_time: AtomicI64::new(PAUSED),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> bool {
        self.start_at(now_millis())
    }

    /// Schedules the first sample one period after `now`. Returns false if
    /// already started.
    pub fn start_at(&self, now: i64) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.schedule_from(now);
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Delays the next sample by `seconds` past its current due time, or
    /// suspends sampling until [`Scheduler::wakeup`] when `seconds` is
    /// negative. Returns false when stopped, already suspended, or given 0.
    pub fn pause(&self, seconds: i64) -> bool {
        if !self.is_started() || seconds == 0 {
            return false;
        }
        let next = self.next_produce_time.load(Ordering::SeqCst);
        if next < 0 {
            return false;
        }

        if seconds > 0 {
            let delayed = next.saturating_add(seconds.saturating_mul(1000));
            self.next_produce_time.store(delayed, Ordering::SeqCst);
            info!(seconds, "sampling paused");
        } else {
            self.next_produce_time.store(PAUSED, Ordering::SeqCst);
            info!("sampling suspended");
        }
        true
    }

    pub fn wakeup(&self) -> bool {
        self.wakeup_at(now_millis())
    }

    /// Resumes a suspended schedule one period after `now`. Returns false
    /// unless sampling is suspended.
    pub fn wakeup_at(&self, now: i64) -> bool {
        if !self.is_started() || self.next_produce_time.load(Ordering::SeqCst) >= 0 {
            return false;
        }
        self.schedule_from(now);
        info!("sampling resumed");
        true
    }

    /// Takes effect from the next sample on.
    pub fn set_frequency(&self, seconds: u64) -> bool {
        if seconds < MIN_FREQUENCY_SECS {
            return false;
        }
        self.frequency_secs.store(seconds, Ordering::SeqCst);
        debug!(seconds, "sampling frequency changed");
        true
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_secs.load(Ordering::SeqCst))
    }

    /// Epoch milliseconds of the next sample, `None` while stopped or
    /// suspended.
    pub fn next_produce_time(&self) -> Option<i64> {
        let next = self.next_produce_time.load(Ordering::SeqCst);
        (self.is_started() && next >= 0).then_some(next)
    }

    /// Time left until the next sample, `None` while stopped or suspended.
    pub fn remaining_at(&self, now: i64) -> Option<Duration> {
        let next = self.next_produce_time()?;
        let left = u64::try_from(next.saturating_sub(now)).unwrap_or(0);
        Some(Duration::from_millis(left))
    }

    pub fn is_due_at(&self, now: i64) -> bool {
        self.remaining_at(now).is_some_and(|left| left.is_zero())
    }

    pub fn mark_produced(&self) {
        self.mark_produced_at(now_millis())
    }

    /// Moves the schedule one period past `now`. A suspension requested
    /// while the sample was taken stays in effect.
    pub fn mark_produced_at(&self, now: i64) {
        if self.next_produce_time.load(Ordering::SeqCst) >= 0 {
            self.schedule_from(now);
        }
    }

    fn schedule_from(&self, now: i64) {
        let period_ms = i64::try_from(self.frequency().as_millis()).unwrap_or(i64::MAX);
        self.next_produce_time
            .store(now.saturating_add(period_ms), Ordering::SeqCst);
    }
}

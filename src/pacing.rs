//! Adaptive frame pacing.
//!
//! While clients are drawing the loop runs on a 60 Hz grid anchored to
//! an epoch, so rounding never drifts the cadence. When nothing
//! happens the clock decays through slower tiers (30, 10, then 5 Hz of
//! wakeups) to keep an idle server off the CPU. Any activity snaps it
//! straight back to the active cadence.
//!
//! All arithmetic is on `Instant`, which is monotonic; a stalled or
//! suspended process shows up as a large forward delta and the clock
//! re-anchors instead of trying to catch up frame by frame.

use std::time::{Duration, Instant};

/// One active-cadence frame, 1000/60 ms truncated.
pub const ACTIVE_FRAME: Duration = Duration::from_millis(1000 / 60);

/// Consecutive idle wakeups before each downshift.
const RELAXED_AFTER: u32 = 600;
const SLOW_AFTER: u32 = 2400;
const CRAWL_AFTER: u32 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdleTier {
    Active,
    Relaxed,
    Slow,
    Crawl,
}

/// Wakeup interval for a tier.
pub fn tier_delay(tier: IdleTier) -> Duration {
    match tier {
        IdleTier::Active => ACTIVE_FRAME,
        IdleTier::Relaxed => Duration::from_millis(33),
        IdleTier::Slow => Duration::from_millis(100),
        IdleTier::Crawl => Duration::from_millis(200),
    }
}

/// The pacing state machine. Callers drive it with four inputs: a
/// frame was presented, an idle wakeup elapsed, outside activity
/// happened, and "when is the next deadline".
pub struct FrameClock {
    epoch: Instant,
    target: Instant,
    frames: u64,
    idle_ticks: u32,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        FrameClock {
            epoch: now,
            target: now + ACTIVE_FRAME,
            frames: 0,
            idle_ticks: 0,
        }
    }

    pub fn tier(&self) -> IdleTier {
        if self.idle_ticks > CRAWL_AFTER {
            IdleTier::Crawl
        } else if self.idle_ticks > SLOW_AFTER {
            IdleTier::Slow
        } else if self.idle_ticks > RELAXED_AFTER {
            IdleTier::Relaxed
        } else {
            IdleTier::Active
        }
    }

    /// How long the reactor may sleep before the next deadline.
    pub fn timeout(&self, now: Instant) -> Duration {
        self.target.saturating_duration_since(now)
    }

    pub fn due(&self, now: Instant) -> bool {
        now >= self.target
    }

    /// A frame went out. Advance along the 60 Hz grid; re-anchor when
    /// coming out of idle or after falling more than a frame behind.
    pub fn frame_presented(&mut self, now: Instant) {
        if self.idle_ticks > 0 || now > self.target + ACTIVE_FRAME {
            self.epoch = now;
            self.frames = 0;
        }
        self.idle_ticks = 0;
        self.frames += 1;
        let mut target = self.epoch + Duration::from_millis(self.frames * 1000 / 60);
        if target <= now {
            self.epoch = now;
            self.frames = 1;
            target = now + ACTIVE_FRAME;
        }
        self.target = target;
    }

    /// The deadline passed with nothing to present.
    pub fn idle_tick(&mut self, now: Instant) {
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        self.epoch = now;
        self.frames = 0;
        self.target = now + tier_delay(self.tier());
    }

    /// Socket or input activity: snap back to the active cadence at
    /// once rather than finishing a long idle sleep.
    pub fn activity(&mut self, now: Instant) {
        self.idle_ticks = 0;
        let soon = now + ACTIVE_FRAME;
        if self.target > soon {
            self.target = soon;
        }
    }
}

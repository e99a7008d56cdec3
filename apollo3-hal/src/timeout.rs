//! Bounded polling.
//!
//! Every wait in the BLE driver is a budget of total time spent in steps of a
//! fixed poll interval, burned down on a [`DelayNs`] provider.

use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU32;

/// A polling budget: `total` time spent in `step` sized sleeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout {
    remaining_us: u32,
    step_us: u32,
}

impl Timeout {
    pub fn new(total: MicrosDurationU32, step: MicrosDurationU32) -> Self {
        Timeout {
            remaining_us: total.to_micros(),
            step_us: step.to_micros().max(1),
        }
    }

    /// `polls` iterations of `step` each.
    pub fn polls(polls: u32, step: MicrosDurationU32) -> Self {
        let step_us = step.to_micros().max(1);
        Timeout {
            remaining_us: polls.saturating_mul(step_us),
            step_us,
        }
    }

    /// Sleeps for one step. Returns `false` without sleeping once the budget
    /// is exhausted.
    pub fn wait<D: DelayNs>(&mut self, delay: &mut D) -> bool {
        if self.expired() {
            return false;
        }
        let step = self.step_us.min(self.remaining_us);
        delay.delay_us(step);
        self.remaining_us -= step;
        true
    }

    pub fn expired(&self) -> bool {
        self.remaining_us == 0
    }

    pub fn remaining(&self) -> MicrosDurationU32 {
        MicrosDurationU32::micros(self.remaining_us)
    }
}

/// Polls `done` until it returns `true` or `timeout` runs out.
///
/// `done` is always evaluated once more after the last sleep, so a condition
/// that becomes true during the final step is still seen.
pub fn poll_until<D, F>(delay: &mut D, mut timeout: Timeout, mut done: F) -> bool
where
    D: DelayNs,
    F: FnMut() -> bool,
{
    loop {
        if done() {
            return true;
        }
        if !timeout.wait(delay) {
            return false;
        }
    }
}

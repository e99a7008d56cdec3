//! Delays.

use crate::target_constants::CORE_CLOCK_HZ;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;
use embedded_hal::delay::DelayNs;

/// System timer (SysTick) as a delay provider.
///
/// This is what the BLE transfer engine busy-waits on when polling the
/// STATUS and IRQ lines.
pub struct Delay {
    syst: SYST,
    clock_hz: u32,
}

impl Delay {
    /// Configures the system timer (SysTick) as a delay provider, clocked
    /// from the core clock at its reset frequency.
    pub fn new(syst: SYST) -> Self {
        Self::with_clock(syst, CORE_CLOCK_HZ)
    }

    /// Same as [`Delay::new`], for a core clock that was reconfigured
    /// (e.g. the 96 MHz burst mode).
    pub fn with_clock(mut syst: SYST, clock_hz: u32) -> Self {
        syst.set_clock_source(SystClkSource::Core);

        Delay { syst, clock_hz }
    }

    /// Releases the system timer (SysTick) resource.
    pub fn free(self) -> SYST {
        self.syst
    }
}

impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        // The SysTick Reload Value register supports values between 1 and 0x00FFFFFF.
        const MAX_RVR: u64 = 0x00FF_FFFF;

        let mut total_rvr = u64::from(ns) * u64::from(self.clock_hz) / 1_000_000_000;

        while total_rvr != 0 {
            let current_rvr = total_rvr.min(MAX_RVR);

            self.syst.set_reload(current_rvr as u32);
            self.syst.clear_current();
            self.syst.enable_counter();

            total_rvr -= current_rvr;

            while !self.syst.has_wrapped() {}

            self.syst.disable_counter();
        }
    }
}

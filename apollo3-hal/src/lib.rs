#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod ble;
pub mod delay;
pub mod timeout;

use embedded_hal as hal;

pub mod prelude {
    pub use crate::hal::delay::DelayNs as _;

    pub use fugit::ExtU32 as _;
}

/// Limits of the Apollo3 BLEIF and its DMA engine.
pub mod target_constants {
    /// Depth of each BLEIF FIFO direction, in bytes.
    pub const FIFO_DEPTH: usize = 32;
    /// The CMD.TSIZE field is 12 bits wide.
    pub const MAX_TRANSFER_SIZE: usize = 4095;
    // The DMA engine can only reach the system SRAM.
    pub const SRAM_LOWER: usize = 0x1000_0000;
    pub const SRAM_UPPER: usize = 0x1006_0000;
    /// Core clock after reset (HFRC).
    pub const CORE_CLOCK_HZ: u32 = 48_000_000;
}

/// Does this word slice reside entirely within DMA-reachable SRAM?
pub(crate) fn slice_in_ram(slice: &[u32]) -> bool {
    range_in_ram(slice.as_ptr() as usize, core::mem::size_of_val(slice))
}

fn range_in_ram(start: usize, len: usize) -> bool {
    match start.checked_add(len) {
        Some(end) => start >= target_constants::SRAM_LOWER && end <= target_constants::SRAM_UPPER,
        None => false,
    }
}

pub use crate::ble::{Ble, Modules, MODULES};
pub use crate::delay::Delay;

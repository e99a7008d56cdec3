//! Driver state shared between thread mode and the BLEIF interrupt.

use core::cell::Cell;

use critical_section::Mutex;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        /// A transfer owns the bus.
        const BUSY = 1 << 0;
        const CMD_COMPLETE = 1 << 1;
        const DMA_COMPLETE = 1 << 2;
        const FLOW_CONTROL_COMPLETE = 1 << 3;
        /// The previous transfer asked to keep the packet open; the next
        /// status check passes once without sampling the line.
        const CONTINUE_PACKET = 1 << 4;
        /// A deferred write is parked in the saved slot.
        const SAVED_PACKET = 1 << 5;
        const PATCH_COMPLETE = 1 << 6;
        /// The most recent transfer was a write.
        const LAST_PACKET_TX = 1 << 7;
        const USE_DEFAULT_PATCHES = 1 << 8;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Flags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Flags({=u16:#x})", self.bits())
    }
}

/// Flag word behind a critical section. Doubles as the bus lock.
pub struct State {
    flags: Mutex<Cell<Flags>>,
}

impl State {
    pub const fn new() -> Self {
        State {
            flags: Mutex::new(Cell::new(Flags::empty())),
        }
    }

    /// Takes the bus if it is free, clearing the completion flags of the
    /// previous transfer. Never waits.
    pub fn try_lock(&self) -> bool {
        critical_section::with(|cs| {
            let cell = self.flags.borrow(cs);
            let flags = cell.get();
            if flags.contains(Flags::BUSY) {
                return false;
            }
            cell.set(
                (flags | Flags::BUSY)
                    - (Flags::CMD_COMPLETE | Flags::DMA_COMPLETE | Flags::FLOW_CONTROL_COMPLETE),
            );
            true
        })
    }

    pub fn unlock(&self) {
        self.remove(Flags::BUSY);
    }

    pub fn is_busy(&self) -> bool {
        self.contains(Flags::BUSY)
    }

    pub fn get(&self) -> Flags {
        critical_section::with(|cs| self.flags.borrow(cs).get())
    }

    pub fn contains(&self, flags: Flags) -> bool {
        self.get().contains(flags)
    }

    pub fn insert(&self, flags: Flags) {
        self.modify(|f| f | flags);
    }

    pub fn remove(&self, flags: Flags) {
        self.modify(|f| f - flags);
    }

    pub fn set(&self, flags: Flags, on: bool) {
        if on {
            self.insert(flags)
        } else {
            self.remove(flags)
        }
    }

    /// Clears `flags` and reports whether any of them was set.
    pub fn take(&self, flags: Flags) -> bool {
        critical_section::with(|cs| {
            let cell = self.flags.borrow(cs);
            let old = cell.get();
            cell.set(old - flags);
            old.intersects(flags)
        })
    }

    fn modify(&self, f: impl FnOnce(Flags) -> Flags) {
        critical_section::with(|cs| {
            let cell = self.flags.borrow(cs);
            cell.set(f(cell.get()));
        })
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

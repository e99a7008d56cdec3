//! HAL interface to the BLE interface (BLEIF) of the Apollo3.
//!
//! The BLEIF is a half-duplex SPI master wired to the on-package radio core.
//! Besides the data lines it has three handshake signals: WAKE (MCU to
//! radio, "I have something to send"), STATUS (radio to MCU, "ready to
//! clock in a write") and BLEIRQ (radio to MCU, "I have something for you").
//!
//! [`Ble`] owns one interface and runs every transfer through a single-owner
//! bus lock. Transfers are either blocking ([`Ble::blocking_transfer`]) or
//! DMA driven ([`Ble::nonblocking_transfer`]), the latter finishing in
//! [`Ble::handle_interrupt`].

use core::cell::Cell;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;
use fugit::{ExtU32, MicrosDurationU32};
use heapless::spsc::Producer;
use tock_registers::fields::FieldValue;

use crate::timeout::{poll_until, Timeout};

mod blocking;
mod command;
mod dma;
mod hci;
mod patch;
pub mod regs;
mod state;

#[cfg(test)]
pub(crate) mod sim;

pub use blocking::{Data, Transfer};
pub use command::{CommandWord, Direction, Offset};
pub use dma::{dispatch, next_completion, Completion, DmaBuffer, DmaTransfer, Submission};
pub use hci::{Framing, PacketType, TxPower};
pub use patch::{crc16, Patch, MAX_PATCH_PACKET_LEN, PATCH_TRIALS};
pub use regs::{Bleif, Capabilities, Instance, Interrupts, Reg, Silicon};
pub use state::{Flags, State};

use regs::{BLECFG, BLEDBG, BSTATUS, CLKCFG, FIFOCTRL, FIFOTHR, MSPICFG};

/// Number of BLE interfaces on the part.
pub const NUM_MODULES: usize = 1;

/// Slots in the completion queue handed to [`Ble::attach_events`]. The
/// queue holds one less than this.
pub const EVENT_QUEUE_LEN: usize = 4;

const FEATURE_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::millis(10);
const POWER_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::millis(100);
const POWER_POLL: MicrosDurationU32 = MicrosDurationU32::micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No BLE interface with that index.
    OutOfRange,
    InvalidArg,
    /// The interface is already initialized, or the call does not fit the
    /// current state.
    InvalidOperation,
    BusBusy,
    /// A read was requested while the radio has nothing to send.
    IrqLow,
    /// The radio never raised STATUS, or interrupted the handshake with IRQ.
    SpiNotReady,
    NoHciResponse,
    /// CMDCMP never arrived after the data phase.
    HciPacketIncomplete,
    /// The radio's 32 kHz clock is out of tolerance.
    ClockUnstable,
    /// Acknowledgement or status mismatch.
    Fail,
    /// FIFOs not empty after a DMA transfer.
    FifoError,
    RxBufferTooSmall,
    /// DMA can only reach system SRAM.
    DmaBufferNotInDataMemory,
    EventQueueFull,
    FeatureDisabled,
    PowerupIncomplete,
    ShutdownFailed,
    RegulatorFailed,
}

/// SPI clock of the BLEIF, derived from the 48 MHz HFRC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiClock {
    M24,
    M12,
    M6,
    M3,
    K1500,
    K750,
}

impl SpiClock {
    fn fsel(self) -> u32 {
        match self {
            SpiClock::M24 => 1,
            SpiClock::M12 => 2,
            SpiClock::M6 => 3,
            SpiClock::M3 => 4,
            SpiClock::K1500 => 5,
            SpiClock::K750 => 6,
        }
    }
}

/// Interface configuration, applied by [`Ble::configure`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub spi_clock: SpiClock,
    /// Read FIFO level that triggers DMA, in bytes.
    pub read_threshold: u8,
    /// Write FIFO space that triggers DMA, in bytes.
    pub write_threshold: u8,
    /// Feed the radio's low-power clock from the MCU's 32 kHz oscillator.
    pub clock_32k: bool,
    /// Let the radio sleep between connection events.
    pub sleep_enabled: bool,
    pub use_default_patches: bool,
    /// Patches applied by [`Ble::boot`] when `use_default_patches` is set.
    pub default_patches: &'static [Patch<'static>],
    /// Switch the radio to two-byte HCI length prefixes after patching.
    pub two_byte_header: bool,
    /// How long a write waits for STATUS, polled every 10 µs.
    pub status_timeout: MicrosDurationU32,
    /// Debug aid: complete DMA transfers without the flow-control edge.
    pub skip_flow_control: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            spi_clock: SpiClock::M6,
            read_threshold: 8,
            write_threshold: 8,
            clock_32k: true,
            sleep_enabled: true,
            use_default_patches: true,
            default_patches: &[],
            two_byte_header: false,
            status_timeout: MicrosDurationU32::micros(3_000),
            skip_flow_control: false,
        }
    }
}

/// Radio power states for [`Ble::power_control`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    Wake,
    Off,
}

/// The transfer currently owning the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHeader {
    pub direction: Direction,
    pub offset: Offset,
    pub len: u16,
    pub cont: bool,
}

/// Tracks which BLE interfaces have a live [`Ble`] handle.
pub struct Modules {
    claimed: Mutex<Cell<u32>>,
}

/// Registry for the interfaces of this chip.
pub static MODULES: Modules = Modules::new();

impl Modules {
    pub const fn new() -> Self {
        Modules {
            claimed: Mutex::new(Cell::new(0)),
        }
    }

    /// Takes ownership of BLE interface `module`.
    ///
    /// Fails with `OutOfRange` for a module that does not exist and with
    /// `InvalidOperation` if it is already initialized. The resources are
    /// handed back on failure.
    pub fn initialize<I, D>(
        &self,
        module: usize,
        mut iface: I,
        delay: D,
    ) -> Result<Ble<'_, I, D>, (I, D, Error)>
    where
        I: Instance,
        D: DelayNs,
    {
        if module >= NUM_MODULES {
            return Err((iface, delay, Error::OutOfRange));
        }
        let claimed = critical_section::with(|cs| {
            let cell = self.claimed.borrow(cs);
            let mask = cell.get();
            if mask & (1 << module) != 0 {
                return false;
            }
            cell.set(mask | (1 << module));
            true
        });
        if !claimed {
            return Err((iface, delay, Error::InvalidOperation));
        }

        let silicon = Silicon::from_chip_revision(iface.chip_revision());
        debug!("BLE{} initialized on {:?}", module, silicon);

        Ok(Ble {
            module,
            iface,
            delay,
            registry: self,
            silicon,
            config: Config::default(),
            framing: Framing::OneByte,
            state: State::new(),
            current: None,
            dma: None,
            saved: None,
            events: None,
        })
    }

    pub fn is_initialized(&self, module: usize) -> bool {
        module < NUM_MODULES
            && critical_section::with(|cs| self.claimed.borrow(cs).get() & (1 << module) != 0)
    }

    fn release(&self, module: usize) {
        critical_section::with(|cs| {
            let cell = self.claimed.borrow(cs);
            cell.set(cell.get() & !(1 << module));
        })
    }
}

impl Default for Modules {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver for one BLE interface.
pub struct Ble<'a, I, D> {
    module: usize,
    iface: I,
    delay: D,
    registry: &'a Modules,
    silicon: Silicon,
    config: Config,
    framing: Framing,
    state: State,
    current: Option<TransferHeader>,
    dma: Option<DmaTransfer>,
    saved: Option<DmaTransfer>,
    events: Option<Producer<'a, Completion, EVENT_QUEUE_LEN>>,
}

impl<'a, I, D> Ble<'a, I, D>
where
    I: Instance,
    D: DelayNs,
{
    /// Releases the interface and returns its resources.
    pub fn deinitialize(mut self) -> (I, D) {
        self.disable_interrupts(Interrupts::all());
        self.registry.release(self.module);
        (self.iface, self.delay)
    }

    pub fn module(&self) -> usize {
        self.module
    }

    pub fn silicon(&self) -> Silicon {
        self.silicon
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flags(&self) -> Flags {
        self.state.get()
    }

    /// Bus lock and completion flags.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Header of the transfer currently owning the bus, if any.
    pub fn current(&self) -> Option<TransferHeader> {
        self.current
    }

    /// Routes completions of non-blocking transfers to `events` instead of
    /// calling their callbacks from interrupt context.
    pub fn attach_events(&mut self, events: Producer<'a, Completion, EVENT_QUEUE_LEN>) {
        self.events = Some(events);
    }

    pub fn detach_events(&mut self) -> Option<Producer<'a, Completion, EVENT_QUEUE_LEN>> {
        self.events.take()
    }

    /// Applies `config` to the interface.
    pub fn configure(&mut self, config: Config) -> Result<(), Error> {
        let depth = crate::target_constants::FIFO_DEPTH as u8;
        if config.read_threshold > depth || config.write_threshold > depth {
            return Err(Error::InvalidArg);
        }

        self.iface.store(
            Reg::ClkCfg,
            CLKCFG::IOCLKEN::SET
                + CLKCFG::FSEL.val(config.spi_clock.fsel())
                + CLKCFG::CLK32KEN.val(config.clock_32k as u32),
        );
        self.iface.store(
            Reg::FifoThr,
            FIFOTHR::FIFORTHR.val(u32::from(config.read_threshold))
                + FIFOTHR::FIFOWTHR.val(u32::from(config.write_threshold)),
        );
        self.iface.store(Reg::MspiCfg, MSPICFG::WTFCPOL::SET + MSPICFG::RDFCPOL::SET);
        self.iface.update(Reg::BleCfg, BLECFG::WAKEUPCTL::OFF);
        if self.silicon.capabilities().fifo_pop_write {
            self.iface.update(Reg::FifoCtrl, FIFOCTRL::POPWR::SET);
        }
        command::fifo_reset(&mut self.iface);

        self.state.set(Flags::USE_DEFAULT_PATCHES, config.use_default_patches);
        self.config = config;
        Ok(())
    }

    /// Powers the radio core up or down.
    pub fn power_control(&mut self, power: PowerState) -> Result<(), Error> {
        match power {
            PowerState::Wake => {
                self.iface.set_feature_request(true);
                let iface = &mut self.iface;
                if !poll_until(
                    &mut self.delay,
                    Timeout::new(FEATURE_TIMEOUT, 10.micros()),
                    || iface.feature_ready(),
                ) {
                    warn!("BLE feature not granted");
                    return Err(Error::FeatureDisabled);
                }

                self.iface.set_power_domain(true);
                let iface = &mut self.iface;
                if !poll_until(&mut self.delay, Timeout::new(POWER_TIMEOUT, POWER_POLL), || {
                    iface.power_domain_on()
                }) {
                    return Err(Error::RegulatorFailed);
                }

                self.iface.update(Reg::BleCfg, BLECFG::PWRSMEN::SET + BLECFG::BLERSTN::SET);
                if !self.wait_power_state(BSTATUS::PWRST::ACTIVE) {
                    return Err(Error::PowerupIncomplete);
                }
                debug!("BLE core active");
                Ok(())
            }
            PowerState::Off => {
                self.iface.update(
                    Reg::BleCfg,
                    BLECFG::BLERSTN::CLEAR + BLECFG::PWRSMEN::CLEAR + BLECFG::WAKEUPCTL::OFF,
                );
                if !self.wait_power_state(BSTATUS::PWRST::OFF) {
                    return Err(Error::ShutdownFailed);
                }

                self.iface.set_power_domain(false);
                let iface = &mut self.iface;
                if !poll_until(&mut self.delay, Timeout::new(POWER_TIMEOUT, POWER_POLL), || {
                    !iface.power_domain_on()
                }) {
                    return Err(Error::ShutdownFailed);
                }
                self.iface.set_feature_request(false);

                // The core forgets its patches and framing when it loses power.
                self.state
                    .remove(Flags::PATCH_COMPLETE | Flags::LAST_PACKET_TX | Flags::CONTINUE_PACKET);
                self.framing = Framing::OneByte;
                debug!("BLE core off");
                Ok(())
            }
        }
    }

    fn wait_power_state(&mut self, pwrst: FieldValue<u32, BSTATUS::Register>) -> bool {
        let iface = &mut self.iface;
        poll_until(&mut self.delay, Timeout::new(POWER_TIMEOUT, POWER_POLL), || {
            iface.fetch::<BSTATUS::Register>(Reg::BStatus).matches_all(pwrst)
        })
    }

    /// Level of the STATUS line. A transfer that asked to continue its
    /// packet makes the next check pass without sampling.
    pub fn check_status(&mut self) -> bool {
        if self.state.take(Flags::CONTINUE_PACKET) {
            return true;
        }
        self.status_line()
    }

    /// Level of the BLEIRQ line.
    pub fn check_irq(&mut self) -> bool {
        blocking::ble_irq(&mut self.iface)
    }

    /// Whether STATUS rose since it was last consumed. The edge latch is only
    /// reliable once the radio is patched; before that the level is used.
    fn status_edge(&mut self) -> bool {
        if self.state.take(Flags::CONTINUE_PACKET) {
            return true;
        }
        if !self.state.contains(Flags::PATCH_COMPLETE) {
            return self.status_line();
        }
        let raw = Interrupts::from_bits_truncate(self.iface.read(Reg::IntStat));
        if raw.contains(Interrupts::BLECSSTAT) {
            self.iface.write(Reg::IntClr, Interrupts::BLECSSTAT.bits());
            true
        } else {
            false
        }
    }

    fn status_line(&mut self) -> bool {
        blocking::spi_status(&mut self.iface)
    }

    /// Drives the WAKE line.
    pub fn wakeup_set(&mut self, on: bool) {
        let ctl = if on {
            BLECFG::WAKEUPCTL::ON
        } else {
            BLECFG::WAKEUPCTL::OFF
        };
        self.iface.update(Reg::BleCfg, ctl);
    }

    fn io_clock(&mut self, on: bool) {
        self.iface.update(Reg::BleDbg, BLEDBG::IOCLKON.val(on as u32));
    }

    pub fn enable_interrupts(&mut self, irqs: Interrupts) {
        let enabled = self.iface.read(Reg::IntEn);
        self.iface.write(Reg::IntEn, enabled | irqs.bits());
    }

    pub fn disable_interrupts(&mut self, irqs: Interrupts) {
        let enabled = self.iface.read(Reg::IntEn);
        self.iface.write(Reg::IntEn, enabled & !irqs.bits());
    }

    pub fn clear_interrupts(&mut self, irqs: Interrupts) {
        self.iface.write(Reg::IntClr, irqs.bits());
    }

    /// Pending interrupts, optionally masked by the enabled set.
    pub fn interrupt_status(&mut self, enabled_only: bool) -> Interrupts {
        let mut raw = self.iface.read(Reg::IntStat);
        if enabled_only {
            raw &= self.iface.read(Reg::IntEn);
        }
        Interrupts::from_bits_truncate(raw)
    }

    /// Register access for diagnostics.
    pub fn iface(&mut self) -> &mut I {
        &mut self.iface
    }
}

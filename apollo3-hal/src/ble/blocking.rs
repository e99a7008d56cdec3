//! Blocking transfers.
//!
//! A write walks the handshake: assert WAKE, wait for the radio to raise
//! STATUS, take the bus, issue the command, feed the FIFO and wait for
//! CMDCMP. A read needs the radio to already be asserting BLEIRQ.

use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU32;

use super::command::{self, CommandWord, Direction, Offset};
use super::regs::{Instance, Interrupts, Reg, BSTATUS};
use super::{Ble, Error, Flags, TransferHeader};
use crate::timeout::{poll_until, Timeout};

/// Polls of 1 µs allowed for FIFO space or data to show up mid-transfer.
pub(crate) const MAX_BLOCKING_WAIT: u32 = 5000;

const STATUS_POLL: MicrosDurationU32 = MicrosDurationU32::micros(10);
/// Gap between back-to-back writes while the radio still runs its ROM.
const PACKET_SPACING_US: u32 = 1_000;
/// STATUS from the previous write must drop within this many polls.
const STATUS_RELEASE_POLLS: u32 = 300;
const WRITE_CMDCMP_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::millis(2);
const CMDCMP_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::millis(10);

/// Payload of a blocking transfer.
#[derive(Debug)]
pub enum Data<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

impl Data<'_> {
    pub fn len(&self) -> usize {
        match self {
            Data::Write(data) => data.len(),
            Data::Read(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One blocking transfer. The length is the length of the buffer.
#[derive(Debug)]
pub struct Transfer<'a> {
    pub offset: Offset,
    /// Keep the packet open: the next transfer skips the STATUS/IRQ check.
    pub cont: bool,
    pub data: Data<'a>,
}

impl<'a> Transfer<'a> {
    /// A write without offset bytes.
    pub fn write(data: &'a [u8]) -> Self {
        Transfer {
            offset: Offset::NONE,
            cont: false,
            data: Data::Write(data),
        }
    }

    pub fn read(buf: &'a mut [u8]) -> Self {
        Transfer {
            offset: Offset::NONE,
            cont: false,
            data: Data::Read(buf),
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_cont(mut self, cont: bool) -> Self {
        self.cont = cont;
        self
    }

    pub fn direction(&self) -> Direction {
        match self.data {
            Data::Write(_) => Direction::Write,
            Data::Read(_) => Direction::Read,
        }
    }
}

pub(crate) fn command_complete<I: Instance>(iface: &mut I) -> bool {
    Interrupts::from_bits_truncate(iface.read(Reg::IntStat)).contains(Interrupts::CMDCMP)
}

pub(crate) fn spi_status<I: Instance>(iface: &mut I) -> bool {
    iface.fetch::<BSTATUS::Register>(Reg::BStatus).is_set(BSTATUS::SPISTATUS)
}

pub(crate) fn ble_irq<I: Instance>(iface: &mut I) -> bool {
    iface.fetch::<BSTATUS::Register>(Reg::BStatus).is_set(BSTATUS::BLEIRQ)
}

impl<'a, I, D> Ble<'a, I, D>
where
    I: Instance,
    D: DelayNs,
{
    /// Runs `transfer` to completion.
    ///
    /// A zero-length transfer succeeds without touching the interface. A
    /// failed precondition leaves the bus and the current-transfer state as
    /// they were.
    pub fn blocking_transfer(&mut self, transfer: Transfer<'_>) -> Result<(), Error> {
        let len = transfer.data.len();
        if len == 0 {
            return Ok(());
        }
        let direction = transfer.direction();
        let command = CommandWord::encode(direction, len, transfer.offset, transfer.cont)?;
        let header = TransferHeader {
            direction,
            offset: transfer.offset,
            len: len as u16,
            cont: transfer.cont,
        };
        trace!(
            "blocking {:?} of {} bytes, cmd {:#x}",
            direction,
            len,
            command.cmd()
        );

        match transfer.data {
            Data::Write(data) => self.blocking_write(command, header, data),
            Data::Read(buf) => self.blocking_read(command, header, buf),
        }
    }

    fn blocking_write(
        &mut self,
        command: CommandWord,
        header: TransferHeader,
        data: &[u8],
    ) -> Result<(), Error> {
        let patched = self.state.contains(Flags::PATCH_COMPLETE);
        if patched {
            // STATUS of the previous write has to drop before a new edge can
            // be recognised.
            let iface = &mut self.iface;
            poll_until(
                &mut self.delay,
                Timeout::polls(STATUS_RELEASE_POLLS, STATUS_POLL),
                || !spi_status(iface),
            );
        } else if self.state.contains(Flags::LAST_PACKET_TX) {
            self.delay.delay_us(PACKET_SPACING_US);
        }

        self.io_clock(true);
        self.wakeup_set(true);
        let acquired = self.acquire_for_write();
        self.io_clock(false);
        if let Err(e) = acquired {
            self.wakeup_set(false);
            debug!("write handshake failed: {:?}", e);
            return Err(e);
        }

        self.current = Some(header);
        let inten = self.iface.read(Reg::IntEn);
        self.iface.write(Reg::IntEn, 0);
        self.clear_interrupts(Interrupts::CMDCMP);

        critical_section::with(|_| {
            command.issue(&mut self.iface);
            self.pump_write(data);
        });

        let iface = &mut self.iface;
        poll_until(
            &mut self.delay,
            Timeout::new(WRITE_CMDCMP_TIMEOUT, STATUS_POLL),
            || command_complete(iface),
        );
        self.wakeup_set(false);

        self.finish_blocking(inten, header)
    }

    /// Waits for the radio to answer WAKE with STATUS and takes the bus.
    fn acquire_for_write(&mut self) -> Result<(), Error> {
        let mut timeout = Timeout::new(self.config.status_timeout, STATUS_POLL);
        let mut status_seen = false;
        loop {
            if ble_irq(&mut self.iface) {
                // The radio wants to talk first.
                return Err(Error::SpiNotReady);
            }
            if self.status_edge() {
                status_seen = true;
                if self.state.try_lock() {
                    return Ok(());
                }
            }
            if !timeout.wait(&mut self.delay) {
                return Err(if status_seen {
                    Error::BusBusy
                } else {
                    Error::SpiNotReady
                });
            }
        }
    }

    fn pump_write(&mut self, data: &[u8]) {
        let mut index = 0;
        while index < data.len() {
            if command_complete(&mut self.iface) {
                break;
            }
            let iface = &mut self.iface;
            let room = poll_until(
                &mut self.delay,
                Timeout::polls(MAX_BLOCKING_WAIT, MicrosDurationU32::micros(1)),
                || command::write_fifo_space(iface) >= 4,
            );
            if !room {
                warn!("write FIFO stalled at {} of {}", index, data.len());
                break;
            }
            command::fifo_fill(&mut self.iface, data, &mut index);
        }
    }

    fn blocking_read(
        &mut self,
        command: CommandWord,
        header: TransferHeader,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let continued = self.state.contains(Flags::CONTINUE_PACKET);
        if !continued && !self.check_irq() {
            return Err(Error::IrqLow);
        }
        if !self.state.try_lock() {
            return Err(Error::BusBusy);
        }
        self.state.remove(Flags::CONTINUE_PACKET);

        self.current = Some(header);
        let inten = self.iface.read(Reg::IntEn);
        self.iface.write(Reg::IntEn, 0);
        self.clear_interrupts(Interrupts::CMDCMP);

        let pop_write = self.silicon.capabilities().fifo_pop_write;
        critical_section::with(|_| command.issue(&mut self.iface));
        let mut drained = 0;
        let mut idle = Timeout::polls(MAX_BLOCKING_WAIT, MicrosDurationU32::micros(1));
        while drained < buf.len() {
            if command::fifo_drain(&mut self.iface, pop_write, buf, &mut drained) == 0
                && !idle.wait(&mut self.delay)
            {
                break;
            }
        }

        let finished = self.finish_blocking(inten, header);
        if drained < buf.len() {
            warn!("read stalled at {} of {}", drained, buf.len());
            return Err(Error::HciPacketIncomplete);
        }
        finished
    }

    /// Common epilogue: wait for CMDCMP, restore the interrupt mask, release
    /// the bus and remember what kind of packet this was.
    fn finish_blocking(&mut self, inten: u32, header: TransferHeader) -> Result<(), Error> {
        let iface = &mut self.iface;
        let complete = poll_until(
            &mut self.delay,
            Timeout::new(CMDCMP_TIMEOUT, STATUS_POLL),
            || command_complete(iface),
        );
        self.clear_interrupts(Interrupts::CMDCMP);
        self.current = None;
        self.iface.write(Reg::IntEn, inten);
        self.state.unlock();

        self.state.set(Flags::LAST_PACKET_TX, header.direction == Direction::Write);
        if !complete {
            return Err(Error::HciPacketIncomplete);
        }
        self.state.set(Flags::CONTINUE_PACKET, header.cont);
        Ok(())
    }
}

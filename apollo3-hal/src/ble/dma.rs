//! DMA driven (non-blocking) transfers and their completion interrupt.
//!
//! A transfer is only complete once three things have happened: the command
//! finished (CMDCMP), the DMA engine finished (DCMP) and, on silicon that
//! reports it, the radio released its handshake line (the flow-control edge).
//! These arrive in any order, possibly over several interrupts.

use core::fmt;
use core::sync::atomic::{compiler_fence, Ordering};

use embedded_hal::delay::DelayNs;
use heapless::spsc::Consumer;

use super::command::{CommandWord, Direction, Offset};
use super::regs::{Instance, Interrupts, Reg, DMACFG, DMATRIGEN, FIFOPTR_EMPTY};
use super::{Ble, Error, Flags, TransferHeader};

/// Word buffer handed to the DMA engine for the duration of a transfer.
#[derive(Debug)]
pub enum DmaBuffer {
    Write(&'static [u32]),
    Read(&'static mut [u32]),
}

impl DmaBuffer {
    pub fn words(&self) -> &[u32] {
        match self {
            DmaBuffer::Write(words) => words,
            DmaBuffer::Read(words) => words,
        }
    }
}

/// One non-blocking transfer. It travels into the driver on submission and
/// comes back inside the [`Completion`].
pub struct DmaTransfer {
    pub offset: Offset,
    pub cont: bool,
    /// Extra repetitions of the command (CMDRPT).
    pub repeat: u8,
    /// Length in bytes, at most the size of `buffer`.
    pub len: usize,
    pub buffer: DmaBuffer,
    pub callback: Option<fn(&Completion)>,
    /// Opaque value for the callback.
    pub context: usize,
}

impl DmaTransfer {
    pub fn write(buffer: &'static [u32], len: usize) -> Self {
        Self::new(DmaBuffer::Write(buffer), len)
    }

    pub fn read(buffer: &'static mut [u32], len: usize) -> Self {
        Self::new(DmaBuffer::Read(buffer), len)
    }

    fn new(buffer: DmaBuffer, len: usize) -> Self {
        DmaTransfer {
            offset: Offset::NONE,
            cont: false,
            repeat: 0,
            len,
            buffer,
            callback: None,
            context: 0,
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

    pub fn with_callback(mut self, callback: fn(&Completion), context: usize) -> Self {
        self.callback = Some(callback);
        self.context = context;
        self
    }

    pub fn direction(&self) -> Direction {
        match self.buffer {
            DmaBuffer::Write(_) => Direction::Write,
            DmaBuffer::Read(_) => Direction::Read,
        }
    }

    fn header(&self) -> TransferHeader {
        TransferHeader {
            direction: self.direction(),
            offset: self.offset,
            len: self.len as u16,
            cont: self.cont,
        }
    }
}

impl fmt::Debug for DmaTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaTransfer")
            .field("direction", &self.direction())
            .field("offset", &self.offset)
            .field("cont", &self.cont)
            .field("repeat", &self.repeat)
            .field("len", &self.len)
            .field("callback", &self.callback.is_some())
            .field("context", &self.context)
            .finish()
    }
}

/// A finished non-blocking transfer.
#[derive(Debug)]
pub struct Completion {
    pub transfer: DmaTransfer,
    pub result: Result<(), Error>,
}

impl Completion {
    /// Runs the transfer's callback, if it has one.
    pub fn notify(&self) {
        if let Some(callback) = self.transfer.callback {
            callback(self);
        }
    }

    pub fn context(&self) -> usize {
        self.transfer.context
    }
}

/// Outcome of [`Ble::nonblocking_transfer`].
#[derive(Debug)]
pub enum Submission {
    /// DMA is running; a [`Completion`] follows.
    Started,
    /// The radio is busy talking to us. The write was parked and is replayed
    /// once the bus frees up.
    Deferred,
    /// Nothing to transfer. The transfer is handed straight back.
    Completed(DmaTransfer),
}

/// Drains `events`, running every completion's callback in the caller's
/// context. Returns how many were handled.
pub fn dispatch<const N: usize>(events: &mut Consumer<'_, Completion, N>) -> usize {
    let mut handled = 0;
    while let Some(completion) = events.dequeue() {
        completion.notify();
        handled += 1;
    }
    handled
}

pub fn next_completion<const N: usize>(
    events: &mut Consumer<'_, Completion, N>,
) -> nb::Result<Completion, void::Void> {
    events.dequeue().ok_or(nb::Error::WouldBlock)
}

impl<'a, I, D> Ble<'a, I, D>
where
    I: Instance,
    D: DelayNs,
{
    /// Starts `transfer` on the DMA engine and returns immediately.
    ///
    /// Preconditions are checked without waiting. On failure the transfer
    /// is handed back with the error.
    ///
    /// A write raises WAKE. If the radio is sending (BLEIRQ), the bus is
    /// taken, or STATUS is not up yet, the write is parked and started from
    /// [`Ble::handle_interrupt`] on BLECSSTAT or BLECIRQN, so both should be
    /// enabled while a write is parked.
    pub fn nonblocking_transfer(
        &mut self,
        transfer: DmaTransfer,
    ) -> Result<Submission, (Error, DmaTransfer)> {
        if transfer.len == 0 {
            return Ok(Submission::Completed(transfer));
        }
        if transfer.len > core::mem::size_of_val(transfer.buffer.words()) {
            return Err((Error::InvalidArg, transfer));
        }
        let direction = transfer.direction();
        let command =
            match CommandWord::encode(direction, transfer.len, transfer.offset, transfer.cont) {
                Ok(command) => command,
                Err(e) => return Err((e, transfer)),
            };
        let address = match self.iface.dma_address(transfer.buffer.words()) {
            Some(address) => address,
            None => return Err((Error::DmaBufferNotInDataMemory, transfer)),
        };

        critical_section::with(|_| {
            match direction {
                Direction::Write => {
                    if self.check_irq() || self.state.is_busy() {
                        return self.defer(transfer);
                    }
                    self.wakeup_set(true);
                    if !self.check_status() {
                        // WAKE stays up; BLECSSTAT restarts the write.
                        return self.defer(transfer);
                    }
                    if !self.state.try_lock() {
                        return Err((Error::BusBusy, transfer));
                    }
                }
                Direction::Read => {
                    let continued = self.state.contains(Flags::CONTINUE_PACKET);
                    if !continued && !self.check_irq() {
                        return Err((Error::IrqLow, transfer));
                    }
                    if !self.state.try_lock() {
                        return Err((Error::BusBusy, transfer));
                    }
                    self.state.remove(Flags::CONTINUE_PACKET);
                }
            }
            self.start_dma(command, address, transfer);
            Ok(Submission::Started)
        })
    }

    fn defer(&mut self, transfer: DmaTransfer) -> Result<Submission, (Error, DmaTransfer)> {
        if self.saved.is_some() {
            return Err((Error::BusBusy, transfer));
        }
        debug!("deferring {} byte write", transfer.len);
        self.saved = Some(transfer);
        self.state.insert(Flags::SAVED_PACKET);
        Ok(Submission::Deferred)
    }

    fn start_dma(&mut self, command: CommandWord, address: u32, transfer: DmaTransfer) {
        let direction = transfer.direction();
        self.current = Some(transfer.header());

        self.iface.write(Reg::DmaTargAddr, address);
        self.iface.write(Reg::DmaTotCount, transfer.len as u32);
        self.iface.store(Reg::DmaTrigEn, DMATRIGEN::DTHREN::SET);
        let dir = match direction {
            Direction::Write => DMACFG::DMADIR::M2P,
            Direction::Read => DMACFG::DMADIR::P2M,
        };
        self.iface.store(Reg::DmaCfg, dir + DMACFG::DMAEN::DIS);
        self.iface.write(Reg::CmdRpt, u32::from(transfer.repeat));
        self.clear_interrupts(
            Interrupts::CMDCMP | Interrupts::DCMP | Interrupts::BLECSSTATN | Interrupts::BLECIRQN,
        );

        // The buffer must be fully written before the engine may read it.
        compiler_fence(Ordering::SeqCst);

        command.issue(&mut self.iface);
        self.iface.update(Reg::DmaCfg, DMACFG::DMAEN::EN);
        self.dma = Some(transfer);

        if direction == Direction::Write {
            // The radio latched the request; holding WAKE longer would keep
            // it from sleeping.
            self.wakeup_set(false);
        }
    }

    /// Retries the parked write, if there is one.
    pub fn resume_saved(&mut self) -> Result<Submission, Error> {
        let saved = self.saved.take().ok_or(Error::InvalidOperation)?;
        self.state.remove(Flags::SAVED_PACKET);
        match self.nonblocking_transfer(saved) {
            Ok(submission) => Ok(submission),
            Err((e, transfer)) => {
                self.saved = Some(transfer);
                self.state.insert(Flags::SAVED_PACKET);
                Err(e)
            }
        }
    }

    /// Withdraws the parked write and drops WAKE if nothing is in flight.
    pub fn cancel_saved(&mut self) -> Option<DmaTransfer> {
        self.state.remove(Flags::SAVED_PACKET);
        if self.dma.is_none() {
            self.wakeup_set(false);
        }
        self.saved.take()
    }

    /// Starts the parked write. A failure to start is reported like a
    /// completion.
    fn replay_saved(&mut self) -> Result<(), Error> {
        if !self.state.take(Flags::SAVED_PACKET) {
            return Ok(());
        }
        match self.saved.take() {
            Some(saved) => match self.nonblocking_transfer(saved) {
                Ok(_) => Ok(()),
                Err((e, transfer)) => self.report(Completion {
                    transfer,
                    result: Err(e),
                }),
            },
            None => Ok(()),
        }
    }

    /// Reads, clears and handles the enabled interrupts. Call from the BLEIF
    /// interrupt handler.
    pub fn on_interrupt(&mut self) -> Result<(), Error> {
        let status = self.interrupt_status(true);
        self.clear_interrupts(status);
        self.handle_interrupt(status)
    }

    /// Feeds interrupt `status` into the completion state machine.
    ///
    /// When the in-flight transfer completes, the bus is released and the
    /// completion goes to the attached event queue, or to the transfer's
    /// callback (from this context) when there is none. A parked write is
    /// then replayed. With nothing in flight, a parked write is replayed when
    /// STATUS rises or the radio drops BLEIRQ.
    pub fn handle_interrupt(&mut self, status: Interrupts) -> Result<(), Error> {
        let direction = match (&self.dma, self.current) {
            (Some(_), Some(header)) => header.direction,
            _ => {
                let bus_free = !self.state.is_busy();
                if bus_free && status.intersects(Interrupts::BLECSSTAT | Interrupts::BLECIRQN) {
                    return self.replay_saved();
                }
                return Ok(());
            }
        };

        if status.contains(Interrupts::CMDCMP) {
            self.state.insert(Flags::CMD_COMPLETE);
        }
        if status.contains(Interrupts::DCMP) {
            self.state.insert(Flags::DMA_COMPLETE);
        }
        let flow_control = self.silicon.capabilities().flow_control_irqs;
        if flow_control {
            let edge = match direction {
                Direction::Read => Interrupts::BLECIRQN,
                Direction::Write => Interrupts::BLECSSTATN,
            };
            if status.contains(edge) {
                self.state.insert(Flags::FLOW_CONTROL_COMPLETE);
            }
        }

        let flags = self.state.get();
        let flow_done = flags.contains(Flags::FLOW_CONTROL_COMPLETE)
            || !flow_control
            || self.config.skip_flow_control;
        if !(flags.contains(Flags::CMD_COMPLETE | Flags::DMA_COMPLETE) && flow_done) {
            return Ok(());
        }

        self.state.remove(Flags::CMD_COMPLETE | Flags::DMA_COMPLETE | Flags::FLOW_CONTROL_COMPLETE);
        compiler_fence(Ordering::SeqCst);

        let fifo = self.iface.read(Reg::FifoPtr);
        let result = if fifo == FIFOPTR_EMPTY {
            Ok(())
        } else {
            warn!("FIFOs not empty after DMA: {:#x}", fifo);
            Err(Error::FifoError)
        };

        self.state.set(Flags::LAST_PACKET_TX, direction == Direction::Write);
        if direction == Direction::Write && self.state.contains(Flags::PATCH_COMPLETE) {
            self.wakeup_set(false);
        }
        self.iface.update(Reg::DmaCfg, DMACFG::DMAEN::DIS);
        self.current = None;
        let finished = self.dma.take();
        self.state.unlock();

        let reported = match finished {
            Some(transfer) => {
                if transfer.cont {
                    self.state.insert(Flags::CONTINUE_PACKET);
                }
                self.report(Completion { transfer, result })
            }
            None => Ok(()),
        };

        let replayed = self.replay_saved();
        reported.and(replayed)
    }

    fn report(&mut self, completion: Completion) -> Result<(), Error> {
        match self.events.as_mut() {
            Some(events) => events.enqueue(completion).map_err(|completion| {
                // Nowhere to queue it; the callback still has to hear about it.
                completion.notify();
                Error::EventQueueFull
            }),
            None => {
                completion.notify();
                Ok(())
            }
        }
    }
}

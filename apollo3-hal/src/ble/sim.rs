//! Host-side model of the BLEIF and of the radio behind it.
//!
//! [`SimBleif`] implements [`Instance`] with enough hardware behaviour for
//! the transfer engine to run unmodified: the WAKE/STATUS handshake, BLEIRQ
//! while the radio has data, FIFOs with CMDCMP at the end of a command, and
//! a record of what the DMA engine was told to do. [`FakeRadio`] answers
//! patch packets and HCI commands the way the radio firmware does.

use std::collections::{HashMap, VecDeque};

use embedded_hal::delay::DelayNs;
use tock_registers::LocalRegisterCopy;

use super::command::{CommandWord, Direction};
use super::hci::{
    Framing, HEADER_FORMAT_OPCODE, LE_TEST_END_OPCODE, PLF_REG_READ_OPCODE, PLF_REG_WRITE_OPCODE,
};
use super::regs::{Instance, Interrupts, Reg, BLECFG, BSTATUS, DMACFG, FIFOCTRL, FIFOPTR};
use super::Ble;

const FIFO_WORDS: usize = crate::target_constants::FIFO_DEPTH / 4;

/// One write the radio received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Written {
    pub offset: Vec<u8>,
    pub data: Vec<u8>,
}

/// What the DMA engine was started with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaProgram {
    pub direction: Direction,
    pub count: u32,
    pub address: u32,
    pub command: CommandWord,
}

struct Capture {
    offset: Vec<u8>,
    len: usize,
    data: Vec<u8>,
}

pub struct SimBleif {
    revision: u32,
    regs: HashMap<Reg, u32>,
    intstat: u32,
    accesses: usize,

    wake_response: bool,
    status: bool,
    swallow_cmdcmp: bool,

    /// Bytes the radio still wants to send.
    stream: VecDeque<u8>,
    /// Bytes of the running read command not yet in the FIFO.
    pending: VecDeque<u8>,
    rx_fifo: VecDeque<u32>,
    rx_level: Option<usize>,
    reading: bool,
    pop_writes: usize,

    capture: Option<Capture>,
    pushed: Vec<u32>,
    written: Vec<Written>,

    fifo_resets: usize,
    fifoptr: Option<u32>,
    dma_program: Option<DmaProgram>,
    dma_reject: bool,

    feature_available: bool,
    feature_request: bool,
    regulator_fault: bool,
    domain: bool,
    core_stuck: bool,
    modex_trim: Option<u32>,

    radio: Option<FakeRadio>,
}

impl SimBleif {
    /// A B0 part.
    pub fn new() -> Self {
        Self::with_revision(0x21)
    }

    pub fn with_revision(revision: u32) -> Self {
        let mut regs = HashMap::new();
        regs.insert(Reg::FifoCtrl, FIFOCTRL::FIFORSTN::SET.value);
        SimBleif {
            revision,
            regs,
            intstat: 0,
            accesses: 0,
            wake_response: true,
            status: false,
            swallow_cmdcmp: false,
            stream: VecDeque::new(),
            pending: VecDeque::new(),
            rx_fifo: VecDeque::new(),
            rx_level: None,
            reading: false,
            pop_writes: 0,
            capture: None,
            pushed: Vec::new(),
            written: Vec::new(),
            fifo_resets: 0,
            fifoptr: None,
            dma_program: None,
            dma_reject: false,
            feature_available: true,
            feature_request: false,
            regulator_fault: false,
            domain: false,
            core_stuck: false,
            modex_trim: None,
            radio: None,
        }
    }

    /// Register value as the driver would read it, without side effects.
    pub fn reg(&self, reg: Reg) -> u32 {
        match reg {
            Reg::IntStat => self.intstat,
            Reg::FifoPtr => self.fifoptr(),
            Reg::BStatus => self.bstatus(),
            Reg::FifoPop => self.rx_fifo.front().copied().unwrap_or(0),
            _ => self.regs.get(&reg).copied().unwrap_or(0),
        }
    }

    /// Register reads and writes so far.
    pub fn accesses(&self) -> usize {
        self.accesses
    }

    pub fn written(&self) -> &[Written] {
        &self.written
    }

    /// Level of the WAKE line.
    pub fn wake(&self) -> bool {
        LocalRegisterCopy::<u32, BLECFG::Register>::new(self.reg(Reg::BleCfg))
            .matches_all(BLECFG::WAKEUPCTL::ON)
    }

    pub fn powered(&self) -> bool {
        self.domain
    }

    pub fn pop_writes(&self) -> usize {
        self.pop_writes
    }

    pub fn pushed_words(&self) -> &[u32] {
        &self.pushed
    }

    pub fn fifo_resets(&self) -> usize {
        self.fifo_resets
    }

    /// The last transfer the DMA engine was enabled for.
    pub fn dma_program(&self) -> Option<DmaProgram> {
        self.dma_program
    }

    /// Whether the radio answers WAKE by raising STATUS.
    pub fn set_wake_response(&mut self, respond: bool) {
        self.wake_response = respond;
    }

    /// Bytes for the radio to send; BLEIRQ stays high until all are read.
    pub fn queue_rx(&mut self, bytes: &[u8]) {
        self.stream.extend(bytes);
    }

    /// Puts `bytes` straight into the read FIFO.
    pub fn load_rx_fifo(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.rx_fifo.push_back(u32::from_le_bytes(word));
        }
    }

    /// Overrides the byte count FIFOPTR reports for the read FIFO.
    pub fn set_rx_fifo_level(&mut self, level: usize) {
        self.rx_level = Some(level);
    }

    /// Forgets the words pushed so far.
    pub fn start_write_capture(&mut self) {
        self.pushed.clear();
    }

    pub fn set_swallow_cmdcmp(&mut self, swallow: bool) {
        self.swallow_cmdcmp = swallow;
    }

    pub fn set_feature_available(&mut self, available: bool) {
        self.feature_available = available;
    }

    pub fn set_regulator_fault(&mut self, fault: bool) {
        self.regulator_fault = fault;
    }

    /// The core never leaves power-on reset.
    pub fn set_core_stuck(&mut self, stuck: bool) {
        self.core_stuck = stuck;
    }

    pub fn set_modex_trim(&mut self, trim: Option<u32>) {
        self.modex_trim = trim;
    }

    /// The radio finally answers a WAKE that is already up.
    pub fn answer_wake(&mut self) {
        if self.wake() {
            self.status = true;
            self.raise(Interrupts::BLECSSTAT);
        }
    }

    pub fn raise(&mut self, irqs: Interrupts) {
        self.intstat |= irqs.bits();
    }

    /// Completes the running DMA transfer: data moved, command done and the
    /// handshake line released.
    pub fn finish_dma(&mut self) {
        self.rx_fifo.clear();
        self.pending.clear();
        self.reading = false;
        self.capture = None;
        let edge = match self.dma_program.map(|p| p.direction) {
            Some(Direction::Write) => Interrupts::BLECSSTATN,
            _ => Interrupts::BLECIRQN,
        };
        self.raise(Interrupts::CMDCMP | Interrupts::DCMP | edge);
    }

    /// Pins FIFOPTR to `value`.
    pub fn set_fifoptr(&mut self, value: u32) {
        self.fifoptr = Some(value);
    }

    /// Makes every buffer look unreachable for DMA.
    pub fn set_dma_reject(&mut self, reject: bool) {
        self.dma_reject = reject;
    }

    pub fn attach_radio(&mut self, radio: FakeRadio) {
        self.radio = Some(radio);
    }

    pub fn radio(&mut self) -> &mut FakeRadio {
        self.radio.as_mut().expect("no radio attached")
    }

    fn fifoptr(&self) -> u32 {
        if let Some(value) = self.fifoptr {
            return value;
        }
        let depth = crate::target_constants::FIFO_DEPTH as u32;
        // The hardware counts the padded tail of the last word.
        let level = self.rx_level.unwrap_or(self.rx_fifo.len() * 4) as u32;
        (FIFOPTR::FIFO0REM.val(depth)
            + FIFOPTR::FIFO1SIZ.val(level)
            + FIFOPTR::FIFO1REM.val(depth.saturating_sub(level)))
        .value
    }

    fn bstatus(&self) -> u32 {
        let cfg: LocalRegisterCopy<u32, BLECFG::Register> =
            LocalRegisterCopy::new(self.reg(Reg::BleCfg));
        let running = self.domain && cfg.is_set(BLECFG::PWRSMEN) && cfg.is_set(BLECFG::BLERSTN);
        let pwrst = match (running, self.core_stuck) {
            (false, _) => BSTATUS::PWRST::OFF,
            (true, true) => BSTATUS::PWRST::PWRON,
            (true, false) => BSTATUS::PWRST::ACTIVE,
        };
        (pwrst
            + BSTATUS::SPISTATUS.val(self.status as u32)
            + BSTATUS::BLEIRQ.val(!self.stream.is_empty() as u32))
        .value
    }

    fn command_done(&mut self) {
        if !self.swallow_cmdcmp {
            self.raise(Interrupts::CMDCMP);
        }
    }

    fn start_command(&mut self, value: u32) {
        self.intstat &= !Interrupts::CMDCMP.bits();
        let command = CommandWord::from_raw(value, self.reg(Reg::OffsetHi));
        match command.direction() {
            Some(Direction::Write) => {
                self.capture = Some(Capture {
                    offset: command.offset().as_slice().to_vec(),
                    len: command.len(),
                    data: Vec::new(),
                });
            }
            Some(Direction::Read) => {
                let n = command.len().min(self.stream.len());
                self.pending.extend(self.stream.drain(..n));
                self.reading = true;
                self.refill();
            }
            None => {}
        }
    }

    fn refill(&mut self) {
        while self.rx_fifo.len() < FIFO_WORDS && !self.pending.is_empty() {
            let mut word = [0u8; 4];
            for byte in word.iter_mut() {
                match self.pending.pop_front() {
                    Some(b) => *byte = b,
                    None => break,
                }
            }
            self.rx_fifo.push_back(u32::from_le_bytes(word));
        }
    }

    fn pop(&mut self) {
        self.rx_fifo.pop_front();
        self.refill();
        if self.reading && self.rx_fifo.is_empty() && self.pending.is_empty() {
            self.reading = false;
            self.command_done();
        }
    }

    fn push(&mut self, word: u32) {
        self.pushed.push(word);
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        capture.data.extend_from_slice(&word.to_le_bytes());
        if capture.data.len() < capture.len {
            return;
        }
        let Some(mut capture) = self.capture.take() else {
            return;
        };
        capture.data.truncate(capture.len);
        self.command_done();
        if let Some(response) = self
            .radio
            .as_mut()
            .and_then(|radio| radio.receive(&capture.offset, &capture.data))
        {
            self.stream.extend(response);
        }
        self.written.push(Written {
            offset: capture.offset,
            data: capture.data,
        });
    }

    fn write_blecfg(&mut self, value: u32) {
        let was_awake = self.wake();
        self.regs.insert(Reg::BleCfg, value);
        match (was_awake, self.wake()) {
            (false, true) if self.wake_response => {
                self.status = true;
                self.raise(Interrupts::BLECSSTAT);
            }
            (_, false) => self.status = false,
            _ => {}
        }
    }

    fn write_fifoctrl(&mut self, value: u32) {
        let was_running = FIFOCTRL::FIFORSTN.read(self.reg(Reg::FifoCtrl)) != 0;
        if was_running && FIFOCTRL::FIFORSTN.read(value) == 0 {
            self.fifo_resets += 1;
            self.rx_fifo.clear();
            self.pending.clear();
        }
        self.regs.insert(Reg::FifoCtrl, value);
    }

    fn pop_on_write(&self) -> bool {
        FIFOCTRL::POPWR.read(self.reg(Reg::FifoCtrl)) != 0
    }
}

impl Default for SimBleif {
    fn default() -> Self {
        Self::new()
    }
}

impl Instance for SimBleif {
    fn read(&mut self, reg: Reg) -> u32 {
        self.accesses += 1;
        let value = self.reg(reg);
        if reg == Reg::FifoPop && !self.pop_on_write() {
            self.pop();
        }
        value
    }

    fn write(&mut self, reg: Reg, value: u32) {
        self.accesses += 1;
        match reg {
            Reg::IntClr => self.intstat &= !value,
            Reg::IntSet => self.intstat |= value,
            Reg::IntStat => self.intstat = value,
            Reg::FifoPush => self.push(value),
            Reg::FifoPop => {
                self.pop_writes += 1;
                if self.pop_on_write() {
                    self.pop();
                }
            }
            Reg::FifoCtrl => self.write_fifoctrl(value),
            Reg::BleCfg => self.write_blecfg(value),
            Reg::Cmd => {
                self.regs.insert(Reg::Cmd, value);
                self.start_command(value);
            }
            Reg::DmaCfg => {
                self.regs.insert(Reg::DmaCfg, value);
                if DMACFG::DMAEN.read(value) == 0x3 {
                    let direction = if DMACFG::DMADIR.read(value) == 1 {
                        Direction::Write
                    } else {
                        Direction::Read
                    };
                    self.dma_program = Some(DmaProgram {
                        direction,
                        count: self.reg(Reg::DmaTotCount),
                        address: self.reg(Reg::DmaTargAddr),
                        command: CommandWord::from_raw(
                            self.reg(Reg::Cmd),
                            self.reg(Reg::OffsetHi),
                        ),
                    });
                }
            }
            Reg::FifoPtr | Reg::BStatus => {}
            _ => {
                self.regs.insert(reg, value);
            }
        }
    }

    fn chip_revision(&mut self) -> u32 {
        self.revision
    }

    fn set_feature_request(&mut self, on: bool) {
        self.feature_request = on;
    }

    fn feature_ready(&mut self) -> bool {
        self.feature_request && self.feature_available
    }

    fn set_power_domain(&mut self, on: bool) {
        self.domain = on && !self.regulator_fault;
    }

    fn power_domain_on(&mut self) -> bool {
        self.domain
    }

    fn modex_trim(&mut self) -> Option<u32> {
        self.modex_trim
    }

    fn dma_address(&mut self, words: &[u32]) -> Option<u32> {
        (!self.dma_reject).then(|| words.as_ptr() as usize as u32)
    }
}

/// Delay provider that only counts.
#[derive(Default)]
pub struct SimDelay {
    elapsed_ns: u64,
}

impl SimDelay {
    pub fn new() -> Self {
        SimDelay::default()
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
    }
}

impl Ble<'_, SimBleif, SimDelay> {
    /// Time spent in delays since initialization.
    pub(crate) fn delay_elapsed_us(&self) -> u64 {
        self.delay.elapsed_ns / 1_000
    }
}

/// The radio firmware, as far as the driver can see it.
pub struct FakeRadio {
    framing: Framing,
    registers: HashMap<u32, u32>,
    commands: Vec<u16>,
    patch_packets: Vec<Vec<u8>>,
    corrupt_phase: Option<u8>,
    fail_status: Option<u8>,
    packets_received: u16,
    mute: bool,
}

impl FakeRadio {
    pub fn new(framing: Framing) -> Self {
        FakeRadio {
            framing,
            registers: HashMap::new(),
            commands: Vec::new(),
            patch_packets: Vec::new(),
            corrupt_phase: None,
            fail_status: None,
            packets_received: 0,
            mute: false,
        }
    }

    /// `packet` with the length prefix of `framing` in front.
    pub fn frame(framing: Framing, packet: &[u8]) -> Vec<u8> {
        let len = (packet.len() as u16).to_le_bytes();
        let mut framed = len[..framing.prefix_len()].to_vec();
        framed.extend_from_slice(packet);
        framed
    }

    /// Opcodes of the HCI commands received.
    pub fn commands(&self) -> &[u16] {
        &self.commands
    }

    /// Header, data and CRC packets of every patch received.
    pub fn patch_packets(&self) -> &[Vec<u8>] {
        &self.patch_packets
    }

    pub fn set_register(&mut self, address: u32, value: u32) {
        self.registers.insert(address, value);
    }

    pub fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set_packets_received(&mut self, count: u16) {
        self.packets_received = count;
    }

    /// The next command completes with `status`.
    pub fn fail_next_command(&mut self, status: u8) {
        self.fail_status = Some(status);
    }

    /// Acknowledge patch packets of `phase` with a bad status.
    pub fn corrupt_ack(&mut self, phase: u8) {
        self.corrupt_phase = Some(phase);
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Takes one write and returns what the radio sends back, if anything.
    fn receive(&mut self, offset: &[u8], data: &[u8]) -> Option<Vec<u8>> {
        if self.mute {
            return None;
        }
        match offset {
            [] => self.receive_patch(data),
            [0x01] => self.receive_command(data),
            _ => None,
        }
    }

    fn receive_patch(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let (kind, phase) = match *data {
            [0x01, kind, phase, ..] if (0xF1..=0xF3).contains(&phase) => (kind, phase),
            _ => return None,
        };
        if kind == 0xEE {
            // Patch complete: the firmware starts and reports in its framing.
            let event = [0x04, 0x0E, 0x04, 0x01, 0xEE, 0xFC, 0x00];
            return Some(Self::frame(self.framing, &event));
        }
        self.patch_packets.push(data.to_vec());
        let status = if self.corrupt_phase == Some(phase) { 0x01 } else { 0x00 };
        Some(vec![0x04, kind, phase, 0x01, status])
    }

    fn receive_command(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 3 {
            return None;
        }
        let opcode = u16::from_le_bytes([data[0], data[1]]);
        let params = &data[3..];
        self.commands.push(opcode);

        let mut returned = Vec::new();
        match opcode {
            PLF_REG_READ_OPCODE if params.len() >= 4 => {
                let address = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
                returned.extend_from_slice(&self.register(address).to_le_bytes());
            }
            PLF_REG_WRITE_OPCODE if params.len() >= 8 => {
                let address = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
                let value = u32::from_le_bytes([params[4], params[5], params[6], params[7]]);
                self.registers.insert(address, value);
            }
            LE_TEST_END_OPCODE => returned.extend_from_slice(&self.packets_received.to_le_bytes()),
            _ => {}
        }

        let status = self.fail_status.take().unwrap_or(0);
        let [lo, hi] = opcode.to_le_bytes();
        let mut event = vec![0x04, 0x0E, 4 + returned.len() as u8, 0x01, lo, hi, status];
        event.extend_from_slice(&returned);
        let framed = Self::frame(self.framing, &event);

        if opcode == HEADER_FORMAT_OPCODE && status == 0 {
            self.framing = Framing::TwoByte;
        }
        Some(framed)
    }
}

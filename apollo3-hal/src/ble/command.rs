//! BLEIF command words and FIFO access.

use tock_registers::LocalRegisterCopy;

use super::regs::{Instance, Reg, CMD, FIFOCTRL, FIFOPTR, OFFSETHI};
use super::Error;
use crate::target_constants::MAX_TRANSFER_SIZE;

/// Transfer direction, seen from the MCU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Write,
    Read,
}

/// Up to three offset (address) bytes clocked out ahead of the data phase.
/// HCI writes use a single offset byte carrying the packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Offset {
    bytes: [u8; 3],
    len: u8,
}

impl Offset {
    pub const NONE: Offset = Offset {
        bytes: [0; 3],
        len: 0,
    };

    pub fn new(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() > 3 {
            return Err(Error::InvalidArg);
        }
        let mut offset = Offset::NONE;
        offset.bytes[..bytes.len()].copy_from_slice(bytes);
        offset.len = bytes.len() as u8;
        Ok(offset)
    }

    pub const fn byte(b: u8) -> Self {
        Offset {
            bytes: [b, 0, 0],
            len: 1,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The CMD/OFFSETHI register pair that starts a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandWord {
    cmd: u32,
    offset_hi: u32,
}

impl CommandWord {
    /// Packs a transfer header. The last offset byte travels in CMD.OFFSETLO,
    /// the ones before it in OFFSETHI (most significant first).
    pub fn encode(
        direction: Direction,
        len: usize,
        offset: Offset,
        cont: bool,
    ) -> Result<Self, Error> {
        if len > MAX_TRANSFER_SIZE {
            return Err(Error::InvalidArg);
        }
        let (hi, lo) = match *offset.as_slice() {
            [] => (0, 0),
            [b0] => (0, b0),
            [b0, b1] => (u32::from(b0), b1),
            [b0, b1, b2] => ((u32::from(b0) << 8) | u32::from(b1), b2),
            _ => return Err(Error::InvalidArg),
        };
        let kind = match direction {
            Direction::Write => CMD::CMD::WRITE,
            Direction::Read => CMD::CMD::READ,
        };
        let mut cmd: LocalRegisterCopy<u32, CMD::Register> = LocalRegisterCopy::new(0);
        cmd.modify(
            kind + CMD::OFFSETCNT.val(offset.len() as u32)
                + CMD::CONT.val(cont as u32)
                + CMD::TSIZE.val(len as u32)
                + CMD::OFFSETLO.val(u32::from(lo)),
        );
        let mut offset_hi: LocalRegisterCopy<u32, OFFSETHI::Register> = LocalRegisterCopy::new(0);
        offset_hi.modify(OFFSETHI::OFFSETHI.val(hi));
        Ok(CommandWord {
            cmd: cmd.get(),
            offset_hi: offset_hi.get(),
        })
    }

    /// Wraps register values read back from the interface.
    #[cfg(test)]
    pub(crate) fn from_raw(cmd: u32, offset_hi: u32) -> Self {
        CommandWord { cmd, offset_hi }
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    pub fn offset_hi(&self) -> u32 {
        self.offset_hi
    }

    pub fn direction(&self) -> Option<Direction> {
        let cmd: LocalRegisterCopy<u32, CMD::Register> = LocalRegisterCopy::new(self.cmd);
        if cmd.matches_all(CMD::CMD::WRITE) {
            Some(Direction::Write)
        } else if cmd.matches_all(CMD::CMD::READ) {
            Some(Direction::Read)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        CMD::TSIZE.read(self.cmd) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cont(&self) -> bool {
        CMD::CONT.read(self.cmd) != 0
    }

    /// Recovers the offset bytes.
    pub fn offset(&self) -> Offset {
        let lo = CMD::OFFSETLO.read(self.cmd) as u8;
        let hi = OFFSETHI::OFFSETHI.read(self.offset_hi);
        let bytes: &[u8] = match CMD::OFFSETCNT.read(self.cmd) {
            0 => &[],
            1 => &[lo],
            2 => &[hi as u8, lo],
            _ => &[(hi >> 8) as u8, hi as u8, lo],
        };
        // At most three bytes by construction.
        Offset::new(bytes).unwrap_or_default()
    }

    /// OFFSETHI first: the transfer starts on the CMD write.
    pub(crate) fn issue<I: Instance>(&self, iface: &mut I) {
        iface.write(Reg::OffsetHi, self.offset_hi);
        iface.write(Reg::Cmd, self.cmd);
    }
}

/// Bytes waiting in the read FIFO.
pub(crate) fn read_fifo_level<I: Instance>(iface: &mut I) -> usize {
    iface.fetch::<FIFOPTR::Register>(Reg::FifoPtr).read(FIFOPTR::FIFO1SIZ) as usize
}

/// Free space in the write FIFO.
pub(crate) fn write_fifo_space<I: Instance>(iface: &mut I) -> usize {
    iface.fetch::<FIFOPTR::Register>(Reg::FifoPtr).read(FIFOPTR::FIFO0REM) as usize
}

/// Pops `dest.len()` bytes worth of words out of the read FIFO. Words are
/// little-endian; the unused tail of the last word is dropped.
pub(crate) fn fifo_read<I: Instance>(iface: &mut I, pop_write: bool, dest: &mut [u8]) {
    for chunk in dest.chunks_mut(4) {
        let word = iface.read(Reg::FifoPop);
        if pop_write {
            // A0/A1 only advance the read pointer on an explicit write.
            iface.write(Reg::FifoPop, 0);
        }
        chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
    }
}

/// Copies whatever whole words the read FIFO holds into `buf[*index..]` and
/// advances `index`. Returns the number of bytes copied; zero while less
/// than one word is available.
pub(crate) fn fifo_drain<I: Instance>(
    iface: &mut I,
    pop_write: bool,
    buf: &mut [u8],
    index: &mut usize,
) -> usize {
    let available = read_fifo_level(iface);
    if available < 4 {
        return 0;
    }
    let remaining = buf.len() - *index;
    let count = (available & !0x3).min(remaining);
    fifo_read(iface, pop_write, &mut buf[*index..*index + count]);
    *index += count;
    count
}

/// Pushes words from `data[*index..]` while the write FIFO has room for a
/// whole word, zero-padding the last one. Returns the bytes consumed.
pub(crate) fn fifo_fill<I: Instance>(iface: &mut I, data: &[u8], index: &mut usize) -> usize {
    let start = *index;
    while *index < data.len() && write_fifo_space(iface) >= 4 {
        let end = (*index + 4).min(data.len());
        let mut word = [0u8; 4];
        word[..end - *index].copy_from_slice(&data[*index..end]);
        iface.write(Reg::FifoPush, u32::from_le_bytes(word));
        *index = end;
    }
    *index - start
}

/// Resets both FIFO pointers.
pub(crate) fn fifo_reset<I: Instance>(iface: &mut I) {
    iface.update(Reg::FifoCtrl, FIFOCTRL::FIFORSTN::CLEAR);
    iface.update(Reg::FifoCtrl, FIFOCTRL::FIFORSTN::SET);
}

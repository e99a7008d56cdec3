//! HCI packets over the BLEIF, and the vendor commands built on them.
//!
//! Writes carry the HCI packet type in the single offset byte. Reads start
//! with a length prefix (one or two bytes, negotiated at patch completion)
//! followed by the packet itself, type byte included.

use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU32;

use super::blocking::Transfer;
use super::command::Offset;
use super::dma::{DmaTransfer, Submission};
use super::regs::Instance;
use super::{Ble, Error, Flags};
use crate::timeout::{poll_until, Timeout};

pub(crate) const PLF_REG_READ_OPCODE: u16 = 0xFC01;
pub(crate) const PLF_REG_WRITE_OPCODE: u16 = 0xFC02;
pub(crate) const TX_POWER_OPCODE: u16 = 0xFC3B;
pub(crate) const HEADER_FORMAT_OPCODE: u16 = 0xFC7D;
pub(crate) const LE_RECEIVER_TEST_OPCODE: u16 = 0x201D;
pub(crate) const LE_TRANSMITTER_TEST_OPCODE: u16 = 0x201E;
pub(crate) const LE_TEST_END_OPCODE: u16 = 0x201F;

/// Radio core registers reached through the platform register commands.
pub(crate) const SLEEP_CONTROL_REG: u32 = 0x2000_67B8;
pub(crate) const CRYSTAL_TRIM_REG: u32 = 0x4300_0004;
pub(crate) const CLOCK_32K_COUNT_REG: u32 = 0x2000_6054;
pub(crate) const MODEX_TRIM_REG: u32 = 0x4300_0094;

const HCI_EVENT_PACKET: u8 = 0x04;
const HCI_COMMAND_COMPLETE: u8 = 0x0E;
const MAX_COMMAND_PARAMS: usize = 32;
/// Largest Command Complete event the vendor commands expect.
const MAX_EVENT_LEN: usize = 64;
const LAST_RF_CHANNEL: u8 = 39;

pub(crate) const HCI_RESPONSE_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::millis(100);
const IRQ_POLL: MicrosDurationU32 = MicrosDurationU32::micros(10);

/// Length prefix the radio puts in front of every packet it sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Framing {
    OneByte,
    TwoByte,
}

impl Framing {
    pub fn prefix_len(self) -> usize {
        match self {
            Framing::OneByte => 1,
            Framing::TwoByte => 2,
        }
    }
}

/// HCI packet indicators (UART transport numbering).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    Command = 0x01,
    AclData = 0x02,
    SyncData = 0x03,
    Event = 0x04,
}

/// Transmit power levels of the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxPower {
    Minus20dBm,
    Minus10dBm,
    Minus5dBm,
    ZerodBm,
    Plus4dBm,
}

impl TxPower {
    fn code(self) -> u8 {
        match self {
            TxPower::Minus20dBm => 0x03,
            TxPower::Minus10dBm => 0x04,
            TxPower::Minus5dBm => 0x05,
            TxPower::ZerodBm => 0x08,
            TxPower::Plus4dBm => 0x0F,
        }
    }
}

impl<'a, I, D> Ble<'a, I, D>
where
    I: Instance,
    D: DelayNs,
{
    /// Sends one HCI packet of type `packet_type`.
    pub fn blocking_hci_write(
        &mut self,
        packet_type: PacketType,
        data: &[u8],
    ) -> Result<(), Error> {
        self.blocking_transfer(Transfer::write(data).with_offset(Offset::byte(packet_type as u8)))
    }

    /// Sends `data` as is, without the packet type byte.
    pub fn blocking_hci_write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.blocking_transfer(Transfer::write(data))
    }

    /// Reads one packet from the radio into `buf` and returns its length.
    pub fn blocking_hci_read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let len = self.read_length_prefix()?;
        if len > buf.len() {
            self.state.remove(Flags::CONTINUE_PACKET);
            return Err(Error::RxBufferTooSmall);
        }
        if len == 0 {
            self.state.remove(Flags::CONTINUE_PACKET);
            return Ok(0);
        }
        self.blocking_transfer(Transfer::read(&mut buf[..len]))?;
        Ok(len)
    }

    fn read_length_prefix(&mut self) -> Result<usize, Error> {
        let mut prefix = [0u8; 2];
        let n = self.framing.prefix_len();
        self.blocking_transfer(Transfer::read(&mut prefix[..n]).with_cont(true))?;
        Ok(usize::from(u16::from_le_bytes(prefix)))
    }

    /// DMA version of [`Ble::blocking_hci_write`]. The engine raises WAKE
    /// itself; see [`Ble::nonblocking_transfer`] for when the write is
    /// parked instead of started.
    pub fn nonblocking_hci_write(
        &mut self,
        packet_type: PacketType,
        transfer: DmaTransfer,
    ) -> Result<Submission, (Error, DmaTransfer)> {
        self.nonblocking_transfer(transfer.with_offset(Offset::byte(packet_type as u8)))
    }

    /// Reads the length prefix, then hands the packet body to DMA.
    /// `transfer.len` is replaced by the length the radio announced.
    pub fn nonblocking_hci_read(
        &mut self,
        mut transfer: DmaTransfer,
    ) -> Result<Submission, (Error, DmaTransfer)> {
        let len = match self.read_length_prefix() {
            Ok(len) => len,
            Err(e) => return Err((e, transfer)),
        };
        if len > core::mem::size_of_val(transfer.buffer.words()) {
            self.state.remove(Flags::CONTINUE_PACKET);
            return Err((Error::RxBufferTooSmall, transfer));
        }
        transfer.len = len;
        if len == 0 {
            self.state.remove(Flags::CONTINUE_PACKET);
        }
        self.nonblocking_transfer(transfer)
    }

    /// Waits for the radio to raise BLEIRQ.
    pub fn wait_for_irq(&mut self, timeout: MicrosDurationU32) -> Result<(), Error> {
        let iface = &mut self.iface;
        let raised = poll_until(&mut self.delay, Timeout::new(timeout, IRQ_POLL), || {
            super::blocking::ble_irq(iface)
        });
        if raised {
            Ok(())
        } else {
            Err(Error::NoHciResponse)
        }
    }

    /// Sends an HCI command and collects the return parameters of its
    /// Command Complete event into `response`. Returns their length.
    pub fn vendor_command(
        &mut self,
        opcode: u16,
        params: &[u8],
        response: &mut [u8],
    ) -> Result<usize, Error> {
        if params.len() > MAX_COMMAND_PARAMS {
            return Err(Error::InvalidArg);
        }
        let mut packet = [0u8; 3 + MAX_COMMAND_PARAMS];
        packet[..2].copy_from_slice(&opcode.to_le_bytes());
        packet[2] = params.len() as u8;
        packet[3..3 + params.len()].copy_from_slice(params);
        self.blocking_hci_write(PacketType::Command, &packet[..3 + params.len()])?;

        self.wait_for_irq(HCI_RESPONSE_TIMEOUT)?;
        let mut event = [0u8; MAX_EVENT_LEN];
        let len = self.blocking_hci_read(&mut event)?;
        let event = &event[..len];

        // type, event code, length, credits, opcode, status
        if len < 7
            || event[0] != HCI_EVENT_PACKET
            || event[1] != HCI_COMMAND_COMPLETE
            || u16::from_le_bytes([event[4], event[5]]) != opcode
        {
            warn!("unexpected response to {:#x}", opcode);
            return Err(Error::Fail);
        }
        if event[6] != 0 {
            debug!("command {:#x} failed with status {:#x}", opcode, event[6]);
            return Err(Error::Fail);
        }
        let params = &event[7..];
        let n = params.len().min(response.len());
        response[..n].copy_from_slice(&params[..n]);
        Ok(n)
    }

    /// Reads a radio core register.
    pub fn plf_reg_read(&mut self, address: u32) -> Result<u32, Error> {
        let mut value = [0u8; 4];
        let n = self.vendor_command(PLF_REG_READ_OPCODE, &address.to_le_bytes(), &mut value)?;
        if n != value.len() {
            return Err(Error::Fail);
        }
        Ok(u32::from_le_bytes(value))
    }

    /// Writes a radio core register.
    pub fn plf_reg_write(&mut self, address: u32, value: u32) -> Result<(), Error> {
        let mut params = [0u8; 8];
        params[..4].copy_from_slice(&address.to_le_bytes());
        params[4..].copy_from_slice(&value.to_le_bytes());
        self.vendor_command(PLF_REG_WRITE_OPCODE, &params, &mut [])?;
        Ok(())
    }

    pub fn tx_power_set(&mut self, power: TxPower) -> Result<(), Error> {
        self.vendor_command(TX_POWER_OPCODE, &[power.code()], &mut [])?;
        Ok(())
    }

    /// Allows or forbids the radio core to sleep.
    pub fn sleep_set(&mut self, enable: bool) -> Result<(), Error> {
        let control = self.plf_reg_read(SLEEP_CONTROL_REG)?;
        let control = if enable { control | 1 } else { control & !1 };
        self.plf_reg_write(SLEEP_CONTROL_REG, control)
    }

    pub fn sleep_enabled(&mut self) -> Result<bool, Error> {
        Ok(self.plf_reg_read(SLEEP_CONTROL_REG)? & 1 != 0)
    }

    /// Sets the 10-bit load capacitance trim of the 32 MHz crystal.
    pub fn crystal_trim_set(&mut self, trim: u32) -> Result<(), Error> {
        let old = self.plf_reg_read(CRYSTAL_TRIM_REG)?;
        let new = (old & 0xFFFF_F803) | ((trim & 0x3FF) << 1);
        self.plf_reg_write(CRYSTAL_TRIM_REG, new)
    }

    /// Starts the LE transmitter test on `channel` (0..=39).
    pub fn transmitter_test_start(
        &mut self,
        channel: u8,
        payload_len: u8,
        pattern: u8,
    ) -> Result<(), Error> {
        if channel > LAST_RF_CHANNEL {
            return Err(Error::InvalidArg);
        }
        self.vendor_command(
            LE_TRANSMITTER_TEST_OPCODE,
            &[channel, payload_len, pattern],
            &mut [],
        )?;
        Ok(())
    }

    /// Starts the LE receiver test on `channel` (0..=39).
    pub fn receiver_test_start(&mut self, channel: u8) -> Result<(), Error> {
        if channel > LAST_RF_CHANNEL {
            return Err(Error::InvalidArg);
        }
        self.vendor_command(LE_RECEIVER_TEST_OPCODE, &[channel], &mut [])?;
        Ok(())
    }

    /// Ends a direct test and returns the number of packets received.
    pub fn test_end(&mut self) -> Result<u16, Error> {
        let mut count = [0u8; 2];
        self.vendor_command(LE_TEST_END_OPCODE, &[], &mut count)?;
        Ok(u16::from_le_bytes(count))
    }
}

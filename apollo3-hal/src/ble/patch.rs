//! Radio firmware patches and the boot sequence.
//!
//! A patch travels in three phases, each acknowledged by the radio with a
//! five-byte event echoing the patch type and the phase: a header announcing
//! the length (0xF1), the payload in chunks (0xF2) and a CRC16 over the
//! payload (0xF3). Once every patch is in, a "patch complete" packet starts
//! the patched firmware and tells us which HCI length prefix it uses.

use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU32;

use super::blocking::Transfer;
use super::hci::{CLOCK_32K_COUNT_REG, HEADER_FORMAT_OPCODE, MODEX_TRIM_REG};
use super::regs::Instance;
use super::{Ble, Error, Flags, Framing};

/// Attempts at sending a header, CRC or patch-complete packet.
pub const PATCH_TRIALS: u32 = 5000;
/// Largest payload chunk per data packet.
pub const MAX_PATCH_PACKET_LEN: usize = 128;

const PATCH_HEADER: u8 = 0xF1;
const PATCH_DATA: u8 = 0xF2;
const PATCH_CRC: u8 = 0xF3;
const PATCH_COMPLETE_TYPE: u8 = 0xEE;

const PATCH_ACK_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::millis(1000);
const PATCH_SETTLE_MS: u32 = 500;

/// Accepted 32 kHz calibration counts, around the nominal 0x8000.
const CLOCK_32K_RANGE: core::ops::RangeInclusive<u32> = 0x7B00..=0x8200;

/// One firmware patch for the radio core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Patch<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

impl<'a> Patch<'a> {
    pub const fn new(kind: u8, data: &'a [u8]) -> Self {
        Patch { kind, data }
    }

    pub fn crc(&self) -> u16 {
        crc16(self.data)
    }

    pub fn chunks(&self) -> core::slice::Chunks<'a, u8> {
        self.data.chunks(MAX_PATCH_PACKET_LEN)
    }
}

static CRC_TABLE: [u16; 256] = crc_table();

const fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16 with polynomial 0x8005, MSB first, zero seed and no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &byte| {
        CRC_TABLE[usize::from((crc >> 8) ^ u16::from(byte)) & 0xFF] ^ (crc << 8)
    })
}

impl<'a, I, D> Ble<'a, I, D>
where
    I: Instance,
    D: DelayNs,
{
    /// Delivers `patch` to the radio.
    pub fn apply_patch(&mut self, patch: &Patch<'_>) -> Result<(), Error> {
        let len = u16::try_from(patch.data.len()).map_err(|_| Error::InvalidArg)?;
        debug!("patch {:#x}: {} bytes", patch.kind, len);

        let [lo, hi] = len.to_le_bytes();
        self.patch_exchange(
            &[0x01, patch.kind, PATCH_HEADER, 0x02, lo, hi],
            patch.kind,
            PATCH_HEADER,
            PATCH_TRIALS,
        )?;

        let mut packet = [0u8; 4 + MAX_PATCH_PACKET_LEN];
        for chunk in patch.chunks() {
            packet[..4].copy_from_slice(&[0x01, patch.kind, PATCH_DATA, chunk.len() as u8]);
            packet[4..4 + chunk.len()].copy_from_slice(chunk);
            self.patch_exchange(&packet[..4 + chunk.len()], patch.kind, PATCH_DATA, 1)?;
        }

        let [lo, hi] = patch.crc().to_le_bytes();
        self.patch_exchange(
            &[0x01, patch.kind, PATCH_CRC, 0x02, lo, hi],
            patch.kind,
            PATCH_CRC,
            PATCH_TRIALS,
        )
    }

    /// Sends `packet` and checks the radio's acknowledgement of `phase`.
    fn patch_exchange(
        &mut self,
        packet: &[u8],
        kind: u8,
        phase: u8,
        trials: u32,
    ) -> Result<(), Error> {
        self.write_with_retry(packet, trials)?;
        self.wait_for_irq(PATCH_ACK_TIMEOUT)?;

        let mut ack = [0u8; 5];
        self.blocking_transfer(Transfer::read(&mut ack))?;
        if ack != [0x04, kind, phase, 0x01, 0x00] {
            warn!("patch {:#x} phase {:#x} rejected", kind, phase);
            return Err(Error::Fail);
        }
        Ok(())
    }

    fn write_with_retry(&mut self, packet: &[u8], trials: u32) -> Result<(), Error> {
        let mut last = Error::Fail;
        for _ in 0..trials.max(1) {
            match self.blocking_hci_write_raw(packet) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Starts the patched firmware and picks up the HCI framing it uses.
    pub fn patch_complete(&mut self) -> Result<(), Error> {
        self.write_with_retry(
            &[0x01, PATCH_COMPLETE_TYPE, PATCH_HEADER, 0x02, 0x00, 0x00],
            PATCH_TRIALS,
        )?;
        self.wait_for_irq(PATCH_ACK_TIMEOUT)?;

        // [len, 0x04, ..] on one-byte firmware, [len_lo, len_hi = 0, 0x04, ..]
        // on two-byte firmware.
        let mut head = [0u8; 2];
        self.blocking_transfer(Transfer::read(&mut head).with_cont(true))?;
        let mut remaining = match head[1] {
            0x04 => {
                self.framing = Framing::OneByte;
                usize::from(head[0]).saturating_sub(1)
            }
            0x00 => {
                self.framing = Framing::TwoByte;
                usize::from(u16::from_le_bytes(head))
            }
            _ => {
                self.state.remove(Flags::CONTINUE_PACKET);
                warn!("unexpected patch complete response {:#x}", head[1]);
                return Err(Error::Fail);
            }
        };
        let mut scratch = [0u8; 16];
        while remaining > 0 {
            let n = remaining.min(scratch.len());
            self.blocking_transfer(Transfer::read(&mut scratch[..n]).with_cont(remaining > n))?;
            remaining -= n;
        }
        self.state.remove(Flags::CONTINUE_PACKET);
        self.state.insert(Flags::PATCH_COMPLETE);
        debug!("patched, framing {:?}", self.framing);

        if self.config.two_byte_header && self.framing == Framing::OneByte {
            self.vendor_command(HEADER_FORMAT_OPCODE, &[0x01], &mut [])?;
            self.framing = Framing::TwoByte;
        }
        if let Some(trim) = self.iface.modex_trim() {
            self.plf_reg_write(MODEX_TRIM_REG, trim)?;
        }
        self.delay.delay_ms(PATCH_SETTLE_MS);
        Ok(())
    }

    /// Brings the powered radio into service: default patches, patch
    /// complete, clock check and sleep policy.
    pub fn boot(&mut self) -> Result<(), Error> {
        if self.state.contains(Flags::USE_DEFAULT_PATCHES) {
            let patches = self.config.default_patches;
            for patch in patches {
                self.apply_patch(patch)?;
            }
        }
        self.patch_complete()?;

        if self.silicon.capabilities().clock_check {
            let count = self.plf_reg_read(CLOCK_32K_COUNT_REG)?;
            if !CLOCK_32K_RANGE.contains(&count) {
                warn!("32 kHz clock count {:#x} out of range", count);
                return Err(Error::ClockUnstable);
            }
        }
        self.sleep_set(self.config.sleep_enabled)?;
        info!("BLE boot complete");
        Ok(())
    }
}

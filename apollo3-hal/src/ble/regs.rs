//! BLEIF register map and the register-access seam of the BLE driver.
//!
//! The transfer engine never touches memory-mapped registers directly. It goes
//! through [`Instance`], which [`Bleif`] implements for the real peripheral.

use core::ptr;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs, LocalRegisterCopy, RegisterLongName};

use tock_registers::fields::FieldValue;

pub const BLEIF_BASE: usize = 0x5000_C000;
pub const MCUCTRL_BASE: usize = 0x4002_0000;
pub const PWRCTRL_BASE: usize = 0x4002_1000;
/// OTP word holding the factory modulation-index trim for the radio.
pub const MODEX_TRIM_ADDR: usize = 0x5002_3808;

/// FIFOPTR value with both FIFOs empty and at full remaining capacity.
pub const FIFOPTR_EMPTY: u32 = (32 << 8) | (32 << 24);

register_structs! {
    pub BleifRegisters {
        (0x000 => fifo: [ReadWrite<u32>; 64]),
        (0x100 => fifoptr: ReadWrite<u32, FIFOPTR::Register>),
        (0x104 => fifothr: ReadWrite<u32, FIFOTHR::Register>),
        (0x108 => fifopop: ReadWrite<u32>),
        (0x10C => fifopush: ReadWrite<u32>),
        (0x110 => fifoctrl: ReadWrite<u32, FIFOCTRL::Register>),
        (0x114 => fifoloc: ReadWrite<u32>),
        (0x118 => _reserved0),
        (0x200 => clkcfg: ReadWrite<u32, CLKCFG::Register>),
        (0x204 => _reserved1),
        (0x20C => cmd: ReadWrite<u32, CMD::Register>),
        (0x210 => cmdrpt: ReadWrite<u32>),
        (0x214 => offsethi: ReadWrite<u32, OFFSETHI::Register>),
        (0x218 => cmdstat: ReadWrite<u32>),
        (0x21C => _reserved2),
        (0x220 => inten: ReadWrite<u32>),
        (0x224 => intstat: ReadWrite<u32>),
        (0x228 => intclr: ReadWrite<u32>),
        (0x22C => intset: ReadWrite<u32>),
        (0x230 => dmatrigen: ReadWrite<u32, DMATRIGEN::Register>),
        (0x234 => dmatrigstat: ReadWrite<u32>),
        (0x238 => dmacfg: ReadWrite<u32, DMACFG::Register>),
        (0x23C => dmatotcount: ReadWrite<u32>),
        (0x240 => dmatargaddr: ReadWrite<u32>),
        (0x244 => dmastat: ReadWrite<u32>),
        (0x248 => _reserved3),
        (0x268 => status: ReadWrite<u32>),
        (0x26C => _reserved4),
        (0x300 => mspicfg: ReadWrite<u32, MSPICFG::Register>),
        (0x304 => blecfg: ReadWrite<u32, BLECFG::Register>),
        (0x308 => pwrcmd: ReadWrite<u32>),
        (0x30C => bstatus: ReadWrite<u32, BSTATUS::Register>),
        (0x310 => _reserved5),
        (0x410 => bledbg: ReadWrite<u32, BLEDBG::Register>),
        (0x414 => @END),
    }
}

register_structs! {
    pub McuCtrlRegisters {
        (0x000 => chippn: ReadOnly<u32>),
        (0x004 => _reserved0),
        (0x00C => chiprev: ReadOnly<u32, CHIPREV::Register>),
        (0x010 => _reserved1),
        (0x018 => featureenable: ReadWrite<u32, FEATUREENABLE::Register>),
        (0x01C => @END),
    }
}

register_structs! {
    pub PwrCtrlRegisters {
        (0x000 => supplysrc: ReadWrite<u32>),
        (0x004 => _reserved0),
        (0x008 => devpwren: ReadWrite<u32, DEVPWREN::Register>),
        (0x00C => _reserved1),
        (0x018 => devpwrstatus: ReadOnly<u32, DEVPWRSTATUS::Register>),
        (0x01C => @END),
    }
}

register_bitfields![u32,
    pub FIFOPTR [
        FIFO0SIZ OFFSET(0) NUMBITS(8) [],
        FIFO0REM OFFSET(8) NUMBITS(8) [],
        FIFO1SIZ OFFSET(16) NUMBITS(8) [],
        FIFO1REM OFFSET(24) NUMBITS(8) []
    ],
    pub FIFOTHR [
        FIFORTHR OFFSET(0) NUMBITS(6) [],
        FIFOWTHR OFFSET(8) NUMBITS(6) []
    ],
    pub FIFOCTRL [
        POPWR OFFSET(0) NUMBITS(1) [],
        FIFORSTN OFFSET(1) NUMBITS(1) []
    ],
    pub CLKCFG [
        IOCLKEN OFFSET(0) NUMBITS(1) [],
        FSEL OFFSET(8) NUMBITS(3) [
            HFRC_DIV2 = 1,
            HFRC_DIV4 = 2,
            HFRC_DIV8 = 3,
            HFRC_DIV16 = 4,
            HFRC_DIV32 = 5,
            HFRC_DIV64 = 6
        ],
        CLK32KEN OFFSET(11) NUMBITS(1) [],
        DIV3 OFFSET(12) NUMBITS(1) []
    ],
    pub CMD [
        CMD OFFSET(0) NUMBITS(5) [
            WRITE = 0x1,
            READ = 0x2
        ],
        OFFSETCNT OFFSET(5) NUMBITS(2) [],
        CONT OFFSET(7) NUMBITS(1) [],
        TSIZE OFFSET(8) NUMBITS(12) [],
        CMDSEL OFFSET(20) NUMBITS(2) [],
        OFFSETLO OFFSET(24) NUMBITS(8) []
    ],
    pub OFFSETHI [
        OFFSETHI OFFSET(0) NUMBITS(16) []
    ],
    pub DMATRIGEN [
        DCMDCMPEN OFFSET(0) NUMBITS(1) [],
        DTHREN OFFSET(1) NUMBITS(1) []
    ],
    pub DMACFG [
        DMAEN OFFSET(0) NUMBITS(2) [
            DIS = 0x0,
            EN = 0x3
        ],
        DMADIR OFFSET(2) NUMBITS(1) [
            P2M = 0x0,
            M2P = 0x1
        ],
        DMAPRI OFFSET(8) NUMBITS(1) []
    ],
    pub MSPICFG [
        SPOL OFFSET(0) NUMBITS(1) [],
        SPHA OFFSET(1) NUMBITS(1) [],
        FULLDUP OFFSET(2) NUMBITS(1) [],
        WTFC OFFSET(16) NUMBITS(1) [],
        RDFC OFFSET(17) NUMBITS(1) [],
        WTFCIRQ OFFSET(19) NUMBITS(1) [],
        WTFCPOL OFFSET(21) NUMBITS(1) [],
        RDFCPOL OFFSET(22) NUMBITS(1) [],
        SPILSB OFFSET(23) NUMBITS(1) [],
        DINDLY OFFSET(24) NUMBITS(3) [],
        DOUTDLY OFFSET(27) NUMBITS(3) [],
        MSPIRST OFFSET(30) NUMBITS(1) []
    ],
    pub BLECFG [
        PWRSMEN OFFSET(0) NUMBITS(1) [],
        BLERSTN OFFSET(1) NUMBITS(1) [],
        WAKEUPCTL OFFSET(2) NUMBITS(2) [
            OFF = 0x2,
            ON = 0x3
        ],
        DCDCFLGCTL OFFSET(4) NUMBITS(2) [],
        BLEHREQCTL OFFSET(6) NUMBITS(2) [],
        WT4ACTOFF OFFSET(8) NUMBITS(1) [],
        MCUFRCSLP OFFSET(9) NUMBITS(1) [],
        FRCCLK OFFSET(10) NUMBITS(1) [],
        STAYASLEEP OFFSET(11) NUMBITS(1) [],
        PWRISOCTL OFFSET(12) NUMBITS(2) [],
        SPIISOCTL OFFSET(14) NUMBITS(2) []
    ],
    pub BSTATUS [
        B2MSTATE OFFSET(0) NUMBITS(3) [],
        SPISTATUS OFFSET(3) NUMBITS(1) [],
        DCDCREQ OFFSET(4) NUMBITS(1) [],
        DCDCFLAG OFFSET(5) NUMBITS(1) [],
        WAKEUP OFFSET(6) NUMBITS(1) [],
        BLEIRQ OFFSET(7) NUMBITS(1) [],
        PWRST OFFSET(8) NUMBITS(3) [
            OFF = 0x0,
            INIT = 0x1,
            PWRON = 0x2,
            ACTIVE = 0x3,
            SLEEP = 0x4
        ],
        BLEHACK OFFSET(11) NUMBITS(1) [],
        BLEHREQ OFFSET(12) NUMBITS(1) []
    ],
    pub BLEDBG [
        DBGEN OFFSET(0) NUMBITS(1) [],
        IOCLKON OFFSET(1) NUMBITS(1) [],
        APBCLKON OFFSET(2) NUMBITS(1) []
    ],
    pub CHIPREV [
        REVMIN OFFSET(0) NUMBITS(4) [],
        REVMAJ OFFSET(4) NUMBITS(4) []
    ],
    pub FEATUREENABLE [
        BLEREQ OFFSET(0) NUMBITS(1) [],
        BLEACK OFFSET(1) NUMBITS(1) [],
        BLEAVAIL OFFSET(2) NUMBITS(1) []
    ],
    pub DEVPWREN [
        PWRBLEL OFFSET(13) NUMBITS(1) []
    ],
    pub DEVPWRSTATUS [
        BLEL OFFSET(8) NUMBITS(1) []
    ]
];

bitflags::bitflags! {
    /// BLEIF interrupt sources, as laid out in INTEN/INTSTAT/INTCLR/INTSET.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupts: u32 {
        /// Command complete.
        const CMDCMP = 1 << 0;
        const THR = 1 << 1;
        const FUNDFL = 1 << 2;
        const FOVFL = 1 << 3;
        const B2MST = 1 << 4;
        const IACC = 1 << 5;
        const ICMD = 1 << 6;
        /// BLECIRQ rising edge.
        const BLECIRQ = 1 << 7;
        /// BLECSSTAT (STATUS line) rising edge.
        const BLECSSTAT = 1 << 8;
        /// DMA complete.
        const DCMP = 1 << 9;
        const DERR = 1 << 10;
        const CQPAUSED = 1 << 11;
        const CQUPD = 1 << 12;
        const CQERR = 1 << 13;
        const B2MSLEEP = 1 << 14;
        const B2MACTIVE = 1 << 15;
        const B2MSHUTDN = 1 << 16;
        /// STATUS falling edge: the radio finished clocking in a write.
        const BLECSSTATN = 1 << 17;
        /// BLECIRQ falling edge: the radio has nothing more to send.
        const BLECIRQN = 1 << 18;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Interrupts {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Interrupts({=u32:#x})", self.bits())
    }
}

/// BLEIF registers used by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reg {
    FifoPtr,
    FifoThr,
    FifoPop,
    FifoPush,
    FifoCtrl,
    ClkCfg,
    Cmd,
    CmdRpt,
    OffsetHi,
    IntEn,
    IntStat,
    IntClr,
    IntSet,
    DmaTrigEn,
    DmaCfg,
    DmaTotCount,
    DmaTargAddr,
    DmaStat,
    MspiCfg,
    BleCfg,
    BStatus,
    BleDbg,
}

/// Register access for one BLE interface, plus the handful of system
/// controls (feature enable, power switch, chip revision, OTP) the driver
/// needs around it.
pub trait Instance {
    fn read(&mut self, reg: Reg) -> u32;

    fn write(&mut self, reg: Reg, value: u32);

    /// Raw MCUCTRL.CHIPREV value.
    fn chip_revision(&mut self) -> u32;

    /// Drives MCUCTRL.FEATUREENABLE.BLEREQ.
    fn set_feature_request(&mut self, on: bool);

    /// BLEACK and BLEAVAIL are both set.
    fn feature_ready(&mut self) -> bool;

    /// Switches the BLEL power domain.
    fn set_power_domain(&mut self, on: bool);

    fn power_domain_on(&mut self) -> bool;

    /// Factory modulation trim, `None` when the OTP word is unprogrammed.
    fn modex_trim(&mut self) -> Option<u32>;

    /// Bus address the DMA engine should use for `words`, or `None` if the
    /// buffer is outside DMA-reachable memory.
    fn dma_address(&mut self, words: &[u32]) -> Option<u32>;

    /// Reads `reg` as a typed local copy.
    fn fetch<R: RegisterLongName>(&mut self, reg: Reg) -> LocalRegisterCopy<u32, R> {
        LocalRegisterCopy::new(self.read(reg))
    }

    /// Overwrites `reg` with `value`, all other fields zero.
    fn store<R: RegisterLongName>(&mut self, reg: Reg, value: FieldValue<u32, R>) {
        self.write(reg, value.value);
    }

    /// Read-modify-write of the fields named in `value`.
    fn update<R: RegisterLongName>(&mut self, reg: Reg, value: FieldValue<u32, R>) {
        let mut copy: LocalRegisterCopy<u32, R> = self.fetch(reg);
        copy.modify(value);
        self.write(reg, copy.get());
    }
}

/// Silicon revisions with distinct BLEIF behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Silicon {
    A0,
    A1,
    B0,
}

/// What a silicon revision supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
    /// BLECIRQN/BLECSSTATN edge interrupts exist and gate DMA completion.
    pub flow_control_irqs: bool,
    /// FIFO reads must be followed by a write to FIFOPOP.
    pub fifo_pop_write: bool,
    /// The radio's 32 kHz clock can be measured after boot.
    pub clock_check: bool,
}

impl Silicon {
    /// Decodes MCUCTRL.CHIPREV. Revisions newer than the last known one are
    /// treated as that one.
    pub fn from_chip_revision(raw: u32) -> Silicon {
        let rev: LocalRegisterCopy<u32, CHIPREV::Register> = LocalRegisterCopy::new(raw);
        match (rev.read(CHIPREV::REVMAJ), rev.read(CHIPREV::REVMIN)) {
            (0, _) | (1, 0) | (1, 1) => Silicon::A0,
            (1, _) => Silicon::A1,
            _ => Silicon::B0,
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            Silicon::A0 | Silicon::A1 => Capabilities {
                flow_control_irqs: false,
                fifo_pop_write: true,
                clock_check: false,
            },
            Silicon::B0 => Capabilities {
                flow_control_irqs: true,
                fifo_pop_write: false,
                clock_check: true,
            },
        }
    }
}

/// The memory-mapped BLEIF of the Apollo3.
pub struct Bleif {
    regs: &'static BleifRegisters,
    mcuctrl: &'static McuCtrlRegisters,
    pwrctrl: &'static PwrCtrlRegisters,
}

impl Bleif {
    /// # Safety
    ///
    /// The caller must be the only user of the BLEIF block, of
    /// MCUCTRL.FEATUREENABLE and of the BLEL power switch.
    pub unsafe fn new() -> Self {
        Bleif {
            regs: &*(BLEIF_BASE as *const BleifRegisters),
            mcuctrl: &*(MCUCTRL_BASE as *const McuCtrlRegisters),
            pwrctrl: &*(PWRCTRL_BASE as *const PwrCtrlRegisters),
        }
    }

    /// Part number, for diagnostics.
    pub fn part_number(&self) -> u32 {
        self.mcuctrl.chippn.get()
    }
}

impl Instance for Bleif {
    fn read(&mut self, reg: Reg) -> u32 {
        let r = self.regs;
        match reg {
            Reg::FifoPtr => r.fifoptr.get(),
            Reg::FifoThr => r.fifothr.get(),
            Reg::FifoPop => r.fifopop.get(),
            Reg::FifoPush => r.fifopush.get(),
            Reg::FifoCtrl => r.fifoctrl.get(),
            Reg::ClkCfg => r.clkcfg.get(),
            Reg::Cmd => r.cmd.get(),
            Reg::CmdRpt => r.cmdrpt.get(),
            Reg::OffsetHi => r.offsethi.get(),
            Reg::IntEn => r.inten.get(),
            Reg::IntStat => r.intstat.get(),
            Reg::IntClr => r.intclr.get(),
            Reg::IntSet => r.intset.get(),
            Reg::DmaTrigEn => r.dmatrigen.get(),
            Reg::DmaCfg => r.dmacfg.get(),
            Reg::DmaTotCount => r.dmatotcount.get(),
            Reg::DmaTargAddr => r.dmatargaddr.get(),
            Reg::DmaStat => r.dmastat.get(),
            Reg::MspiCfg => r.mspicfg.get(),
            Reg::BleCfg => r.blecfg.get(),
            Reg::BStatus => r.bstatus.get(),
            Reg::BleDbg => r.bledbg.get(),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        let r = self.regs;
        match reg {
            Reg::FifoPtr => r.fifoptr.set(value),
            Reg::FifoThr => r.fifothr.set(value),
            Reg::FifoPop => r.fifopop.set(value),
            Reg::FifoPush => r.fifopush.set(value),
            Reg::FifoCtrl => r.fifoctrl.set(value),
            Reg::ClkCfg => r.clkcfg.set(value),
            Reg::Cmd => r.cmd.set(value),
            Reg::CmdRpt => r.cmdrpt.set(value),
            Reg::OffsetHi => r.offsethi.set(value),
            Reg::IntEn => r.inten.set(value),
            Reg::IntStat => r.intstat.set(value),
            Reg::IntClr => r.intclr.set(value),
            Reg::IntSet => r.intset.set(value),
            Reg::DmaTrigEn => r.dmatrigen.set(value),
            Reg::DmaCfg => r.dmacfg.set(value),
            Reg::DmaTotCount => r.dmatotcount.set(value),
            Reg::DmaTargAddr => r.dmatargaddr.set(value),
            Reg::DmaStat => r.dmastat.set(value),
            Reg::MspiCfg => r.mspicfg.set(value),
            Reg::BleCfg => r.blecfg.set(value),
            Reg::BStatus => r.bstatus.set(value),
            Reg::BleDbg => r.bledbg.set(value),
        }
    }

    fn chip_revision(&mut self) -> u32 {
        self.mcuctrl.chiprev.get()
    }

    fn set_feature_request(&mut self, on: bool) {
        self.mcuctrl.featureenable.modify(FEATUREENABLE::BLEREQ.val(on as u32));
    }

    fn feature_ready(&mut self) -> bool {
        let fe = self.mcuctrl.featureenable.extract();
        fe.is_set(FEATUREENABLE::BLEACK) && fe.is_set(FEATUREENABLE::BLEAVAIL)
    }

    fn set_power_domain(&mut self, on: bool) {
        self.pwrctrl.devpwren.modify(DEVPWREN::PWRBLEL.val(on as u32));
    }

    fn power_domain_on(&mut self) -> bool {
        self.pwrctrl.devpwrstatus.is_set(DEVPWRSTATUS::BLEL)
    }

    fn modex_trim(&mut self) -> Option<u32> {
        // SAFETY: the OTP info space is always mapped and readable.
        let trim = unsafe { ptr::read_volatile(MODEX_TRIM_ADDR as *const u32) };
        (trim != 0xFFFF_FFFF).then_some(trim)
    }

    fn dma_address(&mut self, words: &[u32]) -> Option<u32> {
        crate::slice_in_ram(words).then(|| words.as_ptr() as u32)
    }
}

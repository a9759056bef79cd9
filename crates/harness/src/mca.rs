//! MCA bank decoder & sampler.
//!
//! Reads `MSR_MCG_CAP` to discover bank count per core, then walks every
//! bank's STATUS/ADDR/MISC0/IPID/SYND/DESTAT/DEADDR registers, decoding
//! STATUS's bit-fields and producing structured [`McaBank`] records.
//! Grounded on `original_source/mce_read/MceCheck.py`.

use crate::error::{HarnessError, Result};
use crate::msr::MsrGateway;

/// `MSR_MCG_CAP`, global machine-check capabilities.
const MSR_MCG_CAP: u32 = 0x179;
/// Base address of bank 0's STATUS register; bank `i`'s group starts at
/// `MCA_BANK_BASE + i * MCA_BANK_STRIDE`.
const MCA_BANK_BASE: u32 = 0xC000_2001;
const MCA_BANK_STRIDE: u32 = 16;

/// Offsets within a bank's register group, relative to its STATUS
/// register (itself offset 0 from `MCA_BANK_BASE + i*16`, i.e. offset 1
/// from the bank's CTL register per the original's 9-field table).
const OFFSET_STATUS: u32 = 0;
const OFFSET_ADDR: u32 = 1;
const OFFSET_MISC0: u32 = 2;
const OFFSET_IPID: u32 = 4;
const OFFSET_SYND: u32 = 5;
const OFFSET_DESTAT: u32 = 6;
const OFFSET_DEADDR: u32 = 7;

/// Decoded STATUS bit-fields, plus the raw 64-bit value they were derived
/// from. Every accessor masks and shifts the raw value — there is no
/// compiler-dependent bit-field layout here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McaStatus(pub u64);

impl McaStatus {
    pub fn error_code(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
    pub fn error_code_ext(self) -> u8 {
        ((self.0 >> 16) & 0x3F) as u8
    }
    pub fn addr_lsb(self) -> u8 {
        ((self.0 >> 24) & 0x3F) as u8
    }
    pub fn error_code_id(self) -> u8 {
        ((self.0 >> 32) & 0x3F) as u8
    }
    pub fn scrub(self) -> bool {
        bit(self.0, 40)
    }
    pub fn poison(self) -> bool {
        bit(self.0, 43)
    }
    pub fn deferred(self) -> bool {
        bit(self.0, 44)
    }
    pub fn uecc(self) -> bool {
        bit(self.0, 45)
    }
    pub fn cecc(self) -> bool {
        bit(self.0, 46)
    }
    pub fn transparent(self) -> bool {
        bit(self.0, 52)
    }
    pub fn syndv(self) -> bool {
        bit(self.0, 53)
    }
    pub fn tcc(self) -> bool {
        bit(self.0, 55)
    }
    pub fn err_core_id_val(self) -> bool {
        bit(self.0, 56)
    }
    pub fn pcc(self) -> bool {
        bit(self.0, 57)
    }
    pub fn addrv(self) -> bool {
        bit(self.0, 58)
    }
    pub fn miscv(self) -> bool {
        bit(self.0, 59)
    }
    pub fn en(self) -> bool {
        bit(self.0, 60)
    }
    pub fn uc(self) -> bool {
        bit(self.0, 61)
    }
    pub fn overflow(self) -> bool {
        bit(self.0, 62)
    }
    pub fn val(self) -> bool {
        bit(self.0, 63)
    }
}

fn bit(raw: u64, n: u32) -> bool {
    (raw >> n) & 1 == 1
}

/// Decoded `DESTAT` — structurally similar to STATUS but with a reduced
/// field set (no en/uc/pcc/tcc/err_core_id_val).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McaDestat(pub u64);

impl McaDestat {
    pub fn val(self) -> bool {
        bit(self.0, 63)
    }
    pub fn addrv(self) -> bool {
        bit(self.0, 58)
    }
}

/// One (core, bank) MCA record. Only emitted when `status.val() == true`.
#[derive(Debug, Clone)]
pub struct McaBank {
    pub core_id: usize,
    pub bank_id: usize,
    pub socket_id: u32,
    pub status: McaStatus,
    pub addr: Option<u64>,
    pub synd: Option<u64>,
    pub ipid: u64,
    pub misc0: Option<u64>,
    pub destat: McaDestat,
    pub deaddr: Option<u64>,
}

impl McaBank {
    /// Human-readable one-line description, for the MCA-details log
    /// column. Mirrors `original_source/mce_read/MceCheck.py::MCABank.__str__`.
    pub fn describe(&self) -> String {
        let mut msg = format!(
            "MCE DETECTED [{}];CORE: {};SOCKET: {};BANK: {};ERROR CODE EXT: {};STATUS: {};MCA_STATUS: {:#x};",
            if self.status.uc() { "UNCORRECTED" } else { "CORRECTED" },
            self.core_id,
            self.socket_id,
            self.bank_id,
            self.status.error_code_ext(),
            if self.status.uc() { "UNCORRECTED" } else { "CORRECTED" },
            self.status.0,
        );
        if let Some(addr) = self.addr {
            msg += &format!("MCA_ADDR: {addr:#x};");
        }
        if let Some(synd) = self.synd {
            msg += &format!("MCA_SYND: {synd:#x};");
        }
        msg += &format!("MCA_IPID: {:#x};", self.ipid);
        if let Some(misc0) = self.misc0 {
            msg += &format!("MCA_MISC0: {misc0:#x};");
        }
        if self.destat.val() {
            msg += &format!("MCA_DESTAT: {:#x};", self.destat.0);
            if let Some(deaddr) = self.deaddr {
                msg += &format!("MCA_DEADDR: {deaddr:#x};");
            }
        }
        msg += &format!("STATUS DECODE: {}", self.status.0);
        msg
    }
}

/// Looks up a core's socket id. Kept as a trait so tests can stub it out
/// without touching `/sys`.
pub trait SocketLookup {
    fn socket_id(&self, core_id: usize) -> Result<u32>;
}

/// Walks every logical core × every visible bank, side-effect-free beyond
/// reads (never clears, acknowledges, or masks MCA state).
pub struct McaSampler<'a> {
    msr: &'a MsrGateway,
}

impl<'a> McaSampler<'a> {
    pub fn new(msr: &'a MsrGateway) -> Self {
        Self { msr }
    }

    /// Sample every core in `[0, num_logical_cores)`, ascending core then
    /// ascending bank, using `sockets` to label each resulting record.
    pub fn sample(&self, num_logical_cores: usize, sockets: &impl SocketLookup) -> Result<Vec<McaBank>> {
        let mut out = Vec::new();
        for core_id in 0..num_logical_cores {
            let cap = self.msr.read(MSR_MCG_CAP, core_id)?;
            let count = (cap & 0xFF) as usize;
            if count == 0 {
                return Err(HarnessError::NoBanks { core_id });
            }

            let socket_id = sockets.socket_id(core_id)?;
            for bank_id in 0..count {
                let group_base = MCA_BANK_BASE + (bank_id as u32) * MCA_BANK_STRIDE;
                let status = McaStatus(self.msr.read(group_base + OFFSET_STATUS, core_id)?);
                if !status.val() {
                    continue;
                }

                let misc0 = if status.miscv() {
                    Some(self.msr.read(group_base + OFFSET_MISC0, core_id)?)
                } else {
                    None
                };
                let addr = if status.addrv() {
                    Some(self.msr.read(group_base + OFFSET_ADDR, core_id)?)
                } else {
                    None
                };
                let synd = if status.syndv() {
                    Some(self.msr.read(group_base + OFFSET_SYND, core_id)?)
                } else {
                    None
                };
                let ipid = self.msr.read(group_base + OFFSET_IPID, core_id)?;
                let destat = McaDestat(self.msr.read(group_base + OFFSET_DESTAT, core_id)?);
                let deaddr = if destat.val() {
                    Some(self.msr.read(group_base + OFFSET_DEADDR, core_id)?)
                } else {
                    None
                };

                out.push(McaBank {
                    core_id,
                    bank_id,
                    socket_id,
                    status,
                    addr,
                    synd,
                    ipid,
                    misc0,
                    destat,
                    deaddr,
                });
            }
        }
        Ok(out)
    }
}

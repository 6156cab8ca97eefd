// SPDX-License-Identifier: MPL-2.0

//! Register-level synchronization with a translation unit.
//!
//! The unit exposes one window of 32-bit registers. How those registers are
//! reached (MMIO mapping, emulation, ...) is the host's concern, provided
//! through [`RegisterIo`]; this module owns the protocol written over them:
//! directory programming, device-table updates and the flush/poll dance.

use alloc::boxed::Box;

use bit_field::BitField;
use bitflags::bitflags;

use crate::{
    error::{Error, Result},
    page_table::{level_shift, LEVEL_STRIDE},
    Paddr,
};

/// The number of busy-bit polls allowed before a flush is declared stuck.
pub const LOOP_TIMEOUT: u32 = 100_000;

/// Flush command and busy/status register.
pub(crate) const REG_VBTC: usize = 0x14;
/// Device-table entry register: enable, index, valid, domain, BDF.
pub(crate) const REG_EIVDB: usize = 0x18;
/// Command register; the low two bits must be cleared after each update.
pub(crate) const REG_CMD: usize = 0x1C;
/// Performance-counter and global-control register.
pub(crate) const REG_PFM_CNT_EN: usize = 0x100;

const REG_PGD0_LO: usize = 0x20;
const REG_DIR_CTRL0: usize = 0xA0;

/// The busy bit in `VBTC`; set while the unit processes a flush.
pub(crate) const PGTABLE_BUSY: u32 = 1 << 16;

const VBTC_FLUSH_DOMAIN: u32 = 1 << 2;
const VBTC_FLUSH_READ: u32 = 1 << 8;
const VBTC_FLUSH_ALL: u32 = 0x5;
const EIVDB_DOMAIN_FIELD: core::ops::Range<usize> = 16..20;

const CMD_FIELD_MASK: u32 = 0xffff_fffc;

bitflags! {
    /// Control bits of the `PFM_CNT_EN` register.
    struct UnitControl: u32 {
        /// Page-table walks fetch from main memory.
        const WALK_MAIN_MEMORY = 1 << 29;
        /// Translation is enabled on the unit.
        const TRANSLATE = 1 << 31;
    }
}

pub(crate) const fn reg_pgd_lo(domain_id: u16) -> usize {
    REG_PGD0_LO + ((domain_id as usize) << 3)
}

pub(crate) const fn reg_pgd_hi(domain_id: u16) -> usize {
    reg_pgd_lo(domain_id) + 4
}

pub(crate) const fn reg_dir_ctrl(domain_id: u16) -> usize {
    REG_DIR_CTRL0 + ((domain_id as usize) << 2)
}

/// The directory-control word describing the table geometry to the walker:
/// per-level stride and shift, packed from the top level down.
pub(crate) const fn dir_ctrl_word() -> u32 {
    ((LEVEL_STRIDE << 26)
        | (level_shift(2) << 20)
        | (LEVEL_STRIDE << 16)
        | (level_shift(1) << 10)
        | (LEVEL_STRIDE << 6)
        | level_shift(0)) as u32
}

/// Access to one unit's register window.
///
/// `delay` separates two busy-bit polls; the host picks a primitive
/// appropriate to its environment. The default busy-waits.
pub trait RegisterIo: Send + Sync {
    /// Reads the 32-bit register at `offset`.
    fn read(&self, offset: usize) -> u32;
    /// Writes the 32-bit register at `offset`.
    fn write(&self, offset: usize, value: u32);
    /// Waits one poll interval.
    fn delay(&self) {
        core::hint::spin_loop();
    }
}

/// One unit's register window plus the update protocol over it.
///
/// The owning unit keeps the block behind its register lock so that the
/// read-modify-write sequences below are atomic across threads.
pub(crate) struct RegisterBlock {
    io: Box<dyn RegisterIo>,
}

impl RegisterBlock {
    pub(crate) fn new(io: Box<dyn RegisterIo>) -> Self {
        Self { io }
    }

    fn update(&mut self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.io.read(offset);
        self.io.write(offset, f(value));
    }

    pub(crate) fn enable_translation(&mut self) {
        self.update(REG_PFM_CNT_EN, |v| v | UnitControl::WALK_MAIN_MEMORY.bits());
        self.update(REG_PFM_CNT_EN, |v| v | UnitControl::TRANSLATE.bits());
        self.update(REG_CMD, |v| v & CMD_FIELD_MASK);
    }

    pub(crate) fn disable_translation(&mut self) {
        self.update(REG_PFM_CNT_EN, |v| v & !UnitControl::TRANSLATE.bits());
        self.update(REG_CMD, |v| v & CMD_FIELD_MASK);
    }

    /// Points the walker for `domain_id` at the table rooted at `pgd`.
    pub(crate) fn set_directory(&mut self, domain_id: u16, pgd: Paddr) {
        self.io.write(reg_dir_ctrl(domain_id), dir_ctrl_word());
        self.io.write(reg_pgd_hi(domain_id), (pgd >> 32) as u32);
        self.io.write(reg_pgd_lo(domain_id), pgd as u32);
    }

    /// Invalidates cached translations of one domain, first the write TLB
    /// and then the read TLB, and re-arms translation.
    ///
    /// The poll budget is shared between the two phases.
    pub(crate) fn flush_domain(&mut self, domain_id: u16) -> Result<()> {
        let mut retry = 0;
        for phase in [0, VBTC_FLUSH_READ] {
            self.update(REG_EIVDB, |v| {
                let mut v = v;
                v.set_bits(EIVDB_DOMAIN_FIELD, domain_id as u32);
                v
            });
            self.update(REG_VBTC, |v| (v & !0x10f) | phase | VBTC_FLUSH_DOMAIN);
            self.wait_idle(&mut retry)?;
        }
        self.enable_translation();
        Ok(())
    }

    /// Invalidates every cached translation on the unit and re-arms
    /// translation.
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        self.update(REG_VBTC, |v| (v & !0x1f) | VBTC_FLUSH_ALL);
        let mut retry = 0;
        self.wait_idle(&mut retry)?;
        self.enable_translation();
        Ok(())
    }

    /// Binds device-table `slot` to (`bdf`, `domain_id`) and marks it valid.
    pub(crate) fn set_device_entry(&mut self, slot: u16, bdf: u16, domain_id: u16) {
        let mut value = 0u32;
        value.set_bits(0..16, bdf as u32);
        value.set_bits(16..20, domain_id as u32);
        value.set_bit(20, true);
        value.set_bits(24..28, slot as u32);
        self.io.write(REG_EIVDB, value);
        self.io.write(
            REG_PFM_CNT_EN,
            UnitControl::TRANSLATE.bits() | UnitControl::WALK_MAIN_MEMORY.bits() | 0xf,
        );
        self.update(REG_CMD, |v| v & CMD_FIELD_MASK);
    }

    /// Invalidates device-table `slot`.
    pub(crate) fn clear_device_entry(&mut self, slot: u16) {
        let mut value = 0u32;
        value.set_bits(24..28, slot as u32);
        self.io.write(REG_EIVDB, value);
        self.update(REG_PFM_CNT_EN, |v| v | UnitControl::WALK_MAIN_MEMORY.bits());
    }

    fn wait_idle(&self, retry: &mut u32) -> Result<()> {
        while self.io.read(REG_VBTC) & PGTABLE_BUSY != 0 {
            if *retry == LOOP_TIMEOUT {
                return Err(Error::HardwareTimeout);
            }
            *retry += 1;
            self.io.delay();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::test_util::FakeRegs;

    #[test]
    fn directory_programming_splits_the_address() {
        let fake = Arc::new(FakeRegs::new());
        let mut block = RegisterBlock::new(Box::new(fake.clone()));
        let pgd: Paddr = 0x1_2345_c000;
        block.set_directory(3, pgd);
        assert_eq!(fake.reg(reg_pgd_lo(3)), 0x2345_c000);
        assert_eq!(fake.reg(reg_pgd_hi(3)), 0x1);
        assert_eq!(fake.reg(reg_dir_ctrl(3)), dir_ctrl_word());
        // Stride 11 at every level, shifts 14/25/36.
        assert_eq!(dir_ctrl_word(), (11 << 26) | (36 << 20) | (11 << 16) | (25 << 10) | (11 << 6) | 14);
    }

    #[test]
    fn device_entry_field_packing() {
        let fake = Arc::new(FakeRegs::new());
        let mut block = RegisterBlock::new(Box::new(fake.clone()));
        block.set_device_entry(5, 0x0108, 9);
        let value = fake.reg(REG_EIVDB);
        assert_eq!(value.get_bits(0..16), 0x0108);
        assert_eq!(value.get_bits(16..20), 9);
        assert!(value.get_bit(20));
        assert_eq!(value.get_bits(24..28), 5);

        block.clear_device_entry(5);
        let value = fake.reg(REG_EIVDB);
        assert!(!value.get_bit(20));
        assert_eq!(value.get_bits(24..28), 5);
    }

    #[test]
    fn flush_polls_until_idle_and_rearms() {
        let fake = Arc::new(FakeRegs::new());
        let mut block = RegisterBlock::new(Box::new(fake.clone()));
        assert_eq!(block.flush_domain(2), Ok(()));
        assert_eq!(fake.flush_count(), 2);
        assert_eq!(fake.reg(REG_EIVDB).get_bits(16..20), 2);
        assert_ne!(fake.reg(REG_PFM_CNT_EN) & (1 << 31), 0);

        assert_eq!(block.flush_all(), Ok(()));
        assert_eq!(fake.flush_count(), 3);
    }

    #[test]
    fn stuck_unit_times_out() {
        let fake = Arc::new(FakeRegs::stuck());
        let mut block = RegisterBlock::new(Box::new(fake.clone()));
        assert_eq!(block.flush_domain(0), Err(Error::HardwareTimeout));
        assert_eq!(block.flush_all(), Err(Error::HardwareTimeout));
    }

    #[test]
    fn disable_clears_the_translate_bit() {
        let fake = Arc::new(FakeRegs::new());
        let mut block = RegisterBlock::new(Box::new(fake.clone()));
        block.enable_translation();
        assert_ne!(fake.reg(REG_PFM_CNT_EN) & (1 << 31), 0);
        block.disable_translation();
        assert_eq!(fake.reg(REG_PFM_CNT_EN) & (1 << 31), 0);
    }
}

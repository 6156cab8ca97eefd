// SPDX-License-Identifier: MPL-2.0

use alloc::boxed::Box;

use log::{error, warn};
use smallvec::SmallVec;
use spin::Mutex;

use crate::{
    error::{Error, Result},
    id_alloc::IdAlloc,
    registers::{RegisterBlock, RegisterIo},
    Paddr,
};

/// The number of hardware domain IDs one unit can hand out.
pub const MAX_DOMAIN_ID: usize = 16;
/// The number of device-table slots one unit can hand out.
pub const MAX_ATTACHED_DEV_ID: usize = 16;

/// One physical translation unit.
///
/// A unit is identified by the PCI segment and requester ID of the IOMMU
/// device itself. It owns the register window, the bitmap of hardware
/// domain IDs, the bitmap of device-table slots, and the set of domain IDs
/// currently bound to it. IDs handed out by a unit are unique among its
/// live users; they return to the bitmap only after the last dependent has
/// released them.
pub struct IommuUnit {
    segment: u16,
    devid: u16,
    disabled: bool,
    regs: Mutex<RegisterBlock>,
    domain_ids: Mutex<IdAlloc>,
    device_slots: Mutex<IdAlloc>,
    bound_domains: Mutex<SmallVec<[u16; 4]>>,
}

impl IommuUnit {
    /// Creates a unit over the given register window. The unit is inert
    /// until the first domain binds to it.
    pub fn new(segment: u16, devid: u16, io: Box<dyn RegisterIo>) -> Self {
        Self {
            segment,
            devid,
            disabled: false,
            regs: Mutex::new(RegisterBlock::new(io)),
            domain_ids: Mutex::new(IdAlloc::with_capacity(MAX_DOMAIN_ID)),
            device_slots: Mutex::new(IdAlloc::with_capacity(MAX_ATTACHED_DEV_ID)),
            bound_domains: Mutex::new(SmallVec::new()),
        }
    }

    /// Marks the unit incompatible; devices routed to it run untranslated.
    pub fn mark_disabled(&mut self) {
        warn!("iommu {:04x}:{:04x}: marked disabled", self.segment, self.devid);
        self.disabled = true;
    }

    /// The PCI segment the unit lives on.
    pub fn segment(&self) -> u16 {
        self.segment
    }

    /// The requester ID of the unit's own PCI function.
    pub fn devid(&self) -> u16 {
        self.devid
    }

    /// Whether the unit was marked incompatible at probe time.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// True while at least one domain is bound to this unit.
    pub fn has_bound_domains(&self) -> bool {
        !self.bound_domains.lock().is_empty()
    }

    pub(crate) fn alloc_domain_id(&self) -> Result<u16> {
        match self.domain_ids.lock().alloc() {
            Some(id) => Ok(id as u16),
            None => {
                error!(
                    "iommu {:04x}:{:04x}: domain ids exhausted",
                    self.segment, self.devid
                );
                Err(Error::ResourceExhausted)
            }
        }
    }

    pub(crate) fn free_domain_id(&self, id: u16) {
        self.domain_ids.lock().free(id as usize);
    }

    pub(crate) fn alloc_device_slot(&self) -> Result<u16> {
        match self.device_slots.lock().alloc() {
            Some(slot) => Ok(slot as u16),
            None => {
                error!(
                    "iommu {:04x}:{:04x}: device-table slots exhausted",
                    self.segment, self.devid
                );
                Err(Error::ResourceExhausted)
            }
        }
    }

    pub(crate) fn free_device_slot(&self, slot: u16) {
        self.device_slots.lock().free(slot as usize);
    }

    pub(crate) fn record_bound_domain(&self, id: u16) {
        let mut bound = self.bound_domains.lock();
        debug_assert!(!bound.contains(&id));
        bound.push(id);
    }

    pub(crate) fn drop_bound_domain(&self, id: u16) {
        self.bound_domains.lock().retain(|&mut bound| bound != id);
    }

    /// Programs the directory-control and page-table base registers so that
    /// device-table entries referencing `id` resolve through the table
    /// rooted at `pgd`.
    pub(crate) fn bind_domain(&self, id: u16, pgd: Paddr) {
        self.regs.lock().set_directory(id, pgd);
    }

    /// Issues a domain-scoped TLB invalidation and re-arms translation.
    pub(crate) fn flush_domain(&self, id: u16) -> Result<()> {
        let result = self.regs.lock().flush_domain(id);
        if result.is_err() {
            error!(
                "iommu {:04x}:{:04x}: iotlb flush busy (domain id {})",
                self.segment, self.devid, id
            );
        }
        result
    }

    /// Issues a global TLB invalidation and re-arms translation.
    pub(crate) fn flush_all(&self) -> Result<()> {
        let result = self.regs.lock().flush_all();
        if result.is_err() {
            error!(
                "iommu {:04x}:{:04x}: iotlb flush busy",
                self.segment, self.devid
            );
        }
        result
    }

    pub(crate) fn set_device_entry(&self, slot: u16, bdf: u16, domain_id: u16) {
        self.regs.lock().set_device_entry(slot, bdf, domain_id);
    }

    pub(crate) fn clear_device_entry(&self, slot: u16) {
        self.regs.lock().clear_device_entry(slot);
    }

    pub(crate) fn disable_translation(&self) {
        self.regs.lock().disable_translation();
    }
}

impl core::fmt::Debug for IommuUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("IommuUnit")
            .field("segment", &self.segment)
            .field("devid", &self.devid)
            .field("disabled", &self.disabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::test_util::FakeRegs;

    fn test_unit() -> IommuUnit {
        IommuUnit::new(0, 0x3c0f, Box::new(Arc::new(FakeRegs::new())))
    }

    #[test]
    fn domain_ids_are_sequential_and_bounded() {
        let unit = test_unit();
        for expected in 0..MAX_DOMAIN_ID as u16 {
            assert_eq!(unit.alloc_domain_id(), Ok(expected));
        }
        assert_eq!(unit.alloc_domain_id(), Err(Error::ResourceExhausted));
        unit.free_domain_id(7);
        assert_eq!(unit.alloc_domain_id(), Ok(7));
    }

    #[test]
    fn slot_allocation_is_independent_of_domain_ids() {
        let unit = test_unit();
        assert_eq!(unit.alloc_domain_id(), Ok(0));
        assert_eq!(unit.alloc_device_slot(), Ok(0));
        assert_eq!(unit.alloc_device_slot(), Ok(1));
        unit.free_device_slot(0);
        assert_eq!(unit.alloc_device_slot(), Ok(0));
    }

    #[test]
    fn bound_domain_tracking() {
        let unit = test_unit();
        assert!(!unit.has_bound_domains());
        unit.record_bound_domain(0);
        unit.record_bound_domain(1);
        unit.drop_bound_domain(0);
        assert!(unit.has_bound_domains());
        unit.drop_bound_domain(1);
        assert!(!unit.has_bound_domains());
    }
}

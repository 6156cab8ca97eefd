// SPDX-License-Identifier: MPL-2.0

//! Isolation domains and their bindings to translation units.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use smallvec::SmallVec;
use spin::Mutex;

use crate::{
    device::{Device, DeviceState},
    error::{Error, Result},
    frame::PAGE_SIZE,
    page_table::{PageTable, PteFlags, MAX_IOVA},
    unit::IommuUnit,
    Iova, Paddr,
};

/// The binding of one domain to one translation unit.
///
/// Created lazily by the first device attach that needs the pair and torn
/// down when its last device detaches. While it exists, the unit's base
/// registers for `id` point at the domain's page table.
pub(crate) struct UnitBinding {
    unit: Arc<IommuUnit>,
    id: u16,
    devices: Mutex<SmallVec<[Arc<Device>; 4]>>,
}

/// An isolation domain: one I/O page table, visible to every unit the
/// domain has a live binding on.
///
/// Mappings may be established before any device is attached; a domain with
/// no devices keeps its page table but holds no bindings.
pub struct Domain {
    self_ref: Weak<Domain>,
    closed: AtomicBool,
    /// The page-table lock. `None` once the domain is closed.
    pt: Mutex<Option<PageTable>>,
    bindings: Mutex<SmallVec<[Arc<UnitBinding>; 2]>>,
}

impl Domain {
    /// Creates a domain with an empty page table.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
            pt: Mutex::new(Some(PageTable::new())),
            bindings: Mutex::new(SmallVec::new()),
        })
    }

    /// Maps `[iova, iova + len)` to `[paddr, paddr + len)` for every device
    /// of the domain, readable and writable, and flushes every bound unit.
    ///
    /// The mapping is guaranteed visible to hardware only once this returns
    /// `Ok`. A short map is reported as [`Error::PartialMapping`]; pages
    /// mapped before the failure are not rolled back.
    pub fn map(&self, iova: Iova, paddr: Paddr, len: usize) -> Result<usize> {
        if iova % PAGE_SIZE != 0 || paddr % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        if iova.checked_add(len).map_or(true, |end| end > MAX_IOVA) {
            return Err(Error::InvalidArgs);
        }
        let mapped = {
            let mut pt = self.pt.lock();
            let pt = pt.as_mut().ok_or(Error::InvalidDomain)?;
            pt.map(iova, paddr, len, PteFlags::RW)
        };
        let flushed = self.flush_all();
        if mapped != len {
            return Err(Error::PartialMapping);
        }
        flushed.map(|_| mapped)
    }

    /// Unmaps `[iova, iova + len)` and flushes every bound unit. Returns
    /// the number of bytes that were mapped; unmapping a hole returns 0.
    pub fn unmap(&self, iova: Iova, len: usize) -> usize {
        debug_assert!(iova % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        let unmapped = {
            let mut pt = self.pt.lock();
            match pt.as_mut() {
                Some(pt) => pt.unmap(iova, len),
                None => return 0,
            }
        };
        // Flush failures are logged by the unit; this path reports bytes.
        let _ = self.flush_all();
        unmapped
    }

    /// Resolves `iova` through the domain's page table.
    pub fn translate(&self, iova: Iova) -> Option<Paddr> {
        let pt = self.pt.lock();
        let (base, size) = pt.as_ref()?.translate(iova)?;
        Some(base | (iova & (size - 1)))
    }

    /// Invalidates every cached translation on every unit the domain is
    /// bound to.
    pub fn flush_all(&self) -> Result<()> {
        let bindings = self.bindings.lock().clone();
        let mut result = Ok(());
        for binding in &bindings {
            if let Err(e) = binding.unit.flush_all() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// The hardware domain ID this domain holds on `unit`, if bound.
    pub fn hardware_id(&self, unit: &Arc<IommuUnit>) -> Option<u16> {
        self.bindings
            .lock()
            .iter()
            .find(|b| Arc::ptr_eq(&b.unit, unit))
            .map(|b| b.id)
    }

    /// Attaches `dev` to this domain.
    ///
    /// Re-attaching a device that already belongs to this domain only
    /// raises its reference count. A device attached to another domain is
    /// moved here (last attach wins). Devices without an owning unit pass
    /// through untranslated and attach as a successful no-op.
    pub fn attach_device(&self, dev: &Arc<Device>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidDomain);
        }
        let Some(unit) = dev.unit().cloned() else {
            debug!("device {}: not managed by any iommu", dev.location());
            return Ok(());
        };
        let mut state = dev.state();
        if state.retired {
            return Err(Error::InvalidDevice);
        }
        if let Some(owner) = state.owner.upgrade() {
            if Weak::ptr_eq(&state.owner, &self.self_ref) {
                state.count += 1;
                info!(
                    "device {}: already attached, count {}",
                    dev.location(),
                    state.count
                );
                return Ok(());
            }
            owner.detach_locked(dev, &mut state, true);
        }
        let pgd = {
            let pt = self.pt.lock();
            pt.as_ref().ok_or(Error::InvalidDomain)?.root_paddr()
        };
        let (binding, created) = self.binding_for(&unit, pgd)?;
        let slot = match unit.alloc_device_slot() {
            Ok(slot) => slot,
            Err(e) => {
                if created {
                    self.teardown_binding(&binding);
                }
                return Err(e);
            }
        };
        unit.set_device_entry(slot, dev.location().device_id(), binding.id);
        if let Err(e) = unit.flush_domain(binding.id) {
            unit.clear_device_entry(slot);
            unit.free_device_slot(slot);
            if created {
                self.teardown_binding(&binding);
            }
            return Err(e);
        }
        state.count = 1;
        state.slot = Some(slot);
        state.owner = self.self_ref.clone();
        binding.devices.lock().push(dev.clone());
        info!(
            "device {}: attached with domain id {} on iommu {:04x}:{:04x}",
            dev.location(),
            binding.id,
            unit.segment(),
            unit.devid()
        );
        Ok(())
    }

    /// Detaches `dev` from this domain.
    ///
    /// Drops one reference; the device stays attached until the count hits
    /// zero. Detaching a device that is not attached here is a no-op.
    pub fn detach_device(&self, dev: &Arc<Device>) {
        let mut state = dev.state();
        self.detach_locked(dev, &mut state, false);
    }

    /// Detaches `dev` completely, regardless of its reference count.
    pub(crate) fn force_detach(&self, dev: &Arc<Device>) {
        let mut state = dev.state();
        self.detach_locked(dev, &mut state, true);
    }

    /// Destroys the domain: force-detaches every remaining device, tears
    /// down all bindings and frees the page table. Idempotent; any use of
    /// the handle afterwards fails with [`Error::InvalidDomain`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let binding = self.bindings.lock().pop();
            let Some(binding) = binding else {
                break;
            };
            let devices: SmallVec<[Arc<Device>; 4]> =
                binding.devices.lock().drain(..).collect();
            for dev in devices {
                let mut state = dev.state();
                if !Weak::ptr_eq(&state.owner, &self.self_ref) {
                    continue;
                }
                state.count = 0;
                state.owner = Weak::new();
                if let Some(slot) = state.slot.take() {
                    binding.unit.clear_device_entry(slot);
                    binding.unit.free_device_slot(slot);
                }
            }
            self.release_binding(&binding);
        }
        *self.pt.lock() = None;
    }

    /// Finds the binding for `unit`, creating and programming one when this
    /// is the first device of the pair. The bool reports whether the
    /// binding was created by this call.
    fn binding_for(&self, unit: &Arc<IommuUnit>, pgd: Paddr) -> Result<(Arc<UnitBinding>, bool)> {
        let mut bindings = self.bindings.lock();
        if let Some(binding) = bindings.iter().find(|b| Arc::ptr_eq(&b.unit, unit)) {
            return Ok((binding.clone(), false));
        }
        let id = unit.alloc_domain_id()?;
        unit.bind_domain(id, pgd);
        unit.record_bound_domain(id);
        let binding = Arc::new(UnitBinding {
            unit: unit.clone(),
            id,
            devices: Mutex::new(SmallVec::new()),
        });
        bindings.push(binding.clone());
        Ok((binding, true))
    }

    fn detach_locked(&self, dev: &Arc<Device>, state: &mut DeviceState, force: bool) {
        if !Weak::ptr_eq(&state.owner, &self.self_ref) || state.count == 0 {
            return;
        }
        if force {
            state.count = 0;
        } else {
            state.count -= 1;
            if state.count > 0 {
                return;
            }
        }
        let Some(unit) = dev.unit() else {
            return;
        };
        let binding = self
            .bindings
            .lock()
            .iter()
            .find(|b| Arc::ptr_eq(&b.unit, unit))
            .cloned();
        let Some(binding) = binding else {
            return;
        };
        if let Some(slot) = state.slot.take() {
            unit.clear_device_entry(slot);
            unit.free_device_slot(slot);
        }
        state.owner = Weak::new();
        let now_empty = {
            let mut devices = binding.devices.lock();
            devices.retain(|d| !Arc::ptr_eq(d, dev));
            devices.is_empty()
        };
        // Failures are logged by the unit; detach itself cannot fail.
        let _ = unit.flush_domain(binding.id);
        if now_empty {
            self.teardown_binding(&binding);
        }
    }

    /// Removes `binding` from the domain and releases its unit resources.
    fn teardown_binding(&self, binding: &Arc<UnitBinding>) {
        self.bindings.lock().retain(|b| !Arc::ptr_eq(b, binding));
        self.release_binding(binding);
    }

    fn release_binding(&self, binding: &Arc<UnitBinding>) {
        let unit = &binding.unit;
        unit.drop_bound_domain(binding.id);
        unit.free_domain_id(binding.id);
        let _ = unit.flush_all();
        if !unit.has_bound_domains() {
            unit.disable_translation();
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // A dropped handle releases its hardware state like an explicit
        // close; bindings cannot outlive the page table they point at.
        self.close();
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("bindings", &self.bindings.lock().len())
            .finish()
    }
}

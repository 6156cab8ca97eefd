// SPDX-License-Identifier: MPL-2.0

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info};

use crate::{device::Device, pci::PciDeviceLocation, unit::IommuUnit};

/// The registry of all translation units and the device routing table.
///
/// Built once at driver initialization from the topology the firmware
/// reports, then used as a read-only lookup. The registry is the only owner
/// of [`IommuUnit`]s; every other reference to a unit is resolved through
/// it at probe time.
pub struct IommuRegistry {
    units: Vec<Arc<IommuUnit>>,
    /// (segment, requester ID) -> index into `units`.
    routes: BTreeMap<(u16, u16), usize>,
}

impl IommuRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            units: Vec::new(),
            routes: BTreeMap::new(),
        }
    }

    /// Adds a discovered unit and returns the shared handle.
    pub fn register_unit(&mut self, unit: IommuUnit) -> Arc<IommuUnit> {
        info!(
            "iommu {:04x}:{:04x}: registered",
            unit.segment(),
            unit.devid()
        );
        let unit = Arc::new(unit);
        self.units.push(unit.clone());
        unit
    }

    /// Routes `location` to `unit` in the lookup table.
    ///
    /// A unit never translates itself, whatever the firmware tables claim;
    /// a route from a unit's own location is dropped.
    pub fn add_route(&mut self, location: PciDeviceLocation, unit: &Arc<IommuUnit>) {
        if location.segment == unit.segment() && location.device_id() == unit.devid() {
            debug!("iommu {:04x}:{:04x}: refusing self-route", unit.segment(), unit.devid());
            return;
        }
        let Some(index) = self.units.iter().position(|u| Arc::ptr_eq(u, unit)) else {
            debug_assert!(false, "route added for an unregistered unit");
            return;
        };
        self.routes
            .insert((location.segment, location.device_id()), index);
    }

    /// The unit responsible for `location`, if the routing table covers it.
    pub fn unit_for(&self, location: PciDeviceLocation) -> Option<&Arc<IommuUnit>> {
        self.routes
            .get(&(location.segment, location.device_id()))
            .map(|&index| &self.units[index])
    }

    /// Creates the passthrough state for the device at `location`.
    ///
    /// Devices with no route, or routed to a disabled unit, run
    /// untranslated; that is a supported degraded mode, not an error.
    pub fn probe_device(&self, location: PciDeviceLocation) -> Arc<Device> {
        let unit = match self.unit_for(location) {
            Some(unit) if unit.is_disabled() => {
                debug!(
                    "device {}: iommu {:04x}:{:04x} is disabled, running untranslated",
                    location,
                    unit.segment(),
                    unit.devid()
                );
                None
            }
            Some(unit) => {
                info!(
                    "device {}: managed by iommu {:04x}:{:04x}",
                    location,
                    unit.segment(),
                    unit.devid()
                );
                Some(unit.clone())
            }
            None => {
                debug!("device {}: not managed by any iommu", location);
                None
            }
        };
        Device::new(location, unit)
    }

    /// Retires a probed device, detaching it from its domain first if the
    /// caller has not already done so.
    pub fn release_device(&self, dev: &Arc<Device>) {
        let owner = {
            let mut state = dev.state();
            state.retired = true;
            state.owner.upgrade()
        };
        if let Some(domain) = owner {
            domain.force_detach(dev);
        }
    }

    /// The registered units, in discovery order.
    pub fn units(&self) -> &[Arc<IommuUnit>] {
        &self.units
    }
}

impl Default for IommuRegistry {
    fn default() -> Self {
        Self::new()
    }
}

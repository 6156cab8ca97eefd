// SPDX-License-Identifier: MPL-2.0

use alloc::sync::{Arc, Weak};

use spin::{Mutex, MutexGuard};

use crate::{domain::Domain, pci::PciDeviceLocation, unit::IommuUnit};

/// Per-device passthrough state.
///
/// The owning unit is resolved once from the routing table when the device
/// is probed and never changes afterwards. A device without a unit is not
/// covered by any IOMMU and runs untranslated; attaching it is accepted as
/// a no-op.
pub struct Device {
    location: PciDeviceLocation,
    unit: Option<Arc<IommuUnit>>,
    state: Mutex<DeviceState>,
}

/// Mutable attach state, guarded by the device's own lock so that
/// concurrent attach/detach calls for the same device are serialized.
pub(crate) struct DeviceState {
    /// The number of outstanding attach calls. The device table entry is
    /// valid exactly while this is non-zero.
    pub(crate) count: usize,
    /// The device-table slot, claimed while attached.
    pub(crate) slot: Option<u16>,
    /// The domain this device is currently attached to.
    pub(crate) owner: Weak<Domain>,
    /// Set once the device is released; all further attaches fail.
    pub(crate) retired: bool,
}

impl Device {
    pub(crate) fn new(location: PciDeviceLocation, unit: Option<Arc<IommuUnit>>) -> Arc<Self> {
        Arc::new(Self {
            location,
            unit,
            state: Mutex::new(DeviceState {
                count: 0,
                slot: None,
                owner: Weak::new(),
                retired: false,
            }),
        })
    }

    /// The PCI location this device was probed at.
    pub fn location(&self) -> PciDeviceLocation {
        self.location
    }

    /// The unit responsible for this device, if any.
    pub fn unit(&self) -> Option<&Arc<IommuUnit>> {
        self.unit.as_ref()
    }

    /// Whether the device's DMA is translated at all.
    pub fn is_translated(&self) -> bool {
        self.unit.is_some()
    }

    /// Whether the device is currently attached to a domain.
    pub fn is_attached(&self) -> bool {
        self.state.lock().count > 0
    }

    /// The device-table slot claimed for this device, while attached.
    pub fn slot(&self) -> Option<u16> {
        self.state.lock().slot
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("location", &self.location)
            .field("translated", &self.is_translated())
            .finish()
    }
}

// SPDX-License-Identifier: MPL-2.0

//! The IOMMU translation engine.
//!
//! This crate maintains, per isolation [`Domain`], a multi-level I/O page
//! table mapping device-visible addresses to physical memory, and keeps one
//! or more hardware translation units ([`IommuUnit`]) in sync with it
//! through the unit's register-level command/flush protocol.
//!
//! The surrounding driver discovers units and device routing from firmware
//! tables and hands both to an [`IommuRegistry`] at initialization; this
//! crate neither parses firmware tables nor enumerates PCI buses. Register
//! windows are reached through the [`RegisterIo`] boundary, and page-table
//! frames come from the host's page-aligned allocator.
//!
//! A typical passthrough setup:
//!
//! ```
//! use aster_iommu::{Domain, IommuRegistry, PciDeviceLocation};
//!
//! # struct NullRegs;
//! # impl aster_iommu::RegisterIo for NullRegs {
//! #     fn read(&self, _offset: usize) -> u32 { 0 }
//! #     fn write(&self, _offset: usize, _value: u32) {}
//! # }
//! # let mut registry = IommuRegistry::new();
//! # let unit = registry.register_unit(aster_iommu::IommuUnit::new(
//! #     0, 0x3c0f, Box::new(NullRegs)));
//! # registry.add_route(PciDeviceLocation::new(0, 0, 1, 0), &unit);
//! let domain = Domain::new();
//! domain.map(0x1000_0000, 0x2000_0000, aster_iommu::PAGE_SIZE)?;
//!
//! let dev = registry.probe_device(PciDeviceLocation::new(0, 0, 1, 0));
//! domain.attach_device(&dev)?;
//! // ... DMA runs translated ...
//! domain.detach_device(&dev);
//! domain.close();
//! # Ok::<(), aster_iommu::Error>(())
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod device;
mod domain;
mod error;
mod frame;
mod id_alloc;
mod page_table;
mod pci;
mod registers;
mod registry;
mod unit;

#[cfg(test)]
mod test_util;

pub use device::Device;
pub use domain::Domain;
pub use error::{Error, Result};
pub use frame::{PAGE_SHIFT, PAGE_SIZE};
pub use id_alloc::IdAlloc;
pub use page_table::{PageTable, PteFlags, HUGE_PAGE_SIZE, IOVA_WIDTH, LEVEL_MAX, MAX_IOVA};
pub use pci::PciDeviceLocation;
pub use registers::{RegisterIo, LOOP_TIMEOUT};
pub use registry::IommuRegistry;
pub use unit::{IommuUnit, MAX_ATTACHED_DEV_ID, MAX_DOMAIN_ID};

/// A physical memory address.
pub type Paddr = usize;
/// A device-visible I/O virtual address.
pub type Iova = usize;

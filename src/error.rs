// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A hardware ID bitmap (domain IDs or device-table slots) is saturated.
    ResourceExhausted,
    /// The busy bit of a translation unit did not clear within the poll bound.
    HardwareTimeout,
    /// A map request was not fully satisfied, e.g. a page-table page could
    /// not be allocated midway through the walk. Pages mapped before the
    /// failure are left in place.
    PartialMapping,
    /// An address or length argument is not page-aligned, or lies outside
    /// the translatable IOVA range.
    InvalidArgs,
    /// The domain handle was used after `Domain::close`.
    InvalidDomain,
    /// The device handle was used after it was released.
    InvalidDevice,
}

/// A specialized [`Result`] type for this crate.
pub type Result<T> = core::result::Result<T, Error>;

// SPDX-License-Identifier: MPL-2.0

//! An in-memory register window for tests.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::registers::{RegisterIo, PGTABLE_BUSY, REG_VBTC};

const FLUSH_KICK: u32 = 1 << 2;

/// Emulates the register window of one unit: plain 32-bit storage, plus a
/// busy bit that stays set for a few polls after every flush command (or
/// forever, for timeout tests).
pub(crate) struct FakeRegs {
    mem: Mutex<BTreeMap<usize, u32>>,
    busy_left: AtomicU32,
    latency: u32,
    stuck: AtomicBool,
    flushes: AtomicU32,
}

impl FakeRegs {
    pub(crate) fn new() -> Self {
        Self {
            mem: Mutex::new(BTreeMap::new()),
            busy_left: AtomicU32::new(0),
            latency: 3,
            stuck: AtomicBool::new(false),
            flushes: AtomicU32::new(0),
        }
    }

    /// A unit whose busy bit never clears.
    pub(crate) fn stuck() -> Self {
        let regs = Self::new();
        regs.set_stuck();
        regs
    }

    /// Makes every flush from now on hang the busy bit.
    pub(crate) fn set_stuck(&self) {
        self.stuck.store(true, Ordering::SeqCst);
    }

    /// The stored value of the register at `offset`.
    pub(crate) fn reg(&self, offset: usize) -> u32 {
        self.mem.lock().get(&offset).copied().unwrap_or(0)
    }

    /// The number of flush commands the unit has seen.
    pub(crate) fn flush_count(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl RegisterIo for Arc<FakeRegs> {
    fn read(&self, offset: usize) -> u32 {
        let value = self.reg(offset);
        if offset == REG_VBTC {
            let left = self.busy_left.load(Ordering::SeqCst);
            if left > 0 {
                if !self.stuck.load(Ordering::SeqCst) {
                    self.busy_left.store(left - 1, Ordering::SeqCst);
                }
                return value | PGTABLE_BUSY;
            }
        }
        value
    }

    fn write(&self, offset: usize, value: u32) {
        if offset == REG_VBTC && value & FLUSH_KICK != 0 {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            let polls = if self.stuck.load(Ordering::SeqCst) {
                u32::MAX
            } else {
                self.latency
            };
            self.busy_left.store(polls, Ordering::SeqCst);
        }
        self.mem.lock().insert(offset, value);
    }

    fn delay(&self) {}
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Scoped device-buffer accounting.
//!
//! Every buffer a stage creates carries a [`Lease`] from the context's
//! [`BufferLedger`]. The lease is returned when the owning buffer drops, so a
//! stage that exits early through `?` still releases everything it acquired.
//! Stages never hold buffers across a boundary; the ledger lets callers check
//! that `live_buffers() == 0` between stages.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// How a stage uses a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Kernel input, read-only on the device.
    ReadOnly,
    /// Kernel output, written by the device.
    WriteOnly,
    /// Per-group scratch for reductions (`group_size * 4` bytes).
    Scratch,
    /// Uniform parameter block.
    Uniform,
    /// Host-mappable copy target for read-back.
    Staging,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadOnly => "read-only",
            Self::WriteOnly => "write-only",
            Self::Scratch => "scratch",
            Self::Uniform => "uniform",
            Self::Staging => "staging",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    live_bytes: AtomicU64,
    peak: AtomicUsize,
    total: AtomicUsize,
    total_bytes: AtomicU64,
}

/// Shared count of live and historical buffer allocations.
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    counters: Arc<Counters>,
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub live: usize,
    pub live_bytes: u64,
    pub peak: usize,
    pub total: usize,
    pub total_bytes: u64,
}

impl BufferLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation; the returned lease releases it on drop.
    #[must_use]
    pub fn acquire(&self, role: BufferRole, bytes: u64) -> Lease {
        let c = &self.counters;
        let live = c.live.fetch_add(1, Ordering::AcqRel) + 1;
        c.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        c.total.fetch_add(1, Ordering::AcqRel);
        c.total_bytes.fetch_add(bytes, Ordering::AcqRel);
        c.peak.fetch_max(live, Ordering::AcqRel);
        tracing::trace!(%role, bytes, live, "buffer acquired");
        Lease {
            counters: Arc::clone(&self.counters),
            role,
            bytes,
        }
    }

    /// Buffers currently held by a stage.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let c = &self.counters;
        LedgerSnapshot {
            live: c.live.load(Ordering::Acquire),
            live_bytes: c.live_bytes.load(Ordering::Acquire),
            peak: c.peak.load(Ordering::Acquire),
            total: c.total.load(Ordering::Acquire),
            total_bytes: c.total_bytes.load(Ordering::Acquire),
        }
    }
}

/// Proof of one live allocation. Dropping it releases the allocation.
#[derive(Debug)]
#[must_use = "dropping a lease releases the buffer immediately"]
pub struct Lease {
    counters: Arc<Counters>,
    role: BufferRole,
    bytes: u64,
}

impl Lease {
    #[must_use]
    pub const fn role(&self) -> BufferRole {
        self.role
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
        self.counters
            .live_bytes
            .fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Byte size of `count` f32 elements.
#[must_use]
pub const fn f32_bytes(count: usize) -> u64 {
    (count * std::mem::size_of::<f32>()) as u64
}

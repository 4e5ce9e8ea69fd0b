pub mod context;
pub mod device;
pub mod export;
pub mod pack;
pub mod page_pool;
pub mod registry;
pub mod userptr;
pub mod va_range;

use crate::error::VmResult;
use std::fmt;

/// The virtual address spaces of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VaRangeKind {
    /// Host memory mapped with regular pages.
    Host,
    /// Host memory mapped with huge pages.
    HostHuge,
    /// Device DRAM.
    Dram,
}

impl VaRangeKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::HostHuge => "host huge",
            Self::Dram => "dram",
        }
    }
}

impl fmt::Display for VaRangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Strategy for carving blocks out of one virtual address space.
pub trait VaAllocator {
    /// Reserve a block and return its start address.
    ///
    /// # Errors
    /// Fails when no free block satisfies the request.
    fn reserve(&mut self, req: VaRequest) -> VmResult<u64>;

    /// Return the inclusive block `[start, end]` to the free list.
    ///
    /// # Errors
    /// Fails when the block overlaps memory that is already free.
    fn release(&mut self, start: u64, end: u64) -> VmResult<()>;

    /// First and last (inclusive) usable address.
    fn bounds(&self) -> (u64, u64);
}

pub use context::{Context, MapSource};
pub use device::Device;
pub use export::{DmaBuf, DmaSegment, build_segments};
pub use pack::PhysPagePack;
pub use page_pool::{PagePool, PoolLease};
pub use registry::{AllocationRegistry, Handle};
pub use userptr::UserPtr;
pub use va_range::{VaBlock, VaRange, VaRequest};

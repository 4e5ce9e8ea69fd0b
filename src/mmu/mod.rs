pub mod soft;

use thiserror::Error;

pub use soft::SoftMmu;

/// Which kind of memory a cache operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Pinned host memory mapped through the host MMU.
    Host,
    /// Device DRAM mapped through the device MMU.
    Device,
}

/// Scope of a translation-cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidate {
    Range { start: u64, size: u64 },
    All,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmuError {
    #[error("no page table for ASID {0}")]
    NoContext(u32),

    #[error("virtual address {0:#x} is already mapped")]
    AlreadyMapped(u64),

    #[error("virtual address {0:#x} is not mapped")]
    NotMapped(u64),

    #[error("unsupported page size {0:#x}")]
    PageSize(u64),

    #[error("MMU operation timed out")]
    Timeout,

    #[error("MMU hardware failure: {0}")]
    Device(String),
}

/// Page-table operations supplied by the MMU implementation.
///
/// Calls for one context are serialized by the caller (the device MMU lock),
/// so implementations only need to be `Send + Sync` to be shared.
pub trait PageTableOps: Send + Sync {
    /// Map one page. `is_last` marks the final page of a batch so TLB and
    /// cache work can be flushed once.
    fn map_page(
        &self,
        asid: u32,
        vaddr: u64,
        paddr: u64,
        page_size: u64,
        is_last: bool,
    ) -> Result<(), MmuError>;

    /// Unmap one page.
    fn unmap_page(&self, asid: u32, vaddr: u64, page_size: u64, is_last: bool)
    -> Result<(), MmuError>;

    /// Invalidate translation caches for a range or for everything.
    fn invalidate_cache(&self, asid: u32, scope: Invalidate, kind: MemoryKind)
    -> Result<(), MmuError>;

    /// Warm the translation cache for a freshly mapped range.
    fn prefetch(
        &self,
        _asid: u32,
        _vaddr: u64,
        _size: u64,
        _kind: MemoryKind,
    ) -> Result<(), MmuError> {
        Ok(())
    }

    /// Called when a context with this ASID is created.
    fn ctx_init(&self, _asid: u32) -> Result<(), MmuError> {
        Ok(())
    }

    /// Called once the context with this ASID has been torn down.
    fn ctx_fini(&self, _asid: u32) {}
}

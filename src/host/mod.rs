pub mod mlock;

use std::io;
use thiserror::Error;

pub use mlock::MlockHostMemory;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("DMA mapping failed: {0}")]
    DmaMap(String),

    #[error("Host Error: {0}")]
    General(String),
}

/// One scatter/gather element: a physically contiguous run of host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Physical address of the first byte.
    pub phys_addr: u64,
    /// Bus address of the first byte, valid once the list is DMA-mapped.
    pub dma_addr: u64,
    pub length: u64,
}

/// Host-side primitives used by the pinner.
pub trait HostMemory: Send + Sync {
    /// Base host page size.
    fn page_size(&self) -> u64;

    /// Pin `npages` pages starting at the page-aligned address `start` and
    /// return their physical addresses in order.
    ///
    /// May pin fewer pages than requested; the caller unpins the short result.
    ///
    /// # Errors
    /// Returns an error if nothing could be pinned.
    fn pin_pages(&self, start: u64, npages: u64) -> Result<Vec<u64>, HostError>;

    /// Release pages returned by [`HostMemory::pin_pages`].
    fn unpin_pages(&self, pages: &[u64]);

    /// Fill in `dma_addr` for every entry.
    ///
    /// # Errors
    /// Returns an error if any entry cannot be mapped; no entry stays mapped.
    fn dma_map(&self, sg: &mut [SgEntry]) -> Result<(), HostError>;

    /// Undo [`HostMemory::dma_map`].
    fn dma_unmap(&self, sg: &[SgEntry]);
}

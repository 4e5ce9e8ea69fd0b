use crate::error::{VmError, VmResult};
use crate::host::{HostMemory, SgEntry};
use crate::utils::{align_down, checked_align_up};
use log::{debug, error};
use std::sync::Arc;

/// A pinned, DMA-mapped range of host memory.
///
/// The pages stay pinned until the value is dropped.
pub struct UserPtr {
    host: Arc<dyn HostMemory>,
    addr: u64,
    size: u64,
    pages: Vec<u64>,
    sg: Vec<SgEntry>,
    dma_mapped: bool,
    pid: u32,
}

impl std::fmt::Debug for UserPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserPtr")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &format_args!("{:#x}", self.size))
            .field("npages", &self.pages.len())
            .field("sg", &self.sg)
            .field("dma_mapped", &self.dma_mapped)
            .field("pid", &self.pid)
            .finish()
    }
}

impl UserPtr {
    /// Pin `[addr, addr + size)` and DMA-map it.
    ///
    /// # Errors
    /// * `InvalidRange` for an empty or overflowing range.
    /// * `PinFailed` if the host pinned fewer pages than needed.
    /// * `Host` if pinning or DMA mapping failed outright.
    pub fn pin(host: &Arc<dyn HostMemory>, addr: u64, size: u64) -> VmResult<Self> {
        let page_size = host.page_size();
        let invalid = || VmError::InvalidRange { addr, size };

        if size == 0 {
            error!("size to pin is invalid - {size}");
            return Err(invalid());
        }
        let end = addr.checked_add(size).ok_or_else(invalid)?;
        let start_page = align_down(addr, page_size);
        let end_page = checked_align_up(end, page_size).ok_or_else(invalid)?;
        let npages = (end_page - start_page) / page_size;

        let pages = host.pin_pages(start_page, npages)?;
        if pages.len() as u64 != npages {
            error!(
                "Failed to pin host memory, user ptr {addr:#x}, size {size:#x}, npages {npages}, pinned {}",
                pages.len()
            );
            host.unpin_pages(&pages);
            return Err(VmError::PinFailed {
                addr,
                requested: npages,
                pinned: pages.len() as u64,
            });
        }

        let mut sg = build_sg(&pages, page_size, addr, end);
        if let Err(e) = host.dma_map(&mut sg) {
            error!("failed to map sgt with DMA region");
            host.unpin_pages(&pages);
            return Err(e.into());
        }

        debug!(
            "pinned {npages} pages at {addr:#x} as {} sg entries",
            sg.len()
        );

        Ok(Self {
            host: Arc::clone(host),
            addr,
            size,
            pages,
            sg,
            dma_mapped: true,
            pid: std::process::id(),
        })
    }

    /// Unmap and unpin.
    pub fn unpin(self) {
        drop(self);
    }

    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn sg(&self) -> &[SgEntry] {
        &self.sg
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Host page size the range was pinned with.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.host.page_size()
    }
}

impl Drop for UserPtr {
    fn drop(&mut self) {
        if self.dma_mapped {
            self.host.dma_unmap(&self.sg);
            self.dma_mapped = false;
        }
        self.host.unpin_pages(&self.pages);
    }
}

/// Merge physically contiguous pages into sg entries covering exactly
/// `[addr, end)`.
fn build_sg(pages: &[u64], page_size: u64, addr: u64, end: u64) -> Vec<SgEntry> {
    let first_vpage = align_down(addr, page_size);
    let mut sg: Vec<SgEntry> = Vec::new();

    for (i, &page) in pages.iter().enumerate() {
        let vpage = first_vpage + i as u64 * page_size;
        let chunk_start = vpage.max(addr);
        let chunk_end = (vpage + page_size).min(end);
        let phys = page + (chunk_start - vpage);
        let len = chunk_end - chunk_start;

        match sg.last_mut() {
            Some(last) if last.phys_addr + last.length == phys => last.length += len,
            _ => sg.push(SgEntry {
                phys_addr: phys,
                dma_addr: 0,
                length: len,
            }),
        }
    }

    sg
}

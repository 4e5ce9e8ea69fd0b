#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use super::{HostError, HostMemory, SgEntry};
use std::io;

/// Pins host memory with `mlock(2)` in an identity-mapped IOMMU domain.
///
/// The process virtual address of every page is reported as both its physical
/// and its bus address, which is what a device behind a passthrough IOMMU
/// domain observes.
#[derive(Debug, Clone, Copy)]
pub struct MlockHostMemory {
    page_size: u64,
}

impl MlockHostMemory {
    /// Queries the system page size.
    ///
    /// # Errors
    /// Returns an error if `sysconf(_SC_PAGESIZE)` fails.
    pub fn new() -> io::Result<Self> {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            page_size: ret as u64,
        })
    }

    fn munlock_run(start: u64, len: u64) {
        // SAFETY: munlock only changes residency attributes of the range.
        let ret = unsafe { libc::munlock(start as *const libc::c_void, len as libc::size_t) };
        if ret != 0 {
            log::warn!(
                "munlock({start:#x}, {len:#x}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl HostMemory for MlockHostMemory {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn pin_pages(&self, start: u64, npages: u64) -> Result<Vec<u64>, HostError> {
        let len = npages
            .checked_mul(self.page_size)
            .ok_or_else(|| HostError::General(format!("{npages} pages overflow")))?;

        // SAFETY: mlock validates the range itself and fails with ENOMEM for
        // addresses that are not mapped in this process.
        let ret = unsafe { libc::mlock(start as *const libc::c_void, len as libc::size_t) };
        if ret != 0 {
            return Err(HostError::Io(io::Error::last_os_error()));
        }

        Ok((0..npages).map(|i| start + i * self.page_size).collect())
    }

    fn unpin_pages(&self, pages: &[u64]) {
        // Unlock contiguous runs with one call each.
        let mut iter = pages.iter().copied();
        let Some(mut run_start) = iter.next() else {
            return;
        };
        let mut run_len = self.page_size;

        for page in iter {
            if page == run_start + run_len {
                run_len += self.page_size;
            } else {
                Self::munlock_run(run_start, run_len);
                run_start = page;
                run_len = self.page_size;
            }
        }
        Self::munlock_run(run_start, run_len);
    }

    fn dma_map(&self, sg: &mut [SgEntry]) -> Result<(), HostError> {
        for entry in sg {
            entry.dma_addr = entry.phys_addr;
        }
        Ok(())
    }

    fn dma_unmap(&self, _sg: &[SgEntry]) {}
}

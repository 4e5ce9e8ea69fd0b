use crate::error::{VmError, VmResult};
use crate::utils::{checked_align_up, is_power_of_two, round_up_to_multiple};
use log::{debug, error};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct PagePool {
    base: u64,
    size: u64,
    granularity: u64,
    /// Free extents, start -> length. Never adjacent.
    free: Mutex<BTreeMap<u64, u64>>,
    allocated: AtomicU64,
}

impl PagePool {
    /// Creates a pool over `[base, base + size)`.
    ///
    /// # Errors
    /// Returns `VmError::Config` if the granularity is not a power of two or
    /// the pool cannot hold a single granule.
    pub fn new(base: u64, size: u64, granularity: u64) -> VmResult<Arc<Self>> {
        if !is_power_of_two(granularity) {
            return Err(VmError::Config(format!(
                "pool granularity {granularity:#x} is not a power of 2"
            )));
        }
        let size = size - size % granularity;
        if size == 0 || base.checked_add(size).is_none() {
            return Err(VmError::Config(format!(
                "DRAM pool at {base:#x} cannot hold a {granularity:#x} page"
            )));
        }

        debug!("DRAM pool {base:#x}-{:#x}, granularity {granularity:#x}", base + size);

        let mut free = BTreeMap::new();
        free.insert(base, size);
        Ok(Arc::new(Self {
            base,
            size,
            granularity,
            free: Mutex::new(free),
            allocated: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// An empty lease drawing from this pool.
    #[must_use]
    pub fn lease(self: &Arc<Self>) -> PoolLease {
        PoolLease {
            pool: Arc::clone(self),
            extents: Vec::new(),
        }
    }

    /// First-fit allocation of `size` bytes aligned to `align`.
    fn alloc_extent(&self, size: u64, align: u64) -> VmResult<(u64, u64)> {
        let size = round_up_to_multiple(size, self.granularity);
        let align = align.max(self.granularity);
        let mut free = self.lock();

        let found = free.iter().find_map(|(&start, &len)| {
            let addr = checked_align_up(start, align)?;
            let fits = (addr - start)
                .checked_add(size)
                .is_some_and(|needed| needed <= len);
            fits.then_some((start, len, addr))
        });

        let Some((start, len, addr)) = found else {
            return Err(VmError::OutOfMemory { size });
        };

        free.remove(&start);
        if addr > start {
            free.insert(start, addr - start);
        }
        let tail = start + len - (addr + size);
        if tail > 0 {
            free.insert(addr + size, tail);
        }
        drop(free);

        self.allocated.fetch_add(size, Ordering::Relaxed);
        Ok((addr, size))
    }

    fn free_extent(&self, addr: u64, size: u64) -> VmResult<()> {
        let inside = addr >= self.base
            && addr
                .checked_add(size)
                .is_some_and(|end| end <= self.base + self.size);
        if !inside || size == 0 {
            return Err(VmError::InternalConsistency(format!(
                "extent {addr:#x}+{size:#x} does not belong to the DRAM pool"
            )));
        }

        let mut free = self.lock();
        let end = addr + size;

        if let Some((&start, &len)) = free.range(..end).next_back()
            && start + len > addr
        {
            return Err(VmError::InternalConsistency(format!(
                "double free of DRAM {addr:#x}+{size:#x}, overlaps free {start:#x}+{len:#x}"
            )));
        }

        let mut merged_start = addr;
        let mut merged_len = size;
        if let Some((&prev, &prev_len)) = free.range(..addr).next_back()
            && prev + prev_len == addr
        {
            free.remove(&prev);
            merged_start = prev;
            merged_len += prev_len;
        }
        if let Some(next_len) = free.remove(&end) {
            merged_len += next_len;
        }
        free.insert(merged_start, merged_len);
        drop(free);

        self.allocated.fetch_sub(size, Ordering::Relaxed);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, u64>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        debug!(
            "DRAM pool {:#x}-{:#x} released",
            self.base,
            self.base + self.size
        );
    }
}

/// Extents held on behalf of one physical allocation.
///
/// Dropping the lease returns every extent it holds, so an allocation that
/// fails halfway unwinds by dropping it.
#[derive(Debug)]
pub struct PoolLease {
    pool: Arc<PagePool>,
    extents: Vec<(u64, u64)>,
}

impl PoolLease {
    /// Allocate `size` bytes (rounded to the pool granularity).
    ///
    /// # Errors
    /// `OutOfMemory` when no free extent is large enough.
    pub fn alloc(&mut self, size: u64) -> VmResult<u64> {
        self.alloc_aligned(size, 0)
    }

    /// Allocate `size` bytes starting at a multiple of `align`.
    ///
    /// # Errors
    /// `OutOfMemory` when no suitably aligned free extent is large enough.
    pub fn alloc_aligned(&mut self, size: u64, align: u64) -> VmResult<u64> {
        let (addr, len) = self.pool.alloc_extent(size, align)?;
        self.extents.push((addr, len));
        Ok(addr)
    }

    /// Total bytes held.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.extents.iter().map(|&(_, len)| len).sum()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        for (addr, len) in self.extents.drain(..) {
            if let Err(e) = self.pool.free_extent(addr, len) {
                error!("{e}");
            }
        }
    }
}

use super::context::Context;
use super::pack::PhysPagePack;
use super::page_pool::PagePool;
use super::registry::{AllocationRegistry, Handle};
use crate::config::{DRAM_POOL_PAGE_SIZE, DeviceProperties, MemFlags};
use crate::error::{VmError, VmResult};
use crate::host::{HostMemory, MlockHostMemory};
use crate::mmu::PageTableOps;
use crate::utils::is_power_of_two;
use log::{debug, error, info};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Device-wide memory state shared by all contexts.
pub struct Device {
    props: DeviceProperties,
    pool: Arc<PagePool>,
    registry: AllocationRegistry,
    mmu: Arc<dyn PageTableOps>,
    host: Arc<dyn HostMemory>,
    /// Serializes page-table updates and cache invalidations.
    mmu_lock: Mutex<()>,
    next_asid: AtomicU32,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("props", &self.props)
            .field("pool", &self.pool)
            .field("dram_used", &self.dram_used())
            .field("live_handles", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// # Errors
    /// Returns `VmError::Config` if the properties are inconsistent.
    pub fn new(
        props: DeviceProperties,
        mmu: Arc<dyn PageTableOps>,
        host: Arc<dyn HostMemory>,
    ) -> VmResult<Arc<Self>> {
        props.validate()?;

        let dram_page_size = props.dram_page_size();
        let granularity = if is_power_of_two(dram_page_size) {
            dram_page_size
        } else {
            DRAM_POOL_PAGE_SIZE
        };
        let pool = PagePool::new(
            props.dram_user_base_address,
            props.dram_end_address - props.dram_user_base_address,
            granularity,
        )?;

        info!(
            "device memory manager: {:#x} bytes of user DRAM at {:#x}, page size {dram_page_size:#x}",
            pool.size(),
            pool.base()
        );

        Ok(Arc::new(Self {
            props,
            pool,
            registry: AllocationRegistry::new(),
            mmu,
            host,
            mmu_lock: Mutex::new(()),
            next_asid: AtomicU32::new(1),
        }))
    }

    /// A device pinning host memory with `mlock(2)`.
    ///
    /// # Errors
    /// Fails if the host page size cannot be queried or the properties are
    /// inconsistent.
    pub fn with_mlock_host(
        props: DeviceProperties,
        mmu: Arc<dyn PageTableOps>,
    ) -> VmResult<Arc<Self>> {
        let host = MlockHostMemory::new().map_err(crate::host::HostError::from)?;
        Self::new(props, mmu, Arc::new(host))
    }

    /// Open a new context with a fresh ASID.
    ///
    /// # Errors
    /// Fails if a virtual range is too small or the MMU rejects the ASID.
    pub fn create_context(self: &Arc<Self>) -> VmResult<Context> {
        let asid = self.next_asid.fetch_add(1, Ordering::Relaxed);
        Context::new(Arc::clone(self), asid)
    }

    #[must_use]
    pub const fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    /// DRAM bytes held by live allocations of all contexts.
    ///
    /// Pages of a freed shared allocation count until the last mapping of
    /// them is gone.
    #[must_use]
    pub fn dram_used(&self) -> u64 {
        self.pool.allocated()
    }

    /// Number of allocations that have not been freed.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.registry.len()
    }

    /// The physical pages behind a live handle.
    ///
    /// # Errors
    /// `InvalidHandle` if the handle was freed or never existed.
    pub fn allocation(&self, handle: Handle) -> VmResult<Arc<PhysPagePack>> {
        self.registry.lookup(handle)
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub(crate) const fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    pub(crate) fn mmu(&self) -> &dyn PageTableOps {
        self.mmu.as_ref()
    }

    pub(crate) const fn host(&self) -> &Arc<dyn HostMemory> {
        &self.host
    }

    pub(crate) fn lock_mmu(&self) -> MutexGuard<'_, ()> {
        self.mmu_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc_page_size(&self, hint: u64) -> VmResult<u64> {
        let page_size = if self.props.supports_user_set_page_size && hint != 0 {
            if !is_power_of_two(hint) {
                error!("user page size {hint:#x} is not a power of 2");
                return Err(VmError::InvalidArgument(format!(
                    "page size {hint:#x} is not a power of 2"
                )));
            }
            hint
        } else {
            self.props.device_mem_alloc_default_page_size
        };

        if page_size % self.pool.granularity() != 0 {
            return Err(VmError::InvalidArgument(format!(
                "page size {page_size:#x} is not a multiple of the DRAM granularity {:#x}",
                self.pool.granularity()
            )));
        }
        Ok(page_size)
    }

    /// Allocate DRAM for `asid` and register it.
    pub(crate) fn alloc_device_memory(
        &self,
        asid: u32,
        size: u64,
        page_size_hint: u64,
        flags: MemFlags,
    ) -> VmResult<(Handle, u64)> {
        let page_size = self.alloc_page_size(page_size_hint)?;
        let num_pgs = size.div_ceil(page_size);
        let total_size = num_pgs
            .checked_mul(page_size)
            .ok_or_else(|| VmError::InvalidArgument(format!("size {size:#x} overflows")))?;

        if total_size == 0 {
            error!("Cannot allocate 0 bytes");
            return Err(VmError::InvalidArgument("cannot allocate 0 bytes".into()));
        }

        let mut lease = self.pool.lease();
        let capacity = num_pgs.min(self.pool.size() / page_size);
        let mut pages = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0));
        let pow2 = is_power_of_two(page_size);

        if flags.contiguous {
            let paddr = if pow2 {
                lease.alloc_aligned(total_size, page_size)
            } else {
                lease.alloc(total_size)
            }
            .inspect_err(|_| error!("Failed to allocate {size:#x} contiguous bytes of DRAM"))?;
            pages.extend((0..num_pgs).map(|i| paddr + i * page_size));
        } else {
            for _ in 0..num_pgs {
                // `lease` returns what was taken so far if this fails.
                let paddr = if pow2 {
                    lease.alloc_aligned(page_size, page_size)
                } else {
                    lease.alloc(page_size)
                }
                .inspect_err(|_| error!("Failed to allocate DRAM page of size {page_size:#x}"))?;
                pages.push(paddr);
            }
        }

        let pack = PhysPagePack::from_device(
            asid,
            pages,
            page_size,
            flags.contiguous,
            flags.shared,
            lease,
        );
        let handle = self.registry.insert(pack);

        debug!(
            "allocated {total_size:#x} bytes of DRAM for asid {asid}, handle {handle}, {num_pgs} pages of {page_size:#x}"
        );

        Ok((handle, total_size))
    }

    /// Free an unmapped allocation owned by `asid`. Returns its size.
    pub(crate) fn free_device_memory(&self, asid: u32, handle: Handle) -> VmResult<u64> {
        let pack = self.registry.remove(handle, asid).inspect_err(|e| {
            error!("free device memory failed for handle {handle}: {e}");
        })?;
        let size = pack.total_size();
        debug!("freed handle {handle} of asid {asid}, {size:#x} bytes");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SZ_2M, SZ_8M};
    use crate::host::HostMemory;
    use crate::mmu::SoftMmu;
    use crate::vm::userptr::tests::FakeHost;

    fn identity(vpn: u64) -> u64 {
        vpn * 0x1000
    }

    fn device(props: DeviceProperties) -> Arc<Device> {
        let host: Arc<dyn HostMemory> = Arc::new(FakeHost::new(0x1000, identity));
        Device::new(props, Arc::new(SoftMmu::new()), host).unwrap()
    }

    fn small_dram() -> DeviceProperties {
        DeviceProperties::new().with_dram(0x1000_0000, 0x1000_0000, 0x1000_0000 + 16 * SZ_2M)
    }

    #[test]
    fn contiguous_allocation_is_one_run() {
        let dev = device(small_dram());
        let (handle, size) = dev
            .alloc_device_memory(1, 3 * SZ_2M - 1, 0, MemFlags::new().contiguous())
            .unwrap();
        assert_eq!(size, 3 * SZ_2M);

        let pack = dev.registry().lookup(handle).unwrap();
        assert!(pack.is_contiguous());
        let pages = pack.pages();
        assert!(pages.windows(2).all(|w| w[1] == w[0] + SZ_2M));
        assert_eq!(dev.dram_used(), 3 * SZ_2M);
    }

    #[test]
    fn failed_allocation_returns_every_page() {
        let dev = device(small_dram());
        let err = dev
            .alloc_device_memory(1, 17 * SZ_2M, 0, MemFlags::new())
            .unwrap_err();
        assert!(matches!(err, VmError::OutOfMemory { .. }));
        assert_eq!(dev.pool().allocated(), 0);
        assert_eq!(dev.dram_used(), 0);
        assert_eq!(dev.live_handles(), 0);
    }

    #[test]
    fn free_returns_pages_and_accounting() {
        let dev = device(small_dram());
        let (handle, size) = dev.alloc_device_memory(1, SZ_2M, 0, MemFlags::new()).unwrap();

        assert!(matches!(
            dev.free_device_memory(2, handle),
            Err(VmError::PermissionDenied { .. })
        ));
        assert_eq!(dev.free_device_memory(1, handle).unwrap(), size);
        assert_eq!(dev.dram_used(), 0);
        assert_eq!(dev.pool().allocated(), 0);
        assert!(matches!(
            dev.free_device_memory(1, handle),
            Err(VmError::InvalidHandle(_))
        ));
    }

    #[test]
    fn zero_size_is_rejected() {
        let dev = device(small_dram());
        assert!(matches!(
            dev.alloc_device_memory(1, 0, 0, MemFlags::new()),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn user_page_size_must_be_power_of_two() {
        let dev = device(small_dram().with_user_page_size());
        assert!(matches!(
            dev.alloc_device_memory(1, SZ_8M, 0x30_0000, MemFlags::new()),
            Err(VmError::InvalidArgument(_))
        ));

        let (handle, _) = dev.alloc_device_memory(1, SZ_8M, 2 * SZ_2M, MemFlags::new()).unwrap();
        let pack = dev.registry().lookup(handle).unwrap();
        assert_eq!(pack.page_size(), 2 * SZ_2M);
        assert!(pack.pages().iter().all(|p| p % (2 * SZ_2M) == 0));
    }

    #[test]
    fn non_power_of_two_dram_pages_come_from_8m_units() {
        let page = 3 * SZ_8M;
        let props = DeviceProperties::new()
            .with_dram(0x1000_0000, 0x1000_0000, 0x1000_0000 + 8 * page)
            .with_dram_page_size(page);
        let dev = device(props);
        assert_eq!(dev.pool().granularity(), SZ_8M);

        let (handle, size) = dev.alloc_device_memory(1, page + 1, 0, MemFlags::new()).unwrap();
        assert_eq!(size, 2 * page);
        assert_eq!(dev.registry().lookup(handle).unwrap().npages(), 2);
    }
}

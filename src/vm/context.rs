use super::device::Device;
use super::export::{DmaBuf, check_pages_in_bar};
use super::pack::PhysPagePack;
use super::registry::Handle;
use super::userptr::UserPtr;
use super::va_range::{VaRange, VaRequest};
use super::VaRangeKind;
use crate::config::{DMA_GRANULE, MemFlags};
use crate::error::{VmError, VmResult};
use crate::mmu::{Invalidate, MemoryKind};
use crate::utils::is_aligned;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pages unmapped between two voluntary yields.
const UNMAP_YIELD_INTERVAL: usize = 0x8000;

/// What to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSource {
    /// A device allocation.
    Device(Handle),
    /// A range of this process's memory.
    Host { addr: u64, size: u64 },
}

enum Backing {
    Device(Arc<PhysPagePack>),
    Host {
        pack: PhysPagePack,
        userptr: UserPtr,
    },
}

impl Backing {
    fn pack(&self) -> &PhysPagePack {
        match self {
            Self::Device(pack) => pack,
            Self::Host { pack, .. } => pack,
        }
    }

    const fn memory_kind(&self) -> MemoryKind {
        match self {
            Self::Device(_) => MemoryKind::Device,
            Self::Host { .. } => MemoryKind::Host,
        }
    }
}

struct MappingEntry {
    backing: Backing,
    /// Start of the reserved block; the user address adds the pack offset.
    block_start: u64,
    range: VaRangeKind,
    export_count: u32,
}

pub(crate) struct ContextInner {
    asid: u32,
    device: Arc<Device>,
    host_range: Arc<VaRange>,
    /// Same `Arc` as `host_range` when the device has no huge page range.
    host_huge_range: Arc<VaRange>,
    dram_range: Arc<VaRange>,
    mem_hash: Mutex<HashMap<u64, MappingEntry>>,
    /// Raw blocks from `reserve_va`: start -> (range, reserved size).
    reservations: Mutex<HashMap<u64, (VaRangeKind, u64)>>,
    dram_phys_mem: AtomicU64,
}

/// A process address-space context on the device.
///
/// Dropping the last handle to a context tears it down: every remaining
/// mapping is removed and every allocation it owns is freed.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("asid", &self.inner.asid)
            .field("dram_usage", &self.dram_usage())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(device: Arc<Device>, asid: u32) -> VmResult<Self> {
        let props = device.properties();
        let hints = |r| if props.hints_range_reservation { r } else { None };

        let host_range = Arc::new(VaRange::new(
            VaRangeKind::Host,
            props.pmmu.start_addr,
            props.pmmu.end_addr - 1,
            props.pmmu.page_size,
            hints(props.hints_host_reserved),
        )?);

        let host_huge_range = match props.pmmu_huge {
            Some(huge) if huge != props.pmmu => Arc::new(VaRange::new(
                VaRangeKind::HostHuge,
                huge.start_addr,
                huge.end_addr - 1,
                huge.page_size,
                hints(props.hints_host_huge_reserved),
            )?),
            _ => Arc::clone(&host_range),
        };

        let dram_range = Arc::new(VaRange::new(
            VaRangeKind::Dram,
            props.dmmu.start_addr,
            props.dmmu.end_addr - 1,
            props.dram_page_size(),
            hints(props.hints_dram_reserved),
        )?);

        device.mmu().ctx_init(asid).inspect_err(|e| {
            error!("failed to init MMU context for asid {asid}: {e}");
        })?;

        debug!("created context with asid {asid}");

        Ok(Self {
            inner: Arc::new(ContextInner {
                asid,
                device,
                host_range,
                host_huge_range,
                dram_range,
                mem_hash: Mutex::new(HashMap::new()),
                reservations: Mutex::new(HashMap::new()),
                dram_phys_mem: AtomicU64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn asid(&self) -> u32 {
        self.inner.asid
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    /// DRAM bytes allocated by this context and not yet freed.
    #[must_use]
    pub fn dram_usage(&self) -> u64 {
        self.inner.dram_phys_mem.load(Ordering::Relaxed)
    }

    /// Live mappings of an allocation, across all contexts.
    ///
    /// # Errors
    /// `InvalidHandle` if the handle was freed or never existed.
    pub fn mapping_count(&self, handle: Handle) -> VmResult<u32> {
        Ok(self.inner.device.allocation(handle)?.mapping_count())
    }

    /// The virtual range of the given kind.
    #[must_use]
    pub fn va_range(&self, kind: VaRangeKind) -> &VaRange {
        self.inner.range(kind)
    }

    /// Allocate device memory. `page_size_hint` is honoured only on devices
    /// that let users pick the page size; 0 selects the default.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size or bad page size, `OutOfMemory` when
    /// the DRAM pool is exhausted.
    pub fn alloc_device_memory(
        &self,
        size: u64,
        page_size_hint: u64,
        flags: MemFlags,
    ) -> VmResult<Handle> {
        let (handle, total_size) = self.inner.device.alloc_device_memory(
            self.inner.asid,
            size,
            page_size_hint,
            flags,
        )?;
        self.inner
            .dram_phys_mem
            .fetch_add(total_size, Ordering::Relaxed);
        Ok(handle)
    }

    /// # Errors
    /// `InvalidHandle`, `PermissionDenied` for another context's handle, or
    /// `StillMapped`.
    pub fn free_device_memory(&self, handle: Handle) -> VmResult<()> {
        let size = self
            .inner
            .device
            .free_device_memory(self.inner.asid, handle)?;
        self.inner.dram_phys_mem.fetch_sub(size, Ordering::Relaxed);
        Ok(())
    }

    /// Map device memory or pinned host memory and return the device virtual
    /// address. `hint` of 0 means no preference.
    ///
    /// # Errors
    /// Lookup, pinning, VA reservation and MMU failures are returned after
    /// everything done so far has been undone.
    pub fn map(&self, source: MapSource, hint: u64, flags: MemFlags) -> VmResult<u64> {
        let inner = &self.inner;
        let device = &inner.device;
        let props = device.properties();

        let (backing, range_kind, align) = match source {
            MapSource::Device(handle) => {
                let pack = device
                    .registry()
                    .lookup_for_map(handle, inner.asid)
                    .inspect_err(|e| error!("cannot map handle {handle}: {e}"))?;
                (Backing::Device(pack), VaRangeKind::Dram, props.dmmu.page_size)
            }
            MapSource::Host { addr, size } => {
                let userptr = UserPtr::pin(device.host(), addr, size)?;
                let huge_page_size = props.host_huge_page_size();
                let pack = PhysPagePack::from_userptr(
                    &userptr,
                    inner.asid,
                    userptr.page_size(),
                    huge_page_size,
                    Arc::ptr_eq(&inner.host_range, &inner.host_huge_range),
                )?;
                pack.get_mapping();

                let page_size = props.pmmu.page_size;
                let (range_kind, align) = if pack.page_size() == huge_page_size
                    && huge_page_size != page_size
                {
                    (VaRangeKind::HostHuge, huge_page_size)
                } else if is_aligned(addr, huge_page_size) {
                    // Regular pages, but keep huge alignment when the host
                    // address has it.
                    (VaRangeKind::Host, huge_page_size)
                } else {
                    (VaRangeKind::Host, page_size)
                };
                (Backing::Host { pack, userptr }, range_kind, align)
            }
        };

        let pack = backing.pack();
        let mut hint = hint;
        if hint != 0 && pack.offset() != 0 {
            if flags.force_hint {
                error!(
                    "Mapping hint address {hint:#x} cannot be respected because of page offset {:#x}",
                    pack.offset()
                );
                inner.rollback_backing(backing);
                return Err(VmError::HintUnsatisfiable { hint });
            }
            debug!(
                "Mapping hint address {hint:#x} will be ignored because of page offset {:#x}",
                pack.offset()
            );
            hint = 0;
        }

        let range = inner.range(range_kind);
        let req = VaRequest::new(pack.total_size(), align).with_hint(hint, flags.force_hint);
        let block_start = match range.reserve(req) {
            Ok(va) => va,
            Err(e) => {
                error!(
                    "no available va block for handle {:#x}: {e}",
                    pack.handle()
                );
                inner.rollback_backing(backing);
                return Err(e);
            }
        };

        let kind = backing.memory_kind();
        let mapped = {
            let _mmu = device.lock_mmu();
            inner.map_pack(block_start, pack).and_then(|()| {
                device
                    .mmu()
                    .invalidate_cache(
                        inner.asid,
                        Invalidate::Range {
                            start: block_start,
                            size: pack.total_size(),
                        },
                        kind,
                    )
                    .map_err(|e| {
                        inner.unmap_pack(block_start, pack);
                        VmError::from(e)
                    })
            })
        };

        if let Err(e) = mapped {
            error!("mapping failed for asid {}: {e}", inner.asid);
            if let Err(release_err) =
                range.release(block_start, block_start + pack.total_size() - 1)
            {
                warn!("release va block failed for vaddr {block_start:#x}: {release_err}");
            }
            inner.rollback_backing(backing);
            return Err(e);
        }

        if flags.prefetch
            && let Err(e) = device
                .mmu()
                .prefetch(inner.asid, block_start, pack.total_size(), kind)
        {
            warn!("prefetch of {block_start:#x} failed: {e}");
        }

        let vaddr = block_start + pack.offset();
        debug!(
            "mapped {:#x} bytes at {vaddr:#x} for asid {}",
            pack.total_size(),
            inner.asid
        );

        inner.lock_hash().insert(
            vaddr,
            MappingEntry {
                backing,
                block_start,
                range: range_kind,
                export_count: 0,
            },
        );

        Ok(vaddr)
    }

    /// Unmap a mapping created by [`Context::map`].
    ///
    /// # Errors
    /// `NotMapped` if `vaddr` is not a mapping, `Exported` while it is
    /// exported. Invalidation and VA release failures are reported after
    /// the mapping has been removed.
    pub fn unmap(&self, vaddr: u64) -> VmResult<()> {
        self.inner.unmap(vaddr, false)
    }

    /// Export `size` bytes at `offset` of the device mapping at `vaddr`.
    ///
    /// # Errors
    /// `InvalidArgument` for unaligned or out-of-bounds parameters, host
    /// mappings, or pages outside the PCI BAR. `NotMapped` if `vaddr` is not
    /// a mapping.
    pub fn export(&self, vaddr: u64, size: u64, offset: u64) -> VmResult<DmaBuf> {
        if size == 0
            || !is_aligned(vaddr, DMA_GRANULE)
            || !is_aligned(size, DMA_GRANULE)
            || !is_aligned(offset, DMA_GRANULE)
        {
            error!(
                "export of {vaddr:#x} needs {DMA_GRANULE:#x}-aligned address, size ({size:#x}) and offset ({offset:#x})"
            );
            return Err(VmError::InvalidArgument(format!(
                "export parameters of {vaddr:#x} must be {DMA_GRANULE:#x} aligned"
            )));
        }

        let inner = &self.inner;
        let mut hash = inner.lock_hash();
        let entry = hash.get_mut(&vaddr).ok_or(VmError::NotMapped(vaddr))?;

        let Backing::Device(pack) = &entry.backing else {
            return Err(VmError::InvalidArgument(format!(
                "host mapping at {vaddr:#x} cannot be exported"
            )));
        };

        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= pack.total_size());
        if !in_bounds {
            error!(
                "export range {offset:#x}+{size:#x} exceeds allocation size {:#x}",
                pack.total_size()
            );
            return Err(VmError::InvalidArgument(format!(
                "export range {offset:#x}+{size:#x} is outside the allocation"
            )));
        }
        check_pages_in_bar(pack, inner.device.properties())?;

        let pack = Arc::clone(pack);
        entry.export_count += 1;
        drop(hash);

        Ok(DmaBuf::new(Arc::clone(inner), vaddr, pack, offset, size))
    }

    /// Finish an export. Equivalent to dropping the buffer.
    pub fn end_export(&self, buf: DmaBuf) {
        drop(buf);
    }

    /// Reserve a block of virtual addresses without backing.
    ///
    /// # Errors
    /// `OutOfSpace` if the range is full, `InvalidArgument` for a bad
    /// alignment.
    pub fn reserve_va(&self, kind: VaRangeKind, size: u64, alignment: u64) -> VmResult<u64> {
        let range = self.inner.range(kind);
        let align = alignment.max(range.page_size());
        let mut reservations = self.inner.lock_reservations();
        let addr = range
            .reserve(VaRequest::new(size, align))
            .inspect_err(|e| error!("failed to reserve {size:#x} bytes of {kind} va: {e}"))?;
        reservations.insert(addr, (kind, range.reserved_size(size)));
        Ok(addr)
    }

    /// Return a block obtained from [`Context::reserve_va`].
    ///
    /// # Errors
    /// `InvalidArgument` unless `addr` and `size` name a live reservation
    /// made by this context.
    pub fn unreserve_va(&self, addr: u64, size: u64) -> VmResult<()> {
        let inner = &self.inner;
        let mut reservations = inner.lock_reservations();

        let Some(&(kind, reserved)) = reservations.get(&addr) else {
            error!("Cannot unreserve VA block {addr:#x}+{size:#x}, it was not reserved");
            return Err(VmError::InvalidArgument(format!(
                "{addr:#x} is not a reserved va block"
            )));
        };
        let range = inner.range(kind);
        if range.reserved_size(size) != reserved {
            error!(
                "Cannot unreserve VA block {addr:#x}+{size:#x}, {reserved:#x} bytes were reserved"
            );
            return Err(VmError::InvalidArgument(format!(
                "reserved block at {addr:#x} is {reserved:#x} bytes, not {size:#x}"
            )));
        }

        range.release(addr, addr + reserved - 1)?;
        reservations.remove(&addr);
        Ok(())
    }
}

impl ContextInner {
    pub(crate) const fn asid(&self) -> u32 {
        self.asid
    }

    pub(crate) const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn range(&self, kind: VaRangeKind) -> &VaRange {
        match kind {
            VaRangeKind::Host => &self.host_range,
            VaRangeKind::HostHuge => &self.host_huge_range,
            VaRangeKind::Dram => &self.dram_range,
        }
    }

    fn lock_hash(&self) -> MutexGuard<'_, HashMap<u64, MappingEntry>> {
        self.mem_hash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reservations(&self) -> MutexGuard<'_, HashMap<u64, (VaRangeKind, u64)>> {
        self.reservations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map every page of `pack` at `vaddr`. Caller holds the MMU lock.
    fn map_pack(&self, vaddr: u64, pack: &PhysPagePack) -> VmResult<()> {
        let mmu = self.device.mmu();
        let page_size = pack.page_size();
        let npages = pack.npages();

        for (i, &paddr) in pack.pages().iter().enumerate() {
            let next_vaddr = vaddr + i as u64 * page_size;
            let is_last = i + 1 == npages;
            if let Err(e) = mmu.map_page(self.asid, next_vaddr, paddr, page_size, is_last) {
                error!(
                    "map failed for handle {:#x}, vaddr {next_vaddr:#x}, paddr {paddr:#x}, page size {page_size:#x}: {e}",
                    pack.handle()
                );

                for j in 0..i {
                    let undo = vaddr + j as u64 * page_size;
                    if let Err(e) = mmu.unmap_page(self.asid, undo, page_size, j + 1 == i) {
                        warn!("failed to unmap {undo:#x} during rollback: {e}");
                    }
                }
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// Unmap every page of `pack` at `vaddr`. Caller holds the MMU lock.
    fn unmap_pack(&self, vaddr: u64, pack: &PhysPagePack) {
        let mmu = self.device.mmu();
        let page_size = pack.page_size();
        let npages = pack.npages();

        for i in 0..npages {
            let next_vaddr = vaddr + i as u64 * page_size;
            if let Err(e) = mmu.unmap_page(self.asid, next_vaddr, page_size, i + 1 == npages) {
                warn!("unmap failed for vaddr {next_vaddr:#x}: {e}");
            }
            if (i + 1) % UNMAP_YIELD_INTERVAL == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Undo the first step of a map: drop the mapping reference or unpin.
    fn rollback_backing(&self, backing: Backing) {
        match backing {
            Backing::Device(pack) => pack.put_mapping(),
            Backing::Host { pack, userptr } => {
                drop(pack);
                userptr.unpin();
            }
        }
    }

    fn unmap(&self, vaddr: u64, ctx_free: bool) -> VmResult<()> {
        let entry = {
            let mut hash = self.lock_hash();
            let Some(entry) = hash.get(&vaddr) else {
                error!("unmap failed, no mem hnode for vaddr {vaddr:#x}");
                return Err(VmError::NotMapped(vaddr));
            };
            if entry.export_count > 0 && !ctx_free {
                error!("failed to unmap {vaddr:#x}, memory is exported");
                return Err(VmError::Exported(vaddr));
            }
            hash.remove(&vaddr).ok_or(VmError::NotMapped(vaddr))?
        };

        let pack = entry.backing.pack();
        let block_start = entry.block_start;
        let kind = entry.backing.memory_kind();
        let mut result = Ok(());

        {
            let _mmu = self.device.lock_mmu();
            self.unmap_pack(block_start, pack);

            if !ctx_free
                && let Err(e) = self.device.mmu().invalidate_cache(
                    self.asid,
                    Invalidate::Range {
                        start: block_start,
                        size: pack.total_size(),
                    },
                    kind,
                )
            {
                error!("failed to invalidate MMU cache after unmapping {vaddr:#x}: {e}");
                result = Err(e.into());
            }
        }

        if let Err(e) = self
            .range(entry.range)
            .release(block_start, block_start + pack.total_size() - 1)
        {
            warn!("add va block failed for vaddr {block_start:#x}: {e}");
            if result.is_ok() {
                result = Err(e);
            }
        }

        self.rollback_backing(entry.backing);
        result
    }

    pub(crate) fn put_export(&self, vaddr: u64) {
        let mut hash = self.lock_hash();
        match hash.get_mut(&vaddr) {
            Some(entry) if entry.export_count > 0 => entry.export_count -= 1,
            _ => error!("export of {vaddr:#x} ended but no export is live"),
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let asid = self.asid;
        let vaddrs: Vec<u64> = self.lock_hash().keys().copied().collect();

        for vaddr in vaddrs {
            debug!("mapping at {vaddr:#x} of asid {asid} was not destroyed, freeing it");
            if let Err(e) = self.unmap(vaddr, true) {
                warn!("teardown unmap of {vaddr:#x} failed: {e}");
            }
        }

        {
            let _mmu = self.device.lock_mmu();
            for kind in [MemoryKind::Host, MemoryKind::Device] {
                if let Err(e) = self.device.mmu().invalidate_cache(asid, Invalidate::All, kind) {
                    warn!("failed to invalidate {kind:?} MMU cache of asid {asid}: {e}");
                }
            }
        }

        for pack in self.device.registry().drain_owned_by(asid) {
            debug!(
                "allocation {:#x} of asid {asid} is still alive, freeing it",
                pack.handle()
            );
        }
        self.dram_phys_mem.store(0, Ordering::Relaxed);

        for range in [&self.host_range, &self.host_huge_range, &self.dram_range] {
            if !range.is_pristine() {
                warn!(
                    "{} va range of asid {asid} still has reserved blocks at teardown",
                    range.kind()
                );
            }
        }

        self.device.mmu().ctx_fini(asid);
        debug!("context with asid {asid} torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceProperties, HintReservation, MmuRange, PeerDevice, SZ_2M, SZ_4K};
    use crate::host::HostMemory;
    use crate::mmu::SoftMmu;
    use crate::vm::userptr::tests::FakeHost;

    fn identity(vpn: u64) -> u64 {
        vpn * 0x1000
    }

    const DRAM: u64 = 0x10_0000_0000;

    fn props() -> DeviceProperties {
        DeviceProperties::new()
            .with_dram(DRAM, DRAM, DRAM + 64 * SZ_2M)
            .with_pci_bar(0xA0_0000_0000, 64 * SZ_2M)
    }

    fn setup(props: DeviceProperties) -> (Arc<SoftMmu>, Arc<FakeHost>, Arc<Device>) {
        let mmu = Arc::new(SoftMmu::new());
        let host = Arc::new(FakeHost::new(0x1000, identity));
        let dyn_host: Arc<dyn HostMemory> = host.clone();
        let dev = Device::new(props, mmu.clone(), dyn_host).unwrap();
        (mmu, host, dev)
    }

    #[test]
    fn map_unmap_device_memory() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();

        let handle = ctx.alloc_device_memory(2 * SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();

        let pack = dev.registry().lookup(handle).unwrap();
        assert_eq!(pack.mapping_count(), 1);
        assert_eq!(mmu.mapped_pages(ctx.asid()), 2);
        assert_eq!(
            mmu.translate(ctx.asid(), va + SZ_2M).unwrap().paddr,
            pack.pages()[1]
        );
        assert!(matches!(
            ctx.free_device_memory(handle),
            Err(VmError::StillMapped(_))
        ));

        ctx.unmap(va).unwrap();
        assert_eq!(pack.mapping_count(), 0);
        assert_eq!(mmu.mapped_pages(ctx.asid()), 0);
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
        assert!(matches!(ctx.unmap(va), Err(VmError::NotMapped(_))));

        drop(pack);
        ctx.free_device_memory(handle).unwrap();
        assert_eq!(ctx.dram_usage(), 0);
        assert_eq!(dev.dram_used(), 0);
    }

    #[test]
    fn unmap_invalidates_the_range() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();
        ctx.unmap(va).unwrap();

        let expected = (
            ctx.asid(),
            Invalidate::Range {
                start: va,
                size: SZ_2M,
            },
            MemoryKind::Device,
        );
        let invalidations = mmu.invalidations();
        assert_eq!(invalidations.len(), 2);
        assert!(invalidations.iter().all(|i| *i == expected));
    }

    #[test]
    fn exported_mapping_cannot_be_unmapped() {
        let (_, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();

        let buf = ctx.export(va, SZ_2M, 0).unwrap();
        assert!(matches!(ctx.unmap(va), Err(VmError::Exported(_))));

        let segs = buf.segments().unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].len, SZ_2M);

        let peer = buf.map_for(&PeerDevice::new(SZ_2M)).unwrap();
        assert_eq!(peer[0].addr, 0xA0_0000_0000 + (segs[0].addr - DRAM));
        assert!(matches!(
            buf.map_for(&PeerDevice::new(SZ_2M).without_p2p()),
            Err(VmError::PermissionDenied { .. })
        ));

        ctx.end_export(buf);
        ctx.unmap(va).unwrap();
    }

    #[test]
    fn export_validates_parameters() {
        let (_, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();

        assert!(matches!(ctx.export(va, 0x800, 0), Err(VmError::InvalidArgument(_))));
        assert!(matches!(ctx.export(va, SZ_2M, SZ_4K), Err(VmError::InvalidArgument(_))));
        assert!(matches!(ctx.export(va + SZ_4K, SZ_4K, 0), Err(VmError::NotMapped(_))));

        let host_va = ctx
            .map(
                MapSource::Host {
                    addr: 0x7000_0000,
                    size: SZ_4K,
                },
                0,
                MemFlags::new(),
            )
            .unwrap();
        assert!(matches!(ctx.export(host_va, SZ_4K, 0), Err(VmError::InvalidArgument(_))));

        // Failed exports leave nothing behind.
        ctx.unmap(va).unwrap();
        ctx.unmap(host_va).unwrap();
    }

    #[test]
    fn export_rejects_pages_outside_the_bar() {
        let (_, _, dev) = setup(props().with_pci_bar(0xA0_0000_0000, SZ_2M));
        let ctx = dev.create_context().unwrap();
        let first = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let second = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();

        let va1 = ctx.map(MapSource::Device(first), 0, MemFlags::new()).unwrap();
        let va2 = ctx.map(MapSource::Device(second), 0, MemFlags::new()).unwrap();

        drop(ctx.export(va1, SZ_2M, 0).unwrap());
        assert!(matches!(ctx.export(va2, SZ_2M, 0), Err(VmError::InvalidArgument(_))));
        ctx.unmap(va2).unwrap();
    }

    #[test]
    fn host_mapping_keeps_in_page_offset() {
        let (mmu, host, dev) = setup(props());
        let ctx = dev.create_context().unwrap();

        let va = ctx
            .map(
                MapSource::Host {
                    addr: 0x7000_0123,
                    size: 0x2000,
                },
                0,
                MemFlags::new(),
            )
            .unwrap();
        assert_eq!(va & 0xfff, 0x123);
        assert_eq!(mmu.mapped_pages(ctx.asid()), 3);
        assert_eq!(host.pinned.load(Ordering::SeqCst), 3);
        assert_eq!(mmu.translate(ctx.asid(), va).unwrap().paddr, 0x7000_0000);

        ctx.unmap(va).unwrap();
        assert_eq!(host.pinned.load(Ordering::SeqCst), 0);
        assert!(ctx.va_range(VaRangeKind::Host).is_pristine());
    }

    #[test]
    fn huge_aligned_host_memory_goes_to_huge_range() {
        let (mmu, host, dev) = setup(props());
        let ctx = dev.create_context().unwrap();

        let va = ctx
            .map(
                MapSource::Host {
                    addr: 0x4000_0000,
                    size: 2 * SZ_2M,
                },
                0,
                MemFlags::new(),
            )
            .unwrap();
        assert!(ctx.va_range(VaRangeKind::HostHuge).contains(va, 2 * SZ_2M));
        assert_eq!(mmu.translate(ctx.asid(), va).unwrap().page_size, SZ_2M);

        ctx.unmap(va).unwrap();
        assert_eq!(host.pinned.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn without_huge_range_host_memory_uses_regular_pages() {
        let (mmu, _, dev) = setup(props().with_host_huge_range(None));
        let ctx = dev.create_context().unwrap();

        let va = ctx
            .map(
                MapSource::Host {
                    addr: 0x4000_0000,
                    size: SZ_2M,
                },
                0,
                MemFlags::new(),
            )
            .unwrap();
        assert_eq!(va % SZ_2M, 0);
        assert_eq!(mmu.mapped_pages(ctx.asid()), 512);
        ctx.unmap(va).unwrap();
    }

    #[test]
    fn hint_is_honoured_or_rejected() {
        let (_, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let dram = ctx.va_range(VaRangeKind::Dram).start_addr();
        let hint = dram + 16 * SZ_2M;

        let h1 = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx
            .map(MapSource::Device(h1), hint, MemFlags::new().force_hint())
            .unwrap();
        assert_eq!(va, hint);

        let h2 = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        assert!(matches!(
            ctx.map(MapSource::Device(h2), hint, MemFlags::new().force_hint()),
            Err(VmError::HintUnsatisfiable { .. })
        ));
        assert_eq!(ctx.mapping_count(h2).unwrap(), 0);

        // With an offset the hint cannot be kept.
        assert!(matches!(
            ctx.map(
                MapSource::Host {
                    addr: 0x7000_0010,
                    size: SZ_4K,
                },
                0x8000_0010_0000,
                MemFlags::new().force_hint()
            ),
            Err(VmError::HintUnsatisfiable { .. })
        ));
    }

    #[test]
    fn mmu_fault_rolls_back() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(4 * SZ_2M, 0, MemFlags::new()).unwrap();

        mmu.fail_map_after(2);
        assert!(matches!(
            ctx.map(MapSource::Device(handle), 0, MemFlags::new()),
            Err(VmError::Hardware(_))
        ));

        assert_eq!(mmu.mapped_pages(ctx.asid()), 0);
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
        assert_eq!(dev.registry().lookup(handle).unwrap().mapping_count(), 0);
        ctx.free_device_memory(handle).unwrap();
    }

    #[test]
    fn invalidate_failure_after_map_rolls_back() {
        let (mmu, host, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(2 * SZ_2M, 0, MemFlags::new()).unwrap();

        mmu.fail_next_invalidate();
        assert!(matches!(
            ctx.map(MapSource::Device(handle), 0, MemFlags::new()),
            Err(VmError::Hardware(crate::mmu::MmuError::Timeout))
        ));
        assert_eq!(mmu.mapped_pages(ctx.asid()), 0);
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
        assert_eq!(ctx.mapping_count(handle).unwrap(), 0);

        mmu.fail_next_invalidate();
        let src = MapSource::Host {
            addr: 0x7000_0000,
            size: 2 * SZ_4K,
        };
        assert!(ctx.map(src, 0, MemFlags::new()).is_err());
        assert_eq!(host.pinned.load(Ordering::SeqCst), 0);
        assert!(ctx.va_range(VaRangeKind::Host).is_pristine());

        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();
        ctx.unmap(va).unwrap();
        ctx.free_device_memory(handle).unwrap();
    }

    #[test]
    fn unmap_continues_past_page_fault() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(4 * SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();

        mmu.fail_next_unmap();
        ctx.unmap(va).unwrap();

        // Only the faulting page is left behind.
        assert_eq!(mmu.mapped_pages(ctx.asid()), 1);
        assert!(mmu.translate(ctx.asid(), va).is_some());
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
        assert_eq!(ctx.mapping_count(handle).unwrap(), 0);
        ctx.free_device_memory(handle).unwrap();
    }

    #[test]
    fn failed_invalidate_on_unmap_still_removes_the_mapping() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();

        mmu.fail_next_invalidate();
        assert!(matches!(ctx.unmap(va), Err(VmError::Hardware(_))));
        assert!(matches!(ctx.unmap(va), Err(VmError::NotMapped(_))));
        assert_eq!(mmu.mapped_pages(ctx.asid()), 0);
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
        assert_eq!(ctx.mapping_count(handle).unwrap(), 0);
    }

    #[test]
    fn teardown_continues_past_unmap_fault() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let asid = ctx.asid();
        for _ in 0..2 {
            let h = ctx.alloc_device_memory(2 * SZ_2M, 0, MemFlags::new()).unwrap();
            ctx.map(MapSource::Device(h), 0, MemFlags::new()).unwrap();
        }

        mmu.fail_next_unmap();
        drop(ctx);

        assert!(!mmu.has_context(asid));
        assert_eq!(dev.live_handles(), 0);
        assert_eq!(dev.pool().allocated(), 0);
    }

    #[test]
    fn prefetch_is_requested_on_demand() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let handle = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();

        let va = ctx
            .map(MapSource::Device(handle), 0, MemFlags::new().prefetch())
            .unwrap();
        assert_eq!(mmu.prefetch_count(), 1);
        ctx.unmap(va).unwrap();
    }

    #[test]
    fn private_allocation_is_not_mappable_elsewhere() {
        let (_, _, dev) = setup(props());
        let owner = dev.create_context().unwrap();
        let other = dev.create_context().unwrap();

        let private = owner.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let shared = owner
            .alloc_device_memory(SZ_2M, 0, MemFlags::new().shared())
            .unwrap();

        assert!(matches!(
            other.map(MapSource::Device(private), 0, MemFlags::new()),
            Err(VmError::PermissionDenied { .. })
        ));
        let va = other.map(MapSource::Device(shared), 0, MemFlags::new()).unwrap();
        other.unmap(va).unwrap();
    }

    #[test]
    fn reserve_and_unreserve_va() {
        let (_, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();

        let va = ctx.reserve_va(VaRangeKind::Host, 0x10_0000, 0x10_0000).unwrap();
        assert_eq!(va % 0x10_0000, 0);
        assert!(!ctx.va_range(VaRangeKind::Host).is_pristine());

        assert!(matches!(ctx.unreserve_va(0x10, 0x1000), Err(VmError::InvalidArgument(_))));
        assert!(matches!(
            ctx.unreserve_va(va, 0x1000),
            Err(VmError::InvalidArgument(_))
        ));
        ctx.unreserve_va(va, 0x10_0000).unwrap();
        assert!(ctx.va_range(VaRangeKind::Host).is_pristine());
        assert!(matches!(
            ctx.unreserve_va(va, 0x10_0000),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unreserve_cannot_release_a_mapping() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let first = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let second = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();

        let va = ctx.map(MapSource::Device(first), 0, MemFlags::new()).unwrap();
        assert!(matches!(
            ctx.unreserve_va(va, SZ_2M),
            Err(VmError::InvalidArgument(_))
        ));

        let other = ctx.map(MapSource::Device(second), 0, MemFlags::new()).unwrap();
        assert_ne!(other, va);
        assert_eq!(mmu.mapped_pages(ctx.asid()), 2);

        ctx.unmap(va).unwrap();
        ctx.unmap(other).unwrap();
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
    }

    #[test]
    fn unreserve_inside_a_reservation_is_rejected() {
        let (_, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();

        let va = ctx.reserve_va(VaRangeKind::Dram, 4 * SZ_2M, 0).unwrap();
        assert!(matches!(
            ctx.unreserve_va(va + SZ_2M, SZ_2M),
            Err(VmError::InvalidArgument(_))
        ));
        ctx.unreserve_va(va, 4 * SZ_2M).unwrap();
        assert!(ctx.va_range(VaRangeKind::Dram).is_pristine());
    }

    #[test]
    fn unhinted_maps_skip_the_hint_reservation() {
        let host = MmuRange::new(0x8000_0000_0000, 0x8020_0000_0000, SZ_4K);
        let reserved = HintReservation {
            start_addr: host.start_addr,
            end_addr: host.start_addr + 0xfff_ffff,
        };
        let (_, _, dev) = setup(props().with_hint_reservations(Some(reserved), None, None));
        let ctx = dev.create_context().unwrap();
        let src = MapSource::Host {
            addr: 0x7000_1000,
            size: SZ_4K,
        };

        let hinted = ctx.map(src, reserved.end_addr - 0xfff, MemFlags::new()).unwrap();
        assert_eq!(hinted, reserved.end_addr - 0xfff);

        let va = ctx.map(src, 0, MemFlags::new()).unwrap();
        assert_eq!(va, reserved.end_addr + 1);
    }

    #[test]
    fn teardown_releases_everything() {
        let (mmu, host, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let asid = ctx.asid();

        let h = ctx.alloc_device_memory(2 * SZ_2M, 0, MemFlags::new()).unwrap();
        ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        ctx.map(MapSource::Device(h), 0, MemFlags::new()).unwrap();
        ctx.map(
            MapSource::Host {
                addr: 0x7000_0000,
                size: SZ_4K,
            },
            0,
            MemFlags::new(),
        )
        .unwrap();

        drop(ctx);

        assert_eq!(dev.dram_used(), 0);
        assert_eq!(dev.live_handles(), 0);
        assert_eq!(dev.pool().allocated(), 0);
        assert_eq!(host.pinned.load(Ordering::SeqCst), 0);
        assert!(!mmu.has_context(asid));
        let all = mmu
            .invalidations()
            .into_iter()
            .filter(|(a, scope, _)| *a == asid && *scope == Invalidate::All)
            .count();
        assert_eq!(all, 2);
    }

    #[test]
    fn export_keeps_context_alive() {
        let (mmu, _, dev) = setup(props());
        let ctx = dev.create_context().unwrap();
        let asid = ctx.asid();
        let handle = ctx.alloc_device_memory(SZ_2M, 0, MemFlags::new()).unwrap();
        let va = ctx.map(MapSource::Device(handle), 0, MemFlags::new()).unwrap();

        let buf = ctx.export(va, SZ_4K, SZ_4K).unwrap();
        drop(ctx);
        assert!(mmu.has_context(asid));
        assert_eq!(buf.segments().unwrap()[0].len, SZ_4K);

        drop(buf);
        assert!(!mmu.has_context(asid));
        assert_eq!(dev.dram_used(), 0);
    }
}

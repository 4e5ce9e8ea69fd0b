use super::page_pool::PoolLease;
use super::userptr::UserPtr;
use crate::error::{VmError, VmResult};
use crate::utils::{align_down, is_power_of_two};
use std::sync::atomic::{AtomicU32, Ordering};

/// The physical backing of one allocation or one pinned host range.
///
/// Device packs own their DRAM through a [`PoolLease`]; the pages return to
/// the pool when the last reference to the pack goes away.
#[derive(Debug)]
pub struct PhysPagePack {
    pub(crate) handle: u64,
    pages: Vec<u64>,
    page_size: u64,
    total_size: u64,
    contiguous: bool,
    created_from_userptr: bool,
    /// Misalignment of the first byte inside the first page.
    offset: u64,
    owner_asid: u32,
    shared: bool,
    mapping_count: AtomicU32,
    _lease: Option<PoolLease>,
}

impl PhysPagePack {
    /// A pack of device DRAM pages.
    #[must_use]
    pub fn from_device(
        owner_asid: u32,
        pages: Vec<u64>,
        page_size: u64,
        contiguous: bool,
        shared: bool,
        lease: PoolLease,
    ) -> Self {
        Self {
            handle: 0,
            total_size: pages.len() as u64 * page_size,
            pages,
            page_size,
            contiguous,
            created_from_userptr: false,
            offset: 0,
            owner_asid,
            shared,
            mapping_count: AtomicU32::new(0),
            _lease: Some(lease),
        }
    }

    /// Describe pinned host memory as device-mappable pages.
    ///
    /// Huge pages are used when every sg entry starts huge-aligned and spans
    /// a whole number of huge pages, unless `force_regular` is set.
    ///
    /// # Errors
    /// Returns `VmError::Config` if the page sizes are not powers of two or
    /// the huge page size is not a multiple of the regular one.
    pub fn from_userptr(
        userptr: &UserPtr,
        owner_asid: u32,
        page_size: u64,
        huge_page_size: u64,
        force_regular: bool,
    ) -> VmResult<Self> {
        if !is_power_of_two(page_size)
            || !is_power_of_two(huge_page_size)
            || huge_page_size < page_size
        {
            return Err(VmError::Config(format!(
                "bad host page sizes {page_size:#x}/{huge_page_size:#x}"
            )));
        }

        let pgs_in_huge_page = huge_page_size / page_size;
        let sg_pages = |dma_addr: u64, length: u64| {
            (length + (dma_addr & (page_size - 1))).div_ceil(page_size)
        };

        let mut total_npages = 0;
        let mut is_huge = !force_regular;
        for entry in userptr.sg() {
            let npages = sg_pages(entry.dma_addr, entry.length);
            total_npages += npages;
            if npages % pgs_in_huge_page != 0 || entry.dma_addr & (huge_page_size - 1) != 0 {
                is_huge = false;
            }
        }

        let (pack_page_size, step) = if is_huge {
            (huge_page_size, pgs_in_huge_page)
        } else {
            (page_size, 1)
        };

        let mut pages = Vec::with_capacity((total_npages / step) as usize);
        let mut offset = 0;
        for (i, entry) in userptr.sg().iter().enumerate() {
            let mut npages = sg_pages(entry.dma_addr, entry.length);
            let mut dma_addr = entry.dma_addr;
            if i == 0 {
                offset = dma_addr & (pack_page_size - 1);
                dma_addr = align_down(dma_addr, pack_page_size);
            }
            while npages > 0 {
                pages.push(dma_addr);
                dma_addr += pack_page_size;
                npages -= step;
            }
        }

        Ok(Self {
            handle: 0,
            total_size: pages.len() as u64 * pack_page_size,
            pages,
            page_size: pack_page_size,
            contiguous: false,
            created_from_userptr: true,
            offset,
            owner_asid,
            shared: false,
            mapping_count: AtomicU32::new(0),
            _lease: None,
        })
    }

    /// Registry handle, 0 for host packs.
    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    #[must_use]
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    #[must_use]
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    #[must_use]
    pub const fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    #[must_use]
    pub const fn created_from_userptr(&self) -> bool {
        self.created_from_userptr
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn owner_asid(&self) -> u32 {
        self.owner_asid
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether a context with `asid` may map this pack.
    #[must_use]
    pub const fn accessible_by(&self, asid: u32) -> bool {
        self.shared || self.owner_asid == asid
    }

    /// Number of live mappings of this pack.
    #[must_use]
    pub fn mapping_count(&self) -> u32 {
        self.mapping_count.load(Ordering::Acquire)
    }

    pub(crate) fn get_mapping(&self) {
        self.mapping_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put_mapping(&self) {
        let prev = self.mapping_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "mapping count underflow on handle {:#x}", self.handle);
    }
}

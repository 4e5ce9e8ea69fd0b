use super::{Invalidate, MemoryKind, MmuError, PageTableOps};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const NO_FAULT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftPte {
    pub paddr: u64,
    pub page_size: u64,
}

#[derive(Debug, Default)]
struct Tables {
    contexts: HashMap<u32, BTreeMap<u64, SoftPte>>,
    invalidations: Vec<(u32, Invalidate, MemoryKind)>,
}

/// A software page table with one `vaddr -> pte` table per ASID.
///
/// Failures can be injected to exercise rollback paths.
#[derive(Debug)]
pub struct SoftMmu {
    tables: Mutex<Tables>,
    /// Number of further successful `map_page` calls before one fails.
    map_budget: AtomicU64,
    fail_unmap: AtomicBool,
    fail_invalidate: AtomicBool,
    prefetches: AtomicU64,
}

impl Default for SoftMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftMmu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            map_budget: AtomicU64::new(NO_FAULT),
            fail_unmap: AtomicBool::new(false),
            fail_invalidate: AtomicBool::new(false),
            prefetches: AtomicU64::new(0),
        }
    }

    /// Make the `n + 1`-th following `map_page` call fail with a device error.
    pub fn fail_map_after(&self, n: u64) {
        self.map_budget.store(n, Ordering::SeqCst);
    }

    /// Make the next `unmap_page` call fail. The entry stays mapped.
    pub fn fail_next_unmap(&self) {
        self.fail_unmap.store(true, Ordering::SeqCst);
    }

    /// Make the next `invalidate_cache` call time out.
    pub fn fail_next_invalidate(&self) {
        self.fail_invalidate.store(true, Ordering::SeqCst);
    }

    /// Look up the translation of `vaddr` in the given context.
    #[must_use]
    pub fn translate(&self, asid: u32, vaddr: u64) -> Option<SoftPte> {
        let tables = self.lock();
        let table = tables.contexts.get(&asid)?;
        let (&base, pte) = table.range(..=vaddr).next_back()?;
        (vaddr < base + pte.page_size).then_some(*pte)
    }

    /// Number of live page-table entries for the context.
    #[must_use]
    pub fn mapped_pages(&self, asid: u32) -> usize {
        self.lock().contexts.get(&asid).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn has_context(&self, asid: u32) -> bool {
        self.lock().contexts.contains_key(&asid)
    }

    /// Every invalidation issued so far, oldest first.
    #[must_use]
    pub fn invalidations(&self) -> Vec<(u32, Invalidate, MemoryKind)> {
        self.lock().invalidations.clone()
    }

    #[must_use]
    pub fn prefetch_count(&self) -> u64 {
        self.prefetches.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn consume_map_budget(&self) -> bool {
        self.map_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                NO_FAULT => None,
                0 => Some(NO_FAULT),
                n => Some(n - 1),
            })
            .is_ok_and(|prev| prev == 0)
    }
}

impl PageTableOps for SoftMmu {
    fn map_page(
        &self,
        asid: u32,
        vaddr: u64,
        paddr: u64,
        page_size: u64,
        _is_last: bool,
    ) -> Result<(), MmuError> {
        if page_size == 0 {
            return Err(MmuError::PageSize(page_size));
        }
        if self.consume_map_budget() {
            return Err(MmuError::Device(format!("injected fault at {vaddr:#x}")));
        }

        let mut tables = self.lock();
        let table = tables
            .contexts
            .get_mut(&asid)
            .ok_or(MmuError::NoContext(asid))?;
        if table.contains_key(&vaddr) {
            return Err(MmuError::AlreadyMapped(vaddr));
        }
        table.insert(vaddr, SoftPte { paddr, page_size });
        Ok(())
    }

    fn unmap_page(
        &self,
        asid: u32,
        vaddr: u64,
        _page_size: u64,
        _is_last: bool,
    ) -> Result<(), MmuError> {
        if self.fail_unmap.swap(false, Ordering::SeqCst) {
            return Err(MmuError::Device(format!("injected unmap fault at {vaddr:#x}")));
        }

        let mut tables = self.lock();
        let table = tables
            .contexts
            .get_mut(&asid)
            .ok_or(MmuError::NoContext(asid))?;
        table
            .remove(&vaddr)
            .map(|_| ())
            .ok_or(MmuError::NotMapped(vaddr))
    }

    fn invalidate_cache(
        &self,
        asid: u32,
        scope: Invalidate,
        kind: MemoryKind,
    ) -> Result<(), MmuError> {
        if self.fail_invalidate.swap(false, Ordering::SeqCst) {
            return Err(MmuError::Timeout);
        }
        self.lock().invalidations.push((asid, scope, kind));
        Ok(())
    }

    fn prefetch(
        &self,
        _asid: u32,
        _vaddr: u64,
        _size: u64,
        _kind: MemoryKind,
    ) -> Result<(), MmuError> {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn ctx_init(&self, asid: u32) -> Result<(), MmuError> {
        self.lock().contexts.entry(asid).or_default();
        Ok(())
    }

    fn ctx_fini(&self, asid: u32) {
        self.lock().contexts.remove(&asid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap() {
        let mmu = SoftMmu::new();
        mmu.ctx_init(1).unwrap();
        mmu.map_page(1, 0x20_0000, 0x9000_0000, 0x1000, true).unwrap();

        let pte = mmu.translate(1, 0x20_0fff).unwrap();
        assert_eq!(pte.paddr, 0x9000_0000);
        assert!(mmu.translate(1, 0x20_1000).is_none());

        assert_eq!(
            mmu.map_page(1, 0x20_0000, 0, 0x1000, true),
            Err(MmuError::AlreadyMapped(0x20_0000))
        );
        mmu.unmap_page(1, 0x20_0000, 0x1000, true).unwrap();
        assert_eq!(mmu.mapped_pages(1), 0);
    }

    #[test]
    fn unknown_context_is_rejected() {
        let mmu = SoftMmu::new();
        assert_eq!(
            mmu.map_page(7, 0, 0, 0x1000, true),
            Err(MmuError::NoContext(7))
        );
    }

    #[test]
    fn injected_fault_fires_once() {
        let mmu = SoftMmu::new();
        mmu.ctx_init(1).unwrap();
        mmu.fail_map_after(1);

        assert!(mmu.map_page(1, 0x0, 0x0, 0x1000, false).is_ok());
        assert!(matches!(
            mmu.map_page(1, 0x1000, 0x1000, 0x1000, false),
            Err(MmuError::Device(_))
        ));
        assert!(mmu.map_page(1, 0x1000, 0x1000, 0x1000, true).is_ok());
    }

    #[test]
    fn injected_unmap_and_invalidate_faults_fire_once() {
        let mmu = SoftMmu::new();
        mmu.ctx_init(1).unwrap();
        mmu.map_page(1, 0x0, 0x0, 0x1000, true).unwrap();

        mmu.fail_next_unmap();
        assert!(matches!(
            mmu.unmap_page(1, 0x0, 0x1000, true),
            Err(MmuError::Device(_))
        ));
        assert_eq!(mmu.mapped_pages(1), 1);
        mmu.unmap_page(1, 0x0, 0x1000, true).unwrap();

        mmu.fail_next_invalidate();
        assert_eq!(
            mmu.invalidate_cache(1, Invalidate::All, MemoryKind::Host),
            Err(MmuError::Timeout)
        );
        mmu.invalidate_cache(1, Invalidate::All, MemoryKind::Host).unwrap();
        assert_eq!(mmu.invalidations().len(), 1);
    }
}

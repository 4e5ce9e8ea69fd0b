use super::pack::PhysPagePack;
use crate::error::{VmError, VmResult};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Opaque, never-zero identifier of a device allocation.
///
/// The low half is the slot index plus one, the high half the slot's
/// generation, so a stale handle does not resolve after its slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64 + 1))
    }

    /// Rebuild a handle received from a caller.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(self) -> Option<usize> {
        match (self.0 as u32).checked_sub(1) {
            Some(i) => Some(i as usize),
            None => None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    pack: Option<Arc<PhysPagePack>>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Slots {
    fn get(&self, handle: Handle) -> Option<&Arc<PhysPagePack>> {
        let slot = self.slots.get(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.pack.as_ref()
    }
}

/// Maps handles to physical page packs.
///
/// Lookups for mapping and removal race against each other; both run under
/// the table lock so a pack is never freed while a mapping is being set up.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    inner: RwLock<Slots>,
}

impl AllocationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `pack` and return its new handle.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert(&self, mut pack: PhysPagePack) -> Handle {
        let mut inner = self.write();

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        let handle = Handle::new(index, slot.generation);
        pack.handle = handle.into_raw();
        slot.pack = Some(Arc::new(pack));
        inner.live += 1;

        handle
    }

    /// # Errors
    /// `InvalidHandle` if nothing is stored under `handle`.
    pub fn lookup(&self, handle: Handle) -> VmResult<Arc<PhysPagePack>> {
        self.read()
            .get(handle)
            .cloned()
            .ok_or(VmError::InvalidHandle(handle.into_raw()))
    }

    /// Look up a pack for mapping by `asid` and count the new mapping.
    ///
    /// # Errors
    /// `InvalidHandle` if the handle is stale, `PermissionDenied` if the pack
    /// belongs to another context and is not shared.
    pub fn lookup_for_map(&self, handle: Handle, asid: u32) -> VmResult<Arc<PhysPagePack>> {
        let inner = self.read();
        let pack = inner
            .get(handle)
            .ok_or(VmError::InvalidHandle(handle.into_raw()))?;

        if !pack.accessible_by(asid) {
            return Err(VmError::PermissionDenied {
                handle: handle.into_raw(),
                asid,
            });
        }

        pack.get_mapping();
        Ok(Arc::clone(pack))
    }

    /// Remove an unmapped pack owned by `asid`.
    ///
    /// # Errors
    /// `InvalidHandle` if nothing is stored, `PermissionDenied` if another
    /// context owns the pack, `StillMapped` if the pack has live mappings.
    pub fn remove(&self, handle: Handle, asid: u32) -> VmResult<Arc<PhysPagePack>> {
        let mut inner = self.write();
        let pack = inner
            .get(handle)
            .ok_or(VmError::InvalidHandle(handle.into_raw()))?;
        if pack.owner_asid() != asid {
            return Err(VmError::PermissionDenied {
                handle: handle.into_raw(),
                asid,
            });
        }
        if pack.mapping_count() > 0 {
            return Err(VmError::StillMapped(handle.into_raw()));
        }

        let Some(index) = handle.index() else {
            return Err(VmError::InvalidHandle(handle.into_raw()));
        };
        Ok(Self::vacate(&mut inner, index))
    }

    /// Remove every pack owned by `asid`, mapped or not.
    #[allow(clippy::cast_possible_truncation)]
    pub fn drain_owned_by(&self, asid: u32) -> Vec<Arc<PhysPagePack>> {
        let mut inner = self.write();
        let owned: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.pack.as_ref().is_some_and(|p| p.owner_asid() == asid))
            .map(|(index, _)| index)
            .collect();

        owned
            .into_iter()
            .map(|index| Self::vacate(&mut inner, index))
            .collect()
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn vacate(inner: &mut Slots, index: usize) -> Arc<PhysPagePack> {
        let slot = &mut inner.slots[index];
        let pack = slot.pack.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(index as u32);
        inner.live -= 1;
        // Callers only vacate occupied slots.
        pack.unwrap_or_else(|| unreachable!("vacating empty slot {index}"))
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page_pool::PagePool;

    const PAGE: u64 = 0x20_0000;

    fn pack(pool: &Arc<PagePool>, asid: u32, shared: bool) -> PhysPagePack {
        let mut lease = pool.lease();
        let addr = lease.alloc(PAGE).unwrap();
        PhysPagePack::from_device(asid, vec![addr], PAGE, false, shared, lease)
    }

    #[test]
    fn handles_are_nonzero_and_distinct() {
        let pool = PagePool::new(0, 16 * PAGE, PAGE).unwrap();
        let reg = AllocationRegistry::new();

        let a = reg.insert(pack(&pool, 1, false));
        let b = reg.insert(pack(&pool, 1, false));
        assert_ne!(a.into_raw(), 0);
        assert_ne!(a, b);
        assert_eq!(reg.lookup(a).unwrap().handle(), a.into_raw());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn stale_handle_does_not_resolve() {
        let pool = PagePool::new(0, 16 * PAGE, PAGE).unwrap();
        let reg = AllocationRegistry::new();

        let a = reg.insert(pack(&pool, 1, false));
        drop(reg.remove(a, 1).unwrap());
        let b = reg.insert(pack(&pool, 1, false));

        assert_ne!(a, b);
        assert!(matches!(reg.lookup(a), Err(VmError::InvalidHandle(_))));
        assert!(matches!(reg.remove(a, 1), Err(VmError::InvalidHandle(_))));
        assert!(matches!(
            reg.lookup(Handle::from_raw(0)),
            Err(VmError::InvalidHandle(0))
        ));
    }

    #[test]
    fn mapped_pack_cannot_be_removed() {
        let pool = PagePool::new(0, 16 * PAGE, PAGE).unwrap();
        let reg = AllocationRegistry::new();
        let h = reg.insert(pack(&pool, 1, false));

        let p = reg.lookup_for_map(h, 1).unwrap();
        assert_eq!(p.mapping_count(), 1);
        assert!(matches!(reg.remove(h, 1), Err(VmError::StillMapped(_))));

        p.put_mapping();
        drop(p);
        assert!(matches!(
            reg.remove(h, 2),
            Err(VmError::PermissionDenied { asid: 2, .. })
        ));
        reg.remove(h, 1).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn foreign_context_needs_shared_pack() {
        let pool = PagePool::new(0, 16 * PAGE, PAGE).unwrap();
        let reg = AllocationRegistry::new();
        let private = reg.insert(pack(&pool, 1, false));
        let shared = reg.insert(pack(&pool, 1, true));

        assert!(matches!(
            reg.lookup_for_map(private, 2),
            Err(VmError::PermissionDenied { asid: 2, .. })
        ));
        assert_eq!(reg.lookup(private).unwrap().mapping_count(), 0);
        assert_eq!(reg.lookup_for_map(shared, 2).unwrap().mapping_count(), 1);
    }

    #[test]
    fn drain_returns_only_owned_packs() {
        let pool = PagePool::new(0, 16 * PAGE, PAGE).unwrap();
        let reg = AllocationRegistry::new();
        reg.insert(pack(&pool, 1, false));
        let keep = reg.insert(pack(&pool, 2, false));
        reg.insert(pack(&pool, 1, true));

        let drained = reg.drain_owned_by(1);
        assert_eq!(drained.len(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.lookup(keep).is_ok());

        drop(drained);
        assert_eq!(pool.allocated(), PAGE);
    }
}

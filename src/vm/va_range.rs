use super::{VaAllocator, VaRangeKind};
use crate::config::HintReservation;
use crate::error::{VmError, VmResult};
use crate::utils::{
    align_down, area_crosses_range, checked_align_up, is_aligned, is_power_of_two,
    round_up_to_multiple,
};
use log::{debug, error};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A free, inclusive interval of device virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaBlock {
    pub start: u64,
    pub end: u64,
}

impl VaBlock {
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parameters of a single reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRequest {
    pub size: u64,
    /// Preferred start address; 0 means no preference.
    pub hint: u64,
    pub align: u64,
    pub force_hint: bool,
}

impl VaRequest {
    #[must_use]
    pub const fn new(size: u64, align: u64) -> Self {
        Self {
            size,
            hint: 0,
            align,
            force_hint: false,
        }
    }

    #[must_use]
    pub const fn with_hint(mut self, hint: u64, force: bool) -> Self {
        self.hint = hint;
        self.force_hint = force;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    block_start: u64,
    block_end: u64,
    reserved_start: u64,
    valid_size: u64,
}

/// Ordered free list of one address space.
///
/// Keys are block starts, values are inclusive block ends. Blocks never
/// overlap and never touch: a release that makes two blocks adjacent merges
/// them.
#[derive(Debug)]
pub struct VaBlockList {
    name: &'static str,
    start: u64,
    end: u64,
    page_size: u64,
    hint_reserved: Option<HintReservation>,
    blocks: BTreeMap<u64, u64>,
}

impl VaBlockList {
    fn new(
        name: &'static str,
        start: u64,
        end: u64,
        page_size: u64,
        hint_reserved: Option<HintReservation>,
    ) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(start, end);
        Self {
            name,
            start,
            end,
            page_size,
            hint_reserved,
            blocks,
        }
    }

    fn crosses_hint_reservation(&self, addr: u64, size: u64) -> bool {
        self.hint_reserved
            .is_some_and(|r| area_crosses_range(addr, size, r.start_addr, r.end_addr))
    }

    fn blocks(&self) -> Vec<VaBlock> {
        self.blocks
            .iter()
            .map(|(&start, &end)| VaBlock { start, end })
            .collect()
    }
}

impl VaAllocator for VaBlockList {
    fn bounds(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Best fit by leftover size; a block that holds the hint wins outright.
    fn reserve(&mut self, req: VaRequest) -> VmResult<u64> {
        let is_align_pow_2 = is_power_of_two(self.page_size);
        let align = req.align.max(1);
        let mut size = req.size;

        if size == 0 {
            return Err(VmError::InvalidArgument(format!(
                "cannot reserve 0 bytes in the {} range",
                self.name
            )));
        }

        if is_align_pow_2 {
            if !is_power_of_two(align) {
                return Err(VmError::InvalidArgument(format!(
                    "alignment {align:#x} is not a power of 2"
                )));
            }
        } else {
            // Non power-of-2 ranges work at page granularity only.
            size = round_up_to_multiple(size, self.page_size);
        }

        let mut hint = req.hint;
        let misaligned = if is_align_pow_2 {
            !is_aligned(hint, align)
        } else {
            hint % self.page_size != 0
        };
        if hint != 0 && misaligned {
            if req.force_hint {
                error!("Hint address {hint:#x} is not aligned to {align:#x} - cannot be respected");
                return Err(VmError::HintUnsatisfiable { hint });
            }
            debug!("Hint address {hint:#x} will be ignored because it is not aligned");
            hint = 0;
        }

        let mut chosen: Option<Candidate> = None;

        for (&block_start, &block_end) in &self.blocks {
            let mut valid_start = block_start;

            if is_align_pow_2 && !is_aligned(valid_start, align) {
                match align_down(valid_start, align).checked_add(align) {
                    Some(aligned) if aligned <= block_end => valid_start = aligned,
                    _ => continue,
                }
            }

            let valid_size = (block_end - valid_start).saturating_add(1);
            if valid_size < size {
                continue;
            }

            if hint == 0 && self.crosses_hint_reservation(valid_start, size) {
                continue;
            }

            if chosen.is_none_or(|c| valid_size < c.valid_size) {
                chosen = Some(Candidate {
                    block_start,
                    block_end,
                    reserved_start: valid_start,
                    valid_size,
                });
            }

            let hint_fits = hint
                .checked_add(size - 1)
                .is_some_and(|hint_end| hint_end <= block_end);
            if hint != 0 && hint >= valid_start && hint_fits {
                chosen = Some(Candidate {
                    block_start,
                    block_end,
                    reserved_start: hint,
                    valid_size,
                });
                break;
            }
        }

        let Some(c) = chosen else {
            error!("no available va block for size {size:#x} in the {} range", self.name);
            return Err(VmError::OutOfSpace {
                range: self.name,
                size,
            });
        };

        if req.force_hint && hint != 0 && c.reserved_start != hint {
            error!("Hint address {hint:#x} could not be respected");
            return Err(VmError::HintUnsatisfiable { hint });
        }

        self.blocks.remove(&c.block_start);
        if c.reserved_start > c.block_start {
            self.blocks.insert(c.block_start, c.reserved_start - 1);
        }
        let reserved_end = c.reserved_start + (size - 1);
        if reserved_end < c.block_end {
            self.blocks.insert(reserved_end + 1, c.block_end);
        }

        Ok(c.reserved_start)
    }

    /// Insert, then merge with touching neighbours.
    fn release(&mut self, start: u64, end: u64) -> VmResult<()> {
        if end < start || start < self.start || end > self.end {
            return Err(VmError::InvalidArgument(format!(
                "block {start:#x}-{end:#x} is outside the {} range {:#x}-{:#x}",
                self.name, self.start, self.end
            )));
        }

        // Only the last block starting at or before `end` can overlap.
        if let Some((&block_start, &block_end)) = self.blocks.range(..=end).next_back()
            && block_end >= start
        {
            error!(
                "block crossing ranges at start {block_start:#x}, end {block_end:#x} while releasing {start:#x}-{end:#x}"
            );
            return Err(VmError::Overlap {
                start,
                end,
                block_start,
                block_end,
            });
        }

        let mut merged_start = start;
        let mut merged_end = end;

        if let Some((&prev_start, &prev_end)) = self.blocks.range(..start).next_back()
            && prev_end + 1 == start
        {
            self.blocks.remove(&prev_start);
            merged_start = prev_start;
        }

        if let Some(next_end) = end.checked_add(1).and_then(|next| self.blocks.remove(&next)) {
            merged_end = next_end;
        }

        self.blocks.insert(merged_start, merged_end);
        Ok(())
    }
}

/// One device virtual address space with its own lock.
#[derive(Debug)]
pub struct VaRange {
    kind: VaRangeKind,
    start_addr: u64,
    end_addr: u64,
    page_size: u64,
    list: Mutex<VaBlockList>,
}

impl VaRange {
    /// Creates a range over the inclusive span `[start, end]`.
    ///
    /// Power-of-2 ranges are trimmed to whole pages. The caller aligns
    /// non power-of-2 ranges.
    ///
    /// # Errors
    /// Returns `VmError::Config` if nothing usable is left after trimming.
    pub fn new(
        kind: VaRangeKind,
        start: u64,
        end: u64,
        page_size: u64,
        hint_reserved: Option<HintReservation>,
    ) -> VmResult<Self> {
        if page_size == 0 {
            return Err(VmError::Config(format!("{kind} range has a zero page size")));
        }

        let (start, end) = if is_power_of_two(page_size) {
            let start = checked_align_up(start, page_size);
            // `end` is inclusive; keep only the last full page.
            let end = end
                .checked_add(1)
                .map_or(align_down(u64::MAX, page_size), |e| align_down(e, page_size))
                .checked_sub(1);
            match (start, end) {
                (Some(s), Some(e)) => (s, e),
                _ => (1, 0),
            }
        } else {
            (start, end)
        };

        if start >= end {
            return Err(VmError::Config(format!("too small vm range for the {kind} va list")));
        }

        Ok(Self {
            kind,
            start_addr: start,
            end_addr: end,
            page_size,
            list: Mutex::new(VaBlockList::new(
                kind.name(),
                start,
                end,
                page_size,
                hint_reserved,
            )),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> VaRangeKind {
        self.kind
    }

    #[must_use]
    pub const fn start_addr(&self) -> u64 {
        self.start_addr
    }

    /// Inclusive end address.
    #[must_use]
    pub const fn end_addr(&self) -> u64 {
        self.end_addr
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Whether `[addr, addr + size)` lies inside this range.
    #[must_use]
    pub const fn contains(&self, addr: u64, size: u64) -> bool {
        crate::utils::area_inside_range(addr, size, self.start_addr, self.end_addr)
    }

    /// Bytes a reservation of `size` occupies in this range.
    #[must_use]
    pub const fn reserved_size(&self, size: u64) -> u64 {
        if is_power_of_two(self.page_size) {
            size
        } else {
            round_up_to_multiple(size, self.page_size)
        }
    }

    /// Reserve a block.
    ///
    /// # Errors
    /// `OutOfSpace` when no block fits, `HintUnsatisfiable` when a forced hint
    /// cannot be honoured, `InvalidArgument` for a zero size or bad alignment.
    pub fn reserve(&self, req: VaRequest) -> VmResult<u64> {
        self.lock().reserve(req)
    }

    /// Return the inclusive block `[start, end]` to the free list.
    ///
    /// # Errors
    /// `Overlap` if the block crosses a free block.
    pub fn release(&self, start: u64, end: u64) -> VmResult<()> {
        self.lock().release(start, end)
    }

    /// Snapshot of the free list in address order.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<VaBlock> {
        self.lock().blocks()
    }

    /// True when the free list is back to the single initial block.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        let list = self.lock();
        let (start, end) = list.bounds();
        list.blocks.len() == 1 && list.blocks.first_key_value() == Some((&start, &end))
    }

    fn lock(&self) -> MutexGuard<'_, VaBlockList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

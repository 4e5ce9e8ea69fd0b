#[must_use]
pub const fn is_power_of_two(val: u64) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

/// Rounds `val` up to `align`, or `None` on overflow.
#[must_use]
pub const fn checked_align_up(val: u64, align: u64) -> Option<u64> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Rounds `val` up to a multiple of `unit`, which need not be a power of two.
#[must_use]
pub const fn round_up_to_multiple(val: u64, unit: u64) -> u64 {
    val.div_ceil(unit) * unit
}

/// Whether `[addr, addr + size)` overlaps the inclusive range `[start, end]`.
#[must_use]
pub const fn area_crosses_range(addr: u64, size: u64, start: u64, end: u64) -> bool {
    let area_end = addr.saturating_add(size.saturating_sub(1));
    (addr >= start && addr <= end)
        || (area_end >= start && area_end <= end)
        || (addr < start && area_end > end)
}

/// Whether `[addr, addr + size)` lies entirely inside the inclusive range `[start, end]`.
#[must_use]
pub const fn area_inside_range(addr: u64, size: u64, start: u64, end: u64) -> bool {
    match addr.checked_add(size) {
        Some(area_end) => size != 0 && addr >= start && area_end - 1 <= end,
        None => false,
    }
}

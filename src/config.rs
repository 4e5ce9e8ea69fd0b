use crate::error::{VmError, VmResult};
use crate::utils::is_power_of_two;

pub const SZ_4K: u64 = 0x1000;
pub const SZ_2M: u64 = 0x20_0000;
pub const SZ_8M: u64 = 0x80_0000;

/// Granule for DMA segment sizes and exported ranges (host `PAGE_SIZE`).
pub const DMA_GRANULE: u64 = SZ_4K;

/// Pool granularity used when the DRAM page size is not a power of two
/// (32M/40M/48M pages are built from 8M pool units).
pub const DRAM_POOL_PAGE_SIZE: u64 = SZ_8M;

/// One MMU-managed virtual range. `end_addr` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuRange {
    pub start_addr: u64,
    pub end_addr: u64,
    pub page_size: u64,
}

impl MmuRange {
    #[must_use]
    pub const fn new(start_addr: u64, end_addr: u64, page_size: u64) -> Self {
        Self {
            start_addr,
            end_addr,
            page_size,
        }
    }
}

/// Inclusive sub-range kept free for hinted reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintReservation {
    pub start_addr: u64,
    pub end_addr: u64,
}

/// Fixed properties of the accelerator the memory manager runs on.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    /// Host (PCI) MMU range for regular host pages.
    pub pmmu: MmuRange,
    /// Host MMU range for huge pages. `None` aliases it to `pmmu`.
    pub pmmu_huge: Option<MmuRange>,
    /// Device (DRAM) MMU range.
    pub dmmu: MmuRange,

    pub dram_base_address: u64,
    pub dram_user_base_address: u64,
    pub dram_end_address: u64,
    /// DRAM page size; 0 means `dmmu.page_size`.
    pub dram_page_size: u64,
    pub device_mem_alloc_default_page_size: u64,
    pub supports_user_set_page_size: bool,

    pub dram_pci_bar_start: u64,
    pub dram_pci_bar_size: u64,
    /// Largest DMA segment the exporter hands out by default.
    pub dma_max_seg_size: u64,

    pub hints_range_reservation: bool,
    pub hints_host_reserved: Option<HintReservation>,
    pub hints_host_huge_reserved: Option<HintReservation>,
    pub hints_dram_reserved: Option<HintReservation>,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProperties {
    /// A layout with 32 GiB of DRAM behind a matching PCI BAR, 4K host pages,
    /// 2M huge host pages and 2M DRAM pages.
    #[must_use]
    pub const fn new() -> Self {
        let dram_base = 0x10_0000_0000;
        let dram_size = 0x8_0000_0000;
        Self {
            pmmu: MmuRange::new(0x8000_0000_0000, 0x8020_0000_0000, SZ_4K),
            pmmu_huge: Some(MmuRange::new(0x8020_0000_0000, 0x8040_0000_0000, SZ_2M)),
            dmmu: MmuRange::new(0x1000_0000_0000, 0x1200_0000_0000, SZ_2M),
            dram_base_address: dram_base,
            dram_user_base_address: dram_base + SZ_2M * 8,
            dram_end_address: dram_base + dram_size,
            dram_page_size: 0,
            device_mem_alloc_default_page_size: SZ_2M,
            supports_user_set_page_size: false,
            dram_pci_bar_start: 0xA0_0000_0000,
            dram_pci_bar_size: dram_size,
            dma_max_seg_size: 0x1_0000_0000,
            hints_range_reservation: false,
            hints_host_reserved: None,
            hints_host_huge_reserved: None,
            hints_dram_reserved: None,
        }
    }

    #[must_use]
    pub const fn with_host_range(mut self, range: MmuRange) -> Self {
        self.pmmu = range;
        self
    }

    #[must_use]
    pub const fn with_host_huge_range(mut self, range: Option<MmuRange>) -> Self {
        self.pmmu_huge = range;
        self
    }

    #[must_use]
    pub const fn with_dram_range(mut self, range: MmuRange) -> Self {
        self.dmmu = range;
        self
    }

    /// Sets the DRAM window. `user_base` is where user allocations start.
    #[must_use]
    pub const fn with_dram(mut self, base: u64, user_base: u64, end: u64) -> Self {
        self.dram_base_address = base;
        self.dram_user_base_address = user_base;
        self.dram_end_address = end;
        self
    }

    #[must_use]
    pub const fn with_dram_page_size(mut self, page_size: u64) -> Self {
        self.dram_page_size = page_size;
        self.device_mem_alloc_default_page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_user_page_size(mut self) -> Self {
        self.supports_user_set_page_size = true;
        self
    }

    #[must_use]
    pub const fn with_pci_bar(mut self, start: u64, size: u64) -> Self {
        self.dram_pci_bar_start = start;
        self.dram_pci_bar_size = size;
        self
    }

    #[must_use]
    pub const fn with_dma_max_seg_size(mut self, size: u64) -> Self {
        self.dma_max_seg_size = size;
        self
    }

    #[must_use]
    pub const fn with_hint_reservations(
        mut self,
        host: Option<HintReservation>,
        host_huge: Option<HintReservation>,
        dram: Option<HintReservation>,
    ) -> Self {
        self.hints_range_reservation = true;
        self.hints_host_reserved = host;
        self.hints_host_huge_reserved = host_huge;
        self.hints_dram_reserved = dram;
        self
    }

    /// Effective DRAM page size.
    #[must_use]
    pub const fn dram_page_size(&self) -> u64 {
        if self.dram_page_size != 0 {
            self.dram_page_size
        } else {
            self.dmmu.page_size
        }
    }

    /// Huge host page size, falling back to the regular host page size.
    #[must_use]
    pub const fn host_huge_page_size(&self) -> u64 {
        match self.pmmu_huge {
            Some(range) => range.page_size,
            None => self.pmmu.page_size,
        }
    }

    /// Checks that the ranges and page sizes describe a usable device.
    ///
    /// # Errors
    /// Returns `VmError::Config` naming the first inconsistent property.
    pub fn validate(&self) -> VmResult<()> {
        let ranges = [
            ("host", Some(self.pmmu)),
            ("host huge", self.pmmu_huge),
            ("dram", Some(self.dmmu)),
        ];
        for (name, range) in ranges {
            let Some(range) = range else { continue };
            if range.page_size == 0 {
                return Err(VmError::Config(format!("{name} range has a zero page size")));
            }
            if range.start_addr >= range.end_addr {
                return Err(VmError::Config(format!(
                    "{name} range {:#x}-{:#x} is empty",
                    range.start_addr, range.end_addr
                )));
            }
        }

        if !is_power_of_two(self.pmmu.page_size) || !is_power_of_two(self.host_huge_page_size()) {
            return Err(VmError::Config("host page sizes must be powers of two".into()));
        }

        if self.dram_user_base_address < self.dram_base_address
            || self.dram_user_base_address >= self.dram_end_address
        {
            return Err(VmError::Config(format!(
                "DRAM user base {:#x} is outside DRAM {:#x}-{:#x}",
                self.dram_user_base_address, self.dram_base_address, self.dram_end_address
            )));
        }

        if self.device_mem_alloc_default_page_size == 0 {
            return Err(VmError::Config("default allocation page size is zero".into()));
        }

        Ok(())
    }
}

/// Flags controlling allocation and mapping behaviour.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemFlags {
    pub contiguous: bool,
    pub shared: bool,
    pub force_hint: bool,
    pub prefetch: bool,
}

impl MemFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    #[must_use]
    pub const fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    #[must_use]
    pub const fn force_hint(mut self) -> Self {
        self.force_hint = true;
        self
    }

    #[must_use]
    pub const fn prefetch(mut self) -> Self {
        self.prefetch = true;
        self
    }
}

/// DMA constraints of a peer importing exported device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDevice {
    pub max_segment_size: u64,
    pub peer_to_peer: bool,
}

impl PeerDevice {
    #[must_use]
    pub const fn new(max_segment_size: u64) -> Self {
        Self {
            max_segment_size,
            peer_to_peer: true,
        }
    }

    #[must_use]
    pub const fn without_p2p(mut self) -> Self {
        self.peer_to_peer = false;
        self
    }
}

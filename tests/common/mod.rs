#![allow(dead_code)]

use accel_vm::host::{HostError, HostMemory, SgEntry};
use accel_vm::mmu::SoftMmu;
use accel_vm::{Device, DeviceProperties};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const SZ_4K: u64 = 0x1000;
pub const SZ_2M: u64 = 0x20_0000;
pub const DRAM: u64 = 0x10_0000_0000;

/// Identity-mapped host that only counts pins.
#[derive(Default)]
pub struct CountingHost {
    pub pinned: AtomicU64,
}

impl HostMemory for CountingHost {
    fn page_size(&self) -> u64 {
        SZ_4K
    }

    fn pin_pages(&self, start: u64, npages: u64) -> Result<Vec<u64>, HostError> {
        self.pinned.fetch_add(npages, Ordering::SeqCst);
        Ok((0..npages).map(|i| start + i * SZ_4K).collect())
    }

    fn unpin_pages(&self, pages: &[u64]) {
        self.pinned.fetch_sub(pages.len() as u64, Ordering::SeqCst);
    }

    fn dma_map(&self, sg: &mut [SgEntry]) -> Result<(), HostError> {
        for entry in sg {
            entry.dma_addr = entry.phys_addr;
        }
        Ok(())
    }

    fn dma_unmap(&self, _sg: &[SgEntry]) {}
}

/// 128 MiB of DRAM exposed through a matching BAR.
pub fn props() -> DeviceProperties {
    DeviceProperties::new()
        .with_dram(DRAM, DRAM, DRAM + 64 * SZ_2M)
        .with_pci_bar(0xA0_0000_0000, 64 * SZ_2M)
}

pub fn device() -> (Arc<SoftMmu>, Arc<CountingHost>, Arc<Device>) {
    let mmu = Arc::new(SoftMmu::new());
    let host = Arc::new(CountingHost::default());
    let dyn_host: Arc<dyn HostMemory> = host.clone();
    let dev = Device::new(props(), mmu.clone(), dyn_host).unwrap();
    (mmu, host, dev)
}

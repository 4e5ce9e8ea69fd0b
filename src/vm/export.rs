use super::context::ContextInner;
use super::pack::PhysPagePack;
use crate::config::{DMA_GRANULE, DeviceProperties, PeerDevice};
use crate::error::{VmError, VmResult};
use crate::utils::align_down;
use log::{debug, error, trace};
use std::sync::Arc;

/// One physically contiguous DMA segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u64,
}

/// Walks the pages of an exported range and yields maximal segments.
///
/// A segment ends where the next page does not follow the previous one
/// physically or where it reaches `max_segment_size`.
struct SegmentWalker<'a> {
    pages: &'a [u64],
    page_size: u64,
    max_segment_size: u64,
    index: usize,
    /// Next byte to emit.
    cursor: u64,
    /// Bytes left in the current page.
    page_left: u64,
    /// Bytes left in the exported range.
    remaining: u64,
}

impl<'a> SegmentWalker<'a> {
    fn new(
        pages: &'a [u64],
        page_size: u64,
        exported_size: u64,
        offset: u64,
        max_segment_size: u64,
    ) -> VmResult<Self> {
        let index = usize::try_from(offset / page_size).unwrap_or(usize::MAX);
        let Some(&first) = pages.get(index) else {
            return Err(VmError::InternalConsistency(format!(
                "offset {offset:#x} is past the last of {} pages",
                pages.len()
            )));
        };
        let in_page = offset % page_size;

        Ok(Self {
            pages,
            page_size,
            max_segment_size,
            index,
            cursor: first + in_page,
            page_left: page_size - in_page,
            remaining: exported_size,
        })
    }
}

impl Iterator for SegmentWalker<'_> {
    type Item = VmResult<DmaSegment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let mut seg = DmaSegment {
            addr: self.cursor,
            len: 0,
        };

        loop {
            let chunk = self
                .page_left
                .min(self.remaining)
                .min(self.max_segment_size - seg.len);
            seg.len += chunk;
            self.cursor += chunk;
            self.page_left -= chunk;
            self.remaining -= chunk;

            if self.remaining == 0 {
                break;
            }

            if self.page_left == 0 {
                self.index += 1;
                let Some(&next) = self.pages.get(self.index) else {
                    let left = std::mem::take(&mut self.remaining);
                    return Some(Err(VmError::InternalConsistency(format!(
                        "ran out of pages with {left:#x} bytes left"
                    ))));
                };
                let contiguous = next == self.cursor;
                self.cursor = next;
                self.page_left = self.page_size;
                if !contiguous {
                    break;
                }
            }

            if seg.len == self.max_segment_size {
                break;
            }
        }

        Some(Ok(seg))
    }
}

/// Split `exported_size` bytes starting `offset` bytes into `pages` into
/// DMA segments no larger than `max_segment_size`.
///
/// # Errors
/// * `Config` if `max_segment_size` is below the DMA granule.
/// * `InvalidArgument` for an empty range.
/// * `InternalConsistency` if the pages do not cover the range.
pub fn build_segments(
    pages: &[u64],
    page_size: u64,
    exported_size: u64,
    offset: u64,
    max_segment_size: u64,
) -> VmResult<Vec<DmaSegment>> {
    let max_segment_size = align_down(max_segment_size, DMA_GRANULE);
    if max_segment_size < DMA_GRANULE {
        return Err(VmError::Config(format!(
            "max DMA segment size must be at least {DMA_GRANULE:#x}"
        )));
    }
    if exported_size == 0 || page_size == 0 {
        return Err(VmError::InvalidArgument("cannot export an empty range".into()));
    }

    let walker = || SegmentWalker::new(pages, page_size, exported_size, offset, max_segment_size);

    let nents = walker()?.try_fold(0usize, |n, seg| seg.map(|_| n + 1))?;

    let mut segments = Vec::with_capacity(nents);
    let mut left = exported_size;
    for seg in walker()? {
        let seg = seg?;
        trace!("dma segment {:#x}+{:#x}", seg.addr, seg.len);
        left -= seg.len;
        segments.push(seg);
    }

    if left != 0 {
        error!("{left:#x} bytes of the exported range were not covered");
        return Err(VmError::InternalConsistency(format!(
            "export left {left:#x} bytes uncovered"
        )));
    }

    Ok(segments)
}

/// Reject packs with pages the PCI BAR does not expose.
pub(crate) fn check_pages_in_bar(pack: &PhysPagePack, props: &DeviceProperties) -> VmResult<()> {
    for &page in pack.pages() {
        let inside = page
            .checked_sub(props.dram_base_address)
            .and_then(|off| off.checked_add(pack.page_size()))
            .is_some_and(|end| end <= props.dram_pci_bar_size);
        if !inside {
            error!(
                "DRAM page {page:#x} is outside the PCI BAR of size {:#x}",
                props.dram_pci_bar_size
            );
            return Err(VmError::InvalidArgument(format!(
                "page {page:#x} cannot be exposed through the PCI BAR"
            )));
        }
    }
    Ok(())
}

/// A live export of part of a device mapping.
///
/// While a `DmaBuf` exists the mapping it was created from cannot be unmapped
/// and its context stays alive.
pub struct DmaBuf {
    ctx: Arc<ContextInner>,
    vaddr: u64,
    pack: Arc<PhysPagePack>,
    offset: u64,
    size: u64,
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("asid", &self.ctx.asid())
            .field("vaddr", &format_args!("{:#x}", self.vaddr))
            .field("handle", &format_args!("{:#x}", self.pack.handle()))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl DmaBuf {
    pub(crate) fn new(
        ctx: Arc<ContextInner>,
        vaddr: u64,
        pack: Arc<PhysPagePack>,
        offset: u64,
        size: u64,
    ) -> Self {
        debug!(
            "exporting {size:#x} bytes at offset {offset:#x} of {vaddr:#x}, asid {}",
            ctx.asid()
        );
        Self {
            ctx,
            vaddr,
            pack,
            offset,
            size,
        }
    }

    /// Device virtual address of the exported mapping.
    #[must_use]
    pub const fn vaddr(&self) -> u64 {
        self.vaddr
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Handle of the exported allocation.
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.pack.handle()
    }

    /// DRAM segments of the export, split at the device's maximum segment size.
    ///
    /// # Errors
    /// See [`build_segments`].
    pub fn segments(&self) -> VmResult<Vec<DmaSegment>> {
        build_segments(
            self.pack.pages(),
            self.pack.page_size(),
            self.size,
            self.offset,
            self.ctx.device().properties().dma_max_seg_size,
        )
    }

    /// Segments as the peer sees them: PCI BAR bus addresses split at the
    /// peer's maximum segment size.
    ///
    /// # Errors
    /// `PermissionDenied` if the peer cannot do peer-to-peer DMA, otherwise
    /// see [`build_segments`].
    pub fn map_for(&self, peer: &PeerDevice) -> VmResult<Vec<DmaSegment>> {
        if !peer.peer_to_peer {
            error!("peer device does not support peer-to-peer DMA");
            return Err(VmError::PermissionDenied {
                handle: self.pack.handle(),
                asid: self.ctx.asid(),
            });
        }

        let props = self.ctx.device().properties();
        let mut segments = build_segments(
            self.pack.pages(),
            self.pack.page_size(),
            self.size,
            self.offset,
            peer.max_segment_size,
        )?;
        for seg in &mut segments {
            seg.addr = props.dram_pci_bar_start + (seg.addr - props.dram_base_address);
        }
        Ok(segments)
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        self.ctx.put_export(self.vaddr);
    }
}

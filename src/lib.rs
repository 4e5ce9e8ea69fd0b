//! Device memory management for an accelerator with its own MMU.

pub mod config;
pub mod error;
pub mod host;
pub mod mmu;
pub mod utils;
pub mod vm;

pub use config::{DeviceProperties, MemFlags, MmuRange, PeerDevice};
pub use error::{VmError, VmResult};
pub use vm::{Context, Device, DmaBuf, DmaSegment, Handle, MapSource, VaRangeKind};

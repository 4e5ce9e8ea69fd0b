use crate::host::HostError;
use crate::mmu::MmuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("No free virtual address block of size {size:#x} in the {range} range")]
    OutOfSpace { range: &'static str, size: u64 },

    #[error("Out of device memory: cannot allocate {size:#x} bytes")]
    OutOfMemory { size: u64 },

    #[error("Hint address {hint:#x} cannot be respected")]
    HintUnsatisfiable { hint: u64 },

    #[error("Block {start:#x}-{end:#x} crosses a free block {block_start:#x}-{block_end:#x}")]
    Overlap {
        start: u64,
        end: u64,
        block_start: u64,
        block_end: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Host range {addr:#x} + {size:#x} is invalid")]
    InvalidRange { addr: u64, size: u64 },

    #[error("No allocation matches handle {0:#x}")]
    InvalidHandle(u64),

    #[error("Handle {0:#x} is mapped, cannot free")]
    StillMapped(u64),

    #[error("Device address {0:#x} is exported")]
    Exported(u64),

    #[error("Device address {0:#x} is not mapped")]
    NotMapped(u64),

    #[error("Handle {handle:#x} is not shared with ASID {asid}")]
    PermissionDenied { handle: u64, asid: u32 },

    #[error("Pinned {pinned} of {requested} host pages at {addr:#x}")]
    PinFailed {
        addr: u64,
        requested: u64,
        pinned: u64,
    },

    #[error("MMU Error: {0}")]
    Hardware(#[from] MmuError),

    #[error("Host memory Error: {0}")]
    Host(#[from] HostError),

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),
}

// A convenient alias
pub type VmResult<T> = Result<T, VmError>;

//! Error type shared by every fallible engine operation that does not run guest code.
//!
//! The run loop itself never returns this type; see [`crate::vmm::Disposition`].

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("CPU is not supported")]
    CPUUnsupported,

    #[error("VMX is not supported")]
    VMXUnsupported,

    #[error("VMX is locked off in IA32_FEATURE_CONTROL")]
    VMXBIOSLock,

    #[error("VMX root mode is already enabled on this core")]
    AlreadyInRootMode,

    #[error("VMX root mode is not enabled on this core")]
    NotInRootMode,

    #[error("VMXON was rejected by the processor")]
    RootModeEntryFailed,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("out of memory")]
    OutOfMemory,

    #[error("requested VMX controls {requested:#x} not allowed by {msr:#x}")]
    UnsupportedControls { msr: u32, requested: u32 },

    #[error("VMCLEAR failed")]
    VmcsClearFailed,

    #[error("VMPTRLD failed")]
    VmcsPtrLoadFailed,

    #[error("a different control block is already active on core {0}")]
    ControlBlockBusy(u32),

    #[error("control block is not allocated")]
    ControlBlockNotAllocated,

    #[error("unknown MSR {0:#x} in the autoload area")]
    UnknownAutoloadMsr(u32),

    #[error("real mode cannot run without a virtual-8086 TSS")]
    RealModeTssMissing,

    #[error("INVEPT failed")]
    InveptFailed,

    #[error("INVVPID failed")]
    InvvpidFailed,

    #[error("operation not valid in the current run state")]
    InvalidRunState,
}

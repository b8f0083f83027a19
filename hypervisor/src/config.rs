//! Engine-wide constants and the per-VM tuning knobs.

/// Size of every page handed to the engine.
pub const PAGE_SIZE: usize = 0x1000;

/// Number of 16-byte entries that fit in one autoload MSR page.
pub const MAX_AUTOLOAD_MSRS: usize = PAGE_SIZE / 16;

/// The MSR permission bitmap is a single page.
pub const VMX_MSR_BITMAP_SIZE: usize = PAGE_SIZE;

/// Offset of the task priority register inside the virtual-APIC page.
pub const VIRTUAL_APIC_TPR_OFFSET: usize = 0x80;

/// Size of the real-mode TSS including the interrupt redirection and I/O bitmaps.
pub const REAL_MODE_TSS_SIZE: u32 = 0x68 + 32 + 0x2000 + 1;

/// Tunables handed to [`crate::intel::vm::VirtualMachine::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of immediate resumes before the run loop yields back to the caller.
    pub max_resume_loops: u32,

    /// Exclusive upper bound of the rotating VPID. Clamped to 16 bits at setup.
    pub max_asid: u32,

    /// Pages a shootdown queue holds before degrading to a full flush.
    pub shootdown_capacity: usize,

    /// Intercept every guest exception.
    pub trap_all_exceptions: bool,

    /// A host debugger owns the debug registers.
    pub host_debugging: bool,

    /// Use EPT when the processor offers it.
    pub allow_nested_paging: bool,

    /// Use VPID tagging when EPT is not in use and the processor offers it.
    pub allow_vpid: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_resume_loops: 1024,
            max_asid: 256,
            shootdown_capacity: 16,
            trap_all_exceptions: cfg!(feature = "strict"),
            host_debugging: false,
            allow_nested_paging: true,
            allow_vpid: true,
        }
    }
}

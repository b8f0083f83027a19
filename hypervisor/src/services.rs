//! Interfaces to the components the engine consumes but does not implement.
//!
//! Each VCPU thread hands `run_guest_code` one object implementing
//! [`VcpuServices`]. Calls into these traits only ever happen outside the
//! interrupt-disabled world-switch window, so implementations may block.

use {
    crate::intel::{context::GuestCpuContext, vmerror::ExceptionInterrupt},
    bitflags::bitflags,
};

/// How a queued trap entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// External interrupt from the virtual interrupt controller.
    HardwareInterrupt,
    /// CPU exception raised by emulation.
    Exception,
    /// `INT n` / `INT3` / `INTO` from the interpreter.
    SoftwareInterrupt,
}

/// One event waiting in the trap queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTrap {
    pub vector: u8,
    pub kind: TrapKind,
    pub error_code: Option<u32>,
    /// New CR2 for a page fault.
    pub fault_address: Option<u64>,
    /// Length of the instruction that raised a software interrupt.
    pub instruction_length: u32,
}

impl QueuedTrap {
    pub const fn interrupt(vector: u8) -> Self {
        Self {
            vector,
            kind: TrapKind::HardwareInterrupt,
            error_code: None,
            fault_address: None,
            instruction_length: 0,
        }
    }

    pub const fn exception(vector: ExceptionInterrupt, error_code: Option<u32>) -> Self {
        Self {
            vector: vector as u8,
            kind: TrapKind::Exception,
            error_code,
            fault_address: None,
            instruction_length: 0,
        }
    }
}

/// Snapshot of the virtual local APIC's task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TprState {
    pub tpr: u8,
    /// Highest pending interrupt vector, if any.
    pub pending_vector: Option<u8>,
}

/// The interrupt/trap queue plus the virtual interrupt controller behind it.
pub trait TrapQueue {
    fn has_trap(&self) -> bool;
    fn query_trap(&self) -> Option<QueuedTrap>;
    fn assert_trap(&mut self, trap: QueuedTrap);
    fn reset_trap(&mut self);

    fn nmi_pending(&self) -> bool;
    fn take_nmi(&mut self);

    /// A maskable interrupt is waiting in the virtual PIC/APIC.
    fn interrupt_pending(&self) -> bool;
    /// Acknowledges the highest priority interrupt and returns its vector.
    fn get_interrupt(&mut self) -> Option<u8>;

    /// `None` when the VM has no local APIC.
    fn tpr(&mut self) -> Option<TprState>;
    fn set_tpr(&mut self, tpr: u8);
    /// Guest-physical base of the local APIC's MMIO page.
    fn apic_base(&self) -> u64;
}

/// Outcome of a guest page or nested-paging fault handed to the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping fixed, retry the instruction.
    Resolved,
    /// The guest itself must see the fault.
    Reflect,
    /// The access targets something only an instruction emulator can service.
    Emulate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryError {
    pub address: u64,
}

/// The physical address space of the VM.
pub trait GuestMemory {
    fn read_phys(&mut self, gpa: u64, buffer: &mut [u8]) -> Result<(), MemoryError>;
    fn write_phys(&mut self, gpa: u64, buffer: &[u8]) -> Result<(), MemoryError>;

    fn handle_nested_fault(&mut self, gpa: u64, error_code: u32, ctx: &mut GuestCpuContext) -> FaultOutcome;
    fn handle_nested_misconfig(&mut self, gpa: u64, ctx: &mut GuestCpuContext) -> FaultOutcome;
    /// Shadow-paging #PF at `address`.
    fn handle_shadow_fault(&mut self, address: u64, error_code: u32, ctx: &mut GuestCpuContext) -> FaultOutcome;

    /// Root of the shadow page tables used without nested paging.
    fn shadow_cr3(&self) -> u64;
    /// Identity map loaded while a guest without nested paging runs with paging off.
    fn identity_cr3(&self) -> u64;
    /// EPT pointer for this VM.
    fn eptp(&self) -> u64;
    /// Guest-physical address of the TSS used for virtual-8086 emulation of real mode.
    fn real_mode_tss(&self) -> Option<u64>;

    /// Paging-relevant control register changed (CR0, CR3 or CR4).
    fn control_register_changed(&mut self, register: u8, ctx: &GuestCpuContext);
}

/// Instruction exits the engine forwards instead of emulating itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionExit {
    Cpuid,
    Rdtsc,
    Rdtscp,
    Rdpmc,
    Invlpg(u64),
    Rdmsr,
    Wrmsr,
    Monitor,
    Mwait,
    /// #GP in the virtual-8086 rendition of real mode, with its error code. The
    /// faulting instruction is usually IOPL-sensitive (CLI, STI, PUSHF, POPF, INT n, IRET).
    GeneralProtection(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationOutcome {
    /// Instruction done. The engine advances RIP past it, which it can only do for
    /// exits that report an instruction length.
    Emulated,
    /// Instruction done and the emulator already moved RIP.
    Completed,
    /// Raise this exception in the guest instead.
    Fault(ExceptionInterrupt, Option<u32>),
    /// Emulator could not handle it; the caller must interpret the instruction.
    Failed,
}

/// Instruction-level emulation helpers.
///
/// Any state the emulator changes in `ctx` is loaded on the next entry.
pub trait InstructionEmulator {
    /// [`InstructionExit::GeneralProtection`] has no instruction length; the emulator decodes
    /// the instruction, moves RIP itself and answers [`EmulationOutcome::Completed`].
    fn emulate_instruction(&mut self, exit: InstructionExit, ctx: &mut GuestCpuContext) -> EmulationOutcome;
    /// Emulates the instruction at RIP which touched MMIO at `gpa`.
    ///
    /// EPT and APIC-access exits carry no instruction length, so the emulator moves RIP
    /// itself and answers [`EmulationOutcome::Completed`].
    fn emulate_mmio(&mut self, gpa: u64, ctx: &mut GuestCpuContext) -> EmulationOutcome;

    fn guest_fpu_active(&self) -> bool;
    /// Loads the guest FPU state. Returns false if it was already loaded.
    fn activate_guest_fpu(&mut self) -> bool;
}

/// Result of a port access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome<T = ()> {
    Done(T),
    /// Forward the access to the caller.
    Deferred,
}

/// Decoded port I/O exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    /// Access width in bytes: 1, 2 or 4.
    pub size: u8,
    pub input: bool,
    pub string: bool,
    pub rep: bool,
}

/// Port I/O dispatch.
pub trait IoPorts {
    fn read_port(&mut self, port: u16, size: u8) -> IoOutcome<u32>;
    fn write_port(&mut self, port: u16, size: u8, value: u32) -> IoOutcome;
    /// INS/OUTS, with RSI/RDI/RCX updated on `Done`.
    fn string_io(&mut self, access: IoAccess, ctx: &mut GuestCpuContext) -> IoOutcome;
}

/// Virtual time.
pub trait TimerService {
    /// Runs expired timers; true if one fired and the caller should service it.
    fn poll_timers(&mut self) -> bool;
    /// Offset to add to the host TSC, `None` when reads must be intercepted.
    fn tsc_offset(&self) -> Option<u64>;
    /// Highest TSC value the guest has observed.
    fn last_guest_tsc(&self) -> u64;
    /// TSC ticks until the next timer deadline.
    fn ticks_to_deadline(&self) -> Option<u64>;
}

bitflags! {
    /// Work the VM or VCPU needs done by the host before the guest may run again.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ActionFlags: u32 {
        const POOL_FLUSH = 1 << 0;
        const DMA = 1 << 1;
        const REQUEST = 1 << 2;
        const PAGE_TABLE_SYNC = 1 << 3;
        const RESET = 1 << 4;
    }
}

/// Pending-action flags of the surrounding VM and VCPU.
pub trait ForcedActions {
    fn pending_actions(&self) -> ActionFlags;
    fn single_stepping(&self) -> bool;
}

/// Everything one VCPU needs from the outside world.
pub trait VcpuServices: TrapQueue + GuestMemory + InstructionEmulator + IoPorts + TimerService + ForcedActions {}

impl<T> VcpuServices for T where T: TrapQueue + GuestMemory + InstructionEmulator + IoPorts + TimerService + ForcedActions {}

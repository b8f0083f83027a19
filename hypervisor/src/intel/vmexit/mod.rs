//! VM-exit dispatch.
//!
//! Every handler gets the decoded [`ExitRecord`] plus mutable access to the VCPU,
//! the hardware and the services, and answers with an [`ExitType`]. Handlers never
//! re-enter the guest themselves; the run loop folds their answer into a resume
//! or a return to the caller.

pub mod apic;
pub mod cr;
pub mod dr;
pub mod ept;
pub mod exception;
pub mod instructions;
pub mod io;

use {
    crate::{
        intel::{
            context::GuestCpuContext,
            diagnostics::dump_vmcs_state,
            events::{reflect_exception, set_interrupt_window, Reflection},
            support::VmxSupport,
            vcpu::VirtualCpu,
            vmerror::{ExceptionInterrupt, VmxBasicExitReason, EXIT_REASON_ENTRY_FAILURE},
        },
        services::VcpuServices,
        vmm::Disposition,
    },
    log::*,
    x86::vmx::vmcs,
};

/// What the run loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// The instruction was handled; skip it and resume.
    IncrementRIP,
    /// Resume at the current RIP.
    Continue,
    /// Leave the loop.
    Return(Disposition),
}

/// The exit-information fields of one VM exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitRecord {
    /// Full exit reason, including the entry-failure bit.
    pub reason: u32,
    pub qualification: u64,
    pub instruction_length: u32,
    pub instruction_info: u32,
    pub interruption_info: u32,
    pub interruption_error_code: u32,
    pub idt_vectoring_info: u32,
    pub idt_vectoring_error_code: u32,
    pub guest_linear_address: u64,
    pub guest_physical_address: u64,
}

impl ExitRecord {
    /// Decodes the exit fields from the VCPU's field cache.
    pub fn read<S: VmxSupport>(vcpu: &VirtualCpu, support: &mut S) -> Self {
        let cache = &vcpu.field_cache;
        Self {
            reason: cache.read(support, vmcs::ro::EXIT_REASON) as u32,
            qualification: cache.read(support, vmcs::ro::EXIT_QUALIFICATION),
            instruction_length: cache.read(support, vmcs::ro::VMEXIT_INSTRUCTION_LEN) as u32,
            instruction_info: cache.read(support, vmcs::ro::VMEXIT_INSTRUCTION_INFO) as u32,
            interruption_info: cache.read(support, vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32,
            interruption_error_code: cache.read(support, vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32,
            idt_vectoring_info: cache.read(support, vmcs::ro::IDT_VECTORING_INFO) as u32,
            idt_vectoring_error_code: cache.read(support, vmcs::ro::IDT_VECTORING_ERR_CODE) as u32,
            guest_linear_address: cache.read(support, vmcs::ro::GUEST_LINEAR_ADDR),
            guest_physical_address: cache.read(support, vmcs::ro::GUEST_PHYSICAL_ADDR_FULL),
        }
    }

    pub fn basic_reason(&self) -> Option<VmxBasicExitReason> {
        VmxBasicExitReason::from_u32(self.reason)
    }

    pub fn is_entry_failure(&self) -> bool {
        self.reason & EXIT_REASON_ENTRY_FAILURE != 0
    }

    pub fn idt_vectoring_valid(&self) -> bool {
        self.idt_vectoring_info & (1 << 31) != 0
    }

    /// A host interrupt arrived and no event delivery was cut short.
    pub fn is_plain_external_interrupt(&self) -> bool {
        self.basic_reason() == Some(VmxBasicExitReason::ExternalInterrupt) && !self.idt_vectoring_valid()
    }
}

/// Everything a handler may touch while servicing one exit.
pub struct ExitContext<'a, S: VmxSupport, V: VcpuServices + ?Sized> {
    pub vcpu: &'a mut VirtualCpu,
    pub support: &'a mut S,
    pub services: &'a mut V,
    pub ctx: &'a mut GuestCpuContext,
    pub exit: ExitRecord,
}

impl<S: VmxSupport, V: VcpuServices + ?Sized> ExitContext<'_, S, V> {
    /// Raises an exception in the guest, merging it with any event the exit interrupted.
    pub fn raise(&mut self, vector: ExceptionInterrupt, error_code: u32) -> ExitType {
        let interrupted = self.vcpu.pending_event.take();

        match reflect_exception(vector as u8, error_code, interrupted) {
            Reflection::Inject(event) => {
                self.vcpu.pending_event = Some(event);
                ExitType::Continue
            }
            Reflection::TripleFault => {
                debug!("Exception {:?} during #DF delivery, guest triple faults", vector);
                ExitType::Return(Disposition::ResetRequested)
            }
        }
    }

    /// A service had mutable access to the guest context, so reload all of it on the next entry.
    pub fn context_handed_out(&mut self) {
        self.vcpu.mark_all_dirty();
    }

    /// Moves RIP past the exiting instruction.
    pub fn advance_rip(&mut self) {
        let rip = self.ctx.regs.rip.wrapping_add(self.exit.instruction_length as u64);
        self.ctx.regs.rip = if self.ctx.is_64bit_code() { rip } else { rip & 0xFFFF_FFFF };
    }
}

/// Routes one VM exit to its handler.
pub fn dispatch<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let reason = exit_ctx.exit.reason;

    let Some(basic_reason) = exit_ctx.exit.basic_reason() else {
        error!("Unknown exit reason: {:#x}", reason);
        return ExitType::Return(Disposition::UnexpectedExit(reason));
    };

    trace!("VM exit {:?} at RIP {:#x}", basic_reason, exit_ctx.ctx.regs.rip);

    match basic_reason {
        VmxBasicExitReason::ExceptionOrNmi => exception::handle_exception_or_nmi(exit_ctx),
        // The host takes the interrupt as soon as interrupts are re-enabled.
        VmxBasicExitReason::ExternalInterrupt => ExitType::Return(Disposition::InterruptPending),
        VmxBasicExitReason::TripleFault => {
            debug!("Guest triple fault at RIP {:#x}", exit_ctx.ctx.regs.rip);
            ExitType::Return(Disposition::ResetRequested)
        }
        VmxBasicExitReason::InterruptWindow => {
            set_interrupt_window(exit_ctx.vcpu, exit_ctx.support, false);
            ExitType::Continue
        }
        VmxBasicExitReason::TaskSwitch => ExitType::Return(Disposition::Interpret),
        VmxBasicExitReason::Cpuid
        | VmxBasicExitReason::Rdtsc
        | VmxBasicExitReason::Rdtscp
        | VmxBasicExitReason::Rdpmc
        | VmxBasicExitReason::Invlpg
        | VmxBasicExitReason::Rdmsr
        | VmxBasicExitReason::Wrmsr
        | VmxBasicExitReason::Monitor
        | VmxBasicExitReason::Mwait => instructions::handle_delegated_instruction(exit_ctx, basic_reason),
        VmxBasicExitReason::Hlt => instructions::handle_hlt(exit_ctx),
        VmxBasicExitReason::Invd | VmxBasicExitReason::WbinvdOrWbnoinvd => ExitType::IncrementRIP,
        VmxBasicExitReason::Xsetbv => ExitType::Return(Disposition::EmulateInstruction),
        VmxBasicExitReason::ControlRegisterAccesses => cr::handle_cr_access(exit_ctx),
        VmxBasicExitReason::MovDr => dr::handle_mov_dr(exit_ctx),
        VmxBasicExitReason::IoInstruction => io::handle_io_instruction(exit_ctx),
        VmxBasicExitReason::TprBelowThreshold => apic::handle_tpr_below_threshold(exit_ctx),
        VmxBasicExitReason::ApicAccess => apic::handle_apic_access(exit_ctx),
        VmxBasicExitReason::EptViolation => ept::handle_ept_violation(exit_ctx),
        VmxBasicExitReason::EptMisconfiguration => ept::handle_ept_misconfiguration(exit_ctx),
        VmxBasicExitReason::VmxPreemptionTimerExpired => {
            if exit_ctx.services.poll_timers() {
                ExitType::Return(Disposition::TimerPending)
            } else {
                ExitType::Continue
            }
        }
        VmxBasicExitReason::VmEntryFailureInvalidGuestState => {
            dump_vmcs_state(exit_ctx.support);
            ExitType::Return(Disposition::InvalidGuestState)
        }
        VmxBasicExitReason::VmEntryFailureMsrLoading => ExitType::Return(Disposition::MsrLoadFailed),
        VmxBasicExitReason::Vmcall
        | VmxBasicExitReason::Vmclear
        | VmxBasicExitReason::Vmlaunch
        | VmxBasicExitReason::Vmptrld
        | VmxBasicExitReason::Vmptrst
        | VmxBasicExitReason::Vmread
        | VmxBasicExitReason::Vmresume
        | VmxBasicExitReason::Vmwrite
        | VmxBasicExitReason::Vmxoff
        | VmxBasicExitReason::Vmxon
        | VmxBasicExitReason::Invept
        | VmxBasicExitReason::Invvpid
        | VmxBasicExitReason::Vmfunc => {
            debug!("Guest executed VMX instruction {:?}", basic_reason);
            ExitType::Return(Disposition::UnexpectedExit(reason))
        }
        _ => {
            warn!("Unhandled VM exit {:?} ({:#x})", basic_reason, reason);
            ExitType::Return(Disposition::UnexpectedExit(reason))
        }
    }
}

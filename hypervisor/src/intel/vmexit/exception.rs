//! Module handling VM exits due to exceptions or non-maskable interrupts (NMIs).

use {
    crate::{
        intel::{
            dirty::GuestStateChanges,
            events::{EventInjection, PendingEvent},
            support::VmxSupport,
            vmerror::{ExceptionInterrupt, InterruptionType},
            vmexit::{instructions::decoded_emulation_result, ExitContext, ExitType},
        },
        services::{FaultOutcome, InstructionExit, VcpuServices},
        vmm::Disposition,
    },
    log::*,
    x86_64::registers::control::Cr0Flags,
};

/// DR6 bits that read as one.
const DR6_FIXED_ONES: u64 = 0xFFFF_0FF0;

/// Handles an exception or NMI raised while the guest ran.
///
/// Faults the engine can resolve (a lazily loaded FPU, a shadow page fault) are
/// resolved; everything else is reflected back into the guest.
pub fn handle_exception_or_nmi<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let info = EventInjection(exit_ctx.exit.interruption_info);
    let error_code = exit_ctx.exit.interruption_error_code;
    let vector = info.get_vector() as u8;
    let rip = exit_ctx.ctx.regs.rip;

    match InterruptionType::from_u32(info.get_type()) {
        Some(InterruptionType::NonMaskableInterrupt) => {
            // A host NMI; the host handles it once we are back in root mode.
            debug!("NMI received at RIP {:#x}", rip);
            return ExitType::Return(Disposition::InterruptPending);
        }
        Some(InterruptionType::SoftwareException) => {
            trace!("Software exception {} at RIP {:#x}, re-injecting", vector, rip);
            exit_ctx.vcpu.pending_event = Some(PendingEvent::new(EventInjection::software_interrupt(vector), 0, exit_ctx.exit.instruction_length));
            return ExitType::Continue;
        }
        _ => {}
    }

    let Some(exception) = ExceptionInterrupt::from_u32(vector as u32) else {
        error!("Invalid exception vector: {}", vector);
        return ExitType::Return(Disposition::InternalError);
    };

    trace!("Exception {:?} at RIP {:#x}, error_code={:#x}", exception, rip, error_code);

    match exception {
        ExceptionInterrupt::DeviceNotAvailable => handle_device_not_available(exit_ctx),
        ExceptionInterrupt::PageFault => handle_page_fault(exit_ctx, error_code),
        ExceptionInterrupt::GeneralProtectionFault if exit_ctx.vcpu.real_mode.emulating => handle_v86_general_protection(exit_ctx, error_code),
        ExceptionInterrupt::Debug => handle_debug(exit_ctx),
        ExceptionInterrupt::X87FloatingPoint if !exit_ctx.ctx.cr0_flags().contains(Cr0Flags::NUMERIC_ERROR) => {
            // Legacy FERR#/IRQ 13 reporting is the interrupt controller's business.
            ExitType::Return(Disposition::GuestTrap)
        }
        ExceptionInterrupt::MachineCheck => {
            warn!("Machine check while the guest ran at RIP {:#x}", rip);
            ExitType::Return(Disposition::InterruptPending)
        }
        _ => exit_ctx.raise(exception, error_code),
    }
}

/// First FPU use since the guest was scheduled in.
fn handle_device_not_available<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    if exit_ctx.services.activate_guest_fpu() {
        trace!("Guest FPU state loaded");
        exit_ctx.vcpu.mark_dirty(GuestStateChanges::CR0);
        return ExitType::Continue;
    }

    // The guest FPU is already live, so the guest set CR0.TS or CR0.EM itself.
    exit_ctx.raise(ExceptionInterrupt::DeviceNotAvailable, 0)
}

/// #GP raised by an IOPL-sensitive instruction while real mode runs as virtual-8086.
fn handle_v86_general_protection<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, error_code: u32) -> ExitType {
    let outcome = exit_ctx.services.emulate_instruction(InstructionExit::GeneralProtection(error_code), exit_ctx.ctx);
    trace!("Real-mode #GP at RIP {:#x}: {:?}", exit_ctx.ctx.regs.rip, outcome);
    decoded_emulation_result(exit_ctx, outcome)
}

/// #PF is only intercepted for shadow paging.
fn handle_page_fault<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, error_code: u32) -> ExitType {
    let address = exit_ctx.exit.qualification;

    let outcome = exit_ctx.services.handle_shadow_fault(address, error_code, exit_ctx.ctx);
    exit_ctx.context_handed_out();

    match outcome {
        FaultOutcome::Resolved => ExitType::Continue,
        FaultOutcome::Reflect => {
            exit_ctx.ctx.regs.cr2 = address;
            exit_ctx.raise(ExceptionInterrupt::PageFault, error_code)
        }
        FaultOutcome::Emulate => ExitType::Return(Disposition::EmulateInstruction),
    }
}

fn handle_debug<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    // The exit qualification holds the DR6 bits the exception would have set.
    let dr6 = (exit_ctx.exit.qualification & 0x600F) | DR6_FIXED_ONES;
    exit_ctx.ctx.dr[6] = dr6;

    if exit_ctx.vcpu.config.host_debugging {
        return ExitType::Return(Disposition::GuestTrap);
    }

    if exit_ctx.vcpu.guest_debug_active {
        let mut registers = exit_ctx.support.read_debug_registers();
        registers[6] = dr6;
        exit_ctx.support.write_debug_registers(&registers);
    }

    exit_ctx.raise(ExceptionInterrupt::Debug, 0)
}

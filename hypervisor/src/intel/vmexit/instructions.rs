//! Instruction exits the engine hands to the instruction emulator, plus HLT.

use {
    crate::{
        intel::{
            support::VmxSupport,
            vmerror::VmxBasicExitReason,
            vmexit::{ExitContext, ExitType},
        },
        services::{EmulationOutcome, InstructionExit, VcpuServices},
        vmm::Disposition,
    },
    log::*,
};

fn instruction_exit(reason: VmxBasicExitReason, qualification: u64) -> Option<InstructionExit> {
    Some(match reason {
        VmxBasicExitReason::Cpuid => InstructionExit::Cpuid,
        VmxBasicExitReason::Rdtsc => InstructionExit::Rdtsc,
        VmxBasicExitReason::Rdtscp => InstructionExit::Rdtscp,
        VmxBasicExitReason::Rdpmc => InstructionExit::Rdpmc,
        VmxBasicExitReason::Invlpg => InstructionExit::Invlpg(qualification),
        VmxBasicExitReason::Rdmsr => InstructionExit::Rdmsr,
        VmxBasicExitReason::Wrmsr => InstructionExit::Wrmsr,
        VmxBasicExitReason::Monitor => InstructionExit::Monitor,
        VmxBasicExitReason::Mwait => InstructionExit::Mwait,
        _ => return None,
    })
}

/// Translates an emulator verdict into what the run loop does next.
pub fn emulation_result<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, outcome: EmulationOutcome) -> ExitType {
    if outcome != EmulationOutcome::Failed {
        exit_ctx.context_handed_out();
    }

    match outcome {
        EmulationOutcome::Emulated => ExitType::IncrementRIP,
        EmulationOutcome::Completed => ExitType::Continue,
        EmulationOutcome::Fault(exception, error_code) => exit_ctx.raise(exception, error_code.unwrap_or(0)),
        EmulationOutcome::Failed => ExitType::Return(Disposition::EmulateInstruction),
    }
}

/// Like [`emulation_result`], for exits whose instruction length is undefined (EPT
/// violations, EPT misconfigurations, APIC accesses and exceptions). The emulator must
/// have moved RIP itself.
pub fn decoded_emulation_result<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, outcome: EmulationOutcome) -> ExitType {
    if outcome == EmulationOutcome::Emulated {
        exit_ctx.context_handed_out();
        error!("Emulator left RIP {:#x} in place on an exit without an instruction length", exit_ctx.ctx.regs.rip);
        return ExitType::Return(Disposition::EmulateInstruction);
    }

    emulation_result(exit_ctx, outcome)
}

/// CPUID, RDTSC(P), RDPMC, INVLPG, RDMSR, WRMSR, MONITOR and MWAIT.
pub fn handle_delegated_instruction<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, reason: VmxBasicExitReason) -> ExitType {
    let Some(instruction) = instruction_exit(reason, exit_ctx.exit.qualification) else {
        return ExitType::Return(Disposition::UnexpectedExit(exit_ctx.exit.reason));
    };

    let outcome = exit_ctx.services.emulate_instruction(instruction, exit_ctx.ctx);
    trace!("{:?} at RIP {:#x}: {:?}", instruction, exit_ctx.ctx.regs.rip, outcome);

    if let (InstructionExit::Invlpg(address), EmulationOutcome::Emulated | EmulationOutcome::Completed) = (instruction, outcome) {
        if exit_ctx.vcpu.tlb.invalidate_page(exit_ctx.support, address).is_err() {
            error!("INVLPG {:#x}: TLB invalidation failed", address);
            return ExitType::Return(Disposition::InternalError);
        }
    }

    emulation_result(exit_ctx, outcome)
}

/// HLT is always intercepted.
///
/// The guest resumes straight away if it could take an interrupt right now;
/// otherwise the caller blocks the VCPU.
pub fn handle_hlt<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    exit_ctx.advance_rip();

    let services = &*exit_ctx.services;
    let wakeup = services.nmi_pending() || services.has_trap() || (exit_ctx.ctx.interrupts_enabled() && services.interrupt_pending());

    if wakeup {
        ExitType::Continue
    } else {
        trace!("Guest halted at RIP {:#x}", exit_ctx.ctx.regs.rip);
        ExitType::Return(Disposition::Halted)
    }
}

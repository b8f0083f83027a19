//! EPT violation and misconfiguration exits.
//!
//! Both are resolved by the memory service. Accesses it cannot back with memory
//! (MMIO) go to the instruction emulator.

use {
    crate::{
        intel::{
            support::VmxSupport,
            vmerror::EptViolationExitQualification,
            vmexit::{instructions::decoded_emulation_result, ExitContext, ExitType},
        },
        services::{FaultOutcome, VcpuServices},
        vmm::Disposition,
    },
    log::*,
};

/// Handles an EPT violation.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.3.2 EPT Violations
pub fn handle_ept_violation<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let gpa = exit_ctx.exit.guest_physical_address;
    let qualification = EptViolationExitQualification::from_exit_qualification(exit_ctx.exit.qualification);
    let error_code = qualification.page_fault_error_code();

    trace!("EPT violation at GPA {:#x} ({:?}), RIP {:#x}", gpa, qualification, exit_ctx.ctx.regs.rip);

    let outcome = exit_ctx.services.handle_nested_fault(gpa, error_code, exit_ctx.ctx);
    resolve(exit_ctx, gpa, outcome)
}

/// Handles an EPT misconfiguration, which the memory service uses to mark MMIO pages.
pub fn handle_ept_misconfiguration<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let gpa = exit_ctx.exit.guest_physical_address;
    trace!("EPT misconfiguration at GPA {:#x}", gpa);

    let outcome = exit_ctx.services.handle_nested_misconfig(gpa, exit_ctx.ctx);
    resolve(exit_ctx, gpa, outcome)
}

fn resolve<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, gpa: u64, outcome: FaultOutcome) -> ExitType {
    exit_ctx.context_handed_out();

    match outcome {
        FaultOutcome::Resolved => ExitType::Continue,
        FaultOutcome::Emulate => {
            let outcome = exit_ctx.services.emulate_mmio(gpa, exit_ctx.ctx);
            decoded_emulation_result(exit_ctx, outcome)
        }
        FaultOutcome::Reflect => {
            debug!("Nested fault at GPA {:#x} left unresolved", gpa);
            ExitType::Return(Disposition::EmulateInstruction)
        }
    }
}

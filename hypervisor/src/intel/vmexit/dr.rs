//! MOV DR exits.
//!
//! The first guest access to a debug register loads the guest's DR0-DR3/DR6 into
//! hardware and turns MOV DR exiting off, so later accesses run natively. While a
//! host debugger owns the registers every access is emulated against the context.

use {
    crate::{
        intel::{
            dirty::GuestStateChanges,
            guest::{activate_guest_debug_state, normalize_dr7},
            support::VmxSupport,
            vmerror::{DrAccessExitQualification, ExceptionInterrupt},
            vmexit::{ExitContext, ExitType},
        },
        services::VcpuServices,
    },
    log::*,
    x86_64::registers::control::Cr4Flags,
};

pub fn handle_mov_dr<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    if !exit_ctx.vcpu.guest_debug_active && activate_guest_debug_state(exit_ctx.vcpu, exit_ctx.support, exit_ctx.ctx) {
        trace!("Guest debug registers activated, restarting MOV DR");
        return ExitType::Continue;
    }

    let qualification = DrAccessExitQualification(exit_ctx.exit.qualification);
    let gpr = qualification.general_purpose_register();
    let mut register = qualification.debug_register() as usize;

    // DR4/DR5 alias DR6/DR7 unless CR4.DE is set.
    if register == 4 || register == 5 {
        if exit_ctx.ctx.cr4_flags().contains(Cr4Flags::DEBUGGING_EXTENSIONS) {
            return exit_ctx.raise(ExceptionInterrupt::InvalidOpcode, 0);
        }
        register += 2;
    }

    if qualification.direction() == 1 {
        let value = exit_ctx.ctx.dr[register];
        exit_ctx.ctx.regs.set_gpr(gpr, value);
        return ExitType::IncrementRIP;
    }

    let value = exit_ctx.ctx.regs.gpr(gpr);
    match register {
        6 | 7 if value >> 32 != 0 => return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0),
        6 => exit_ctx.ctx.dr[6] = (value & 0xF00F) | 0xFFFF_0FF0,
        7 => exit_ctx.ctx.dr[7] = normalize_dr7(value),
        _ => exit_ctx.ctx.dr[register] = value,
    }

    trace!("MOV to DR{}: {:#x}", register, exit_ctx.ctx.dr[register]);
    exit_ctx.vcpu.mark_dirty(GuestStateChanges::DEBUG);
    ExitType::IncrementRIP
}

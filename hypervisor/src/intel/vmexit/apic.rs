//! Virtual-APIC exits: TPR below threshold and APIC-access page accesses.

use {
    crate::{
        intel::{
            support::VmxSupport,
            vmerror::ApicAccessExitQualification,
            vmexit::{instructions::decoded_emulation_result, ExitContext, ExitType},
        },
        services::VcpuServices,
        vmm::Disposition,
    },
    log::*,
};

/// The guest lowered its TPR below the threshold we programmed.
///
/// The new TPR is picked up from the virtual-APIC page on the next entry, which
/// also recomputes the threshold, so there is nothing left to do here.
pub fn handle_tpr_below_threshold<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    trace!("TPR below threshold at RIP {:#x}", exit_ctx.ctx.regs.rip);
    ExitType::Continue
}

/// A linear access hit the APIC-access page.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 30.4.4 VM Exits Due to APIC Accesses
pub fn handle_apic_access<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let qualification = ApicAccessExitQualification(exit_ctx.exit.qualification);

    match qualification.access_type() {
        0 | 1 => {
            let gpa = exit_ctx.services.apic_base() + qualification.page_offset();
            trace!("APIC access at {:#x}", gpa);
            let outcome = exit_ctx.services.emulate_mmio(gpa, exit_ctx.ctx);
            decoded_emulation_result(exit_ctx, outcome)
        }
        other => {
            debug!("APIC access type {} left to the caller", other);
            ExitType::Return(Disposition::EmulateInstruction)
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::{context::GuestCpuContext, vmexit::ExitRecord},
            services::EmulationOutcome,
            testing::{test_vcpu, MockServices, SimulatedCpu},
        },
    };

    #[test]
    fn linear_write_is_emulated_at_apic_base() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        services.emulation = EmulationOutcome::Completed;
        let mut ctx = GuestCpuContext::default();

        let exit = ExitRecord { reason: 44, qualification: (1 << 12) | 0x80, ..Default::default() };
        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit };
        assert_eq!(handle_apic_access(&mut exit_ctx), ExitType::Continue);
        assert_eq!(exit_ctx.services.mmio, [0xFEE0_0080]);

        // The exit reports no instruction length, so the engine cannot step over the access.
        exit_ctx.services.emulation = EmulationOutcome::Emulated;
        assert_eq!(handle_apic_access(&mut exit_ctx), ExitType::Return(Disposition::EmulateInstruction));
    }

    #[test]
    fn event_delivery_access_is_not_emulated() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        let mut ctx = GuestCpuContext::default();

        let exit = ExitRecord { reason: 44, qualification: 3 << 12, ..Default::default() };
        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit };
        assert_eq!(handle_apic_access(&mut exit_ctx), ExitType::Return(Disposition::EmulateInstruction));
        assert!(exit_ctx.services.mmio.is_empty());
    }
}

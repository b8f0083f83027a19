//! Control Register access VM-exit handler
//! Handles MOV to/from CR0, CR3, CR4 and CR8, CLTS and LMSW against the guest context.

use {
    crate::{
        intel::{
            dirty::GuestStateChanges,
            support::VmxSupport,
            vmerror::{ControlRegAccessExitQualification, CrAccessType, ExceptionInterrupt},
            vmexit::{ExitContext, ExitType},
        },
        services::VcpuServices,
        vmm::Disposition,
    },
    bit_field::BitField,
    log::{debug, trace, warn},
    x86_64::registers::{
        control::{Cr0Flags, Cr4Flags},
        model_specific::EferFlags,
    },
};

/// Handles the `ControlRegisterAccess` VM-exit.
///
/// The guest context already holds the guest's view of CR0 and CR4 (shadow bits
/// merged with guest-owned bits), so every check below runs against what the
/// guest believes the registers contain.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally
pub fn handle_cr_access<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let qualification = ControlRegAccessExitQualification(exit_ctx.exit.qualification);
    let register = qualification.control_register() as u8;
    let gpr = qualification.general_purpose_register();

    trace!("CR access: {:?} CR{}, GPR={}, RIP={:#x}", qualification.kind(), register, gpr, exit_ctx.ctx.regs.rip);

    match (qualification.kind(), register) {
        (CrAccessType::MovToCr, 0) => {
            let value = exit_ctx.ctx.regs.gpr(gpr);
            handle_mov_to_cr0(exit_ctx, value)
        }
        (CrAccessType::MovToCr, 3) => {
            let value = exit_ctx.ctx.regs.gpr(gpr);
            handle_mov_to_cr3(exit_ctx, value)
        }
        (CrAccessType::MovToCr, 4) => {
            let value = exit_ctx.ctx.regs.gpr(gpr);
            handle_mov_to_cr4(exit_ctx, value)
        }
        (CrAccessType::MovToCr, 8) => {
            let value = exit_ctx.ctx.regs.gpr(gpr);
            handle_mov_to_cr8(exit_ctx, value)
        }
        (CrAccessType::MovFromCr, 0) => {
            exit_ctx.ctx.regs.set_gpr(gpr, exit_ctx.ctx.cr0);
            ExitType::IncrementRIP
        }
        (CrAccessType::MovFromCr, 3) => {
            exit_ctx.ctx.regs.set_gpr(gpr, exit_ctx.ctx.cr3);
            ExitType::IncrementRIP
        }
        (CrAccessType::MovFromCr, 4) => {
            exit_ctx.ctx.regs.set_gpr(gpr, exit_ctx.ctx.cr4);
            ExitType::IncrementRIP
        }
        (CrAccessType::MovFromCr, 8) => {
            let tpr = exit_ctx.services.tpr().map_or(0, |state| state.tpr >> 4);
            exit_ctx.ctx.regs.set_gpr(gpr, tpr as u64);
            ExitType::IncrementRIP
        }
        (CrAccessType::Clts, _) => {
            let cr0 = exit_ctx.ctx.cr0 & !Cr0Flags::TASK_SWITCHED.bits();
            handle_mov_to_cr0(exit_ctx, cr0)
        }
        (CrAccessType::Lmsw, _) => {
            let cr0 = lmsw(exit_ctx.ctx.cr0, qualification.lmsw_source_data());
            handle_mov_to_cr0(exit_ctx, cr0)
        }
        (kind, register) => {
            warn!("Unhandled {:?} CR{}", kind, register);
            ExitType::Return(Disposition::UnexpectedExit(exit_ctx.exit.reason))
        }
    }
}

/// LMSW only loads CR0[3:0] and cannot clear PE.
fn lmsw(cr0: u64, source: u64) -> u64 {
    let mut new_cr0 = (cr0 & !0xF) | (source & 0xF);
    if cr0 & Cr0Flags::PROTECTED_MODE_ENABLE.bits() != 0 {
        new_cr0 |= Cr0Flags::PROTECTED_MODE_ENABLE.bits();
    }
    new_cr0
}

/// Handle MOV to CR0
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: MOV - Move to/from Control Registers
fn handle_mov_to_cr0<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, value: u64) -> ExitType {
    let mut new_cr0 = value;

    // #GP(0) if setting any reserved bits in CR0[63:32]
    if new_cr0.get_bits(32..64) != 0 {
        debug!("MOV to CR0: #GP - reserved bits set in upper 32 bits");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    // CR0[15:6], CR0[17] and CR0[28:19] are always 0, CR0.ET is always 1
    new_cr0.set_bits(6..16, 0);
    new_cr0.set_bit(17, false);
    new_cr0.set_bits(19..29, 0);
    let new_flags = Cr0Flags::from_bits_retain(new_cr0) | Cr0Flags::EXTENSION_TYPE;

    // #GP(0) if setting CR0.PG while CR0.PE is clear
    if new_flags.contains(Cr0Flags::PAGING) && !new_flags.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
        debug!("MOV to CR0: #GP - PG=1 with PE=0");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    // #GP(0) if invalid bit combination
    if !new_flags.contains(Cr0Flags::CACHE_DISABLE) && new_flags.contains(Cr0Flags::NOT_WRITE_THROUGH) {
        debug!("MOV to CR0: #GP - NW=1 with CD=0");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    let old_flags = exit_ctx.ctx.cr0_flags();
    let efer = EferFlags::from_bits_retain(exit_ctx.ctx.efer);
    let enabling_paging = new_flags.contains(Cr0Flags::PAGING) && !old_flags.contains(Cr0Flags::PAGING);
    let disabling_paging = !new_flags.contains(Cr0Flags::PAGING) && old_flags.contains(Cr0Flags::PAGING);

    // #GP(0) if clearing CR0.PG while running 64-bit code
    if disabling_paging && exit_ctx.ctx.is_64bit_code() {
        debug!("MOV to CR0: #GP - clearing PG in 64-bit mode");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    // #GP(0) if enabling long mode without PAE
    if enabling_paging && efer.contains(EferFlags::LONG_MODE_ENABLE) && !exit_ctx.ctx.cr4_flags().contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
        debug!("MOV to CR0: #GP - LME=1 with PAE=0");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    // #GP(0) if an attempt is made to clear CR0.WP while CR4.CET is set
    if !new_flags.contains(Cr0Flags::WRITE_PROTECT) && exit_ctx.ctx.cr4_flags().contains(Cr4Flags::CONTROL_FLOW_ENFORCEMENT) {
        debug!("MOV to CR0: #GP - WP=0 with CET=1");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    let mut changes = GuestStateChanges::CR0;

    // Long mode activates and deactivates with paging.
    if efer.contains(EferFlags::LONG_MODE_ENABLE) && (enabling_paging || disabling_paging) {
        let mut efer = efer;
        efer.set(EferFlags::LONG_MODE_ACTIVE, enabling_paging);
        exit_ctx.ctx.efer = efer.bits();
        changes |= GuestStateChanges::AUTOLOAD_MSRS;
        trace!("MOV to CR0: EFER.LMA={}", enabling_paging);
    }

    let paging_bits = Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT | Cr0Flags::PROTECTED_MODE_ENABLE;
    if (old_flags ^ new_flags).intersects(paging_bits) {
        exit_ctx.vcpu.tlb.flush_all();
    }

    // Entering or leaving real mode reloads every segment.
    if (old_flags ^ new_flags).contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
        changes |= GuestStateChanges::all();
    }

    exit_ctx.ctx.cr0 = new_flags.bits();
    exit_ctx.vcpu.mark_dirty(changes);
    exit_ctx.services.control_register_changed(0, exit_ctx.ctx);

    if let Some(exit_type) = reload_pdptes(exit_ctx) {
        return exit_type;
    }

    trace!("MOV to CR0 completed: {:#x}", exit_ctx.ctx.cr0);
    ExitType::IncrementRIP
}

/// Handle MOV to CR3
///
/// Without nested paging every CR3 load exits; with it, only loads while guest paging is off.
fn handle_mov_to_cr3<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, value: u64) -> ExitType {
    let mut new_cr3 = value;

    // Bit 63 only requests a PCID-preserving load.
    if exit_ctx.ctx.cr4_flags().contains(Cr4Flags::PCID) {
        new_cr3.set_bit(63, false);
    }

    trace!("Handling MOV to CR3: new value={:#x}", new_cr3);

    exit_ctx.ctx.cr3 = new_cr3;
    exit_ctx.vcpu.mark_dirty(GuestStateChanges::CR3);
    exit_ctx.services.control_register_changed(3, exit_ctx.ctx);

    if !exit_ctx.vcpu.policy.nested_paging {
        exit_ctx.vcpu.tlb.flush_all();
    }

    if let Some(exit_type) = reload_pdptes(exit_ctx) {
        return exit_type;
    }

    ExitType::IncrementRIP
}

/// Handle MOV to CR4
fn handle_mov_to_cr4<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, value: u64) -> ExitType {
    trace!("Handling MOV to CR4: new value={:#x}", value);

    let new_flags = Cr4Flags::from_bits_retain(value);
    let old_flags = exit_ctx.ctx.cr4_flags();

    // VMX is not exposed to the guest.
    if new_flags.contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) {
        debug!("MOV to CR4: #GP - VMXE");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    // #GP(0) if clearing CR4.PAE while in long mode
    if exit_ctx.ctx.is_long_mode() && !new_flags.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
        debug!("MOV to CR4: #GP - clearing PAE in long mode");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    let paging_bits = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::PAGE_GLOBAL | Cr4Flags::PAGE_SIZE_EXTENSION | Cr4Flags::PCID;
    if (old_flags ^ new_flags).intersects(paging_bits) {
        exit_ctx.vcpu.tlb.flush_all();
    }

    exit_ctx.ctx.cr4 = new_flags.bits();
    exit_ctx.vcpu.mark_dirty(GuestStateChanges::CR4);
    exit_ctx.services.control_register_changed(4, exit_ctx.ctx);

    if let Some(exit_type) = reload_pdptes(exit_ctx) {
        return exit_type;
    }

    ExitType::IncrementRIP
}

/// Handle MOV to CR8 (Task Priority Register)
fn handle_mov_to_cr8<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, value: u64) -> ExitType {
    trace!("Handling MOV to CR8: value={:#x}", value);

    // CR8 only uses bits 3:0 for TPR
    if value & !0xF != 0 {
        debug!("MOV to CR8: #GP - reserved bits set");
        return exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0);
    }

    let tpr = (value as u8) << 4;
    exit_ctx.services.set_tpr(tpr);
    exit_ctx.vcpu.last_tpr = Some(tpr);

    ExitType::IncrementRIP
}

/// PAE paging under EPT takes its PDPTEs from the VMCS, so they are read when CR0, CR3 or CR4 change.
fn reload_pdptes<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> Option<ExitType> {
    if !exit_ctx.vcpu.policy.nested_paging || !exit_ctx.ctx.is_pae_paging() {
        return None;
    }

    let table = exit_ctx.ctx.cr3 & !0x1F;
    let mut raw = [0u8; 32];
    if exit_ctx.services.read_phys(table, &mut raw).is_err() {
        debug!("PDPT at {:#x} is not backed by memory", table);
        return Some(exit_ctx.raise(ExceptionInterrupt::GeneralProtectionFault, 0));
    }

    for (slot, bytes) in raw.chunks_exact(8).enumerate() {
        let mut entry = [0u8; 8];
        entry.copy_from_slice(bytes);
        exit_ctx.ctx.pdpte[slot] = u64::from_le_bytes(entry);
    }
    exit_ctx.vcpu.mark_dirty(GuestStateChanges::CR3);

    None
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::{context::GuestCpuContext, vmexit::ExitRecord},
            testing::{test_vcpu, MockServices, SimulatedCpu},
        },
    };

    /// MOV to/from CR`cr` using GPR `gpr`.
    fn cr_exit(cr: u64, access: u64, gpr: u64) -> ExitRecord {
        ExitRecord {
            reason: 28,
            qualification: cr | (access << 4) | (gpr << 8),
            instruction_length: 3,
            ..Default::default()
        }
    }

    fn protected_mode() -> GuestCpuContext {
        let mut ctx = GuestCpuContext::default();
        ctx.cr0 = (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::EXTENSION_TYPE).bits();
        ctx
    }

    #[test]
    fn enabling_paging_with_lme_activates_long_mode() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        vcpu.dirty = GuestStateChanges::empty();
        vcpu.tlb.force_flush = false;
        let mut services = MockServices::new();
        let mut ctx = protected_mode();
        ctx.cr4 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
        ctx.efer = EferFlags::LONG_MODE_ENABLE.bits();
        ctx.regs.rax = ctx.cr0 | Cr0Flags::PAGING.bits();

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: cr_exit(0, 0, 0) };
        assert_eq!(handle_cr_access(&mut exit_ctx), ExitType::IncrementRIP);

        assert!(exit_ctx.ctx.is_paging_enabled());
        assert!(exit_ctx.ctx.is_long_mode());
        assert!(exit_ctx.vcpu.dirty.contains(GuestStateChanges::CR0 | GuestStateChanges::AUTOLOAD_MSRS));
        assert!(exit_ctx.vcpu.tlb.force_flush);
        assert_eq!(exit_ctx.services.cr_changes, [0]);
    }

    #[test]
    fn paging_without_protection_raises_gp() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        let mut ctx = GuestCpuContext::default();
        ctx.regs.rbx = Cr0Flags::PAGING.bits();

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: cr_exit(0, 0, 3) };
        assert_eq!(handle_cr_access(&mut exit_ctx), ExitType::Continue);
        assert_eq!(exit_ctx.vcpu.pending_event.map(|event| event.vector()), Some(13));
        assert!(exit_ctx.ctx.is_real_mode());
    }

    #[test]
    fn lmsw_cannot_leave_protected_mode() {
        assert_eq!(lmsw(0x11, 0x0), 0x11);
        assert_eq!(lmsw(0x10, 0x1), 0x11);
        assert_eq!(lmsw(0x1F, 0x2), 0x13);
    }

    #[test]
    fn cr3_reads_return_the_guest_value() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        let mut ctx = protected_mode();
        ctx.cr3 = 0x1234_5000;

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: cr_exit(3, 1, 1) };
        assert_eq!(handle_cr_access(&mut exit_ctx), ExitType::IncrementRIP);
        assert_eq!(exit_ctx.ctx.regs.rcx, 0x1234_5000);
    }

    #[test]
    fn pae_cr3_load_reads_the_pdpt() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        for slot in 0..4u64 {
            services.write_u64(0x8000 + slot * 8, 0x1000 * (slot + 1) | 1);
        }
        let mut ctx = protected_mode();
        ctx.cr0 |= Cr0Flags::PAGING.bits();
        ctx.cr4 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
        ctx.regs.rdx = 0x8000;

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: cr_exit(3, 0, 2) };
        assert_eq!(handle_cr_access(&mut exit_ctx), ExitType::IncrementRIP);
        assert_eq!(exit_ctx.ctx.pdpte, [0x1001, 0x2001, 0x3001, 0x4001]);
    }

    #[test]
    fn cr8_writes_reach_the_interrupt_controller() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        let mut ctx = protected_mode();
        ctx.regs.rax = 0x9;

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: cr_exit(8, 0, 0) };
        assert_eq!(handle_cr_access(&mut exit_ctx), ExitType::IncrementRIP);
        assert_eq!(exit_ctx.services.tpr, 0x90);
    }
}

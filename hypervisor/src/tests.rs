//! End-to-end scenarios driving the engine from VMXON to VMXOFF against the simulated CPU.

use {
    crate::{
        config::EngineConfig,
        intel::{
            capabilities::{check_supported_cpu, VmxCapabilities},
            context::{DescriptorTable, GuestCpuContext},
            dirty::GuestStateChanges,
            events::EventInjection,
            guest::{load_guest_state, save_guest_state, EntryInputs},
            host::{enter, leave},
            page::PageAllocator,
            percpu::PhysicalCore,
            realmode::v86_segment,
            support::{InvEptKind, InvVpidKind},
            tlb::{TlbState, TlbStrategy},
            vm::VirtualMachine,
            vmerror::{ExceptionInterrupt, VmxBasicExitReason},
            vmxon::{disable_cpu, enable_cpu},
        },
        services::{ActionFlags, InstructionExit, QueuedTrap},
        testing::{protected_mode_context, test_vcpu_with_pages, Invalidation, MockServices, ScriptedExit, SimulatedCpu, TestPageAllocator},
        vmm::{run_guest_code, Disposition},
    },
    alloc::vec::Vec,
    proptest::prelude::*,
    x86::vmx::vmcs,
};

fn cpuid_exit() -> ScriptedExit {
    ScriptedExit::new(VmxBasicExitReason::Cpuid as u32).with_length(2)
}

#[test]
fn cpuid_is_emulated_until_a_forced_action_is_raised() {
    crate::logger::init(log::LevelFilter::Trace);

    let core = PhysicalCore::new(0);
    let mut cpu = SimulatedCpu::new();
    let mut allocator = TestPageAllocator::new();
    let mut scratch = allocator.allocate_page().unwrap();

    check_supported_cpu(&mut cpu).unwrap();
    let caps = VmxCapabilities::read(&mut cpu);
    enable_cpu(&core, &mut cpu, &mut scratch, caps.revision_id()).unwrap();

    let mut vm = VirtualMachine::new(EngineConfig::default(), caps, 1);
    assert!(vm.nested_paging);
    vm.init(&mut allocator).unwrap();
    vm.setup(&core, &mut cpu).unwrap();

    let mut services = MockServices::new();
    let mut ctx = protected_mode_context();
    let start = ctx.regs.rip;
    let vcpu = &mut vm.vcpus[0];
    enter(vcpu, &core, &mut cpu).unwrap();

    // CPUID exits resume in place; the exhausted script then ends the run with a host interrupt.
    for _ in 0..3 {
        cpu.exits.push_back(cpuid_exit());
    }
    assert_eq!(run_guest_code(vcpu, &core, &mut cpu, &mut services, &mut ctx), Disposition::InterruptPending);
    assert_eq!(ctx.regs.rip, start + 6);
    assert_eq!(services.emulated, [InstructionExit::Cpuid; 3]);
    assert_eq!(cpu.entries.len(), 4);
    assert_eq!(cpu.entries.iter().filter(|entry| !entry.resume).count(), 1);

    // A request raised while emulating stops the loop before the next entry.
    cpu.exits.push_back(cpuid_exit());
    services.actions_after_emulation = ActionFlags::REQUEST;
    assert_eq!(run_guest_code(vcpu, &core, &mut cpu, &mut services, &mut ctx), Disposition::ForcedAction(ActionFlags::REQUEST));
    assert_eq!(ctx.regs.rip, start + 8);
    assert_eq!(cpu.entries.len(), 5);

    let vcpu = &mut vm.vcpus[0];
    leave(vcpu, &core, &mut cpu, &mut ctx).unwrap();
    vm.terminate(&mut allocator);
    vm.terminate(&mut allocator);
    disable_cpu(&core, &mut cpu, &scratch).unwrap();
    allocator.free_page(scratch);

    assert_eq!(allocator.outstanding(), 0);
    assert_eq!(allocator.double_frees(), 0);
}

#[test]
fn migration_flushes_before_the_first_entry_on_the_new_core() {
    let core_a = PhysicalCore::new(0);
    let core_b = PhysicalCore::new(1);
    core_a.set_root_mode(true);
    core_b.set_root_mode(true);
    let mut cpu = SimulatedCpu::new();
    let mut allocator = TestPageAllocator::new();
    let mut vcpu = test_vcpu_with_pages(&mut cpu, &mut allocator, true);
    let mut services = MockServices::new();
    let mut ctx = protected_mode_context();

    enter(&mut vcpu, &core_a, &mut cpu).unwrap();
    assert_eq!(run_guest_code(&mut vcpu, &core_a, &mut cpu, &mut services, &mut ctx), Disposition::InterruptPending);
    assert!(!vcpu.tlb.needs_flush(&core_a));
    leave(&mut vcpu, &core_a, &mut cpu, &mut ctx).unwrap();

    enter(&mut vcpu, &core_b, &mut cpu).unwrap();
    assert!(vcpu.tlb.needs_flush(&core_b));
    cpu.invalidations.clear();

    assert_eq!(run_guest_code(&mut vcpu, &core_b, &mut cpu, &mut services, &mut ctx), Disposition::InterruptPending);
    assert!(!vcpu.tlb.force_flush);
    assert!(!vcpu.tlb.needs_flush(&core_b));
    assert_eq!(cpu.invalidations, [Invalidation::Ept(InvEptKind::SingleContext, services.eptp)]);

    leave(&mut vcpu, &core_b, &mut cpu, &mut ctx).unwrap();
    vcpu.pages.free(&mut allocator);
}

#[test]
fn interrupted_exception_is_redelivered_before_new_interrupts() {
    let core = PhysicalCore::new(0);
    core.set_root_mode(true);
    let mut cpu = SimulatedCpu::new();
    let mut allocator = TestPageAllocator::new();
    let mut vcpu = test_vcpu_with_pages(&mut cpu, &mut allocator, true);
    let mut services = MockServices::new();
    let mut ctx = protected_mode_context();
    enter(&mut vcpu, &core, &mut cpu).unwrap();

    cpu.exits.push_back(ScriptedExit::new(VmxBasicExitReason::ExternalInterrupt as u32).with_idt_vectoring(EventInjection::page_fault(), 0x4));
    assert_eq!(run_guest_code(&mut vcpu, &core, &mut cpu, &mut services, &mut ctx), Disposition::InterruptPending);

    services.interrupts.push_back(0x30);
    cpu.exits.push_back(ScriptedExit::new(VmxBasicExitReason::Hlt as u32).with_length(1));
    assert_eq!(run_guest_code(&mut vcpu, &core, &mut cpu, &mut services, &mut ctx), Disposition::InterruptPending);

    // Entry 2 redelivers the page fault; the halted guest then wakes up for the interrupt on entry 3.
    assert_eq!(cpu.entries.len(), 3);
    assert_eq!(cpu.entries[1].interruption_info, EventInjection::page_fault() as u64);
    assert_eq!(cpu.entries[2].interruption_info, EventInjection::external_interrupt(0x30) as u64);
    assert!(services.interrupts.is_empty());

    leave(&mut vcpu, &core, &mut cpu, &mut ctx).unwrap();
    vcpu.pages.free(&mut allocator);
}

#[test]
fn undeliverable_double_fault_in_real_mode_requests_a_reset() {
    let core = PhysicalCore::new(0);
    core.set_root_mode(true);
    let mut cpu = SimulatedCpu::new();
    let mut allocator = TestPageAllocator::new();
    let mut vcpu = test_vcpu_with_pages(&mut cpu, &mut allocator, true);
    let mut services = MockServices::new();
    services.real_mode_tss = Some(0x9000);
    services.trap = Some(QueuedTrap::exception(ExceptionInterrupt::GeneralProtectionFault, Some(0)));

    let mut ctx = GuestCpuContext::default();
    ctx.cs = v86_segment(0xF000);
    ctx.ss = v86_segment(0);
    ctx.regs.rip = 0xFFF0;
    ctx.regs.rsp = 0x7C00;
    ctx.regs.rflags = 0x202;
    // Vectors 0-4 only.
    ctx.idtr = DescriptorTable { base: 0, limit: 4 * 4 + 3 };

    enter(&mut vcpu, &core, &mut cpu).unwrap();
    assert_eq!(run_guest_code(&mut vcpu, &core, &mut cpu, &mut services, &mut ctx), Disposition::ResetRequested);
    assert!(cpu.entries.is_empty());
    assert!(vcpu.real_mode.emulating);

    leave(&mut vcpu, &core, &mut cpu, &mut ctx).unwrap();
    vcpu.pages.free(&mut allocator);
}

#[test]
fn failed_setup_leaves_no_session_behind() {
    let core = PhysicalCore::new(0);
    core.set_root_mode(true);
    let mut cpu = SimulatedCpu::new();
    let caps = VmxCapabilities::read(&mut cpu);
    let mut vm = VirtualMachine::new(EngineConfig::default(), caps, 1);
    let mut allocator = TestPageAllocator::new();
    vm.init(&mut allocator).unwrap();

    // Another control block already owns the core.
    core.activate(0xABC000).unwrap();
    assert!(vm.setup(&core, &mut cpu).is_err());
    assert_eq!(core.active_vmcs(), Some(0xABC000));
    assert!(vm.vcpus[0].active_core.is_none());

    vm.terminate(&mut allocator);
    assert_eq!(allocator.outstanding(), 0);
}

#[derive(Debug, Clone)]
enum TlbOp {
    QueuePage(u64),
    QueueFull,
    InvalidatePage(u64),
    Migrate,
}

fn tlb_op() -> impl Strategy<Value = TlbOp> {
    prop_oneof![
        (0u64..64).prop_map(|page| TlbOp::QueuePage(page << 12)),
        Just(TlbOp::QueueFull),
        (0u64..64).prop_map(|page| TlbOp::InvalidatePage(page << 12)),
        Just(TlbOp::Migrate),
    ]
}

proptest! {
    #[test]
    fn asid_wraps_to_one_with_a_single_global_flush(max_asid in 2u32..200) {
        let core = PhysicalCore::new(0);
        let mut cpu = SimulatedCpu::new();
        let mut tlb = TlbState::new(TlbStrategy::Vpid, max_asid, 4);

        for _ in 0..max_asid {
            tlb.flush_all();
            tlb.prepare_entry(&core, &mut cpu).unwrap();
            prop_assert_ne!(tlb.asid, 0);
        }

        let global = cpu.invalidations.iter().filter(|inv| matches!(inv, Invalidation::Vpid(InvVpidKind::AllContexts, ..))).count();
        prop_assert_eq!(global, 1);
        prop_assert_eq!(tlb.asid, 1);
        prop_assert_eq!(cpu.invalidations.len(), max_asid as usize);
    }

    #[test]
    fn each_entry_issues_at_most_one_flush(
        vpid in any::<bool>(),
        rounds in prop::collection::vec(prop::collection::vec(tlb_op(), 0..6), 1..12),
    ) {
        let cores = [PhysicalCore::new(0), PhysicalCore::new(1)];
        let mut current = 0;
        let mut cpu = SimulatedCpu::new();
        let strategy = if vpid { TlbStrategy::Vpid } else { TlbStrategy::Ept };
        let mut tlb = TlbState::new(strategy, 64, 4);
        tlb.eptp = 0x5000_001E;
        tlb.prepare_entry(&cores[current], &mut cpu).unwrap();

        for ops in rounds {
            let mut must_flush = false;
            for op in ops {
                match op {
                    TlbOp::QueuePage(address) => {
                        tlb.shootdown.queue_page(address);
                        must_flush = true;
                    }
                    TlbOp::QueueFull => {
                        tlb.shootdown.request_full_flush();
                        must_flush = true;
                    }
                    TlbOp::InvalidatePage(address) => tlb.invalidate_page(&mut cpu, address).unwrap(),
                    TlbOp::Migrate => {
                        current ^= 1;
                        must_flush = true;
                    }
                }
            }

            cpu.invalidations.clear();
            tlb.prepare_entry(&cores[current], &mut cpu).unwrap();

            prop_assert!(cpu.invalidations.len() <= 1);
            if must_flush {
                prop_assert_eq!(cpu.invalidations.len(), 1);
            }
            prop_assert!(!tlb.force_flush);
        }
    }

    #[test]
    fn full_load_always_clears_the_change_set(bits in any::<u32>()) {
        let mut cpu = SimulatedCpu::new();
        let mut allocator = TestPageAllocator::new();
        let mut vcpu = test_vcpu_with_pages(&mut cpu, &mut allocator, true);
        let ctx = protected_mode_context();

        // The first load is always a full one.
        load_guest_state(&mut vcpu, &mut cpu, &ctx, &EntryInputs::default()).unwrap();
        vcpu.dirty = GuestStateChanges::from_bits_truncate(bits);
        load_guest_state(&mut vcpu, &mut cpu, &ctx, &EntryInputs::default()).unwrap();

        prop_assert!(vcpu.dirty.is_empty());
        vcpu.pages.free(&mut allocator);
    }

    #[test]
    fn load_then_save_round_trips(
        rip in 0xFFFF_8000_0000_0000u64..0xFFFF_8000_FFFF_FFFF,
        rsp in 0xFFFF_8000_0000_0000u64..0xFFFF_8000_FFFF_FFFF,
        arithmetic in 0u64..0x40,
        cr3 in (0u64..0x10_0000).prop_map(|frame| frame << 12),
        lstar in 0xFFFF_8000_0000_0000u64..0xFFFF_FFFF_FFFF_FFFF,
        kernel_gs_base in 0xFFFF_8000_0000_0000u64..0xFFFF_FFFF_FFFF_FFFF,
        sysenter in any::<(u32, u32)>(),
        gdtr_base in 0xFFFF_8000_0000_0000u64..0xFFFF_FFFF_FFFF_F000,
    ) {
        let mut cpu = SimulatedCpu::new();
        let mut allocator = TestPageAllocator::new();
        let mut vcpu = test_vcpu_with_pages(&mut cpu, &mut allocator, true);

        let mut ctx = protected_mode_context();
        ctx.regs.rip = rip;
        ctx.regs.rsp = rsp;
        // CF, PF, AF, ZF, SF and OF from the six random bits.
        let flags = [0x1, 0x4, 0x10, 0x40, 0x80, 0x800];
        ctx.regs.rflags = 0x202 | flags.iter().enumerate().filter(|(i, _)| arithmetic & (1 << i) != 0).map(|(_, flag)| flag).sum::<u64>();
        ctx.cr3 = cr3;
        ctx.lstar = lstar;
        ctx.kernel_gs_base = kernel_gs_base;
        ctx.sysenter_eip = sysenter.0 as u64;
        ctx.sysenter_esp = sysenter.1 as u64;
        ctx.gdtr.base = gdtr_base;

        load_guest_state(&mut vcpu, &mut cpu, &ctx, &EntryInputs::default()).unwrap();
        vcpu.field_cache.flush_writes(&mut cpu);
        vcpu.field_cache.refresh(&mut cpu);

        let mut saved = GuestCpuContext::default();
        save_guest_state(&mut vcpu, &mut cpu, &mut saved).unwrap();

        prop_assert_eq!(&saved, &ctx);
        prop_assert_eq!(cpu.field(vmcs::guest::RIP), rip);
        vcpu.pages.free(&mut allocator);
    }

    #[test]
    fn terminate_is_idempotent_after_any_partial_init(limit in 0usize..16, vcpus in 1u32..4) {
        let mut cpu = SimulatedCpu::new();
        let caps = VmxCapabilities::read(&mut cpu);
        let mut vm = VirtualMachine::new(EngineConfig::default(), caps, vcpus);
        let mut allocator = TestPageAllocator::with_limit(limit);

        let _ = vm.init(&mut allocator);
        vm.terminate(&mut allocator);
        vm.terminate(&mut allocator);

        prop_assert_eq!(allocator.outstanding(), 0);
        prop_assert_eq!(allocator.double_frees(), 0);
        prop_assert!(vm.vcpus.iter().all(|vcpu| vcpu.pages.vmcs.is_none()));
    }
}

#[test]
fn invalidations_recorded_per_strategy() {
    let core = PhysicalCore::new(0);
    let mut cpu = SimulatedCpu::new();
    let mut kinds = Vec::new();

    for strategy in [TlbStrategy::Ept, TlbStrategy::Vpid, TlbStrategy::None] {
        let mut tlb = TlbState::new(strategy, 16, 4);
        cpu.invalidations.clear();
        tlb.prepare_entry(&core, &mut cpu).unwrap();
        kinds.push(cpu.invalidations.len());
    }

    assert_eq!(kinds, [1, 1, 0]);
}

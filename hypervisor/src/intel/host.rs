//! Session enter/leave and host-state capture.
//!
//! A session is the window during which one VCPU's VMCS is current on one
//! physical core. Host state is captured once per session, and again whenever
//! the VCPU marks it stale.

use {
    crate::{
        error::HypervisorError,
        intel::{
            context::GuestCpuContext,
            descriptor::SegmentDescriptor,
            msr::{MsrArea, AUTOLOAD_MSRS},
            percpu::PhysicalCore,
            support::VmxSupport,
            vcpu::{RunState, VirtualCpu},
        },
    },
    log::*,
    x86::{
        msr,
        vmx::vmcs::{self, control::PrimaryControls},
    },
};

/// Makes the VCPU's control block current on `core`.
///
/// The next entry on it is a VMLAUNCH.
pub fn enter<S: VmxSupport>(vcpu: &mut VirtualCpu, core: &PhysicalCore, support: &mut S) -> Result<(), HypervisorError> {
    if !core.is_root_mode() {
        return Err(HypervisorError::NotInRootMode);
    }
    if vcpu.active_core.is_some() || vcpu.run_state != RunState::Idle {
        return Err(HypervisorError::InvalidRunState);
    }

    let vmcs_pa = vcpu.pages.vmcs_pa().ok_or(HypervisorError::ControlBlockNotAllocated)?;
    core.activate(vmcs_pa)?;

    if support.vmptrld(vmcs_pa).is_err() {
        core.deactivate(vmcs_pa);
        return Err(HypervisorError::VmcsPtrLoadFailed);
    }

    vcpu.active_core = Some(core.id);
    vcpu.launched = false;
    vcpu.host_state_stale = true;
    vcpu.mark_all_dirty();

    trace!("VCPU {} entered session on core {}", vcpu.id, core.id);
    Ok(())
}

/// Ends the session: gives the debug registers back to the host and clears the control block.
pub fn leave<S: VmxSupport>(vcpu: &mut VirtualCpu, core: &PhysicalCore, support: &mut S, ctx: &mut GuestCpuContext) -> Result<(), HypervisorError> {
    if vcpu.active_core != Some(core.id) {
        return Err(HypervisorError::InvalidRunState);
    }
    let vmcs_pa = vcpu.pages.vmcs_pa().ok_or(HypervisorError::ControlBlockNotAllocated)?;

    if vcpu.config.host_debugging {
        if let Some(registers) = vcpu.host_debug_saved.take() {
            support.write_debug_registers(&registers);
        }
        rearm_mov_dr_exiting(vcpu, support);
    } else if vcpu.guest_debug_active {
        let guest = support.read_debug_registers();
        ctx.dr[0..4].copy_from_slice(&guest[0..4]);
        ctx.dr[6] = guest[6];

        if let Some(registers) = vcpu.host_debug_saved.take() {
            support.write_debug_registers(&registers);
        }
        vcpu.guest_debug_active = false;
        rearm_mov_dr_exiting(vcpu, support);
    }

    vcpu.field_cache.flush_writes(support);
    let cleared = support.vmclear(vmcs_pa);
    core.deactivate(vmcs_pa);

    vcpu.active_core = None;
    vcpu.launched = false;
    vcpu.run_state = RunState::Idle;

    cleared.map_err(|_| HypervisorError::VmcsClearFailed)?;
    trace!("VCPU {} left core {}", vcpu.id, core.id);
    Ok(())
}

fn rearm_mov_dr_exiting<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S) {
    let procbased = vcpu.controls.procbased | PrimaryControls::MOV_DR_EXITING.bits();
    if procbased != vcpu.controls.procbased {
        vcpu.controls.procbased = procbased;
        vcpu.field_cache.write(support, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased as u64);
    }
}

/// Writes the host-state area of the current VMCS from the running core.
///
/// Runs with interrupts disabled; it must not log.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 HOST-STATE AREA
pub fn save_host_state<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S) -> Result<(), HypervisorError> {
    let host = support.host_segments();
    let tr_base = SegmentDescriptor::from_raw(support.read_host_descriptor(host.gdtr_base, host.tr)).base();
    let fs_base = support.rdmsr(msr::IA32_FS_BASE);
    let gs_base = support.rdmsr(msr::IA32_GS_BASE);
    let sysenter_cs = support.rdmsr(msr::IA32_SYSENTER_CS);
    let sysenter_esp = support.rdmsr(msr::IA32_SYSENTER_ESP);
    let sysenter_eip = support.rdmsr(msr::IA32_SYSENTER_EIP);

    let cache = &mut vcpu.field_cache;
    cache.write(support, vmcs::host::CR0, host.cr0);
    cache.write(support, vmcs::host::CR3, host.cr3);
    cache.write(support, vmcs::host::CR4, host.cr4);

    // Host selectors must have RPL = 0 and TI = 0.
    cache.write(support, vmcs::host::ES_SELECTOR, (host.es & !0x7) as u64);
    cache.write(support, vmcs::host::CS_SELECTOR, (host.cs & !0x7) as u64);
    cache.write(support, vmcs::host::SS_SELECTOR, (host.ss & !0x7) as u64);
    cache.write(support, vmcs::host::DS_SELECTOR, (host.ds & !0x7) as u64);
    cache.write(support, vmcs::host::FS_SELECTOR, (host.fs & !0x7) as u64);
    cache.write(support, vmcs::host::GS_SELECTOR, (host.gs & !0x7) as u64);
    cache.write(support, vmcs::host::TR_SELECTOR, (host.tr & !0x7) as u64);

    cache.write(support, vmcs::host::FS_BASE, fs_base);
    cache.write(support, vmcs::host::GS_BASE, gs_base);
    cache.write(support, vmcs::host::TR_BASE, tr_base);
    cache.write(support, vmcs::host::GDTR_BASE, host.gdtr_base);
    cache.write(support, vmcs::host::IDTR_BASE, host.idtr_base);

    cache.write(support, vmcs::host::IA32_SYSENTER_CS, sysenter_cs);
    cache.write(support, vmcs::host::IA32_SYSENTER_ESP, sysenter_esp);
    cache.write(support, vmcs::host::IA32_SYSENTER_EIP, sysenter_eip);

    if let Some(page) = vcpu.pages.host_msrs.as_mut() {
        let mut area = MsrArea::new(page, 0);
        for index in AUTOLOAD_MSRS {
            area.push(index, support.rdmsr(index))?;
        }
        let count = area.count();
        vcpu.field_cache.write(support, vmcs::control::VMEXIT_MSR_LOAD_COUNT, count as u64);
    }

    vcpu.host_state_stale = false;
    Ok(())
}

//! Root-mode controller: VMXON and VMXOFF on one physical core.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.7 ENABLING AND ENTERING VMX OPERATION

use {
    crate::{
        error::HypervisorError,
        intel::{page::PhysPage, percpu::PhysicalCore, support::VmxSupport},
    },
    log::*,
    x86_64::registers::control::Cr4Flags,
};

/// Enters VMX root operation on the current core.
///
/// `scratch` is the caller-owned VMXON region for this core and `revision_id`
/// comes from IA32_VMX_BASIC.
pub fn enable_cpu<S: VmxSupport>(core: &PhysicalCore, support: &mut S, scratch: &mut PhysPage, revision_id: u32) -> Result<(), HypervisorError> {
    if scratch.pa == 0 || scratch.pa & 0xFFF != 0 {
        return Err(HypervisorError::InvalidParameter);
    }

    let cr4 = support.read_cr4();
    if cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() != 0 {
        return Err(HypervisorError::AlreadyInRootMode);
    }

    scratch.zero();
    scratch.write_u32(0, revision_id);

    trace!("Enabling Virtual Machine Extensions (VMX) on core {}", core.id);
    support.write_cr4(cr4 | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());

    trace!("Executing VMXON instruction");
    if let Err(e) = support.vmxon(scratch.pa) {
        error!("VMXON failed on core {}: {:?}", core.id, e);
        support.write_cr4(cr4);
        return Err(HypervisorError::RootModeEntryFailed);
    }

    core.set_root_mode(true);
    debug!("Core {} entered VMX root operation", core.id);

    Ok(())
}

/// Leaves VMX root operation on the current core.
pub fn disable_cpu<S: VmxSupport>(core: &PhysicalCore, support: &mut S, scratch: &PhysPage) -> Result<(), HypervisorError> {
    if scratch.pa == 0 {
        return Err(HypervisorError::InvalidParameter);
    }

    let cr4 = support.read_cr4();
    if cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() == 0 {
        return Err(HypervisorError::NotInRootMode);
    }

    support.vmxoff();
    support.write_cr4(cr4 & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
    core.set_root_mode(false);
    debug!("Core {} left VMX root operation", core.id);

    Ok(())
}

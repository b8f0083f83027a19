//! Snapshot of the VMX capability MSRs and the must-be-one / may-be-one rule
//! used to build every execution-control word.

use {
    crate::{config::MAX_AUTOLOAD_MSRS, error::HypervisorError, intel::support::VmxSupport},
    bit_field::BitField,
    log::*,
    x86::{
        msr,
        vmx::vmcs::control::{PinbasedControls, PrimaryControls, SecondaryControls},
    },
};

/// One IA32_VMX_*_CTLS pair: low dword = bits that must be 1, high dword = bits that may be 1.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.3 VM-EXECUTION CONTROLS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmxControlCaps {
    pub msr: u32,
    pub allowed0: u32,
    pub allowed1: u32,
}

impl VmxControlCaps {
    pub const fn from_msr(msr: u32, value: u64) -> Self {
        Self {
            msr,
            allowed0: value as u32,
            allowed1: (value >> 32) as u32,
        }
    }

    pub fn can_set(&self, bits: u32) -> bool {
        self.allowed1 & bits == bits
    }

    /// ORs the mandatory bits into `requested` and rejects bits the CPU cannot set.
    pub fn adjust(&self, requested: u32) -> Result<u32, HypervisorError> {
        let value = requested | self.allowed0;
        if value & self.allowed1 != value {
            error!("VMX controls {:#x} not allowed by MSR {:#x} (may-be-one {:#x})", requested, self.msr, self.allowed1);
            return Err(HypervisorError::UnsupportedControls { msr: self.msr, requested });
        }
        Ok(value)
    }
}

/// Everything the engine needs to know about the processor's VMX implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmxCapabilities {
    pub basic: u64,
    pub pinbased: VmxControlCaps,
    pub procbased: VmxControlCaps,
    pub procbased2: VmxControlCaps,
    pub exit: VmxControlCaps,
    pub entry: VmxControlCaps,
    pub misc: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub ept_vpid: u64,
}

impl VmxCapabilities {
    /// Reads the capability MSRs, honouring the TRUE_* variants when IA32_VMX_BASIC[55] says they exist.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.2 RESERVED CONTROLS AND DEFAULT SETTINGS
    pub fn read<S: VmxSupport>(support: &mut S) -> Self {
        let basic = support.rdmsr(msr::IA32_VMX_BASIC);
        let true_controls = basic.get_bit(55);

        let (pin_msr, proc_msr, exit_msr, entry_msr) = if true_controls {
            (msr::IA32_VMX_TRUE_PINBASED_CTLS, msr::IA32_VMX_TRUE_PROCBASED_CTLS, msr::IA32_VMX_TRUE_EXIT_CTLS, msr::IA32_VMX_TRUE_ENTRY_CTLS)
        } else {
            (msr::IA32_VMX_PINBASED_CTLS, msr::IA32_VMX_PROCBASED_CTLS, msr::IA32_VMX_EXIT_CTLS, msr::IA32_VMX_ENTRY_CTLS)
        };

        let procbased = VmxControlCaps::from_msr(proc_msr, support.rdmsr(proc_msr));
        let has_secondary = procbased.can_set(PrimaryControls::SECONDARY_CONTROLS.bits());

        let procbased2 = if has_secondary {
            VmxControlCaps::from_msr(msr::IA32_VMX_PROCBASED_CTLS2, support.rdmsr(msr::IA32_VMX_PROCBASED_CTLS2))
        } else {
            VmxControlCaps::from_msr(msr::IA32_VMX_PROCBASED_CTLS2, 0)
        };

        let caps = Self {
            basic,
            pinbased: VmxControlCaps::from_msr(pin_msr, support.rdmsr(pin_msr)),
            procbased,
            procbased2,
            exit: VmxControlCaps::from_msr(exit_msr, support.rdmsr(exit_msr)),
            entry: VmxControlCaps::from_msr(entry_msr, support.rdmsr(entry_msr)),
            misc: support.rdmsr(msr::IA32_VMX_MISC),
            cr0_fixed0: support.rdmsr(msr::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: support.rdmsr(msr::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: support.rdmsr(msr::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: support.rdmsr(msr::IA32_VMX_CR4_FIXED1),
            ept_vpid: if has_secondary { support.rdmsr(msr::IA32_VMX_EPT_VPID_CAP) } else { 0 },
        };

        debug!("VMX capabilities: {:x?}", caps);
        caps
    }

    /// VMCS revision identifier, IA32_VMX_BASIC[30:0].
    pub fn revision_id(&self) -> u32 {
        self.basic.get_bits(0..31) as u32
    }

    pub fn has_secondary_controls(&self) -> bool {
        self.procbased.can_set(PrimaryControls::SECONDARY_CONTROLS.bits())
    }

    pub fn supports_ept(&self) -> bool {
        self.has_secondary_controls() && self.procbased2.can_set(SecondaryControls::ENABLE_EPT.bits()) && self.supports_invept_single_context()
    }

    pub fn supports_vpid(&self) -> bool {
        self.has_secondary_controls() && self.procbased2.can_set(SecondaryControls::ENABLE_VPID.bits()) && self.supports_invvpid_single_context()
    }

    pub fn supports_tpr_shadow(&self) -> bool {
        self.procbased.can_set(PrimaryControls::USE_TPR_SHADOW.bits())
    }

    pub fn supports_msr_bitmap(&self) -> bool {
        self.procbased.can_set(PrimaryControls::USE_MSR_BITMAPS.bits())
    }

    pub fn supports_apic_access(&self) -> bool {
        self.has_secondary_controls() && self.procbased2.can_set(SecondaryControls::VIRTUALIZE_APIC.bits())
    }

    pub fn supports_preemption_timer(&self) -> bool {
        self.pinbased.can_set(PinbasedControls::VMX_PREEMPTION_TIMER.bits())
    }

    /// The preemption timer counts down once every 2^rate TSC ticks.
    pub fn preemption_timer_rate(&self) -> u32 {
        self.misc.get_bits(0..5) as u32
    }

    /// Maximum number of entries per autoload MSR list: 512 * (N + 1).
    pub fn max_autoload_msrs(&self) -> usize {
        512 * (self.misc.get_bits(25..28) as usize + 1)
    }

    /// Guest/host MSR autoload areas go with MSR bitmaps and need room for a full area.
    pub fn supports_msr_autoload(&self) -> bool {
        self.supports_msr_bitmap() && self.max_autoload_msrs() >= MAX_AUTOLOAD_MSRS
    }

    pub fn supports_invept_single_context(&self) -> bool {
        self.ept_vpid.get_bit(25)
    }

    pub fn supports_invept_all_contexts(&self) -> bool {
        self.ept_vpid.get_bit(26)
    }

    pub fn supports_invvpid_individual_address(&self) -> bool {
        self.ept_vpid.get_bit(40)
    }

    pub fn supports_invvpid_single_context(&self) -> bool {
        self.ept_vpid.get_bit(41)
    }

    pub fn supports_invvpid_all_contexts(&self) -> bool {
        self.ept_vpid.get_bit(42)
    }
}

/// IA32_FEATURE_CONTROL bits: lock (0) and VMXON outside SMX (2).
const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// Makes sure firmware left VMXON usable, locking the MSR ourselves if it did not.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.7 ENABLING AND ENTERING VMX OPERATION
pub fn adjust_feature_control_msr<S: VmxSupport>(support: &mut S) -> Result<(), HypervisorError> {
    let feature_control = support.rdmsr(msr::IA32_FEATURE_CONTROL);

    if feature_control & FEATURE_CONTROL_LOCKED == 0 {
        support.wrmsr(msr::IA32_FEATURE_CONTROL, feature_control | FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_OUTSIDE_SMX);
        trace!("IA32_FEATURE_CONTROL locked with VMXON enabled");
        return Ok(());
    }

    if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
        return Err(HypervisorError::VMXBIOSLock);
    }

    Ok(())
}

/// CPUID.1:ECX.VMX
const CPUID_FEATURE_VMX: u32 = 1 << 5;

/// Checks the CPU vendor, CPUID.1:ECX.VMX and IA32_FEATURE_CONTROL.
pub fn check_supported_cpu<S: VmxSupport>(support: &mut S) -> Result<(), HypervisorError> {
    let vendor = support.cpuid(0);
    let mut name = [0u8; 12];
    name[..4].copy_from_slice(&vendor.ebx.to_le_bytes());
    name[4..8].copy_from_slice(&vendor.edx.to_le_bytes());
    name[8..].copy_from_slice(&vendor.ecx.to_le_bytes());

    if &name != b"GenuineIntel" {
        return Err(HypervisorError::CPUUnsupported);
    }

    if vendor.eax < 1 || support.cpuid(1).ecx & CPUID_FEATURE_VMX == 0 {
        return Err(HypervisorError::VMXUnsupported);
    }
    info!("Virtual Machine Extension (VMX) technology is supported");

    adjust_feature_control_msr(support)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testing::SimulatedCpu};

    #[test]
    fn adjust_forces_mandatory_bits_and_rejects_unsupported_ones() {
        let caps = VmxControlCaps::from_msr(msr::IA32_VMX_PINBASED_CTLS, 0x0000_007F_0000_0016);

        assert_eq!(caps.adjust(0x1).unwrap(), 0x17);
        assert_eq!(
            caps.adjust(0x80),
            Err(HypervisorError::UnsupportedControls {
                msr: msr::IA32_VMX_PINBASED_CTLS,
                requested: 0x80
            })
        );
    }

    #[test]
    fn true_control_msrs_are_preferred() {
        let mut cpu = SimulatedCpu::new();
        cpu.msrs.insert(msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_00FF_0000_0000);
        cpu.msrs.insert(msr::IA32_VMX_PINBASED_CTLS, 0x0000_00FF_0000_0016);

        let caps = VmxCapabilities::read(&mut cpu);
        assert_eq!(caps.pinbased.allowed0, 0);
        assert!(caps.supports_ept());
        assert!(caps.supports_vpid());
    }

    #[test]
    fn locked_feature_control_without_vmxon_is_a_bios_lock() {
        let mut cpu = SimulatedCpu::new();
        cpu.msrs.insert(msr::IA32_FEATURE_CONTROL, FEATURE_CONTROL_LOCKED);
        assert_eq!(adjust_feature_control_msr(&mut cpu), Err(HypervisorError::VMXBIOSLock));

        cpu.msrs.insert(msr::IA32_FEATURE_CONTROL, 0);
        assert!(adjust_feature_control_msr(&mut cpu).is_ok());
        assert_eq!(cpu.msrs[&msr::IA32_FEATURE_CONTROL], FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_OUTSIDE_SMX);
    }

    #[test]
    fn non_intel_or_non_vmx_cpus_are_rejected() {
        let mut cpu = SimulatedCpu::new();
        assert!(check_supported_cpu(&mut cpu).is_ok());

        cpu.cpuid.get_mut(&1).unwrap().ecx &= !CPUID_FEATURE_VMX;
        assert_eq!(check_supported_cpu(&mut cpu), Err(HypervisorError::VMXUnsupported));

        // "AuthenticAMD"
        cpu.cpuid.get_mut(&0).unwrap().ebx = u32::from_le_bytes(*b"Auth");
        assert_eq!(check_supported_cpu(&mut cpu), Err(HypervisorError::CPUUnsupported));
    }
}

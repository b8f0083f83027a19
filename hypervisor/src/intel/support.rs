//! Hardware primitives used by the engine.
//!
//! Every privileged instruction the engine needs goes through [`VmxSupport`], so
//! the algorithms above it never touch the processor directly. [`HardwareSupport`]
//! is the real implementation for x86-64 hosts.

use {
    crate::intel::{capture::GuestRegisters, vmerror::VmxFailure},
    x86::cpuid::CpuIdResult,
};

/// INVEPT types.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvEptKind {
    SingleContext = 1,
    AllContexts = 2,
}

/// INVVPID types.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvVpidKind {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainGlobals = 3,
}

/// Which low-level entry routine runs the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunRoutine {
    /// Legacy, compatibility-less guests: real, protected and PAE modes.
    #[default]
    Guest32,
    /// Long-mode guests.
    Guest64,
}

/// Host control, selector and descriptor-table registers at the moment of capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostSegmentState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
}

/// DR0-DR3, DR6 and DR7 using the same slot numbering as the guest context.
pub type DebugRegisters = [u64; 8];

/// Privileged operations the engine issues on the current physical core.
pub trait VmxSupport {
    fn read_cr4(&mut self) -> u64;
    fn write_cr4(&mut self, value: u64);

    fn rdmsr(&mut self, msr: u32) -> u64;
    fn wrmsr(&mut self, msr: u32, value: u64);
    fn rdtsc(&mut self) -> u64;
    fn cpuid(&mut self, leaf: u32) -> CpuIdResult;

    fn vmxon(&mut self, region_pa: u64) -> Result<(), VmxFailure>;
    fn vmxoff(&mut self);
    fn vmclear(&mut self, vmcs_pa: u64) -> Result<(), VmxFailure>;
    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<(), VmxFailure>;

    /// Reads a field of the current VMCS. Unsupported fields read as zero.
    fn vmread(&mut self, field: u32) -> u64;
    /// Writes a field of the current VMCS.
    fn vmwrite(&mut self, field: u32, value: u64);

    fn invept(&mut self, kind: InvEptKind, eptp: u64) -> Result<(), VmxFailure>;
    fn invvpid(&mut self, kind: InvVpidKind, vpid: u16, address: u64) -> Result<(), VmxFailure>;

    /// Masks maskable interrupts and returns whether they were enabled.
    fn disable_interrupts(&mut self) -> bool;
    fn restore_interrupts(&mut self, were_enabled: bool);

    fn host_segments(&mut self) -> HostSegmentState;
    /// Reads the (up to 16-byte) descriptor `selector` refers to in the host GDT.
    fn read_host_descriptor(&mut self, gdtr_base: u64, selector: u16) -> [u64; 2];

    fn read_debug_registers(&mut self) -> DebugRegisters;
    fn write_debug_registers(&mut self, registers: &DebugRegisters);

    /// VMLAUNCH (`resume == false`) or VMRESUME. `Ok` means a VM exit occurred.
    fn world_switch(&mut self, registers: &mut GuestRegisters, resume: bool, routine: RunRoutine) -> Result<(), VmxFailure>;
}

/// Real hardware implementation.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default)]
pub struct HardwareSupport;

#[cfg(target_arch = "x86_64")]
mod hardware {
    use {
        super::*,
        crate::intel::vmlaunch,
        core::arch::asm,
        x86::{
            bits64::{rflags, vmx},
            dtables::{sgdt, sidt, DescriptorTablePointer},
        },
        x86_64::registers::control::{Cr0, Cr4},
    };

    const RFLAGS_CF: u64 = 1 << 0;
    const RFLAGS_ZF: u64 = 1 << 6;

    fn map_vmx_result(result: x86::vmx::Result<()>) -> Result<(), VmxFailure> {
        result.map_err(|e| match e {
            x86::vmx::VmFail::VmFailInvalid => VmxFailure::Invalid,
            x86::vmx::VmFail::VmFailValid => VmxFailure::Valid,
        })
    }

    fn flags_to_result(flags: u64) -> Result<(), VmxFailure> {
        if flags & RFLAGS_CF != 0 {
            Err(VmxFailure::Invalid)
        } else if flags & RFLAGS_ZF != 0 {
            Err(VmxFailure::Valid)
        } else {
            Ok(())
        }
    }

    #[repr(C)]
    struct InvEptDescriptor {
        eptp: u64,
        reserved: u64,
    }

    #[repr(C)]
    struct InvVpidDescriptor {
        vpid: u64,
        linear_address: u64,
    }

    impl VmxSupport for HardwareSupport {
        fn read_cr4(&mut self) -> u64 {
            Cr4::read_raw()
        }

        fn write_cr4(&mut self, value: u64) {
            unsafe { Cr4::write_raw(value) };
        }

        fn rdmsr(&mut self, msr: u32) -> u64 {
            unsafe { x86::msr::rdmsr(msr) }
        }

        fn wrmsr(&mut self, msr: u32, value: u64) {
            unsafe { x86::msr::wrmsr(msr, value) };
        }

        fn rdtsc(&mut self) -> u64 {
            unsafe { x86::time::rdtsc() }
        }

        fn cpuid(&mut self, leaf: u32) -> CpuIdResult {
            x86::cpuid::cpuid!(leaf)
        }

        fn vmxon(&mut self, region_pa: u64) -> Result<(), VmxFailure> {
            map_vmx_result(unsafe { vmx::vmxon(region_pa) })
        }

        fn vmxoff(&mut self) {
            // VMXOFF only fails outside root mode, which the caller has already ruled out.
            let _ = unsafe { vmx::vmxoff() };
        }

        fn vmclear(&mut self, vmcs_pa: u64) -> Result<(), VmxFailure> {
            map_vmx_result(unsafe { vmx::vmclear(vmcs_pa) })
        }

        fn vmptrld(&mut self, vmcs_pa: u64) -> Result<(), VmxFailure> {
            map_vmx_result(unsafe { vmx::vmptrld(vmcs_pa) })
        }

        fn vmread(&mut self, field: u32) -> u64 {
            unsafe { vmx::vmread(field) }.unwrap_or(0)
        }

        fn vmwrite(&mut self, field: u32, value: u64) {
            // A failed write surfaces later as a VM-entry failure with full diagnostics.
            let _ = unsafe { vmx::vmwrite(field, value) };
        }

        fn invept(&mut self, kind: InvEptKind, eptp: u64) -> Result<(), VmxFailure> {
            let descriptor = InvEptDescriptor { eptp, reserved: 0 };
            let flags: u64;
            unsafe {
                asm!(
                    "invept {kind}, [{desc}]",
                    "pushfq",
                    "pop {flags}",
                    kind = in(reg) kind as u64,
                    desc = in(reg) &descriptor,
                    flags = lateout(reg) flags,
                );
            }
            flags_to_result(flags)
        }

        fn invvpid(&mut self, kind: InvVpidKind, vpid: u16, address: u64) -> Result<(), VmxFailure> {
            let descriptor = InvVpidDescriptor {
                vpid: vpid as u64,
                linear_address: address,
            };
            let flags: u64;
            unsafe {
                asm!(
                    "invvpid {kind}, [{desc}]",
                    "pushfq",
                    "pop {flags}",
                    kind = in(reg) kind as u64,
                    desc = in(reg) &descriptor,
                    flags = lateout(reg) flags,
                );
            }
            flags_to_result(flags)
        }

        fn disable_interrupts(&mut self) -> bool {
            let enabled = rflags::read().contains(rflags::RFlags::FLAGS_IF);
            unsafe { x86::irq::disable() };
            enabled
        }

        fn restore_interrupts(&mut self, were_enabled: bool) {
            if were_enabled {
                unsafe { x86::irq::enable() };
            }
        }

        #[allow(unused_unsafe)]
        fn host_segments(&mut self) -> HostSegmentState {
            let mut gdtr = DescriptorTablePointer::<u64>::default();
            let mut idtr = DescriptorTablePointer::<u64>::default();
            unsafe {
                sgdt(&mut gdtr);
                sidt(&mut idtr);
            }

            unsafe {
                HostSegmentState {
                    cr0: Cr0::read_raw(),
                    cr3: x86::controlregs::cr3(),
                    cr4: Cr4::read_raw(),
                    cs: x86::segmentation::cs().bits(),
                    ss: x86::segmentation::ss().bits(),
                    ds: x86::segmentation::ds().bits(),
                    es: x86::segmentation::es().bits(),
                    fs: x86::segmentation::fs().bits(),
                    gs: x86::segmentation::gs().bits(),
                    tr: x86::task::tr().bits(),
                    gdtr_base: gdtr.base as u64,
                    gdtr_limit: gdtr.limit,
                    idtr_base: idtr.base as u64,
                    idtr_limit: idtr.limit,
                }
            }
        }

        fn read_host_descriptor(&mut self, gdtr_base: u64, selector: u16) -> [u64; 2] {
            let entry = (gdtr_base + (selector & !0x7) as u64) as *const u64;
            unsafe { [entry.read_unaligned(), entry.add(1).read_unaligned()] }
        }

        fn read_debug_registers(&mut self) -> DebugRegisters {
            let mut dr = [0u64; 8];
            unsafe {
                asm!("mov {}, dr0", out(reg) dr[0], options(nomem, nostack));
                asm!("mov {}, dr1", out(reg) dr[1], options(nomem, nostack));
                asm!("mov {}, dr2", out(reg) dr[2], options(nomem, nostack));
                asm!("mov {}, dr3", out(reg) dr[3], options(nomem, nostack));
                asm!("mov {}, dr6", out(reg) dr[6], options(nomem, nostack));
                asm!("mov {}, dr7", out(reg) dr[7], options(nomem, nostack));
            }
            dr
        }

        fn write_debug_registers(&mut self, registers: &DebugRegisters) {
            unsafe {
                asm!("mov dr0, {}", in(reg) registers[0], options(nomem, nostack));
                asm!("mov dr1, {}", in(reg) registers[1], options(nomem, nostack));
                asm!("mov dr2, {}", in(reg) registers[2], options(nomem, nostack));
                asm!("mov dr3, {}", in(reg) registers[3], options(nomem, nostack));
                asm!("mov dr6, {}", in(reg) registers[6], options(nomem, nostack));
                asm!("mov dr7, {}", in(reg) registers[7], options(nomem, nostack));
            }
        }

        fn world_switch(&mut self, registers: &mut GuestRegisters, resume: bool, routine: RunRoutine) -> Result<(), VmxFailure> {
            let flags = match routine {
                RunRoutine::Guest64 => unsafe { vmlaunch::launch_vm(registers, resume as u64) },
                RunRoutine::Guest32 => unsafe { vmlaunch::launch_vm32(registers, resume as u64) },
            };
            flags_to_result(flags)
        }
    }
}

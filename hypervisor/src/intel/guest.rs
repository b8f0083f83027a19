//! Moves the canonical guest context into the VMCS before an entry and back out after an exit.
//!
//! Only RIP, RSP, RFLAGS and the interruptibility state are written when nothing
//! else changed since the last full load. Everything else goes through the
//! full path, which clears the change set when it is done.

use {
    crate::{
        config::REAL_MODE_TSS_SIZE,
        error::HypervisorError,
        intel::{
            context::{GuestCpuContext, SegmentRegister, ACCESS_RIGHTS_UNUSABLE},
            dirty::GuestStateChanges,
            msr::MsrArea,
            realmode::{fixup_after_real_mode, v86_segment, SegmentRole, BUSY_TSS_ACCESS_RIGHTS},
            support::{RunRoutine, VmxSupport},
            vcpu::VirtualCpu,
            vmcs::{base_exception_bitmap, REAL_MODE_EXCEPTION_BITMAP},
        },
        services::{GuestMemory, InstructionEmulator, TimerService},
    },
    bit_field::BitField,
    log::*,
    x86::{
        msr,
        vmx::vmcs::{
            self,
            control::{EntryControls, PinbasedControls, PrimaryControls},
        },
    },
    x86_64::registers::control::{Cr0Flags, Cr4Flags},
};

/// Values pulled from the services before interrupts are disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryInputs {
    pub eptp: u64,
    pub shadow_cr3: u64,
    pub identity_cr3: u64,
    pub real_mode_tss: Option<u64>,
    pub tsc_offset: Option<u64>,
    pub last_guest_tsc: u64,
    pub timer_deadline: Option<u64>,
    pub guest_fpu_active: bool,
}

impl EntryInputs {
    pub fn gather<V: GuestMemory + TimerService + InstructionEmulator + ?Sized>(services: &V) -> Self {
        Self {
            eptp: services.eptp(),
            shadow_cr3: services.shadow_cr3(),
            identity_cr3: services.identity_cr3(),
            real_mode_tss: services.real_mode_tss(),
            tsc_offset: services.tsc_offset(),
            last_guest_tsc: services.last_guest_tsc(),
            timer_deadline: services.ticks_to_deadline(),
            guest_fpu_active: services.guest_fpu_active(),
        }
    }
}

/// How guest reads of the time-stamp counter are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TscMode {
    /// RDTSC runs natively with this offset added.
    Offset(u64),
    /// RDTSC exits to the instruction emulator.
    #[default]
    Intercept,
    /// RDTSC runs natively with no offset.
    Passthrough,
}

impl TscMode {
    /// Lets RDTSC run natively only if the guest cannot see the counter go backwards.
    pub fn select(offset: Option<u64>, host_tsc: u64, last_guest_tsc: u64) -> Self {
        let Some(offset) = offset else {
            return TscMode::Intercept;
        };

        if host_tsc.wrapping_add(offset) < last_guest_tsc {
            return TscMode::Intercept;
        }

        match offset {
            0 => TscMode::Passthrough,
            offset => TscMode::Offset(offset),
        }
    }
}

/// VMCS encodings of one segment register.
struct SegmentFields {
    selector: u32,
    base: u32,
    limit: u32,
    access_rights: u32,
}

const ES_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::ES_SELECTOR,
    base: vmcs::guest::ES_BASE,
    limit: vmcs::guest::ES_LIMIT,
    access_rights: vmcs::guest::ES_ACCESS_RIGHTS,
};
const CS_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::CS_SELECTOR,
    base: vmcs::guest::CS_BASE,
    limit: vmcs::guest::CS_LIMIT,
    access_rights: vmcs::guest::CS_ACCESS_RIGHTS,
};
const SS_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::SS_SELECTOR,
    base: vmcs::guest::SS_BASE,
    limit: vmcs::guest::SS_LIMIT,
    access_rights: vmcs::guest::SS_ACCESS_RIGHTS,
};
const DS_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::DS_SELECTOR,
    base: vmcs::guest::DS_BASE,
    limit: vmcs::guest::DS_LIMIT,
    access_rights: vmcs::guest::DS_ACCESS_RIGHTS,
};
const FS_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::FS_SELECTOR,
    base: vmcs::guest::FS_BASE,
    limit: vmcs::guest::FS_LIMIT,
    access_rights: vmcs::guest::FS_ACCESS_RIGHTS,
};
const GS_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::GS_SELECTOR,
    base: vmcs::guest::GS_BASE,
    limit: vmcs::guest::GS_LIMIT,
    access_rights: vmcs::guest::GS_ACCESS_RIGHTS,
};
const LDTR_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::LDTR_SELECTOR,
    base: vmcs::guest::LDTR_BASE,
    limit: vmcs::guest::LDTR_LIMIT,
    access_rights: vmcs::guest::LDTR_ACCESS_RIGHTS,
};
const TR_FIELDS: SegmentFields = SegmentFields {
    selector: vmcs::guest::TR_SELECTOR,
    base: vmcs::guest::TR_BASE,
    limit: vmcs::guest::TR_LIMIT,
    access_rights: vmcs::guest::TR_ACCESS_RIGHTS,
};

fn code_and_data_segments(ctx: &mut GuestCpuContext) -> [(&'static SegmentFields, SegmentRole, &mut SegmentRegister); 6] {
    [
        (&ES_FIELDS, SegmentRole::Data, &mut ctx.es),
        (&CS_FIELDS, SegmentRole::Code, &mut ctx.cs),
        (&SS_FIELDS, SegmentRole::Stack, &mut ctx.ss),
        (&DS_FIELDS, SegmentRole::Data, &mut ctx.ds),
        (&FS_FIELDS, SegmentRole::Data, &mut ctx.fs),
        (&GS_FIELDS, SegmentRole::Data, &mut ctx.gs),
    ]
}

/// A segment the VMCS must see with the "unusable" bit.
fn is_unusable(segment: &SegmentRegister) -> bool {
    segment.access_rights & ACCESS_RIGHTS_UNUSABLE != 0 || !segment.is_present()
}

/// Access rights as the VMCS wants them: reserved bits 11:8 clear, unusable segments marked.
fn vmcs_access_rights(segment: &SegmentRegister) -> u32 {
    if is_unusable(segment) {
        // SS keeps its DPL since the CPL is taken from it.
        ACCESS_RIGHTS_UNUSABLE | (segment.access_rights & 0x60)
    } else {
        segment.access_rights & 0xF0FF
    }
}

fn write_segment<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, fields: &SegmentFields, segment: &SegmentRegister, access_rights: u32) {
    let cache = &mut vcpu.field_cache;
    cache.write(support, fields.selector, segment.selector as u64);
    cache.write(support, fields.base, segment.base);
    cache.write(support, fields.limit, segment.limit as u64);
    cache.write(support, fields.access_rights, access_rights as u64);
}

/// CR0 bits the host owns; guest reads of them come from the shadow.
pub fn cr0_guest_host_mask(vcpu: &VirtualCpu) -> u64 {
    let owned = Cr0Flags::PROTECTED_MODE_ENABLE
        | Cr0Flags::WRITE_PROTECT
        | Cr0Flags::PAGING
        | Cr0Flags::CACHE_DISABLE
        | Cr0Flags::NOT_WRITE_THROUGH
        | Cr0Flags::TASK_SWITCHED
        | Cr0Flags::EXTENSION_TYPE
        | Cr0Flags::NUMERIC_ERROR
        | Cr0Flags::MONITOR_COPROCESSOR;
    owned.bits() | vcpu.caps.cr0_fixed0 | !vcpu.caps.cr0_fixed1
}

/// CR4 bits the host owns.
pub fn cr4_guest_host_mask(vcpu: &VirtualCpu) -> u64 {
    let owned = Cr4Flags::VIRTUAL_8086_MODE_EXTENSIONS
        | Cr4Flags::PHYSICAL_ADDRESS_EXTENSION
        | Cr4Flags::PAGE_GLOBAL
        | Cr4Flags::PAGE_SIZE_EXTENSION
        | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS;
    owned.bits() | vcpu.caps.cr4_fixed0 | !vcpu.caps.cr4_fixed1
}

/// Puts the guest's debug registers into hardware and stops trapping MOV DR.
///
/// The host's registers are kept for [`crate::intel::host::leave`]. Nothing happens
/// while a host debugger owns the registers.
pub fn activate_guest_debug_state<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext) -> bool {
    if vcpu.config.host_debugging {
        return false;
    }

    if !vcpu.guest_debug_active {
        if vcpu.host_debug_saved.is_none() {
            vcpu.host_debug_saved = Some(support.read_debug_registers());
        }
        vcpu.guest_debug_active = true;
    }

    // DR7 is loaded from the VMCS on entry; a live DR7 here would arm breakpoints in the host.
    let mut registers = ctx.dr;
    registers[7] = 0x400;
    support.write_debug_registers(&registers);

    let procbased = vcpu.controls.procbased & !PrimaryControls::MOV_DR_EXITING.bits() | vcpu.caps.procbased.allowed0;
    if procbased != vcpu.controls.procbased {
        vcpu.controls.procbased = procbased;
        vcpu.field_cache.write(support, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased as u64);
    }

    true
}

/// DR7 with its reserved bits forced to their architectural values.
pub fn normalize_dr7(dr7: u64) -> u64 {
    let mut dr7 = dr7 & 0xFFFF_FFFF;
    dr7.set_bit(11, false);
    dr7.set_bit(12, false);
    dr7.set_bit(14, false);
    dr7.set_bit(15, false);
    dr7.set_bit(10, true);
    dr7
}

fn set_procbased<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, set: PrimaryControls, clear: PrimaryControls) {
    let procbased = (vcpu.controls.procbased | set.bits()) & !(clear.bits() & !vcpu.caps.procbased.allowed0);
    if procbased != vcpu.controls.procbased {
        vcpu.controls.procbased = procbased;
        vcpu.field_cache.write(support, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased as u64);
    }
}

fn interruptibility(ctx: &GuestCpuContext) -> u64 {
    if !ctx.interrupts_inhibited() {
        0
    } else if ctx.interrupts_enabled() {
        // blocking by STI
        1
    } else {
        // blocking by MOV SS
        2
    }
}

fn load_minimal<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext, inputs: &EntryInputs) {
    let mut rflags = (ctx.regs.rflags & 0x3F_7FD5) | 0x2;
    if vcpu.real_mode.emulating {
        rflags = vcpu.real_mode.mask_rflags(rflags);
    }

    let cache = &mut vcpu.field_cache;
    cache.write(support, vmcs::guest::RIP, ctx.regs.rip);
    cache.write(support, vmcs::guest::RSP, ctx.regs.rsp);
    cache.write(support, vmcs::guest::RFLAGS, rflags);
    cache.write(support, vmcs::guest::INTERRUPTIBILITY_STATE, interruptibility(ctx));

    if vcpu.controls.has_pinbased(PinbasedControls::VMX_PREEMPTION_TIMER) {
        let ticks = inputs.timer_deadline.map_or(u32::MAX as u64, |ticks| ticks >> vcpu.caps.preemption_timer_rate());
        cache.write(support, vmcs::guest::VMX_PREEMPTION_TIMER_VALUE, ticks.min(u32::MAX as u64));
    }
}

fn load_segments<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext, inputs: &EntryInputs) -> Result<(), HypervisorError> {
    let emulating = vcpu.real_mode.emulating;
    let leaving_real_mode = !emulating && vcpu.real_mode.was_real_mode;

    let mut scratch = ctx.clone();
    for (fields, role, segment) in code_and_data_segments(&mut scratch) {
        if emulating {
            let v86 = v86_segment(segment.selector);
            write_segment(vcpu, support, fields, &v86, v86.access_rights);
            continue;
        }

        if leaving_real_mode {
            fixup_after_real_mode(segment, role);
        }
        let access_rights = vmcs_access_rights(segment);
        write_segment(vcpu, support, fields, segment, access_rights);
    }

    write_segment(vcpu, support, &LDTR_FIELDS, &ctx.ldtr, vmcs_access_rights(&ctx.ldtr));

    let tr = if emulating {
        let base = inputs.real_mode_tss.ok_or(HypervisorError::RealModeTssMissing)?;
        SegmentRegister::new(0, base, REAL_MODE_TSS_SIZE - 1, BUSY_TSS_ACCESS_RIGHTS)
    } else if is_unusable(&ctx.tr) {
        // VM entry requires a usable busy TSS.
        SegmentRegister::new(0, 0, 0x67, BUSY_TSS_ACCESS_RIGHTS)
    } else {
        let mut tr = ctx.tr;
        match tr.segment_type() {
            // available 32-bit TSS
            9 => {
                tr.access_rights.set_bits(0..4, 0xB);
            }
            // available 16-bit TSS
            1 => {
                tr.access_rights.set_bits(0..4, 0x3);
            }
            _ => {}
        }
        tr
    };
    write_segment(vcpu, support, &TR_FIELDS, &tr, tr.access_rights & 0xF0FF);

    let cache = &mut vcpu.field_cache;
    cache.write(support, vmcs::guest::GDTR_BASE, ctx.gdtr.base);
    cache.write(support, vmcs::guest::GDTR_LIMIT, ctx.gdtr.limit as u64);
    cache.write(support, vmcs::guest::IDTR_BASE, ctx.idtr.base);
    cache.write(support, vmcs::guest::IDTR_LIMIT, ctx.idtr.limit as u64);

    Ok(())
}

fn load_control_registers<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext, inputs: &EntryInputs) {
    let nested_paging = vcpu.policy.nested_paging;
    let paging = ctx.is_paging_enabled();

    let mut cr0 = ctx.cr0 | Cr0Flags::NUMERIC_ERROR.bits();
    if !nested_paging {
        cr0 |= (Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT | Cr0Flags::PROTECTED_MODE_ENABLE).bits();
    } else if !paging {
        cr0 |= Cr0Flags::PAGING.bits();
    }
    if vcpu.real_mode.emulating {
        cr0 |= Cr0Flags::PROTECTED_MODE_ENABLE.bits();
    }
    if !inputs.guest_fpu_active {
        cr0 |= (Cr0Flags::TASK_SWITCHED | Cr0Flags::MONITOR_COPROCESSOR).bits();
    }
    cr0 = (cr0 | vcpu.caps.cr0_fixed0) & vcpu.caps.cr0_fixed1;

    let mut cr4 = ctx.cr4;
    if !nested_paging {
        cr4 |= Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
    } else if !paging {
        // The identity map uses 4 MiB pages.
        cr4 |= Cr4Flags::PAGE_SIZE_EXTENSION.bits();
        cr4 &= !Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
    }
    if vcpu.real_mode.emulating {
        cr4 |= Cr4Flags::VIRTUAL_8086_MODE_EXTENSIONS.bits();
    }
    cr4 = (cr4 | vcpu.caps.cr4_fixed0) & vcpu.caps.cr4_fixed1;

    vcpu.cr0_mask = cr0_guest_host_mask(vcpu);
    vcpu.cr4_mask = cr4_guest_host_mask(vcpu);

    let cr3 = if !nested_paging {
        inputs.shadow_cr3
    } else if paging {
        ctx.cr3
    } else {
        inputs.identity_cr3
    };

    if nested_paging {
        let cr3_exiting = PrimaryControls::CR3_LOAD_EXITING | PrimaryControls::CR3_STORE_EXITING;
        if paging {
            set_procbased(vcpu, support, PrimaryControls::empty(), cr3_exiting);
        } else {
            set_procbased(vcpu, support, cr3_exiting, PrimaryControls::empty());
        }
        vcpu.tlb.eptp = inputs.eptp;
    }

    let cache = &mut vcpu.field_cache;
    cache.write(support, vmcs::guest::CR0, cr0);
    cache.write(support, vmcs::control::CR0_READ_SHADOW, ctx.cr0);
    cache.write(support, vmcs::control::CR0_GUEST_HOST_MASK, vcpu.cr0_mask);
    cache.write(support, vmcs::guest::CR4, cr4);
    cache.write(support, vmcs::control::CR4_READ_SHADOW, ctx.cr4);
    cache.write(support, vmcs::control::CR4_GUEST_HOST_MASK, vcpu.cr4_mask);
    cache.write(support, vmcs::guest::CR3, cr3);

    if nested_paging {
        cache.write(support, vmcs::control::EPTP_FULL, inputs.eptp);
        if ctx.is_pae_paging() {
            cache.write(support, vmcs::guest::PDPTE0_FULL, ctx.pdpte[0]);
            cache.write(support, vmcs::guest::PDPTE1_FULL, ctx.pdpte[1]);
            cache.write(support, vmcs::guest::PDPTE2_FULL, ctx.pdpte[2]);
            cache.write(support, vmcs::guest::PDPTE3_FULL, ctx.pdpte[3]);
        }
    }
}

fn load_debug_registers<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext) {
    vcpu.field_cache.write(support, vmcs::guest::DR7, normalize_dr7(ctx.dr[7]));

    if vcpu.config.host_debugging {
        set_procbased(vcpu, support, PrimaryControls::MOV_DR_EXITING, PrimaryControls::empty());
    } else if ctx.dr[7] & 0xFF != 0 {
        // Armed breakpoints need the guest's DR0-DR3 in hardware.
        activate_guest_debug_state(vcpu, support, ctx);
    } else if !vcpu.guest_debug_active {
        set_procbased(vcpu, support, PrimaryControls::MOV_DR_EXITING, PrimaryControls::empty());
    }
}

fn load_autoload_msrs<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext) -> Result<(), HypervisorError> {
    let Some(page) = vcpu.pages.guest_msrs.as_mut() else {
        return Ok(());
    };

    let mut area = MsrArea::new(page, 0);
    area.push(msr::IA32_EFER, ctx.efer)?;
    if ctx.is_long_mode() {
        area.push(msr::IA32_STAR, ctx.star)?;
        area.push(msr::IA32_LSTAR, ctx.lstar)?;
        area.push(msr::IA32_FMASK, ctx.sfmask)?;
        area.push(msr::IA32_KERNEL_GSBASE, ctx.kernel_gs_base)?;
    }
    let count = area.count();

    vcpu.guest_msr_count = count;
    vcpu.field_cache.write(support, vmcs::control::VMENTRY_MSR_LOAD_COUNT, count as u64);
    vcpu.field_cache.write(support, vmcs::control::VMEXIT_MSR_STORE_COUNT, count as u64);

    Ok(())
}

fn load_tsc_mode<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, inputs: &EntryInputs) {
    let mode = TscMode::select(inputs.tsc_offset, support.rdtsc(), inputs.last_guest_tsc);

    match mode {
        TscMode::Offset(offset) => {
            set_procbased(vcpu, support, PrimaryControls::USE_TSC_OFFSETTING, PrimaryControls::RDTSC_EXITING);
            vcpu.field_cache.write(support, vmcs::control::TSC_OFFSET_FULL, offset);
        }
        TscMode::Passthrough => {
            set_procbased(vcpu, support, PrimaryControls::empty(), PrimaryControls::RDTSC_EXITING | PrimaryControls::USE_TSC_OFFSETTING);
        }
        TscMode::Intercept => set_procbased(vcpu, support, PrimaryControls::RDTSC_EXITING, PrimaryControls::empty()),
    }

    vcpu.tsc_mode = mode;
}

fn load_full<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext, inputs: &EntryInputs) -> Result<(), HypervisorError> {
    let emulating = ctx.is_real_mode();
    vcpu.real_mode.emulating = emulating;

    // Entry controls: IA-32e mode guest follows EFER.LMA.
    let ia32e = EntryControls::IA32E_MODE_GUEST.bits();
    let entry = if ctx.is_long_mode() { vcpu.controls.entry | ia32e } else { vcpu.controls.entry & !ia32e };
    vcpu.controls.entry = entry;
    vcpu.field_cache.write(support, vmcs::control::VMENTRY_CONTROLS, entry as u64);
    vcpu.field_cache.write(support, vmcs::control::VMEXIT_CONTROLS, vcpu.controls.exit as u64);

    load_minimal(vcpu, support, ctx, inputs);
    load_segments(vcpu, support, ctx, inputs)?;
    load_control_registers(vcpu, support, ctx, inputs);

    let mut exception_bitmap = base_exception_bitmap(&vcpu.policy);
    if emulating {
        exception_bitmap |= REAL_MODE_EXCEPTION_BITMAP;
    }
    if exception_bitmap != vcpu.controls.exception_bitmap {
        vcpu.controls.exception_bitmap = exception_bitmap;
        vcpu.field_cache.write(support, vmcs::control::EXCEPTION_BITMAP, exception_bitmap as u64);
    }

    load_debug_registers(vcpu, support, ctx);

    let cache = &mut vcpu.field_cache;
    cache.write(support, vmcs::guest::IA32_SYSENTER_CS, ctx.sysenter_cs);
    cache.write(support, vmcs::guest::IA32_SYSENTER_EIP, ctx.sysenter_eip);
    cache.write(support, vmcs::guest::IA32_SYSENTER_ESP, ctx.sysenter_esp);
    cache.write(support, vmcs::guest::ACTIVITY_STATE, 0);

    load_autoload_msrs(vcpu, support, ctx)?;
    load_tsc_mode(vcpu, support, inputs);

    vcpu.run_routine = if ctx.is_long_mode() { RunRoutine::Guest64 } else { RunRoutine::Guest32 };
    vcpu.real_mode.was_real_mode = emulating;

    Ok(())
}

/// Writes the guest context into the VMCS (through the field cache).
///
/// The change set is empty afterwards, whichever path ran.
pub fn load_guest_state<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &GuestCpuContext, inputs: &EntryInputs) -> Result<(), HypervisorError> {
    if vcpu.dirty.needs_full_load() {
        load_full(vcpu, support, ctx, inputs)?;
    } else {
        load_minimal(vcpu, support, ctx, inputs);
    }

    vcpu.dirty = GuestStateChanges::empty();
    Ok(())
}

/// Reads the guest state the VM exit left in the VMCS back into the context.
pub fn save_guest_state<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, ctx: &mut GuestCpuContext) -> Result<(), HypervisorError> {
    let emulating = vcpu.real_mode.emulating;

    ctx.regs.rip = read(vcpu, support, vmcs::guest::RIP);
    ctx.regs.rsp = read(vcpu, support, vmcs::guest::RSP);
    let rflags = read(vcpu, support, vmcs::guest::RFLAGS);
    ctx.regs.rflags = if emulating { vcpu.real_mode.unmask_rflags(rflags) } else { rflags };

    ctx.interrupt_inhibit_pc = match read(vcpu, support, vmcs::guest::INTERRUPTIBILITY_STATE) & 0x3 {
        0 => None,
        _ => Some(ctx.regs.rip),
    };

    let cr0 = read(vcpu, support, vmcs::guest::CR0);
    let cr0_shadow = read(vcpu, support, vmcs::control::CR0_READ_SHADOW);
    ctx.cr0 = (cr0_shadow & vcpu.cr0_mask) | (cr0 & !vcpu.cr0_mask);

    let cr4 = read(vcpu, support, vmcs::guest::CR4);
    let cr4_shadow = read(vcpu, support, vmcs::control::CR4_READ_SHADOW);
    ctx.cr4 = (cr4_shadow & vcpu.cr4_mask) | (cr4 & !vcpu.cr4_mask);

    if vcpu.policy.nested_paging && ctx.is_paging_enabled() {
        ctx.cr3 = read(vcpu, support, vmcs::guest::CR3);
        if ctx.is_pae_paging() {
            ctx.pdpte = [
                read(vcpu, support, vmcs::guest::PDPTE0_FULL),
                read(vcpu, support, vmcs::guest::PDPTE1_FULL),
                read(vcpu, support, vmcs::guest::PDPTE2_FULL),
                read(vcpu, support, vmcs::guest::PDPTE3_FULL),
            ];
        }
    }

    ctx.dr[7] = read(vcpu, support, vmcs::guest::DR7);

    for (fields, _, segment) in code_and_data_segments(ctx) {
        segment.selector = read(vcpu, support, fields.selector) as u16;
        segment.base = read(vcpu, support, fields.base);
        if emulating {
            // Limit and attributes stay those of the real-mode descriptor cache.
            continue;
        }
        segment.limit = read(vcpu, support, fields.limit) as u32;
        save_access_rights(segment, read(vcpu, support, fields.access_rights) as u32);
    }

    ctx.ldtr.selector = read(vcpu, support, LDTR_FIELDS.selector) as u16;
    ctx.ldtr.base = read(vcpu, support, LDTR_FIELDS.base);
    ctx.ldtr.limit = read(vcpu, support, LDTR_FIELDS.limit) as u32;
    save_access_rights(&mut ctx.ldtr, read(vcpu, support, LDTR_FIELDS.access_rights) as u32);

    if !emulating {
        ctx.tr.selector = read(vcpu, support, TR_FIELDS.selector) as u16;
        ctx.tr.base = read(vcpu, support, TR_FIELDS.base);
        ctx.tr.limit = read(vcpu, support, TR_FIELDS.limit) as u32;
        save_access_rights(&mut ctx.tr, read(vcpu, support, TR_FIELDS.access_rights) as u32);
    }

    ctx.gdtr.base = read(vcpu, support, vmcs::guest::GDTR_BASE);
    ctx.gdtr.limit = read(vcpu, support, vmcs::guest::GDTR_LIMIT) as u32;
    ctx.idtr.base = read(vcpu, support, vmcs::guest::IDTR_BASE);
    ctx.idtr.limit = read(vcpu, support, vmcs::guest::IDTR_LIMIT) as u32;

    ctx.sysenter_cs = read(vcpu, support, vmcs::guest::IA32_SYSENTER_CS);
    ctx.sysenter_eip = read(vcpu, support, vmcs::guest::IA32_SYSENTER_EIP);
    ctx.sysenter_esp = read(vcpu, support, vmcs::guest::IA32_SYSENTER_ESP);

    save_autoload_msrs(vcpu, ctx)
}

fn read<S: VmxSupport>(vcpu: &VirtualCpu, support: &mut S, field: u32) -> u64 {
    vcpu.field_cache.read(support, field)
}

/// Unusable segments come back as the unusable marker plus their DPL, whatever the caller's
/// context held before.
fn save_access_rights(segment: &mut SegmentRegister, access_rights: u32) {
    segment.access_rights = if access_rights & ACCESS_RIGHTS_UNUSABLE == 0 { access_rights } else { ACCESS_RIGHTS_UNUSABLE | (access_rights & 0x60) };
}

fn save_autoload_msrs(vcpu: &mut VirtualCpu, ctx: &mut GuestCpuContext) -> Result<(), HypervisorError> {
    let count = vcpu.guest_msr_count;
    let Some(page) = vcpu.pages.guest_msrs.as_mut() else {
        return Ok(());
    };

    let area = MsrArea::new(page, count);
    for (index, value) in area.iter() {
        match index {
            msr::IA32_EFER => ctx.efer = value,
            msr::IA32_STAR => ctx.star = value,
            msr::IA32_LSTAR => ctx.lstar = value,
            msr::IA32_FMASK => ctx.sfmask = value,
            msr::IA32_KERNEL_GSBASE => ctx.kernel_gs_base = value,
            _ => {
                error!("Unexpected MSR {:#x} in the guest autoload area", index);
                return Err(HypervisorError::UnknownAutoloadMsr(index));
            }
        }
    }

    Ok(())
}

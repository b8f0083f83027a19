//! Test doubles: a software model of the VMX instructions, a scripted VM, and
//! a page allocator backed by the test process heap.
//!
//! [`SimulatedCpu`] keeps the current VMCS as a plain field map and plays back
//! a queue of [`ScriptedExit`]s on every world switch. [`MockServices`] stands
//! in for the rest of the VM with public knobs for each service.

use {
    crate::{
        config::{EngineConfig, PAGE_SIZE, VIRTUAL_APIC_TPR_OFFSET},
        intel::{
            capabilities::VmxCapabilities,
            capture::GuestRegisters,
            context::{DescriptorTable, GuestCpuContext, SegmentRegister, ACCESS_RIGHTS_UNUSABLE},
            page::{PageAllocator, PhysPage},
            support::{DebugRegisters, HostSegmentState, InvEptKind, InvVpidKind, RunRoutine, VmxSupport},
            tlb::TlbStrategy,
            vcpu::VirtualCpu,
            vmcs::{init_region, setup_vmcs_control_fields, ControlPolicy},
            vmerror::VmxFailure,
        },
        services::{
            ActionFlags, EmulationOutcome, FaultOutcome, ForcedActions, GuestMemory, InstructionEmulator, InstructionExit, IoAccess, IoOutcome, IoPorts,
            MemoryError, QueuedTrap, TimerService, TprState, TrapQueue,
        },
    },
    alloc::{
        alloc::{alloc_zeroed, dealloc, Layout},
        collections::{BTreeMap, BTreeSet, VecDeque},
        vec::Vec,
    },
    core::ptr::NonNull,
    x86::{cpuid::CpuIdResult, msr, vmx::vmcs},
    x86_64::registers::{
        control::{Cr0Flags, Cr4Flags},
        model_specific::EferFlags,
    },
};

const REVISION_ID: u64 = 0x4;

/// One INVEPT or INVVPID the engine issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Ept(InvEptKind, u64),
    Vpid(InvVpidKind, u16, u64),
}

/// VM-entry fields as they were when the world switch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    pub resume: bool,
    pub routine: RunRoutine,
    pub rip: u64,
    pub interruption_info: u64,
    pub tpr_threshold: u64,
}

/// What the next world switch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedExit {
    pub reason: u32,
    pub qualification: u64,
    pub instruction_length: u32,
    pub interruption_info: u32,
    pub idt_vectoring_info: u32,
    pub idt_vectoring_error_code: u32,
    pub guest_physical_address: u64,
    /// VMLAUNCH/VMRESUME fails with VMfailValid and this instruction error.
    pub instruction_error: Option<u64>,
}

impl ScriptedExit {
    pub const fn new(reason: u32) -> Self {
        Self {
            reason,
            qualification: 0,
            instruction_length: 0,
            interruption_info: 0,
            idt_vectoring_info: 0,
            idt_vectoring_error_code: 0,
            guest_physical_address: 0,
            instruction_error: None,
        }
    }

    pub const fn fail_valid(instruction_error: u64) -> Self {
        let mut exit = Self::new(0);
        exit.instruction_error = Some(instruction_error);
        exit
    }

    pub const fn with_length(mut self, length: u32) -> Self {
        self.instruction_length = length;
        self
    }

    pub const fn with_qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    pub const fn with_interruption(mut self, info: u32) -> Self {
        self.interruption_info = info;
        self
    }

    pub const fn with_idt_vectoring(mut self, info: u32, error_code: u32) -> Self {
        self.idt_vectoring_info = info;
        self.idt_vectoring_error_code = error_code;
        self
    }
}

/// A core with VT-x, as far as the engine can tell.
#[derive(Debug)]
pub struct SimulatedCpu {
    pub msrs: BTreeMap<u32, u64>,
    /// CPUID leaves; missing leaves read as zero.
    pub cpuid: BTreeMap<u32, CpuIdResult>,
    pub cr4: u64,
    pub fail_vmxon: bool,
    pub vmxon_region: Option<u64>,
    pub current_vmcs: Option<u64>,
    pub invalidations: Vec<Invalidation>,
    pub debug_registers: DebugRegisters,
    pub host: HostSegmentState,
    /// Returned for every host GDT lookup.
    pub host_tss_descriptor: [u64; 2],
    pub exits: VecDeque<ScriptedExit>,
    pub entries: Vec<EntryRecord>,
    /// The guest stores this TPR into the virtual-APIC page during the next world switch.
    pub guest_tpr_write: Option<u8>,
    fields: BTreeMap<u32, u64>,
    tsc: u64,
    interrupts_enabled: bool,
}

impl SimulatedCpu {
    pub fn new() -> Self {
        let msrs: BTreeMap<u32, u64> = BTreeMap::from([
            (msr::IA32_FEATURE_CONTROL, 0x5),
            (msr::IA32_EFER, 0xD01),
            (msr::IA32_VMX_BASIC, (1 << 55) | (6 << 50) | (0x1000 << 32) | REVISION_ID),
            (msr::IA32_VMX_PINBASED_CTLS, 0xFFFF_FFFF_0000_0016),
            (msr::IA32_VMX_PROCBASED_CTLS, 0xFFFF_FFFF_0401_E172),
            (msr::IA32_VMX_EXIT_CTLS, 0xFFFF_FFFF_0003_6DFF),
            (msr::IA32_VMX_ENTRY_CTLS, 0xFFFF_FFFF_0000_11FF),
            (msr::IA32_VMX_TRUE_PINBASED_CTLS, 0xFFFF_FFFF_0000_0016),
            (msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xFFFF_FFFF_0400_6172),
            (msr::IA32_VMX_TRUE_EXIT_CTLS, 0xFFFF_FFFF_0003_6DFB),
            (msr::IA32_VMX_TRUE_ENTRY_CTLS, 0xFFFF_FFFF_0000_11FB),
            (msr::IA32_VMX_PROCBASED_CTLS2, 0xFFFF_FFFF_0000_0000),
            (msr::IA32_VMX_MISC, 0x1E5),
            (msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (msr::IA32_VMX_CR0_FIXED1, 0xFFFF_FFFF),
            (msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (msr::IA32_VMX_CR4_FIXED1, 0x0037_27FF),
            (
                msr::IA32_VMX_EPT_VPID_CAP,
                (1 << 6) | (1 << 14) | (1 << 20) | (1 << 25) | (1 << 26) | (1 << 32) | (1 << 40) | (1 << 41) | (1 << 42),
            ),
        ]);

        let cpuid = BTreeMap::from([
            (
                0,
                CpuIdResult {
                    eax: 0x16,
                    ebx: u32::from_le_bytes(*b"Genu"),
                    ecx: u32::from_le_bytes(*b"ntel"),
                    edx: u32::from_le_bytes(*b"ineI"),
                },
            ),
            (1, CpuIdResult { eax: 0x906EA, ebx: 0, ecx: 0x7FFA_FBFF, edx: 0xBFEB_FBFF }),
        ]);

        Self {
            msrs,
            cpuid,
            cr4: 0x6A0,
            fail_vmxon: false,
            vmxon_region: None,
            current_vmcs: None,
            invalidations: Vec::new(),
            debug_registers: [0, 0, 0, 0, 0, 0, 0xFFFF_0FF0, 0x400],
            host: HostSegmentState {
                cr0: 0x8005_0033,
                cr3: 0x1AD000,
                cr4: 0x6A0,
                cs: 0x10,
                ss: 0x18,
                ds: 0x2B,
                es: 0x2B,
                fs: 0x53,
                gs: 0x2B,
                tr: 0x40,
                gdtr_base: 0xFFFF_F800_0000_0000,
                gdtr_limit: 0x7F,
                idtr_base: 0xFFFF_F800_0000_1000,
                idtr_limit: 0xFFF,
            },
            host_tss_descriptor: [0x0067 | (0x8B << 40), 0],
            exits: VecDeque::new(),
            entries: Vec::new(),
            guest_tpr_write: None,
            fields: BTreeMap::new(),
            tsc: 0,
            interrupts_enabled: true,
        }
    }

    /// Current value of a VMCS field; fields never written read as zero.
    pub fn field(&self, field: u32) -> u64 {
        self.fields.get(&field).copied().unwrap_or(0)
    }

    pub fn set_field(&mut self, field: u32, value: u64) {
        self.fields.insert(field, value);
    }

    fn report_exit(&mut self, exit: &ScriptedExit) {
        self.set_field(vmcs::ro::EXIT_REASON, exit.reason as u64);
        self.set_field(vmcs::ro::EXIT_QUALIFICATION, exit.qualification);
        self.set_field(vmcs::ro::VMEXIT_INSTRUCTION_LEN, exit.instruction_length as u64);
        self.set_field(vmcs::ro::VMEXIT_INTERRUPTION_INFO, exit.interruption_info as u64);
        self.set_field(vmcs::ro::IDT_VECTORING_INFO, exit.idt_vectoring_info as u64);
        self.set_field(vmcs::ro::IDT_VECTORING_ERR_CODE, exit.idt_vectoring_error_code as u64);
        self.set_field(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL, exit.guest_physical_address);

        // The entry interruption-information field is invalidated by every VM exit.
        let info = self.field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD);
        self.set_field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info & !(1 << 31));
    }
}

impl Default for SimulatedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl VmxSupport for SimulatedCpu {
    fn read_cr4(&mut self) -> u64 {
        self.cr4
    }

    fn write_cr4(&mut self, value: u64) {
        self.cr4 = value;
    }

    fn rdmsr(&mut self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    fn rdtsc(&mut self) -> u64 {
        self.tsc += 1000;
        self.tsc
    }

    fn cpuid(&mut self, leaf: u32) -> CpuIdResult {
        self.cpuid.get(&leaf).copied().unwrap_or(CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: 0 })
    }

    fn vmxon(&mut self, region_pa: u64) -> Result<(), VmxFailure> {
        if self.fail_vmxon {
            return Err(VmxFailure::Invalid);
        }
        self.vmxon_region = Some(region_pa);
        Ok(())
    }

    fn vmxoff(&mut self) {
        self.vmxon_region = None;
    }

    fn vmclear(&mut self, vmcs_pa: u64) -> Result<(), VmxFailure> {
        if self.current_vmcs == Some(vmcs_pa) {
            self.current_vmcs = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<(), VmxFailure> {
        self.current_vmcs = Some(vmcs_pa);
        Ok(())
    }

    fn vmread(&mut self, field: u32) -> u64 {
        self.field(field)
    }

    fn vmwrite(&mut self, field: u32, value: u64) {
        self.set_field(field, value);
    }

    fn invept(&mut self, kind: InvEptKind, eptp: u64) -> Result<(), VmxFailure> {
        self.invalidations.push(Invalidation::Ept(kind, eptp));
        Ok(())
    }

    fn invvpid(&mut self, kind: InvVpidKind, vpid: u16, address: u64) -> Result<(), VmxFailure> {
        self.invalidations.push(Invalidation::Vpid(kind, vpid, address));
        Ok(())
    }

    fn disable_interrupts(&mut self) -> bool {
        core::mem::replace(&mut self.interrupts_enabled, false)
    }

    fn restore_interrupts(&mut self, were_enabled: bool) {
        self.interrupts_enabled = were_enabled;
    }

    fn host_segments(&mut self) -> HostSegmentState {
        self.host
    }

    fn read_host_descriptor(&mut self, _gdtr_base: u64, _selector: u16) -> [u64; 2] {
        self.host_tss_descriptor
    }

    fn read_debug_registers(&mut self) -> DebugRegisters {
        self.debug_registers
    }

    fn write_debug_registers(&mut self, registers: &DebugRegisters) {
        self.debug_registers = *registers;
    }

    fn world_switch(&mut self, _registers: &mut GuestRegisters, resume: bool, routine: RunRoutine) -> Result<(), VmxFailure> {
        assert!(!self.interrupts_enabled, "world switch with host interrupts enabled");
        assert!(self.current_vmcs.is_some(), "world switch without a current VMCS");

        self.entries.push(EntryRecord {
            resume,
            routine,
            rip: self.field(vmcs::guest::RIP),
            interruption_info: self.field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD),
            tpr_threshold: self.field(vmcs::control::TPR_THRESHOLD),
        });

        // No scripted exit left: a host interrupt ends the run.
        let exit = self.exits.pop_front().unwrap_or(ScriptedExit::new(1));

        if let Some(error) = exit.instruction_error {
            self.set_field(vmcs::ro::VM_INSTRUCTION_ERROR, error);
            return Err(VmxFailure::Valid);
        }

        if let Some(tpr) = self.guest_tpr_write.take() {
            // Test pages are identity mapped, so the physical address is dereferenceable.
            let vapic = self.field(vmcs::control::VIRT_APIC_ADDR_FULL);
            unsafe { ((vapic as usize + VIRTUAL_APIC_TPR_OFFSET) as *mut u8).write(tpr) };
        }

        self.report_exit(&exit);
        Ok(())
    }
}

/// The rest of the VM, with every service answering from a public field.
#[derive(Debug)]
pub struct MockServices {
    pub memory: BTreeMap<u64, u8>,

    pub trap: Option<QueuedTrap>,
    pub nmi: bool,
    pub interrupts: VecDeque<u8>,
    pub tpr: u8,
    pub tpr_pending: Option<u8>,
    pub apic_base: u64,

    pub nested_fault: FaultOutcome,
    pub nested_faults: Vec<(u64, u32)>,
    pub shadow_fault: FaultOutcome,
    pub shadow_faults: Vec<(u64, u32)>,
    pub eptp: u64,
    pub shadow_cr3: u64,
    pub identity_cr3: u64,
    pub real_mode_tss: Option<u64>,
    pub cr_changes: Vec<u8>,

    pub emulation: EmulationOutcome,
    pub emulated: Vec<InstructionExit>,
    /// Raised as pending actions every time an instruction is emulated.
    pub actions_after_emulation: ActionFlags,
    /// Applied to the guest context by every instruction or MMIO emulation.
    pub context_edit: Option<fn(&mut GuestCpuContext)>,
    pub mmio: Vec<u64>,
    pub fpu_active: bool,

    pub ports: BTreeMap<u16, u32>,

    pub timer_fired: bool,
    pub tsc_offset: Option<u64>,
    pub last_guest_tsc: u64,
    pub deadline: Option<u64>,

    pub actions: ActionFlags,
    pub single_stepping: bool,
}

impl MockServices {
    pub fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            trap: None,
            nmi: false,
            interrupts: VecDeque::new(),
            tpr: 0,
            tpr_pending: None,
            apic_base: 0xFEE0_0000,
            nested_fault: FaultOutcome::Resolved,
            nested_faults: Vec::new(),
            shadow_fault: FaultOutcome::Resolved,
            shadow_faults: Vec::new(),
            eptp: 0x5000_001E,
            shadow_cr3: 0x3000,
            identity_cr3: 0x4000,
            real_mode_tss: None,
            cr_changes: Vec::new(),
            emulation: EmulationOutcome::Emulated,
            emulated: Vec::new(),
            actions_after_emulation: ActionFlags::empty(),
            context_edit: None,
            mmio: Vec::new(),
            fpu_active: false,
            ports: BTreeMap::new(),
            timer_fired: false,
            tsc_offset: None,
            last_guest_tsc: 0,
            deadline: None,
            actions: ActionFlags::empty(),
            single_stepping: false,
        }
    }

    pub fn write_bytes(&mut self, gpa: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(gpa + i as u64, *byte);
        }
    }

    pub fn read_bytes<const N: usize>(&self, gpa: u64) -> [u8; N] {
        core::array::from_fn(|i| self.memory.get(&(gpa + i as u64)).copied().unwrap_or(0))
    }

    pub fn write_u16(&mut self, gpa: u64, value: u16) {
        self.write_bytes(gpa, &value.to_le_bytes());
    }

    pub fn read_u16(&self, gpa: u64) -> u16 {
        u16::from_le_bytes(self.read_bytes(gpa))
    }

    pub fn write_u64(&mut self, gpa: u64, value: u64) {
        self.write_bytes(gpa, &value.to_le_bytes());
    }

    pub fn read_u64(&self, gpa: u64) -> u64 {
        u64::from_le_bytes(self.read_bytes(gpa))
    }
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapQueue for MockServices {
    fn has_trap(&self) -> bool {
        self.trap.is_some()
    }

    fn query_trap(&self) -> Option<QueuedTrap> {
        self.trap
    }

    fn assert_trap(&mut self, trap: QueuedTrap) {
        self.trap = Some(trap);
    }

    fn reset_trap(&mut self) {
        self.trap = None;
    }

    fn nmi_pending(&self) -> bool {
        self.nmi
    }

    fn take_nmi(&mut self) {
        self.nmi = false;
    }

    fn interrupt_pending(&self) -> bool {
        !self.interrupts.is_empty()
    }

    fn get_interrupt(&mut self) -> Option<u8> {
        self.interrupts.pop_front()
    }

    fn tpr(&mut self) -> Option<TprState> {
        Some(TprState { tpr: self.tpr, pending_vector: self.tpr_pending })
    }

    fn set_tpr(&mut self, tpr: u8) {
        self.tpr = tpr;
    }

    fn apic_base(&self) -> u64 {
        self.apic_base
    }
}

impl GuestMemory for MockServices {
    fn read_phys(&mut self, gpa: u64, buffer: &mut [u8]) -> Result<(), MemoryError> {
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = self.memory.get(&(gpa + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_phys(&mut self, gpa: u64, buffer: &[u8]) -> Result<(), MemoryError> {
        self.write_bytes(gpa, buffer);
        Ok(())
    }

    fn handle_nested_fault(&mut self, gpa: u64, error_code: u32, _ctx: &mut GuestCpuContext) -> FaultOutcome {
        self.nested_faults.push((gpa, error_code));
        self.nested_fault
    }

    fn handle_nested_misconfig(&mut self, _gpa: u64, _ctx: &mut GuestCpuContext) -> FaultOutcome {
        self.nested_fault
    }

    fn handle_shadow_fault(&mut self, address: u64, error_code: u32, _ctx: &mut GuestCpuContext) -> FaultOutcome {
        self.shadow_faults.push((address, error_code));
        self.shadow_fault
    }

    fn shadow_cr3(&self) -> u64 {
        self.shadow_cr3
    }

    fn identity_cr3(&self) -> u64 {
        self.identity_cr3
    }

    fn eptp(&self) -> u64 {
        self.eptp
    }

    fn real_mode_tss(&self) -> Option<u64> {
        self.real_mode_tss
    }

    fn control_register_changed(&mut self, register: u8, _ctx: &GuestCpuContext) {
        self.cr_changes.push(register);
    }
}

impl InstructionEmulator for MockServices {
    fn emulate_instruction(&mut self, exit: InstructionExit, ctx: &mut GuestCpuContext) -> EmulationOutcome {
        self.emulated.push(exit);
        self.actions |= self.actions_after_emulation;
        if let Some(edit) = self.context_edit {
            edit(ctx);
        }
        self.emulation
    }

    fn emulate_mmio(&mut self, gpa: u64, ctx: &mut GuestCpuContext) -> EmulationOutcome {
        self.mmio.push(gpa);
        if let Some(edit) = self.context_edit {
            edit(ctx);
        }
        self.emulation
    }

    fn guest_fpu_active(&self) -> bool {
        self.fpu_active
    }

    fn activate_guest_fpu(&mut self) -> bool {
        !core::mem::replace(&mut self.fpu_active, true)
    }
}

impl IoPorts for MockServices {
    fn read_port(&mut self, port: u16, _size: u8) -> IoOutcome<u32> {
        match self.ports.get(&port) {
            Some(value) => IoOutcome::Done(*value),
            None => IoOutcome::Deferred,
        }
    }

    fn write_port(&mut self, port: u16, _size: u8, value: u32) -> IoOutcome {
        match self.ports.get_mut(&port) {
            Some(slot) => {
                *slot = value;
                IoOutcome::Done(())
            }
            None => IoOutcome::Deferred,
        }
    }

    fn string_io(&mut self, _access: IoAccess, _ctx: &mut GuestCpuContext) -> IoOutcome {
        IoOutcome::Done(())
    }
}

impl TimerService for MockServices {
    fn poll_timers(&mut self) -> bool {
        core::mem::take(&mut self.timer_fired)
    }

    fn tsc_offset(&self) -> Option<u64> {
        self.tsc_offset
    }

    fn last_guest_tsc(&self) -> u64 {
        self.last_guest_tsc
    }

    fn ticks_to_deadline(&self) -> Option<u64> {
        self.deadline
    }
}

impl ForcedActions for MockServices {
    fn pending_actions(&self) -> ActionFlags {
        self.actions
    }

    fn single_stepping(&self) -> bool {
        self.single_stepping
    }
}

/// Heap-backed pages whose physical address is their virtual address.
#[derive(Debug, Default)]
pub struct TestPageAllocator {
    limit: Option<usize>,
    live: BTreeSet<usize>,
    double_frees: usize,
}

impl TestPageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocation fails once `limit` pages are outstanding.
    pub fn with_limit(limit: usize) -> Self {
        let mut allocator = Self::default();
        allocator.limit = Some(limit);
        allocator
    }

    fn layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("page layout")
    }

    fn allocate_backing(&mut self) -> Option<NonNull<u8>> {
        if self.limit.is_some_and(|limit| self.live.len() >= limit) {
            return None;
        }
        let va = NonNull::new(unsafe { alloc_zeroed(Self::layout()) })?;
        self.live.insert(va.as_ptr() as usize);
        Some(va)
    }

    /// A real page that claims to live at `pa`, for exercising address validation.
    pub fn allocate_page_at(&mut self, pa: u64) -> Option<PhysPage> {
        let va = self.allocate_backing()?;
        Some(unsafe { PhysPage::new(pa, va) })
    }

    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    pub fn double_frees(&self) -> usize {
        self.double_frees
    }
}

impl PageAllocator for TestPageAllocator {
    fn allocate_page(&mut self) -> Option<PhysPage> {
        let va = self.allocate_backing()?;
        Some(unsafe { PhysPage::new(va.as_ptr() as u64, va) })
    }

    fn free_page(&mut self, page: PhysPage) {
        let va = page.as_ptr();
        if !self.live.remove(&(va as usize)) {
            self.double_frees += 1;
            return;
        }
        unsafe { dealloc(va, Self::layout()) };
    }
}

impl Drop for TestPageAllocator {
    fn drop(&mut self) {
        for &va in self.live.iter() {
            unsafe { dealloc(va as *mut u8, Self::layout()) };
        }
    }
}

/// A VCPU with EPT and no pages, good for handlers that only touch fields.
pub fn test_vcpu(cpu: &mut SimulatedCpu) -> VirtualCpu {
    let caps = VmxCapabilities::read(cpu);
    let policy = ControlPolicy { nested_paging: true, vpid: false, trap_all_exceptions: false };
    VirtualCpu::new(0, EngineConfig::default(), caps, policy, TlbStrategy::Ept)
}

/// A VCPU with its control block allocated, loaded and programmed.
///
/// The autoload MSR areas are only allocated when `msr_areas` is set. The
/// VCPU is not in a session; call [`crate::intel::host::enter`] to start one.
pub fn test_vcpu_with_pages(cpu: &mut SimulatedCpu, allocator: &mut TestPageAllocator, msr_areas: bool) -> VirtualCpu {
    let mut vcpu = test_vcpu(cpu);

    let mut vmcs_page = allocator.allocate_page().expect("VMCS page");
    init_region(&mut vmcs_page, vcpu.caps.revision_id());
    vcpu.pages.vmcs = Some(vmcs_page);
    vcpu.pages.virtual_apic = allocator.allocate_page();
    vcpu.pages.msr_bitmap = allocator.allocate_page();
    if msr_areas {
        vcpu.pages.guest_msrs = allocator.allocate_page();
        vcpu.pages.host_msrs = allocator.allocate_page();
    }

    let vmcs_pa = vcpu.pages.vmcs_pa().expect("VMCS page");
    cpu.vmptrld(vmcs_pa).expect("VMPTRLD");
    let pages = vcpu.pages.control_pages(None);
    vcpu.controls = setup_vmcs_control_fields(cpu, &vcpu.caps, &vcpu.policy, &pages).expect("control fields");
    vcpu.field_cache.init();
    cpu.vmclear(vmcs_pa).expect("VMCLEAR");

    vcpu
}

/// A 64-bit kernel context with flat segments and paging on.
pub fn protected_mode_context() -> GuestCpuContext {
    let mut ctx = GuestCpuContext::default();
    ctx.cr0 = (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING | Cr0Flags::NUMERIC_ERROR | Cr0Flags::EXTENSION_TYPE).bits();
    ctx.cr3 = 0x1000;
    ctx.cr4 = (Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS).bits();
    ctx.efer = (EferFlags::LONG_MODE_ENABLE | EferFlags::LONG_MODE_ACTIVE).bits();
    ctx.cs = SegmentRegister::new(0x10, 0, 0xFFFF_FFFF, 0xA09B);
    ctx.ss = SegmentRegister::new(0x18, 0, 0xFFFF_FFFF, 0xC093);
    ctx.ds = ctx.ss;
    ctx.es = ctx.ss;
    ctx.fs = SegmentRegister::new(0, 0x7FF0_0000, 0, ACCESS_RIGHTS_UNUSABLE);
    ctx.gs = SegmentRegister::new(0, 0xFFFF_8000_0000_0000, 0, ACCESS_RIGHTS_UNUSABLE);
    ctx.ldtr = SegmentRegister::new(0, 0, 0, ACCESS_RIGHTS_UNUSABLE);
    ctx.tr = SegmentRegister::new(0x40, 0xFFFF_8000_0010_0000, 0x67, 0x8B);
    ctx.gdtr = DescriptorTable { base: 0xFFFF_8000_0000_1000, limit: 0x7F };
    ctx.idtr = DescriptorTable { base: 0xFFFF_8000_0000_2000, limit: 0xFFF };
    ctx.regs.rip = 0xFFFF_8000_0040_0000;
    ctx.regs.rsp = 0xFFFF_8000_0080_0000;
    ctx.regs.rflags = 0x246;
    ctx.dr[7] = 0x400;
    ctx.lstar = 0xFFFF_8000_0000_4000;
    ctx.star = 0x0023_0010_0000_0000;
    ctx.sfmask = 0x4700;
    ctx.sysenter_cs = 0x10;
    ctx
}

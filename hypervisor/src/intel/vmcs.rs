//! The VMCS region, its control-field policy and the per-VCPU field cache.

use {
    crate::{
        config::MAX_AUTOLOAD_MSRS,
        error::HypervisorError,
        intel::{capabilities::VmxCapabilities, page::PhysPage, support::VmxSupport, vmerror::ExceptionInterrupt},
    },
    bit_field::BitField,
    log::*,
    x86::vmx::vmcs::{
        self,
        control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
    },
};

/// Writes the VMCS revision identifier into a freshly zeroed control block.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
pub fn init_region(page: &mut PhysPage, revision_id: u32) {
    let mut revision_id = revision_id;
    revision_id.set_bit(31, false);
    page.zero();
    page.write_u32(0, revision_id);
}

/// Cached copies of the execution-control words currently in the VMCS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmcsControls {
    pub pinbased: u32,
    pub procbased: u32,
    pub procbased2: u32,
    pub entry: u32,
    pub exit: u32,
    pub exception_bitmap: u32,
}

impl VmcsControls {
    pub fn has_primary(&self, control: PrimaryControls) -> bool {
        self.procbased & control.bits() == control.bits()
    }

    pub fn has_secondary(&self, control: SecondaryControls) -> bool {
        self.has_primary(PrimaryControls::SECONDARY_CONTROLS) && self.procbased2 & control.bits() == control.bits()
    }

    pub fn has_pinbased(&self, control: PinbasedControls) -> bool {
        self.pinbased & control.bits() == control.bits()
    }
}

/// Setup-time choices that shape the execution controls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPolicy {
    pub nested_paging: bool,
    pub vpid: bool,
    pub trap_all_exceptions: bool,
}

/// Physical addresses of the auxiliary pages referenced by the VMCS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPages {
    pub virtual_apic: Option<u64>,
    pub apic_access: Option<u64>,
    pub msr_bitmap: Option<u64>,
    pub guest_msrs: Option<u64>,
    pub host_msrs: Option<u64>,
}

/// Exceptions intercepted regardless of guest mode.
pub fn base_exception_bitmap(policy: &ControlPolicy) -> u32 {
    if policy.trap_all_exceptions {
        return u32::MAX;
    }

    let mut bitmap = (1 << ExceptionInterrupt::DeviceNotAvailable as u32) | (1 << ExceptionInterrupt::MachineCheck as u32);
    if !policy.nested_paging {
        bitmap |= 1 << ExceptionInterrupt::PageFault as u32;
    }
    bitmap
}

/// Exceptions intercepted while real mode runs as virtual-8086 mode: everything but #BP and #OF,
/// which the guest's own IVT handles.
pub const REAL_MODE_EXCEPTION_BITMAP: u32 = !((1 << ExceptionInterrupt::Breakpoint as u32) | (1 << ExceptionInterrupt::Overflow as u32));

/// Writes pin-based, processor-based, secondary, entry and exit controls plus the
/// static control fields of the current VMCS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6 VM-EXECUTION CONTROL FIELDS
pub fn setup_vmcs_control_fields<S: VmxSupport>(support: &mut S, caps: &VmxCapabilities, policy: &ControlPolicy, pages: &ControlPages) -> Result<VmcsControls, HypervisorError> {
    debug!("Setting up VMCS Control Fields");

    let mut pinbased = PinbasedControls::EXTERNAL_INTERRUPT_EXITING | PinbasedControls::NMI_EXITING;
    if caps.supports_preemption_timer() {
        pinbased |= PinbasedControls::VMX_PREEMPTION_TIMER;
    }

    let mut procbased = PrimaryControls::HLT_EXITING
        | PrimaryControls::UNCOND_IO_EXITING
        | PrimaryControls::RDPMC_EXITING
        | PrimaryControls::MONITOR_EXITING
        | PrimaryControls::MWAIT_EXITING
        | PrimaryControls::USE_TSC_OFFSETTING
        | PrimaryControls::MOV_DR_EXITING;

    if !policy.nested_paging {
        procbased |= PrimaryControls::INVLPG_EXITING | PrimaryControls::CR3_LOAD_EXITING | PrimaryControls::CR3_STORE_EXITING;
    }

    if caps.supports_tpr_shadow() && pages.virtual_apic.is_some() {
        procbased |= PrimaryControls::USE_TPR_SHADOW;
    } else if caps.procbased.can_set((PrimaryControls::CR8_LOAD_EXITING | PrimaryControls::CR8_STORE_EXITING).bits()) {
        procbased |= PrimaryControls::CR8_LOAD_EXITING | PrimaryControls::CR8_STORE_EXITING;
    }

    if caps.supports_msr_bitmap() && pages.msr_bitmap.is_some() {
        procbased |= PrimaryControls::USE_MSR_BITMAPS;
    }

    if caps.has_secondary_controls() {
        procbased |= PrimaryControls::SECONDARY_CONTROLS;
    }

    let mut procbased2 = SecondaryControls::empty();
    if caps.has_secondary_controls() {
        if policy.nested_paging {
            procbased2 |= SecondaryControls::ENABLE_EPT;
        }
        if policy.vpid {
            procbased2 |= SecondaryControls::ENABLE_VPID;
        }
        if caps.supports_apic_access() && pages.apic_access.is_some() {
            procbased2 |= SecondaryControls::VIRTUALIZE_APIC;
        }
        if caps.procbased2.can_set(SecondaryControls::ENABLE_RDTSCP.bits()) {
            procbased2 |= SecondaryControls::ENABLE_RDTSCP;
        }
    }

    let entry = EntryControls::LOAD_DEBUG_CONTROLS;
    let exit = ExitControls::SAVE_DEBUG_CONTROLS | ExitControls::HOST_ADDRESS_SPACE_SIZE;

    let controls = VmcsControls {
        pinbased: caps.pinbased.adjust(pinbased.bits())?,
        procbased: caps.procbased.adjust(procbased.bits())?,
        procbased2: if caps.has_secondary_controls() { caps.procbased2.adjust(procbased2.bits())? } else { 0 },
        entry: caps.entry.adjust(entry.bits())?,
        exit: caps.exit.adjust(exit.bits())?,
        exception_bitmap: base_exception_bitmap(policy),
    };

    support.vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, controls.pinbased as u64);
    support.vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, controls.procbased as u64);
    if caps.has_secondary_controls() {
        support.vmwrite(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, controls.procbased2 as u64);
    }
    support.vmwrite(vmcs::control::VMENTRY_CONTROLS, controls.entry as u64);
    support.vmwrite(vmcs::control::VMEXIT_CONTROLS, controls.exit as u64);
    support.vmwrite(vmcs::control::EXCEPTION_BITMAP, controls.exception_bitmap as u64);

    support.vmwrite(vmcs::control::PAGE_FAULT_ERR_CODE_MASK, 0);
    support.vmwrite(vmcs::control::PAGE_FAULT_ERR_CODE_MATCH, 0);
    support.vmwrite(vmcs::control::CR3_TARGET_COUNT, 0);
    support.vmwrite(vmcs::control::TSC_OFFSET_FULL, 0);
    support.vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);

    if let Some(pa) = pages.msr_bitmap {
        support.vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, pa);
    }

    if let (Some(guest), Some(host)) = (pages.guest_msrs, pages.host_msrs) {
        support.vmwrite(vmcs::control::VMENTRY_MSR_LOAD_ADDR_FULL, guest);
        support.vmwrite(vmcs::control::VMEXIT_MSR_STORE_ADDR_FULL, guest);
        support.vmwrite(vmcs::control::VMEXIT_MSR_LOAD_ADDR_FULL, host);
    }
    support.vmwrite(vmcs::control::VMENTRY_MSR_LOAD_COUNT, 0);
    support.vmwrite(vmcs::control::VMEXIT_MSR_STORE_COUNT, 0);
    support.vmwrite(vmcs::control::VMEXIT_MSR_LOAD_COUNT, 0);

    if controls.has_primary(PrimaryControls::USE_TPR_SHADOW) {
        if let Some(pa) = pages.virtual_apic {
            support.vmwrite(vmcs::control::VIRT_APIC_ADDR_FULL, pa);
        }
        support.vmwrite(vmcs::control::TPR_THRESHOLD, 0);
    }

    if controls.has_secondary(SecondaryControls::VIRTUALIZE_APIC) {
        if let Some(pa) = pages.apic_access {
            support.vmwrite(vmcs::control::APIC_ACCESS_ADDR_FULL, pa);
        }
    }

    trace!("VMCS controls: {:x?}", controls);
    debug!("VMCS Control Fields setup successfully!");

    Ok(controls)
}

/// Guest and exit-information fields read back after every VM exit.
pub const CACHED_READ_FIELDS: &[u32] = &[
    vmcs::guest::RIP,
    vmcs::guest::RSP,
    vmcs::guest::RFLAGS,
    vmcs::guest::INTERRUPTIBILITY_STATE,
    vmcs::guest::CR0,
    vmcs::control::CR0_READ_SHADOW,
    vmcs::guest::CR3,
    vmcs::guest::CR4,
    vmcs::control::CR4_READ_SHADOW,
    vmcs::guest::PDPTE0_FULL,
    vmcs::guest::PDPTE1_FULL,
    vmcs::guest::PDPTE2_FULL,
    vmcs::guest::PDPTE3_FULL,
    vmcs::guest::DR7,
    vmcs::guest::IA32_SYSENTER_CS,
    vmcs::guest::IA32_SYSENTER_EIP,
    vmcs::guest::IA32_SYSENTER_ESP,
    vmcs::guest::GDTR_BASE,
    vmcs::guest::GDTR_LIMIT,
    vmcs::guest::IDTR_BASE,
    vmcs::guest::IDTR_LIMIT,
    vmcs::guest::ES_SELECTOR,
    vmcs::guest::ES_BASE,
    vmcs::guest::ES_LIMIT,
    vmcs::guest::ES_ACCESS_RIGHTS,
    vmcs::guest::CS_SELECTOR,
    vmcs::guest::CS_BASE,
    vmcs::guest::CS_LIMIT,
    vmcs::guest::CS_ACCESS_RIGHTS,
    vmcs::guest::SS_SELECTOR,
    vmcs::guest::SS_BASE,
    vmcs::guest::SS_LIMIT,
    vmcs::guest::SS_ACCESS_RIGHTS,
    vmcs::guest::DS_SELECTOR,
    vmcs::guest::DS_BASE,
    vmcs::guest::DS_LIMIT,
    vmcs::guest::DS_ACCESS_RIGHTS,
    vmcs::guest::FS_SELECTOR,
    vmcs::guest::FS_BASE,
    vmcs::guest::FS_LIMIT,
    vmcs::guest::FS_ACCESS_RIGHTS,
    vmcs::guest::GS_SELECTOR,
    vmcs::guest::GS_BASE,
    vmcs::guest::GS_LIMIT,
    vmcs::guest::GS_ACCESS_RIGHTS,
    vmcs::guest::LDTR_SELECTOR,
    vmcs::guest::LDTR_BASE,
    vmcs::guest::LDTR_LIMIT,
    vmcs::guest::LDTR_ACCESS_RIGHTS,
    vmcs::guest::TR_SELECTOR,
    vmcs::guest::TR_BASE,
    vmcs::guest::TR_LIMIT,
    vmcs::guest::TR_ACCESS_RIGHTS,
    vmcs::ro::EXIT_REASON,
    vmcs::ro::EXIT_QUALIFICATION,
    vmcs::ro::VMEXIT_INSTRUCTION_LEN,
    vmcs::ro::VMEXIT_INSTRUCTION_INFO,
    vmcs::ro::VMEXIT_INTERRUPTION_INFO,
    vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE,
    vmcs::ro::IDT_VECTORING_INFO,
    vmcs::ro::IDT_VECTORING_ERR_CODE,
    vmcs::ro::VM_INSTRUCTION_ERROR,
    vmcs::ro::GUEST_LINEAR_ADDR,
    vmcs::ro::GUEST_PHYSICAL_ADDR_FULL,
];

const READ_CAPACITY: usize = 96;
const WRITE_CAPACITY: usize = 64;

/// Fixed-capacity (field, value) store in front of VMREAD/VMWRITE.
///
/// The read half is refilled once per exit, so the loader/saver and exit
/// handlers never VMREAD the same field twice. The write half batches field
/// writes and is flushed right before the world switch.
#[derive(Debug, Clone)]
pub struct VmcsFieldCache {
    read_fields: [u32; READ_CAPACITY],
    read_values: [u64; READ_CAPACITY],
    read_count: usize,
    write_fields: [u32; WRITE_CAPACITY],
    write_values: [u64; WRITE_CAPACITY],
    write_count: usize,
}

impl Default for VmcsFieldCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VmcsFieldCache {
    pub const fn new() -> Self {
        Self {
            read_fields: [0; READ_CAPACITY],
            read_values: [0; READ_CAPACITY],
            read_count: 0,
            write_fields: [0; WRITE_CAPACITY],
            write_values: [0; WRITE_CAPACITY],
            write_count: 0,
        }
    }

    /// Populates the read half with [`CACHED_READ_FIELDS`].
    pub fn init(&mut self) {
        self.read_count = 0;
        self.write_count = 0;
        for &field in CACHED_READ_FIELDS {
            self.add_read_field(field);
        }
    }

    pub fn add_read_field(&mut self, field: u32) -> bool {
        if self.read_fields[..self.read_count].contains(&field) {
            return true;
        }
        if self.read_count == READ_CAPACITY {
            return false;
        }
        self.read_fields[self.read_count] = field;
        self.read_values[self.read_count] = 0;
        self.read_count += 1;
        true
    }

    pub fn read_field_count(&self) -> usize {
        self.read_count
    }

    fn slot(&self, field: u32) -> Option<usize> {
        self.read_fields[..self.read_count].iter().position(|&f| f == field)
    }

    /// VMREADs every cached field.
    pub fn refresh<S: VmxSupport>(&mut self, support: &mut S) {
        for i in 0..self.read_count {
            self.read_values[i] = support.vmread(self.read_fields[i]);
        }
    }

    /// Cached value of `field`, `None` if the field is not cached.
    pub fn cached(&self, field: u32) -> Option<u64> {
        self.slot(field).map(|i| self.read_values[i])
    }

    /// Cached value of `field`, falling back to VMREAD.
    pub fn read<S: VmxSupport>(&self, support: &mut S, field: u32) -> u64 {
        match self.cached(field) {
            Some(value) => value,
            None => support.vmread(field),
        }
    }

    /// Queues a VMWRITE and keeps the read half coherent.
    pub fn write<S: VmxSupport>(&mut self, support: &mut S, field: u32, value: u64) {
        if let Some(i) = self.slot(field) {
            self.read_values[i] = value;
        }

        if let Some(i) = self.write_fields[..self.write_count].iter().position(|&f| f == field) {
            self.write_values[i] = value;
            return;
        }

        if self.write_count == WRITE_CAPACITY {
            self.flush_writes(support);
        }

        self.write_fields[self.write_count] = field;
        self.write_values[self.write_count] = value;
        self.write_count += 1;
    }

    pub fn pending_writes(&self) -> usize {
        self.write_count
    }

    pub fn pending_write(&self, field: u32) -> Option<u64> {
        self.write_fields[..self.write_count].iter().position(|&f| f == field).map(|i| self.write_values[i])
    }

    /// Issues every queued VMWRITE in order.
    pub fn flush_writes<S: VmxSupport>(&mut self, support: &mut S) {
        for i in 0..self.write_count {
            support.vmwrite(self.write_fields[i], self.write_values[i]);
        }
        self.write_count = 0;
    }

    pub fn discard_writes(&mut self) {
        self.write_count = 0;
    }
}

static_assertions::const_assert!(MAX_AUTOLOAD_MSRS >= 5);
static_assertions::const_assert!(CACHED_READ_FIELDS.len() <= READ_CAPACITY);

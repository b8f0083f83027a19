//! Diagnostics for failed VM entries and a short history of recent exits.

use {
    crate::intel::{
        events::PendingEvent,
        support::VmxSupport,
        vmerror::{VmInstructionError, VmxBasicExitReason, VmxFailure},
    },
    core::sync::atomic::{AtomicU64, Ordering},
    log::error,
    x86::vmx::vmcs,
};

const HISTORY_LEN: usize = 16;

/// What the caller learns about a failed VMLAUNCH/VMRESUME or a failed VM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmEntryFailure {
    /// VM-instruction error for VMfailValid, `None` for VMfailInvalid or an entry-failure exit.
    pub instruction_error: Option<u32>,
    /// Full exit reason for an entry-failure exit (bit 31 set), 0 otherwise.
    pub exit_reason: u32,
    pub exit_qualification: u64,
    /// Event that was written to the entry fields for the failed entry. It is not re-queued.
    pub interrupted_event: Option<PendingEvent>,
}

impl VmEntryFailure {
    /// VMLAUNCH/VMRESUME itself reported VMfail.
    pub fn from_instruction<S: VmxSupport>(support: &mut S, failure: VmxFailure, interrupted_event: Option<PendingEvent>) -> Self {
        let instruction_error = match failure {
            VmxFailure::Valid => Some(support.vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32),
            VmxFailure::Invalid => None,
        };

        Self {
            instruction_error,
            exit_reason: 0,
            exit_qualification: 0,
            interrupted_event,
        }
    }

    /// The processor exited with bit 31 of the exit reason set.
    pub fn from_exit(exit_reason: u32, exit_qualification: u64, interrupted_event: Option<PendingEvent>) -> Self {
        Self {
            instruction_error: None,
            exit_reason,
            exit_qualification,
            interrupted_event,
        }
    }

    pub fn basic_reason(&self) -> Option<VmxBasicExitReason> {
        if self.exit_reason == 0 {
            return None;
        }
        VmxBasicExitReason::from_u32(self.exit_reason)
    }
}

/// Canonical check for 48-bit virtual addresses.
fn is_canonical(addr: u64) -> bool {
    let upper = addr & 0xFFFF_0000_0000_0000;
    if addr & 0x0000_8000_0000_0000 != 0 {
        upper == 0xFFFF_0000_0000_0000
    } else {
        upper == 0
    }
}

fn dump_segment<S: VmxSupport>(support: &mut S, name: &str, selector: u32, base: u32, limit: u32, access_rights: u32) {
    error!(
        "  {}: sel={:#06x} base={:#018x} limit={:#010x} ar={:#07x}",
        name,
        support.vmread(selector),
        support.vmread(base),
        support.vmread(limit),
        support.vmread(access_rights)
    );
}

/// Logs the control, exit, segment and control-register state of the current VMCS.
///
/// Reads the VMCS directly rather than through the field cache, so the dump shows
/// what the processor actually checked.
pub fn dump_vmcs_state<S: VmxSupport>(support: &mut S) {
    error!("=== VMCS STATE ===");

    let instruction_error = support.vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32;
    error!("VM-instruction error: {} ({:?})", instruction_error, VmInstructionError::from_u32(instruction_error));

    let exit_reason = support.vmread(vmcs::ro::EXIT_REASON) as u32;
    error!("Exit reason: {:#x} ({:?})", exit_reason, VmxBasicExitReason::from_u32(exit_reason));
    error!("Exit qualification: {:#x}", support.vmread(vmcs::ro::EXIT_QUALIFICATION));

    error!("Pin-based controls: {:#010x}", support.vmread(vmcs::control::PINBASED_EXEC_CONTROLS));
    error!("Primary controls: {:#010x}", support.vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS));
    error!("Secondary controls: {:#010x}", support.vmread(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS));
    error!("Entry controls: {:#010x}", support.vmread(vmcs::control::VMENTRY_CONTROLS));
    error!("Exit controls: {:#010x}", support.vmread(vmcs::control::VMEXIT_CONTROLS));
    error!("Exception bitmap: {:#010x}", support.vmread(vmcs::control::EXCEPTION_BITMAP));
    error!(
        "Entry interruption: info={:#x} error={:#x} len={}",
        support.vmread(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD),
        support.vmread(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE),
        support.vmread(vmcs::control::VMENTRY_INSTRUCTION_LEN)
    );
    error!(
        "MSR areas: entry-load={} exit-store={} exit-load={}",
        support.vmread(vmcs::control::VMENTRY_MSR_LOAD_COUNT),
        support.vmread(vmcs::control::VMEXIT_MSR_STORE_COUNT),
        support.vmread(vmcs::control::VMEXIT_MSR_LOAD_COUNT)
    );

    // --- Control registers -------------------------------------------------
    error!(
        "Guest CR0: {:#x} (shadow {:#x}, mask {:#x})",
        support.vmread(vmcs::guest::CR0),
        support.vmread(vmcs::control::CR0_READ_SHADOW),
        support.vmread(vmcs::control::CR0_GUEST_HOST_MASK)
    );
    error!("Guest CR3: {:#x}", support.vmread(vmcs::guest::CR3));
    error!(
        "Guest CR4: {:#x} (shadow {:#x}, mask {:#x})",
        support.vmread(vmcs::guest::CR4),
        support.vmread(vmcs::control::CR4_READ_SHADOW),
        support.vmread(vmcs::control::CR4_GUEST_HOST_MASK)
    );
    error!("Guest DR7: {:#x}", support.vmread(vmcs::guest::DR7));

    // --- RFLAGS / RIP ------------------------------------------------------
    let rip = support.vmread(vmcs::guest::RIP);
    error!("Guest RIP: {:#x} (canonical: {})", rip, is_canonical(rip));
    error!("Guest RSP: {:#x}", support.vmread(vmcs::guest::RSP));
    error!("Guest RFLAGS: {:#x}", support.vmread(vmcs::guest::RFLAGS));
    error!(
        "Interruptibility: {:#x} activity: {:#x}",
        support.vmread(vmcs::guest::INTERRUPTIBILITY_STATE),
        support.vmread(vmcs::guest::ACTIVITY_STATE)
    );

    // --- Segments ----------------------------------------------------------
    error!("Guest segments:");
    dump_segment(support, "ES", vmcs::guest::ES_SELECTOR, vmcs::guest::ES_BASE, vmcs::guest::ES_LIMIT, vmcs::guest::ES_ACCESS_RIGHTS);
    dump_segment(support, "CS", vmcs::guest::CS_SELECTOR, vmcs::guest::CS_BASE, vmcs::guest::CS_LIMIT, vmcs::guest::CS_ACCESS_RIGHTS);
    dump_segment(support, "SS", vmcs::guest::SS_SELECTOR, vmcs::guest::SS_BASE, vmcs::guest::SS_LIMIT, vmcs::guest::SS_ACCESS_RIGHTS);
    dump_segment(support, "DS", vmcs::guest::DS_SELECTOR, vmcs::guest::DS_BASE, vmcs::guest::DS_LIMIT, vmcs::guest::DS_ACCESS_RIGHTS);
    dump_segment(support, "FS", vmcs::guest::FS_SELECTOR, vmcs::guest::FS_BASE, vmcs::guest::FS_LIMIT, vmcs::guest::FS_ACCESS_RIGHTS);
    dump_segment(support, "GS", vmcs::guest::GS_SELECTOR, vmcs::guest::GS_BASE, vmcs::guest::GS_LIMIT, vmcs::guest::GS_ACCESS_RIGHTS);
    dump_segment(support, "LDTR", vmcs::guest::LDTR_SELECTOR, vmcs::guest::LDTR_BASE, vmcs::guest::LDTR_LIMIT, vmcs::guest::LDTR_ACCESS_RIGHTS);
    dump_segment(support, "TR", vmcs::guest::TR_SELECTOR, vmcs::guest::TR_BASE, vmcs::guest::TR_LIMIT, vmcs::guest::TR_ACCESS_RIGHTS);
    error!("  GDTR: base={:#x} limit={:#x}", support.vmread(vmcs::guest::GDTR_BASE), support.vmread(vmcs::guest::GDTR_LIMIT));
    error!("  IDTR: base={:#x} limit={:#x}", support.vmread(vmcs::guest::IDTR_BASE), support.vmread(vmcs::guest::IDTR_LIMIT));

    // --- Host --------------------------------------------------------------
    let host_rip = support.vmread(vmcs::host::RIP);
    let host_rsp = support.vmread(vmcs::host::RSP);
    error!("Host RIP: {:#x} RSP: {:#x}", host_rip, host_rsp);
    error!(
        "Host CR0: {:#x} CR3: {:#x} CR4: {:#x}",
        support.vmread(vmcs::host::CR0),
        support.vmread(vmcs::host::CR3),
        support.vmread(vmcs::host::CR4)
    );
    error!(
        "Host CS: {:#06x} SS: {:#06x} TR: {:#06x} TR base: {:#x}",
        support.vmread(vmcs::host::CS_SELECTOR),
        support.vmread(vmcs::host::SS_SELECTOR),
        support.vmread(vmcs::host::TR_SELECTOR),
        support.vmread(vmcs::host::TR_BASE)
    );
    if host_rip == 0 || host_rsp == 0 {
        error!("  ERROR: Host RIP/RSP is zero!");
    }
}

/// Ring of the last exits taken by one VCPU.
///
/// Lock-free so a debugger thread can read it while the VCPU runs.
#[derive(Debug)]
pub struct ExitHistory {
    count: AtomicU64,
    reasons: [AtomicU64; HISTORY_LEN],
    rips: [AtomicU64; HISTORY_LEN],
}

impl Default for ExitHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHistory {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            reasons: core::array::from_fn(|_| AtomicU64::new(0)),
            rips: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, exit_reason: u32, rip: u64) {
        let count = self.count.fetch_add(1, Ordering::Relaxed);
        let slot = (count % HISTORY_LEN as u64) as usize;
        self.reasons[slot].store(exit_reason as u64, Ordering::Relaxed);
        self.rips[slot].store(rip, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Most recent exit first, as (exit reason, RIP).
    pub fn recent(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        let count = self.total();
        let len = count.min(HISTORY_LEN as u64);
        (0..len).map(move |age| {
            let slot = ((count - 1 - age) % HISTORY_LEN as u64) as usize;
            (self.reasons[slot].load(Ordering::Relaxed) as u32, self.rips[slot].load(Ordering::Relaxed))
        })
    }

    /// Logs the history; call it from a panic or bugcheck path.
    pub fn dump(&self) {
        error!("=== LAST {} VM-EXITS ===", HISTORY_LEN);
        for (reason, rip) in self.recent() {
            error!("  {:?} ({}) @ RIP={:#x}", VmxBasicExitReason::from_u32(reason), reason, rip);
        }
    }
}

//! Control-block lifecycle: per-VM init, setup and termination.

use {
    crate::{
        config::EngineConfig,
        error::HypervisorError,
        intel::{
            bitmap::MsrBitmap,
            capabilities::VmxCapabilities,
            page::{PageAllocator, PhysPage},
            percpu::PhysicalCore,
            support::VmxSupport,
            tlb::TlbStrategy,
            vcpu::VirtualCpu,
            vmcs::{self, ControlPolicy},
        },
    },
    alloc::vec::Vec,
    log::*,
    x86::msr,
};

/// A virtual machine as seen by the execution engine.
#[derive(Debug)]
pub struct VirtualMachine {
    pub config: EngineConfig,
    pub caps: VmxCapabilities,

    /// Guest-physical translation through EPT.
    pub nested_paging: bool,
    /// VPID tagging, used only without nested paging.
    pub vpid: bool,
    pub tlb_strategy: TlbStrategy,

    /// Shared page behind the guest's APIC MMIO range when APIC accesses are virtualized.
    pub apic_access_page: Option<PhysPage>,

    pub vcpus: Vec<VirtualCpu>,
}

impl VirtualMachine {
    /// Picks the paging and TLB strategy from `caps` and creates `vcpu_count` idle VCPUs.
    pub fn new(config: EngineConfig, caps: VmxCapabilities, vcpu_count: u32) -> Self {
        let nested_paging = config.allow_nested_paging && caps.supports_ept();
        let vpid = !nested_paging && config.allow_vpid && caps.supports_vpid();

        let tlb_strategy = if nested_paging {
            TlbStrategy::Ept
        } else if vpid {
            TlbStrategy::Vpid
        } else {
            TlbStrategy::None
        };

        let policy = ControlPolicy {
            nested_paging,
            vpid,
            trap_all_exceptions: config.trap_all_exceptions,
        };

        debug!("VM strategy: nested paging {}, VPID {}, TLB {:?}", nested_paging, vpid, tlb_strategy);

        Self {
            config,
            caps,
            nested_paging,
            vpid,
            tlb_strategy,
            apic_access_page: None,
            vcpus: (0..vcpu_count).map(|id| VirtualCpu::new(id, config, caps, policy, tlb_strategy)).collect(),
        }
    }

    fn allocate_zeroed<A: PageAllocator>(allocator: &mut A) -> Result<PhysPage, HypervisorError> {
        let mut page = allocator.allocate_page().ok_or(HypervisorError::OutOfMemory)?;
        page.zero();
        Ok(page)
    }

    /// Allocates the control block and auxiliary pages of every VCPU.
    ///
    /// On failure the pages allocated so far stay attached; [`Self::terminate`] frees them.
    pub fn init<A: PageAllocator>(&mut self, allocator: &mut A) -> Result<(), HypervisorError> {
        trace!("Initializing VM with {} VCPUs", self.vcpus.len());

        if self.caps.supports_tpr_shadow() && self.caps.supports_apic_access() && self.apic_access_page.is_none() {
            self.apic_access_page = Some(Self::allocate_zeroed(allocator)?);
        }

        let msr_bitmap = self.caps.supports_msr_bitmap();
        let msr_autoload = self.caps.supports_msr_autoload();
        let revision_id = self.caps.revision_id();

        for vcpu in self.vcpus.iter_mut() {
            if vcpu.pages.vmcs.is_none() {
                let mut page = Self::allocate_zeroed(allocator)?;
                vmcs::init_region(&mut page, revision_id);
                vcpu.pages.vmcs = Some(page);
            }

            if vcpu.pages.virtual_apic.is_none() {
                vcpu.pages.virtual_apic = Some(Self::allocate_zeroed(allocator)?);
            }

            if msr_bitmap && vcpu.pages.msr_bitmap.is_none() {
                vcpu.pages.msr_bitmap = Some(Self::allocate_zeroed(allocator)?);
            }

            if msr_autoload && vcpu.pages.guest_msrs.is_none() {
                vcpu.pages.guest_msrs = Some(Self::allocate_zeroed(allocator)?);
            }

            if msr_autoload && vcpu.pages.host_msrs.is_none() {
                vcpu.pages.host_msrs = Some(Self::allocate_zeroed(allocator)?);
            }

            trace!("VCPU {} pages allocated", vcpu.id);
        }

        debug!("VM initialized");
        Ok(())
    }

    /// Writes the initial execution controls into every VCPU's control block.
    ///
    /// Each block is cleared, loaded on `core`, programmed and cleared again so
    /// the first real entry starts with VMLAUNCH.
    pub fn setup<S: VmxSupport>(&mut self, core: &PhysicalCore, support: &mut S) -> Result<(), HypervisorError> {
        trace!("Setting up VM");

        let caps = self.caps;
        let apic_access = self.apic_access_page.as_ref().map(|page| page.pa);

        for vcpu in self.vcpus.iter_mut() {
            let vmcs_pa = vcpu.pages.vmcs_pa().ok_or(HypervisorError::ControlBlockNotAllocated)?;

            support.vmclear(vmcs_pa).map_err(|_| HypervisorError::VmcsClearFailed)?;
            core.activate(vmcs_pa)?;

            let result = Self::setup_vcpu(vcpu, support, &caps, apic_access, vmcs_pa);

            let cleared = support.vmclear(vmcs_pa);
            core.deactivate(vmcs_pa);
            result?;
            cleared.map_err(|_| HypervisorError::VmcsClearFailed)?;

            vcpu.launched = false;
            vcpu.active_core = None;
            trace!("VCPU {} control block ready", vcpu.id);
        }

        debug!("VM setup successfully!");
        Ok(())
    }

    fn setup_vcpu<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, caps: &VmxCapabilities, apic_access: Option<u64>, vmcs_pa: u64) -> Result<(), HypervisorError> {
        support.vmptrld(vmcs_pa).map_err(|_| HypervisorError::VmcsPtrLoadFailed)?;

        let pages = vcpu.pages.control_pages(apic_access);
        vcpu.controls = vmcs::setup_vmcs_control_fields(support, caps, &vcpu.policy, &pages)?;

        if let Some(page) = vcpu.pages.msr_bitmap.as_mut() {
            let mut bitmap = MsrBitmap::new(page);
            bitmap.intercept_all();
            for msr in [msr::IA32_SYSENTER_CS, msr::IA32_SYSENTER_ESP, msr::IA32_SYSENTER_EIP, msr::IA32_FS_BASE, msr::IA32_GS_BASE] {
                bitmap.passthrough(msr);
            }
        }

        vcpu.field_cache.init();
        vcpu.pending_event = None;
        vcpu.injected_event = None;
        vcpu.mark_all_dirty();
        vcpu.host_state_stale = true;

        Ok(())
    }

    /// Frees everything [`Self::init`] allocated. Idempotent.
    pub fn terminate<A: PageAllocator>(&mut self, allocator: &mut A) {
        trace!("Terminating VM");

        for vcpu in self.vcpus.iter_mut() {
            vcpu.pages.free(allocator);
            vcpu.launched = false;
            vcpu.active_core = None;
        }

        if let Some(page) = self.apic_access_page.take() {
            allocator.free_page(page);
        }
    }
}

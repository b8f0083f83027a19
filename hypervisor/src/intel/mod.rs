//! Intel VT-x support.

pub mod bitmap;
pub mod capabilities;
pub mod capture;
pub mod context;
pub mod descriptor;
pub mod diagnostics;
pub mod dirty;
pub mod events;
pub mod guest;
pub mod host;
pub mod msr;
pub mod page;
pub mod percpu;
pub mod realmode;
pub mod support;
pub mod tlb;
pub mod vcpu;
pub mod vm;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
#[cfg(target_arch = "x86_64")]
pub mod vmlaunch;
pub mod vmxon;

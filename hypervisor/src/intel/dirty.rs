//! Guest-state categories that must be rewritten into the VMCS before the next entry.

use bitflags::bitflags;

bitflags! {
    /// Set of guest-state categories changed since the last full load.
    ///
    /// Anything beyond [`GuestStateChanges::MINIMAL`] selects the full load path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GuestStateChanges: u32 {
        const RIP = 1 << 0;
        const RSP = 1 << 1;
        const RFLAGS = 1 << 2;
        const SEGMENTS = 1 << 3;
        const DESCRIPTOR_TABLES = 1 << 4;
        const LDTR = 1 << 5;
        const TR = 1 << 6;
        const CR0 = 1 << 7;
        const CR3 = 1 << 8;
        const CR4 = 1 << 9;
        const DEBUG = 1 << 10;
        const SYSENTER_MSRS = 1 << 11;
        const AUTOLOAD_MSRS = 1 << 12;
        const TSC = 1 << 13;
        const INTERCEPTS = 1 << 14;

        /// Fields written on every entry.
        const MINIMAL = Self::RIP.bits() | Self::RSP.bits() | Self::RFLAGS.bits();
    }
}

impl GuestStateChanges {
    pub fn needs_full_load(&self) -> bool {
        !self.difference(Self::MINIMAL).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_bits_do_not_force_a_full_load() {
        assert!(!GuestStateChanges::MINIMAL.needs_full_load());
        assert!(!GuestStateChanges::RIP.needs_full_load());
        assert!((GuestStateChanges::RIP | GuestStateChanges::CR0).needs_full_load());
        assert!(GuestStateChanges::all().needs_full_load());
    }
}

//! General-purpose register block exchanged with the world-switch stub.
//!
//! The layout is consumed by `vmlaunch.rs` through `offset_of!`, so fields must
//! not be reordered without updating the assembly.

/// Guest general-purpose registers plus the three VMCS-backed ones.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
    /// Not part of the VMCS; the stub swaps it around the world switch.
    pub cr2: u64,
}

impl GuestRegisters {
    /// Reads a register by its instruction encoding (0 = RAX ... 15 = R15).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    pub fn gpr(&self, index: u64) -> u64 {
        match index & 0xF {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a register by its instruction encoding.
    pub fn set_gpr(&mut self, index: u64, value: u64) {
        let slot = match index & 0xF {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_index_four_is_the_stack_pointer() {
        let mut regs = GuestRegisters::default();
        regs.set_gpr(4, 0x7000);
        regs.set_gpr(11, 0xB);

        assert_eq!(regs.rsp, 0x7000);
        assert_eq!(regs.gpr(4), 0x7000);
        assert_eq!(regs.r11, 0xB);
    }
}

//! World-switch stub: loads guest GPRs, executes VMLAUNCH/VMRESUME and, on VM
//! exit, stores guest GPRs back before returning to the caller.
//!
//! `launch_vm` returns 0 after a VM exit, or the RFLAGS image left by a failed
//! VMLAUNCH/VMRESUME (CF = VMfailInvalid, ZF = VMfailValid).
//!
//! `launch_vm32` is the same contract for guests outside long mode: only the eight
//! legacy GPRs travel, R8-R15 enter the guest zeroed and are not stored back.
//!
//! HOST_RSP and HOST_RIP are written by the stub itself, so the VM exit lands
//! on the exact stack frame that issued the entry.

use {
    crate::intel::capture::GuestRegisters,
    core::{arch::global_asm, mem},
    x86::vmx::vmcs,
};

unsafe extern "sysv64" {
    pub fn launch_vm(registers: *mut GuestRegisters, resume: u64) -> u64;
    pub fn launch_vm32(registers: *mut GuestRegisters, resume: u64) -> u64;
}

global_asm!(
    r#"
    .globl launch_vm

launch_vm:
    // RDI = &mut GuestRegisters, RSI = resume flag
    push    rbp
    push    rbx
    push    r12
    push    r13
    push    r14
    push    r15
    push    rdi

    // HOST_RSP points at the saved GuestRegisters pointer
    mov     rax, {host_rsp}
    vmwrite rax, rsp
    lea     rbx, [rip + .Lvmexit]
    mov     rax, {host_rip}
    vmwrite rax, rbx

    mov     rax, [rdi + {registers_cr2}]
    mov     cr2, rax

    // MOV does not touch flags, so ZF survives the register loads
    test    rsi, rsi

    mov     rax, [rdi + {registers_rax}]
    mov     rcx, [rdi + {registers_rcx}]
    mov     rdx, [rdi + {registers_rdx}]
    mov     rbx, [rdi + {registers_rbx}]
    mov     rbp, [rdi + {registers_rbp}]
    mov     rsi, [rdi + {registers_rsi}]
    mov     r8,  [rdi + {registers_r8}]
    mov     r9,  [rdi + {registers_r9}]
    mov     r10, [rdi + {registers_r10}]
    mov     r11, [rdi + {registers_r11}]
    mov     r12, [rdi + {registers_r12}]
    mov     r13, [rdi + {registers_r13}]
    mov     r14, [rdi + {registers_r14}]
    mov     r15, [rdi + {registers_r15}]
    mov     rdi, [rdi + {registers_rdi}]

    jnz     .Lresume
    vmlaunch
    jmp     .Lfailed
.Lresume:
    vmresume

.Lfailed:
    pushfq
    pop     rax
    pop     rdi
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbx
    pop     rbp
    ret

.Lvmexit:
    // RSP = HOST_RSP, [rsp] = GuestRegisters pointer
    push    rdi
    mov     rdi, [rsp + 8]

    mov     [rdi + {registers_rax}], rax
    mov     [rdi + {registers_rcx}], rcx
    mov     [rdi + {registers_rdx}], rdx
    mov     [rdi + {registers_rbx}], rbx
    mov     [rdi + {registers_rbp}], rbp
    mov     [rdi + {registers_rsi}], rsi
    mov     [rdi + {registers_r8}],  r8
    mov     [rdi + {registers_r9}],  r9
    mov     [rdi + {registers_r10}], r10
    mov     [rdi + {registers_r11}], r11
    mov     [rdi + {registers_r12}], r12
    mov     [rdi + {registers_r13}], r13
    mov     [rdi + {registers_r14}], r14
    mov     [rdi + {registers_r15}], r15
    pop     rax
    mov     [rdi + {registers_rdi}], rax
    mov     rax, cr2
    mov     [rdi + {registers_cr2}], rax

    pop     rdi
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbx
    pop     rbp
    xor     eax, eax
    ret

    .globl launch_vm32

launch_vm32:
    push    rbp
    push    rbx
    push    r12
    push    r13
    push    r14
    push    r15
    push    rdi

    mov     rax, {host_rsp}
    vmwrite rax, rsp
    lea     rbx, [rip + .Lvmexit32]
    mov     rax, {host_rip}
    vmwrite rax, rbx

    mov     rax, [rdi + {registers_cr2}]
    mov     cr2, rax

    // XOR writes the flags, so the resume test follows it
    xor     r8d, r8d
    xor     r9d, r9d
    xor     r10d, r10d
    xor     r11d, r11d
    xor     r12d, r12d
    xor     r13d, r13d
    xor     r14d, r14d
    xor     r15d, r15d
    test    rsi, rsi

    mov     rax, [rdi + {registers_rax}]
    mov     rcx, [rdi + {registers_rcx}]
    mov     rdx, [rdi + {registers_rdx}]
    mov     rbx, [rdi + {registers_rbx}]
    mov     rbp, [rdi + {registers_rbp}]
    mov     rsi, [rdi + {registers_rsi}]
    mov     rdi, [rdi + {registers_rdi}]

    jnz     .Lresume32
    vmlaunch
    jmp     .Lfailed
.Lresume32:
    vmresume
    jmp     .Lfailed

.Lvmexit32:
    push    rdi
    mov     rdi, [rsp + 8]

    mov     [rdi + {registers_rax}], rax
    mov     [rdi + {registers_rcx}], rcx
    mov     [rdi + {registers_rdx}], rdx
    mov     [rdi + {registers_rbx}], rbx
    mov     [rdi + {registers_rbp}], rbp
    mov     [rdi + {registers_rsi}], rsi
    pop     rax
    mov     [rdi + {registers_rdi}], rax
    mov     rax, cr2
    mov     [rdi + {registers_cr2}], rax

    pop     rdi
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbx
    pop     rbp
    xor     eax, eax
    ret
"#,
    host_rsp = const vmcs::host::RSP,
    host_rip = const vmcs::host::RIP,
    registers_rax = const mem::offset_of!(GuestRegisters, rax),
    registers_rcx = const mem::offset_of!(GuestRegisters, rcx),
    registers_rdx = const mem::offset_of!(GuestRegisters, rdx),
    registers_rbx = const mem::offset_of!(GuestRegisters, rbx),
    registers_rbp = const mem::offset_of!(GuestRegisters, rbp),
    registers_rsi = const mem::offset_of!(GuestRegisters, rsi),
    registers_rdi = const mem::offset_of!(GuestRegisters, rdi),
    registers_r8 = const mem::offset_of!(GuestRegisters, r8),
    registers_r9 = const mem::offset_of!(GuestRegisters, r9),
    registers_r10 = const mem::offset_of!(GuestRegisters, r10),
    registers_r11 = const mem::offset_of!(GuestRegisters, r11),
    registers_r12 = const mem::offset_of!(GuestRegisters, r12),
    registers_r13 = const mem::offset_of!(GuestRegisters, r13),
    registers_r14 = const mem::offset_of!(GuestRegisters, r14),
    registers_r15 = const mem::offset_of!(GuestRegisters, r15),
    registers_cr2 = const mem::offset_of!(GuestRegisters, cr2),
);

use std::arch::global_asm;
use std::mem::offset_of;

use crate::{ProcCtx, SYS_CTX_OFF};

/// Guest register bank.
///
/// Register assignments in the sandbox contract: `r14` holds the sandbox
/// base, the `gs` segment base holds the system page. There is no spare
/// register for gas metering or a mask on this architecture. System calls
/// use the conventional `rax` number, `rdi rsi rdx r10 r8 r9` arguments and
/// `rax` return value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub rsp: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
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
    pub rip: u64,
    /// gs segment base; published to the hardware register on guest entry.
    pub gs: u64,
}

impl Regs {
    pub fn init(entry: u64, sp: u64) -> Self {
        Regs {
            rip: entry,
            rsp: sp,
            ..Default::default()
        }
    }

    pub fn pc(&self) -> u64 {
        self.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }

    pub fn sp(&self) -> u64 {
        self.rsp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.rsp = sp;
    }

    pub fn base(&self) -> u64 {
        self.r14
    }

    pub fn set_base(&mut self, base: u64) {
        self.r14 = base;
    }

    /// The i-th register that must always hold an in-sandbox address.
    pub fn addr_reg(&mut self, i: usize) -> Option<&mut u64> {
        match i {
            0 => Some(&mut self.rsp),
            1 => Some(&mut self.rbp),
            _ => None,
        }
    }

    pub fn sys_reg(&mut self) -> Option<&mut u64> {
        Some(&mut self.gs)
    }

    pub fn mask_reg(&mut self) -> Option<&mut u64> {
        None
    }

    pub fn gas_reg(&mut self) -> Option<&mut u64> {
        None
    }

    pub fn sysno(&self) -> u64 {
        self.rax
    }

    pub fn sysarg(&self, i: usize) -> u64 {
        match i {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            5 => self.r9,
            _ => panic!("syscall argument index out of range"),
        }
    }

    pub fn sysret(&self) -> u64 {
        self.rax
    }

    pub fn set_sysret(&mut self, v: u64) {
        self.rax = v;
    }
}

/// Filling executable padding with int3 makes stray control flow trap.
pub const SAFE_CODE_BYTE: u8 = 0xcc;

/// Largest sandbox-relative address guest code may occupy.
pub fn code_max(tag_bits: u32) -> u64 {
    let bits = if tag_bits == 0 { 32 } else { tag_bits };
    1u64 << bits
}

pub fn supports_gas() -> bool {
    false
}

pub fn supports_mask() -> bool {
    false
}

const KSTACKP: usize = offset_of!(ProcCtx, kstackp);
const TP: usize = offset_of!(ProcCtx, tp);
const RSP: usize = offset_of!(Regs, rsp);
const RAX: usize = offset_of!(Regs, rax);
const RCX: usize = offset_of!(Regs, rcx);
const RDX: usize = offset_of!(Regs, rdx);
const RBX: usize = offset_of!(Regs, rbx);
const RBP: usize = offset_of!(Regs, rbp);
const RSI: usize = offset_of!(Regs, rsi);
const RDI: usize = offset_of!(Regs, rdi);
const R8: usize = offset_of!(Regs, r8);
const R9: usize = offset_of!(Regs, r9);
const R10: usize = offset_of!(Regs, r10);
const R11: usize = offset_of!(Regs, r11);
const R12: usize = offset_of!(Regs, r12);
const R13: usize = offset_of!(Regs, r13);
const R14: usize = offset_of!(Regs, r14);
const R15: usize = offset_of!(Regs, r15);
const RIP: usize = offset_of!(Regs, rip);
const GS: usize = offset_of!(Regs, gs);

const SYS_ARCH_PRCTL: i64 = libc::SYS_arch_prctl;
// Not exposed by the `libc` crate; value from Linux's asm/prctl.h.
const ARCH_SET_GS: i32 = 0x1001;

// Guest entry. Saves the host callee-saved registers, anchors the host stack
// pointer in the context, publishes the system page through the gs base and
// hands control to the guest. The staged return address on the guest stack
// lets the final `ret` set every general-purpose register to its bank value.
global_asm!(
    ".text",
    ".globl lfi_ctx_entry",
    ".p2align 4",
    "lfi_ctx_entry:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi + {kstackp}], rsp",
    "mov r12, rdi",
    "mov rsi, [rdi + {gs}]",
    "mov edi, {arch_set_gs}",
    "mov eax, {sys_arch_prctl}",
    "syscall",
    "mov rdi, r12",
    "mov rsp, [rdi + {rsp}]",
    "push qword ptr [rdi + {rip}]",
    "mov rax, [rdi + {rax}]",
    "mov rcx, [rdi + {rcx}]",
    "mov rdx, [rdi + {rdx}]",
    "mov rbx, [rdi + {rbx}]",
    "mov rbp, [rdi + {rbp}]",
    "mov rsi, [rdi + {rsi}]",
    "mov r8, [rdi + {r8}]",
    "mov r9, [rdi + {r9}]",
    "mov r10, [rdi + {r10}]",
    "mov r11, [rdi + {r11}]",
    "mov r12, [rdi + {r12}]",
    "mov r13, [rdi + {r13}]",
    "mov r14, [rdi + {r14}]",
    "mov r15, [rdi + {r15}]",
    "mov rdi, [rdi + {rdi}]",
    "ret",
    kstackp = const KSTACKP,
    gs = const GS,
    arch_set_gs = const ARCH_SET_GS,
    sys_arch_prctl = const SYS_ARCH_PRCTL,
    rsp = const RSP,
    rip = const RIP,
    rax = const RAX,
    rcx = const RCX,
    rdx = const RDX,
    rbx = const RBX,
    rbp = const RBP,
    rsi = const RSI,
    r8 = const R8,
    r9 = const R9,
    r10 = const R10,
    r11 = const R11,
    r12 = const R12,
    r13 = const R13,
    r14 = const R14,
    r15 = const R15,
    rdi = const RDI,
);

// Unwind to the host frame saved by lfi_ctx_entry; `code` becomes its
// return value.
global_asm!(
    ".text",
    ".globl lfi_ctx_exit",
    ".p2align 4",
    "lfi_ctx_exit:",
    "mov rsp, rdi",
    "mov rax, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
);

// Runtime-call entry reached through system-page word 0. The guest arrives
// via `call`, so its resume point is on the guest stack. r11 is trampoline
// scratch and is zeroed on the way back.
global_asm!(
    ".text",
    ".globl lfi_rtcall_syscall",
    ".p2align 4",
    "lfi_rtcall_syscall:",
    "mov r11, qword ptr gs:[{sys_ctx}]",
    "mov [r11 + {rax}], rax",
    "mov [r11 + {rcx}], rcx",
    "mov [r11 + {rdx}], rdx",
    "mov [r11 + {rbx}], rbx",
    "mov [r11 + {rbp}], rbp",
    "mov [r11 + {rsi}], rsi",
    "mov [r11 + {rdi}], rdi",
    "mov [r11 + {r8}], r8",
    "mov [r11 + {r9}], r9",
    "mov [r11 + {r10}], r10",
    "mov [r11 + {r12}], r12",
    "mov [r11 + {r13}], r13",
    "mov [r11 + {r14}], r14",
    "mov [r11 + {r15}], r15",
    "pop rax",
    "mov [r11 + {rip}], rax",
    "mov [r11 + {rsp}], rsp",
    "mov rsp, [r11 + {kstackp}]",
    "mov rdi, r11",
    "push r11",
    "call lfi_dispatch_syscall",
    "pop r11",
    "mov rsp, [r11 + {rsp}]",
    "push qword ptr [r11 + {rip}]",
    "mov rax, [r11 + {rax}]",
    "mov rcx, [r11 + {rcx}]",
    "mov rdx, [r11 + {rdx}]",
    "mov rbx, [r11 + {rbx}]",
    "mov rbp, [r11 + {rbp}]",
    "mov rsi, [r11 + {rsi}]",
    "mov rdi, [r11 + {rdi}]",
    "mov r8, [r11 + {r8}]",
    "mov r9, [r11 + {r9}]",
    "mov r10, [r11 + {r10}]",
    "mov r12, [r11 + {r12}]",
    "mov r13, [r11 + {r13}]",
    "mov r14, [r11 + {r14}]",
    "mov r15, [r11 + {r15}]",
    "xor r11d, r11d",
    "ret",
    sys_ctx = const SYS_CTX_OFF,
    kstackp = const KSTACKP,
    rsp = const RSP,
    rip = const RIP,
    rax = const RAX,
    rcx = const RCX,
    rdx = const RDX,
    rbx = const RBX,
    rbp = const RBP,
    rsi = const RSI,
    rdi = const RDI,
    r8 = const R8,
    r9 = const R9,
    r10 = const R10,
    r12 = const R12,
    r13 = const R13,
    r14 = const R14,
    r15 = const R15,
);

// Thread-pointer runtime calls: no stack switch, no host call.
global_asm!(
    ".text",
    ".globl lfi_rtcall_gettp",
    ".p2align 4",
    "lfi_rtcall_gettp:",
    "mov r11, qword ptr gs:[{sys_ctx}]",
    "mov rax, [r11 + {tp}]",
    "xor r11d, r11d",
    "ret",
    ".globl lfi_rtcall_settp",
    ".p2align 4",
    "lfi_rtcall_settp:",
    "mov r11, qword ptr gs:[{sys_ctx}]",
    "mov [r11 + {tp}], rdi",
    "xor r11d, r11d",
    "ret",
    sys_ctx = const SYS_CTX_OFF,
    tp = const TP,
);

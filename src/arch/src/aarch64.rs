use std::arch::global_asm;
use std::mem::offset_of;

use crate::{ProcCtx, SYS_CTX_OFF};

/// Guest register bank.
///
/// Register assignments in the sandbox contract: `x21` holds the sandbox
/// base, `x25` the system page, `x24` the pointer mask and `x23` the gas
/// counter. System calls use the conventional `x8` number, `x0`-`x5`
/// arguments and `x0` return value. `x16`/`x17` are trampoline scratch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
}

impl Regs {
    pub fn init(entry: u64, sp: u64) -> Self {
        Regs {
            pc: entry,
            sp,
            ..Default::default()
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.sp = sp;
    }

    pub fn base(&self) -> u64 {
        self.x[21]
    }

    pub fn set_base(&mut self, base: u64) {
        self.x[21] = base;
    }

    /// The i-th register that must always hold an in-sandbox address.
    pub fn addr_reg(&mut self, i: usize) -> Option<&mut u64> {
        match i {
            0 => Some(&mut self.sp),
            1 => Some(&mut self.x[29]),
            2 => Some(&mut self.x[30]),
            _ => None,
        }
    }

    pub fn sys_reg(&mut self) -> Option<&mut u64> {
        Some(&mut self.x[25])
    }

    pub fn mask_reg(&mut self) -> Option<&mut u64> {
        Some(&mut self.x[24])
    }

    pub fn gas_reg(&mut self) -> Option<&mut u64> {
        Some(&mut self.x[23])
    }

    pub fn sysno(&self) -> u64 {
        self.x[8]
    }

    pub fn sysarg(&self, i: usize) -> u64 {
        assert!(i < 6, "syscall argument index out of range");
        self.x[i]
    }

    pub fn sysret(&self) -> u64 {
        self.x[0]
    }

    pub fn set_sysret(&mut self, v: u64) {
        self.x[0] = v;
    }
}

/// Zero bytes decode as a permanently-undefined instruction.
pub const SAFE_CODE_BYTE: u8 = 0x00;

/// Largest sandbox-relative address guest code may occupy. Direct branches
/// bound the reachable code window more tightly than the tag width here.
pub fn code_max(tag_bits: u32) -> u64 {
    let bits = if tag_bits == 0 { 32 } else { tag_bits };
    (1u64 << bits).min(1 << 30)
}

pub fn supports_gas() -> bool {
    true
}

pub fn supports_mask() -> bool {
    true
}

const KSTACKP: usize = offset_of!(ProcCtx, kstackp);
const TP: usize = offset_of!(ProcCtx, tp);
const X: usize = offset_of!(Regs, x);
const SP: usize = offset_of!(Regs, sp);
const PC: usize = offset_of!(Regs, pc);

// Guest entry. x16 stages the guest program counter; x0 is loaded last so
// the context pointer stays usable until the end.
global_asm!(
    ".text",
    ".globl lfi_ctx_entry",
    ".p2align 4",
    "lfi_ctx_entry:",
    "sub sp, sp, #96",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "mov x16, sp",
    "str x16, [x0, #{kstackp}]",
    "ldr x16, [x0, #{sp}]",
    "mov sp, x16",
    "ldr x16, [x0, #{pc}]",
    "ldp x1, x2, [x0, #({x} + 8)]",
    "ldp x3, x4, [x0, #({x} + 24)]",
    "ldp x5, x6, [x0, #({x} + 40)]",
    "ldp x7, x8, [x0, #({x} + 56)]",
    "ldp x9, x10, [x0, #({x} + 72)]",
    "ldp x11, x12, [x0, #({x} + 88)]",
    "ldp x13, x14, [x0, #({x} + 104)]",
    "ldr x15, [x0, #({x} + 120)]",
    "ldp x18, x19, [x0, #({x} + 144)]",
    "ldp x20, x21, [x0, #({x} + 160)]",
    "ldp x22, x23, [x0, #({x} + 176)]",
    "ldp x24, x25, [x0, #({x} + 192)]",
    "ldp x26, x27, [x0, #({x} + 208)]",
    "ldp x28, x29, [x0, #({x} + 224)]",
    "ldr x30, [x0, #({x} + 240)]",
    "ldr x0, [x0, #{x}]",
    "mov x17, xzr",
    "br x16",
    kstackp = const KSTACKP,
    sp = const SP,
    pc = const PC,
    x = const X,
);

// Unwind to the host frame saved by lfi_ctx_entry; `code` becomes its
// return value.
global_asm!(
    ".text",
    ".globl lfi_ctx_exit",
    ".p2align 4",
    "lfi_ctx_exit:",
    "mov sp, x0",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "add sp, sp, #96",
    "mov x0, x1",
    "ret",
);

// Runtime-call entry reached through system-page word 0. The guest arrives
// via `blr`, so its resume point is in x30. x25 still holds the system page
// (reserved register), which is how the context is found.
global_asm!(
    ".text",
    ".globl lfi_rtcall_syscall",
    ".p2align 4",
    "lfi_rtcall_syscall:",
    "ldr x17, [x25, #{sys_ctx}]",
    "stp x0, x1, [x17, #{x}]",
    "stp x2, x3, [x17, #({x} + 16)]",
    "stp x4, x5, [x17, #({x} + 32)]",
    "stp x6, x7, [x17, #({x} + 48)]",
    "stp x8, x9, [x17, #({x} + 64)]",
    "stp x10, x11, [x17, #({x} + 80)]",
    "stp x12, x13, [x17, #({x} + 96)]",
    "stp x14, x15, [x17, #({x} + 112)]",
    "stp x18, x19, [x17, #({x} + 144)]",
    "stp x20, x21, [x17, #({x} + 160)]",
    "stp x22, x23, [x17, #({x} + 176)]",
    "stp x24, x25, [x17, #({x} + 192)]",
    "stp x26, x27, [x17, #({x} + 208)]",
    "stp x28, x29, [x17, #({x} + 224)]",
    "str x30, [x17, #({x} + 240)]",
    "mov x16, sp",
    "str x16, [x17, #{sp}]",
    "str x30, [x17, #{pc}]",
    "ldr x16, [x17, #{kstackp}]",
    "mov sp, x16",
    "str x17, [sp, #-16]!",
    "mov x0, x17",
    "bl lfi_dispatch_syscall",
    "ldr x17, [sp], #16",
    "ldr x16, [x17, #{sp}]",
    "mov sp, x16",
    "ldr x16, [x17, #{pc}]",
    "ldp x0, x1, [x17, #{x}]",
    "ldp x2, x3, [x17, #({x} + 16)]",
    "ldp x4, x5, [x17, #({x} + 32)]",
    "ldp x6, x7, [x17, #({x} + 48)]",
    "ldp x8, x9, [x17, #({x} + 64)]",
    "ldp x10, x11, [x17, #({x} + 80)]",
    "ldp x12, x13, [x17, #({x} + 96)]",
    "ldp x14, x15, [x17, #({x} + 112)]",
    "ldp x18, x19, [x17, #({x} + 144)]",
    "ldp x20, x21, [x17, #({x} + 160)]",
    "ldp x22, x23, [x17, #({x} + 176)]",
    "ldp x24, x25, [x17, #({x} + 192)]",
    "ldp x26, x27, [x17, #({x} + 208)]",
    "ldp x28, x29, [x17, #({x} + 224)]",
    "ldr x30, [x17, #({x} + 240)]",
    "mov x17, xzr",
    "br x16",
    sys_ctx = const SYS_CTX_OFF,
    kstackp = const KSTACKP,
    sp = const SP,
    pc = const PC,
    x = const X,
);

// Thread-pointer runtime calls: no stack switch, no host call.
global_asm!(
    ".text",
    ".globl lfi_rtcall_gettp",
    ".p2align 4",
    "lfi_rtcall_gettp:",
    "ldr x17, [x25, #{sys_ctx}]",
    "ldr x0, [x17, #{tp}]",
    "mov x17, xzr",
    "ret",
    ".globl lfi_rtcall_settp",
    ".p2align 4",
    "lfi_rtcall_settp:",
    "ldr x17, [x25, #{sys_ctx}]",
    "str x0, [x17, #{tp}]",
    "mov x17, xzr",
    "ret",
    sys_ctx = const SYS_CTX_OFF,
    tp = const TP,
);

//! Architecture-specific guest state and the host<->guest transition
//! trampolines.
//!
//! Everything outside this crate is architecture-neutral: the rest of the
//! runtime sees a `Regs` bank with named accessors, a `ProcCtx` guest
//! context, and five trampoline entry points with a fixed contract:
//!
//! - `lfi_ctx_entry(ctx)` saves the host callee-saved state on the host
//!   stack, records the host stack pointer in `ctx.kstackp`, loads the guest
//!   bank and transfers to the guest program counter. It returns only when
//!   `lfi_ctx_exit` runs, with that call's `code` as its return value.
//! - `lfi_ctx_exit(kstackp, code)` unwinds straight back to the matching
//!   `lfi_ctx_entry`.
//! - `lfi_rtcall_syscall` is the runtime-call target the guest reaches
//!   through word 0 of its system page. It spills the guest bank into the
//!   context, switches to the host stack and calls the C-ABI hook
//!   `lfi_dispatch_syscall(ctx)`, then reloads the bank and resumes the
//!   guest at its return point.
//! - `lfi_rtcall_gettp` / `lfi_rtcall_settp` read/write `ctx.tp` without
//!   switching stacks.
//!
//! The trampolines may clobber the architecture's intra-procedure scratch
//! registers (`r11` on x86-64, `x16`/`x17` on aarch64).

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Byte offset of the context-pointer word in the system page. Words 0..=3
/// are guest ABI (runtime-call table and sandbox base); word 4 is
/// host-internal and lets the trampolines locate the guest context.
pub const SYS_CTX_OFF: usize = 4 * 8;

/// Guest execution context. The register bank must stay the first field:
/// the trampolines address both through a single base pointer.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ProcCtx {
    pub regs: Regs,
    /// Host stack pointer saved on guest entry; the resume anchor for
    /// `lfi_ctx_exit` and the stack the syscall trampoline runs on.
    pub kstackp: u64,
    /// Guest thread pointer, read and written by the tp runtime calls.
    pub tp: u64,
}

extern "C" {
    pub fn lfi_ctx_entry(ctx: *mut ProcCtx) -> u64;
    pub fn lfi_ctx_exit(kstackp: u64, code: u64) -> !;
    pub fn lfi_rtcall_syscall();
    pub fn lfi_rtcall_gettp();
    pub fn lfi_rtcall_settp();
}

const _: () = assert!(std::mem::offset_of!(ProcCtx, regs) == 0);

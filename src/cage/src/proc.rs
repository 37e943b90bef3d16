use std::cell::Cell;
use std::mem::offset_of;
use std::os::raw::c_void;
use std::ptr;
use std::sync::Arc;

use arch::{ProcCtx, Regs};
use memtab::{MapFlags, MapInfo, Prot};
use tracing::debug;

use crate::error::{seterr, Error, Result};
use crate::loader::{self, ProcInfo};
use crate::{host, AddrSpace, BoxPtr, Platform};

/// Exit codes produced when a guest fault forces the exit: `128 + signal`.
pub const EXIT_FAULT_BASE: u64 = 128;

/// Runtime-call table handed to the guest: three trampoline addresses, the
/// sandbox base, and (host-internal) the guest context pointer.
#[repr(C)]
struct SysTable {
    rtcalls: [u64; 3],
    base: u64,
    ctx: u64,
}

const _: () = assert!(offset_of!(SysTable, ctx) == arch::SYS_CTX_OFF);

struct SysPage {
    addr: u64,
    external: bool,
    page_size: usize,
}

impl SysPage {
    fn install(plat: &Platform, sandbox_base: u64, ctx: u64) -> Result<SysPage> {
        let page_size = plat.opts().page_size;
        let external = plat.opts().sys_external;
        let addr = if external {
            host::map_anywhere(page_size as u64, Prot::READ | Prot::WRITE)
                .map_err(|e| seterr(Error::CannotMap(e)))?
        } else {
            // the first page of the slot, inside guard 1
            host::map_fixed(
                sandbox_base,
                page_size as u64,
                Prot::READ | Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                -1,
                0,
            )
            .map_err(|e| seterr(Error::CannotMap(e)))?;
            sandbox_base
        };

        let table = SysTable {
            rtcalls: [
                arch::lfi_rtcall_syscall as usize as u64,
                arch::lfi_rtcall_gettp as usize as u64,
                arch::lfi_rtcall_settp as usize as u64,
            ],
            base: sandbox_base,
            ctx,
        };
        unsafe {
            ptr::write(addr as *mut SysTable, table);
        }
        host::protect(addr, page_size as u64, Prot::READ)
            .map_err(|e| seterr(Error::CannotMap(e)))?;
        Ok(SysPage {
            addr,
            external,
            page_size,
        })
    }
}

impl Drop for SysPage {
    fn drop(&mut self) {
        // the internal page lives in the slot and is wiped with it
        if self.external {
            host::unmap(self.addr, self.page_size as u64);
        }
    }
}

/// A guest execution context: register bank, sandbox, system page and the
/// anchors used by the enter/exit trampolines.
///
/// The context must stay the first field so the trampolines and the syscall
/// dispatch hook can treat a context pointer as a `Proc` pointer.
#[repr(C)]
pub struct Proc {
    ctx: ProcCtx,
    plat: Arc<Platform>,
    aspace: AddrSpace,
    syspage: Option<SysPage>,
    guard1: (u64, u64),
    guard2: (u64, u64),
    ctxp: *mut c_void,
}

const _: () = assert!(offset_of!(Proc, ctx) == 0);

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proc").field("ctxp", &self.ctxp).finish()
    }
}

// A Proc may move between host threads between guest entries; while a thread
// is inside the guest the Proc is pinned to it by the thread-local below.
unsafe impl Send for Proc {}

thread_local! {
    static CUR_PROC: Cell<*mut Proc> = const { Cell::new(ptr::null_mut()) };
}

/// The Proc currently executing on this thread, null outside guest entries.
/// Valid only from a syscall handler or fault context.
pub fn current_proc() -> *mut Proc {
    CUR_PROC.get()
}

/// End the current guest invocation: restores the host state saved on entry
/// and makes `code` the return value of the `start`/`invoke` that entered
/// the guest. Callable from a syscall handler or the fault handler.
pub fn proc_exit(code: u64) -> ! {
    let p = CUR_PROC.replace(ptr::null_mut());
    assert!(!p.is_null(), "proc_exit outside a guest invocation");
    unsafe { arch::lfi_ctx_exit((*p).ctx.kstackp, code) }
}

/// Called from the syscall trampoline with the guest bank already spilled
/// into the context. Reads the syscall registers, runs the platform's
/// handler, and writes the return value back into the bank.
#[no_mangle]
unsafe extern "C" fn lfi_dispatch_syscall(ctx: *mut ProcCtx) {
    let proc = &mut *(ctx as *mut Proc);
    let regs = &proc.ctx.regs;
    let sysno = regs.sysno();
    let args = [
        regs.sysarg(0),
        regs.sysarg(1),
        regs.sysarg(2),
        regs.sysarg(3),
        regs.sysarg(4),
        regs.sysarg(5),
    ];
    let ret = (proc.plat.opts().syshandler)(proc.ctxp, sysno, args);
    proc.ctx.regs.set_sysret(ret);
}

impl Proc {
    pub(crate) fn new(plat: Arc<Platform>, ctxp: *mut c_void) -> Result<Box<Proc>> {
        let aspace = AddrSpace::new(&plat)?;
        let info = aspace.info();
        let proc = Box::new(Proc {
            ctx: ProcCtx::default(),
            plat,
            aspace,
            syspage: None,
            guard1: (info.base, info.min_addr),
            guard2: (info.max_addr, info.base + info.size),
            ctxp,
        });
        debug!("proc: created in sandbox {:#x}", info.base);
        Ok(proc)
    }

    pub fn base(&self) -> u64 {
        self.aspace.base()
    }

    pub fn size(&self) -> u64 {
        self.aspace.size()
    }

    /// Inaccessible range below the usable area (includes the internal
    /// system page).
    pub fn guard1(&self) -> (u64, u64) {
        self.guard1
    }

    /// Inaccessible range above the usable area.
    pub fn guard2(&self) -> (u64, u64) {
        self.guard2
    }

    pub fn regs(&self) -> &Regs {
        &self.ctx.regs
    }

    pub fn regs_mut(&mut self) -> &mut Regs {
        &mut self.ctx.regs
    }

    pub fn set_ctxp(&mut self, ctxp: *mut c_void) {
        self.ctxp = ctxp;
    }

    pub fn ctxp(&self) -> *mut c_void {
        self.ctxp
    }

    pub fn tp_get(&self) -> u64 {
        self.ctx.tp
    }

    pub fn tp_set(&mut self, tp: u64) {
        self.ctx.tp = tp;
    }

    pub fn addrspace(&self) -> &AddrSpace {
        &self.aspace
    }

    pub fn addrspace_mut(&mut self) -> &mut AddrSpace {
        &mut self.aspace
    }

    /// Load an ELF executable into the sandbox. Any failure wipes the
    /// sandbox back to an inaccessible reservation.
    pub fn exec(&mut self, prog: &[u8]) -> Result<ProcInfo> {
        self.exec_interp(prog, None)
    }

    /// Load an ELF executable plus its dynamic interpreter (placed just
    /// above the program image).
    pub fn exec_interp(&mut self, prog: &[u8], interp: Option<&[u8]>) -> Result<ProcInfo> {
        // no partial image may survive a failed load
        let mut wipe = scopeguard::guard(self, |p| {
            p.syspage = None;
            p.aspace.reset();
        });
        let info = wipe.exec_inner(prog, interp)?;
        scopeguard::ScopeGuard::into_inner(wipe);
        Ok(info)
    }

    fn exec_inner(&mut self, prog: &[u8], interp: Option<&[u8]>) -> Result<ProcInfo> {
        let ctx_addr = &self.ctx as *const ProcCtx as u64;
        self.syspage = Some(SysPage::install(&self.plat, self.aspace.base(), ctx_addr)?);

        let stack_size = self.plat.opts().stack_size;
        let stack_base = self.aspace.max_addr() - stack_size as u64;
        let stack = self.aspace.map_at(
            BoxPtr::new(stack_base),
            stack_size as u64,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            -1,
            0,
        )?;

        let load_base = self.aspace.min_addr();
        let prog_info = loader::load_image(&mut self.aspace, prog, load_base)?;
        let interp_info = match interp {
            Some(buf) => Some(loader::load_image(&mut self.aspace, buf, prog_info.last)?),
            None => None,
        };

        // header re-parse cannot fail: load_image already validated it
        let header = goblin::elf::Elf::parse(prog)
            .map_err(|_| seterr(Error::InvalidElf("unparsable image")))?
            .header;

        Ok(ProcInfo {
            stack,
            stack_size,
            last_va: interp_info.as_ref().map_or(prog_info.last, |i| i.last),
            elf_entry: prog_info.entry,
            ld_entry: interp_info.as_ref().map_or(0, |i| i.entry),
            elf_base: prog_info.base,
            ld_base: interp_info.as_ref().map_or(prog_info.base, |i| i.base),
            phdr_off: header.e_phoff,
            phdr_count: header.e_phnum,
            phdr_entsize: header.e_phentsize,
        })
    }

    /// Initialize the register bank for a fresh invocation: entry point and
    /// stack pointer from the caller, sandbox base and system page
    /// installed, and every address register masked into the sandbox.
    pub fn init_regs(&mut self, entry: u64, sp: u64) -> Result<()> {
        let opts = self.plat.opts().clone();
        let base = self.aspace.base();
        let mut regs = Regs::init(entry, sp);
        regs.set_base(base);

        if opts.tag_bits != 0 {
            let mask = (1u64 << opts.tag_bits) - 1;
            let mut i = 0;
            while let Some(r) = regs.addr_reg(i) {
                *r = base | (*r & mask);
                i += 1;
            }
            if opts.tag_bits != 32 {
                if let Some(m) = regs.mask_reg() {
                    *m = mask;
                }
            }
        }

        if let Some(s) = regs.sys_reg() {
            *s = self.syspage.as_ref().map_or(0, |p| p.addr);
        }

        if opts.gas != 0 {
            match regs.gas_reg() {
                Some(g) => *g = opts.gas,
                None => return Err(seterr(Error::InvalidGas)),
            }
        }

        self.ctx.regs = regs;
        Ok(())
    }

    /// Run the guest from its initialized registers until it exits. The
    /// calling thread owns the guest for the duration.
    pub fn start(&mut self) -> u64 {
        self.enter()
    }

    /// Call the guest function at `func`; when it returns it will land on
    /// `ret` (a guest address, typically a stub that exits).
    pub fn invoke(&mut self, func: u64, ret: u64) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            let sp = self.ctx.regs.sp() - 8;
            self.ctx.regs.set_sp(sp);
            unsafe {
                ptr::write(sp as *mut u64, ret);
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.ctx.regs.x[30] = ret;
        }
        self.ctx.regs.set_pc(func);
        self.enter()
    }

    fn enter(&mut self) -> u64 {
        assert!(
            CUR_PROC.get().is_null(),
            "nested guest entry on one host thread"
        );
        CUR_PROC.set(self as *mut Proc);
        let code = unsafe { arch::lfi_ctx_entry(&mut self.ctx) };
        // proc_exit already cleared the slot; be safe against future exits
        CUR_PROC.set(ptr::null_mut());
        code
    }

    pub fn map_any(
        &mut self,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        off: i64,
    ) -> Result<BoxPtr> {
        self.aspace.map_any(len, prot, flags, fd, off)
    }

    pub fn map_at(
        &mut self,
        ptr: BoxPtr,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        off: i64,
    ) -> Result<BoxPtr> {
        self.aspace.map_at(ptr, len, prot, flags, fd, off)
    }

    pub fn mprotect(&mut self, ptr: BoxPtr, len: u64, prot: Prot) -> Result<()> {
        self.aspace.mprotect(ptr, len, prot)
    }

    pub fn munmap(&mut self, ptr: BoxPtr, len: u64) -> Result<()> {
        self.aspace.munmap(ptr, len)
    }

    pub fn mquery(&self, ptr: BoxPtr) -> Option<MapInfo> {
        self.aspace.query(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testelf::{self, Segment};
    use crate::Options;

    fn plat(opts: Options) -> Arc<Platform> {
        let plat = Platform::new(opts).unwrap();
        plat.add_vaspaces(1).unwrap();
        plat
    }

    fn default_plat() -> Arc<Platform> {
        plat(Options {
            no_verify: true,
            ..Default::default()
        })
    }

    fn page() -> u64 {
        host::page_size() as u64
    }

    fn tiny_image() -> Vec<u8> {
        testelf::build(
            3,
            0,
            &[Segment {
                vaddr: 0,
                memsz: 64,
                flags: testelf::PF_R | testelf::PF_X,
                align: page(),
                data: vec![arch::SAFE_CODE_BYTE; 64],
            }],
        )
    }

    #[test]
    fn init_regs_masks_address_registers() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        proc.init_regs(proc.base() + 0x100, 0x1234_5678_9abc).unwrap();

        let base = proc.base();
        let mask = (1u64 << 32) - 1;
        let regs = proc.regs_mut();
        assert_eq!(regs.base(), base);
        let mut i = 0;
        while let Some(r) = regs.addr_reg(i) {
            assert_eq!(*r & !mask, base, "address register {} escapes the sandbox", i);
            i += 1;
        }
        // low bits of the stack pointer survive the masking
        assert_eq!(regs.sp() & mask, 0x5678_9abc);
    }

    #[test]
    fn init_regs_points_sys_register_at_the_system_page() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        proc.init_regs(proc.base() + 0x100, proc.base() + 0x2000).unwrap();
        let base = proc.base();
        let sys = *proc.regs_mut().sys_reg().unwrap();
        assert_eq!(sys, base, "internal system page sits in the slot's first page");
    }

    #[test]
    fn system_page_table_layout() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        let words =
            unsafe { std::slice::from_raw_parts(proc.base() as *const u64, 5) };
        assert_eq!(words[0], arch::lfi_rtcall_syscall as usize as u64);
        assert_eq!(words[1], arch::lfi_rtcall_gettp as usize as u64);
        assert_eq!(words[2], arch::lfi_rtcall_settp as usize as u64);
        assert_eq!(words[3], proc.base());
        assert_eq!(words[4], &proc.ctx as *const ProcCtx as u64);
    }

    #[test]
    fn external_system_page_lives_outside_the_slot() {
        let plat = plat(Options {
            no_verify: true,
            sys_external: true,
            ..Default::default()
        });
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        let sys = *proc.regs_mut().sys_reg().unwrap();
        // written during init_regs only
        assert_eq!(sys, 0);
        proc.init_regs(proc.base() + 0x100, proc.base() + 0x2000).unwrap();
        let sys = *proc.regs_mut().sys_reg().unwrap();
        assert!(sys != 0);
        assert!(sys < proc.base() || sys >= proc.base() + proc.size());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn gas_is_rejected_without_a_gas_register() {
        let plat = plat(Options {
            no_verify: true,
            gas: 1000,
            ..Default::default()
        });
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        let err = proc.init_regs(proc.base(), proc.base()).unwrap_err();
        assert!(matches!(err, Error::InvalidGas));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn gas_lands_in_the_gas_register() {
        let plat = plat(Options {
            no_verify: true,
            gas: 1000,
            ..Default::default()
        });
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        proc.init_regs(proc.base(), proc.base()).unwrap();
        assert_eq!(*proc.regs_mut().gas_reg().unwrap(), 1000);
    }

    #[test]
    fn exec_maps_the_stack_below_guard2() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let info = proc.exec(&tiny_image()).unwrap();
        let (g2_start, _) = proc.guard2();
        assert_eq!(info.stack.addr() + info.stack_size as u64, g2_start);
        let m = proc.mquery(info.stack).unwrap();
        assert_eq!(m.prot, Prot::READ | Prot::WRITE);
        assert_eq!(m.len, info.stack_size as u64);
    }

    #[test]
    fn failed_exec_wipes_the_sandbox() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&tiny_image()).unwrap();
        assert!(proc.addrspace().mappings().count() > 0);

        // first load segment reaches beyond the code region cap
        let bad = testelf::build(
            2,
            0,
            &[Segment {
                vaddr: 1 << 33,
                memsz: page(),
                flags: testelf::PF_R,
                align: page(),
                data: vec![],
            }],
        );
        let err = proc.exec(&bad).unwrap_err();
        assert!(matches!(err, Error::InvalidElf(_)));
        assert_eq!(proc.addrspace().mappings().count(), 0);

        // the sandbox is reusable afterwards
        proc.exec(&tiny_image()).unwrap();
    }

    #[test]
    fn repeated_exec_reuses_the_sandbox() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let first = proc.exec(&tiny_image()).unwrap();
        for _ in 0..10 {
            let info = proc.exec(&tiny_image()).unwrap();
            assert_eq!(info.stack.addr(), first.stack.addr());
            assert_eq!(info.elf_entry, first.elf_entry);
        }
    }

    #[test]
    fn exhausted_boxmap_reports_no_space() {
        let plat = plat(Options {
            no_verify: true,
            ..Default::default()
        });
        let held: Vec<_> = (0..plat.max_procs())
            .map(|_| plat.add_proc(ptr::null_mut()).unwrap())
            .collect();
        let err = plat.add_proc(ptr::null_mut()).unwrap_err();
        assert!(matches!(err, Error::NoSpace));
        drop(held);
        plat.add_proc(ptr::null_mut()).unwrap();
    }

    #[test]
    fn tp_round_trips() {
        let plat = default_plat();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        assert_eq!(proc.tp_get(), 0);
        proc.tp_set(0xabcd);
        assert_eq!(proc.tp_get(), 0xabcd);
    }
}

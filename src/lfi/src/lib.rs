//! Lightweight fault isolation: run ahead-of-time-verified native guests
//! inside bounded slots of the host's own address space.
//!
//! The host builds a [`Platform`] (slot size, stack size, verifier, syscall
//! handler), reserves room with [`Platform::add_vaspaces`], then per guest
//! creates a [`Proc`], loads an ELF with [`Proc::exec`], seeds registers
//! with [`Proc::init_regs`] and enters with [`Proc::start`]. Guest system
//! calls arrive at the platform's handler; [`proc_exit`] ends the
//! invocation and becomes `start`'s return value.

pub use cage::{
    current_proc, last_error, proc_exit, AddrSpace, AddrSpaceInfo, BoxPtr, Error, MapFlags,
    MapInfo, Options, Platform, Proc, ProcCtx, ProcInfo, Prot, Regs, Result, SysHandler, Verifier,
    ERR_CANNOT_MAP, ERR_CONFIG, ERR_INVALID_ELF, ERR_INVALID_GAS, ERR_NOMEM, ERR_NOSPACE,
    ERR_VERIFY, EXIT_FAULT_BASE, GUARD1_SIZE, GUARD2_SIZE,
};

#[cfg(test)]
mod tests {
    use std::os::raw::c_void;
    use std::ptr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    // ---- guest images ----------------------------------------------------

    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;

    /// One-PT_LOAD position-independent ELF with `code` at vaddr 0.
    fn guest_elf(code: &[u8]) -> Vec<u8> {
        let page = page_size() as u64;
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
        #[cfg(target_arch = "x86_64")]
        out.extend_from_slice(&62u16.to_le_bytes());
        #[cfg(target_arch = "aarch64")]
        out.extend_from_slice(&183u16.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&(EHSIZE as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 6]); // e_shentsize/e_shnum/e_shstrndx

        let data_off = (EHSIZE + PHENTSIZE) as u64;
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
        out.extend_from_slice(&data_off.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&(code.len() as u64).to_le_bytes());
        out.extend_from_slice(&(code.len() as u64).to_le_bytes());
        out.extend_from_slice(&page.to_le_bytes());

        out.extend_from_slice(code);
        out
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// sysno 93, no arguments.
    #[cfg(target_arch = "x86_64")]
    fn code_syscall93() -> Vec<u8> {
        let mut c = vec![0xb8, 93, 0, 0, 0]; // mov eax, 93
        c.extend_from_slice(&[0x65, 0xff, 0x14, 0x25, 0, 0, 0, 0]); // call gs:[0]
        c
    }

    /// sysno 93, no arguments.
    #[cfg(target_arch = "aarch64")]
    fn code_syscall93() -> Vec<u8> {
        let words: [u32; 3] = [
            0xd2800ba8, // movz x8, #93
            0xf9400330, // ldr x16, [x25]
            0xd63f0200, // blr x16
        ];
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// sysno 1 with six literal arguments, then sysno 93 with the first
    /// syscall's return value as argument 0.
    #[cfg(target_arch = "x86_64")]
    fn code_args_then_exit() -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(&[0xb8, 1, 0, 0, 0]); // mov eax, 1
        c.extend_from_slice(&[0xbf, 11, 0, 0, 0]); // mov edi, 11
        c.extend_from_slice(&[0xbe, 22, 0, 0, 0]); // mov esi, 22
        c.extend_from_slice(&[0xba, 33, 0, 0, 0]); // mov edx, 33
        c.extend_from_slice(&[0x41, 0xba, 44, 0, 0, 0]); // mov r10d, 44
        c.extend_from_slice(&[0x41, 0xb8, 55, 0, 0, 0]); // mov r8d, 55
        c.extend_from_slice(&[0x41, 0xb9, 66, 0, 0, 0]); // mov r9d, 66
        c.extend_from_slice(&[0x65, 0xff, 0x14, 0x25, 0, 0, 0, 0]); // call gs:[0]
        c.extend_from_slice(&[0x48, 0x89, 0xc7]); // mov rdi, rax
        c.extend_from_slice(&[0xb8, 93, 0, 0, 0]); // mov eax, 93
        c.extend_from_slice(&[0x65, 0xff, 0x14, 0x25, 0, 0, 0, 0]); // call gs:[0]
        c
    }

    /// sysno 1 with six literal arguments, then sysno 93 with the first
    /// syscall's return value as argument 0.
    #[cfg(target_arch = "aarch64")]
    fn code_args_then_exit() -> Vec<u8> {
        let words: [u32; 12] = [
            0xd2800028, // movz x8, #1
            0xd2800160, // movz x0, #11
            0xd28002c1, // movz x1, #22
            0xd2800422, // movz x2, #33
            0xd2800583, // movz x3, #44
            0xd28006e4, // movz x4, #55
            0xd2800845, // movz x5, #66
            0xf9400330, // ldr x16, [x25]
            0xd63f0200, // blr x16
            0xd2800ba8, // movz x8, #93 (x0 already holds the return)
            0xf9400330, // ldr x16, [x25]
            0xd63f0200, // blr x16
        ];
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// set_tp(0x55), then get_tp, then sysno 93 with the thread pointer as
    /// argument 0.
    #[cfg(target_arch = "x86_64")]
    fn code_tp_round_trip() -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(&[0xbf, 0x55, 0, 0, 0]); // mov edi, 0x55
        c.extend_from_slice(&[0x65, 0xff, 0x14, 0x25, 16, 0, 0, 0]); // call gs:[16]
        c.extend_from_slice(&[0x65, 0xff, 0x14, 0x25, 8, 0, 0, 0]); // call gs:[8]
        c.extend_from_slice(&[0x48, 0x89, 0xc7]); // mov rdi, rax
        c.extend_from_slice(&[0xb8, 93, 0, 0, 0]); // mov eax, 93
        c.extend_from_slice(&[0x65, 0xff, 0x14, 0x25, 0, 0, 0, 0]); // call gs:[0]
        c
    }

    /// set_tp(0x55), then get_tp, then sysno 93 with the thread pointer as
    /// argument 0.
    #[cfg(target_arch = "aarch64")]
    fn code_tp_round_trip() -> Vec<u8> {
        let words: [u32; 8] = [
            0xd2800aa0, // movz x0, #0x55
            0xf9400b30, // ldr x16, [x25, #16]
            0xd63f0200, // blr x16 (set_tp)
            0xf9400730, // ldr x16, [x25, #8]
            0xd63f0200, // blr x16 (get_tp)
            0xd2800ba8, // movz x8, #93
            0xf9400330, // ldr x16, [x25]
            0xd63f0200, // blr x16
        ];
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Store through the sandbox base register into the read-only system
    /// page: faults inside the sandbox.
    #[cfg(target_arch = "x86_64")]
    fn code_fault() -> Vec<u8> {
        vec![0x49, 0x89, 0x86, 0, 1, 0, 0] // mov [r14 + 0x100], rax
    }

    /// Store through the sandbox base register into the read-only system
    /// page: faults inside the sandbox.
    #[cfg(target_arch = "aarch64")]
    fn code_fault() -> Vec<u8> {
        0xf90082a0u32.to_le_bytes().to_vec() // str x0, [x21, #0x100]
    }

    // ---- syscall handlers ------------------------------------------------

    static LAST_SYSNO: AtomicU64 = AtomicU64::new(0);
    static LAST_ARGS: [AtomicU64; 6] = [
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
    ];

    fn handler_exit42(_ctx: *mut c_void, sysno: u64, _args: [u64; 6]) -> u64 {
        LAST_SYSNO.store(sysno, Ordering::SeqCst);
        proc_exit(42);
    }

    fn handler_record_then_exit(_ctx: *mut c_void, sysno: u64, args: [u64; 6]) -> u64 {
        if sysno == 93 {
            proc_exit(args[0]);
        }
        for (slot, a) in LAST_ARGS.iter().zip(args) {
            slot.store(a, Ordering::SeqCst);
        }
        123
    }

    fn make_platform(handler: SysHandler) -> Arc<Platform> {
        let plat = Platform::new(Options {
            no_verify: true,
            syshandler: handler,
            ..Default::default()
        })
        .unwrap();
        plat.add_vaspaces(1).unwrap();
        plat
    }

    fn run_guest(plat: &Arc<Platform>, code: &[u8]) -> u64 {
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let info = proc.exec(&guest_elf(code)).unwrap();
        proc.init_regs(
            info.elf_entry,
            info.stack.addr() + info.stack_size as u64 - 16,
        )
        .unwrap();
        proc.start()
    }

    // ---- scenarios -------------------------------------------------------

    #[test]
    fn trivial_exit_returns_handler_code() {
        let plat = make_platform(handler_exit42);
        assert_eq!(run_guest(&plat, &code_syscall93()), 42);
        assert_eq!(LAST_SYSNO.load(Ordering::SeqCst), 93);
    }

    #[test]
    fn syscall_arguments_and_return_value_cross_the_boundary() {
        let plat = make_platform(handler_record_then_exit);
        // the guest forwards the handler's return (123) into its exit
        assert_eq!(run_guest(&plat, &code_args_then_exit()), 123);
        let got: Vec<u64> = LAST_ARGS
            .iter()
            .map(|a| a.load(Ordering::SeqCst))
            .collect();
        assert_eq!(got, vec![11, 22, 33, 44, 55, 66]);
    }

    #[test]
    fn thread_pointer_runtime_calls() {
        let plat = make_platform(handler_record_then_exit);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let info = proc.exec(&guest_elf(&code_tp_round_trip())).unwrap();
        proc.init_regs(
            info.elf_entry,
            info.stack.addr() + info.stack_size as u64 - 16,
        )
        .unwrap();
        assert_eq!(proc.start(), 0x55);
        assert_eq!(proc.tp_get(), 0x55);
    }

    #[test]
    fn repeat_start_is_stable() {
        let plat = make_platform(handler_exit42);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let info = proc.exec(&guest_elf(&code_syscall93())).unwrap();
        let sp = info.stack.addr() + info.stack_size as u64 - 16;
        for _ in 0..100_000 {
            proc.init_regs(info.elf_entry, sp).unwrap();
            assert_eq!(proc.start(), 42);
        }
    }

    #[test]
    fn invoke_calls_a_guest_function() {
        let plat = make_platform(handler_exit42);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let info = proc.exec(&guest_elf(&code_syscall93())).unwrap();
        proc.init_regs(
            info.elf_entry,
            info.stack.addr() + info.stack_size as u64 - 16,
        )
        .unwrap();
        // the "function" exits through the handler before using `ret`
        assert_eq!(proc.invoke(info.elf_entry, info.elf_entry), 42);
    }

    #[test]
    fn external_system_page_guest_still_reaches_the_runtime() {
        let plat = Platform::new(Options {
            no_verify: true,
            sys_external: true,
            syshandler: handler_exit42,
            ..Default::default()
        })
        .unwrap();
        plat.add_vaspaces(1).unwrap();
        assert_eq!(run_guest(&plat, &code_syscall93()), 42);
    }

    #[test]
    fn guest_fault_exits_with_distinguished_code() {
        let plat = make_platform(handler_exit42);
        let code = run_guest(&plat, &code_fault());
        assert_eq!(code, EXIT_FAULT_BASE + libc::SIGSEGV as u64);
    }

    #[test]
    fn guests_run_in_parallel_on_distinct_threads() {
        let plat = Platform::new(Options {
            no_verify: true,
            syshandler: handler_exit42,
            ..Default::default()
        })
        .unwrap();
        plat.add_vaspaces(4).unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let plat = plat.clone();
            handles.push(std::thread::spawn(move || {
                run_guest(&plat, &code_syscall93())
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
    }

    #[test]
    fn guard_protect_is_rejected_without_side_effects() {
        let plat = make_platform(handler_exit42);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&guest_elf(&code_syscall93())).unwrap();
        let (g1_start, _) = proc.guard1();
        let before: Vec<MapInfo> = proc.addrspace().mappings().collect();
        assert!(proc
            .mprotect(BoxPtr::new(g1_start), page_size() as u64, Prot::READ)
            .is_err());
        let after: Vec<MapInfo> = proc.addrspace().mappings().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn wx_request_fails_with_verify_code() {
        let plat = make_platform(handler_exit42);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let err = proc
            .map_any(
                page_size() as u64,
                Prot::READ | Prot::WRITE | Prot::EXEC,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                -1,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Verify));
        assert_eq!(last_error(), ERR_VERIFY);
    }

    struct AcceptAll;

    impl Verifier for AcceptAll {
        fn verify(&self, _code: &[u8], _addr: u64) -> bool {
            true
        }
    }

    struct RejectAll;

    impl Verifier for RejectAll {
        fn verify(&self, _code: &[u8], _addr: u64) -> bool {
            false
        }
    }

    #[test]
    fn verified_guest_runs_end_to_end() {
        let plat = Platform::new(Options {
            verifier: Some(Arc::new(AcceptAll)),
            syshandler: handler_exit42,
            ..Default::default()
        })
        .unwrap();
        plat.add_vaspaces(1).unwrap();
        assert_eq!(run_guest(&plat, &code_syscall93()), 42);
    }

    #[test]
    fn rejected_image_wipes_the_sandbox() {
        let plat = Platform::new(Options {
            verifier: Some(Arc::new(RejectAll)),
            syshandler: handler_exit42,
            ..Default::default()
        })
        .unwrap();
        plat.add_vaspaces(1).unwrap();
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let err = proc.exec(&guest_elf(&code_syscall93())).unwrap_err();
        assert!(matches!(err, Error::Verify));
        assert_eq!(proc.addrspace().mappings().count(), 0);
        assert_eq!(last_error(), ERR_VERIFY);
    }

    #[test]
    fn oversized_image_is_invalid_elf() {
        // first load segment reaches past the code-region cap
        let mut image = guest_elf(&code_syscall93());
        let vaddr_off = EHSIZE + 16;
        image[vaddr_off..vaddr_off + 8].copy_from_slice(&(1u64 << 33).to_le_bytes());

        let plat = make_platform(handler_exit42);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        let err = proc.exec(&image).unwrap_err();
        assert!(matches!(err, Error::InvalidElf(_)));
        assert_eq!(last_error(), ERR_INVALID_ELF);
        assert_eq!(proc.addrspace().mappings().count(), 0);
    }

    #[test]
    fn pointers_seeded_by_init_regs_stay_in_the_sandbox() {
        let plat = make_platform(handler_exit42);
        let mut proc = plat.add_proc(ptr::null_mut()).unwrap();
        proc.exec(&guest_elf(&code_syscall93())).unwrap();
        proc.init_regs(proc.base() + 64, 0xffff_ffff_ffff_ffff).unwrap();
        let base = proc.base();
        let size = proc.size();
        let regs = proc.regs_mut();
        let mut i = 0;
        while let Some(r) = regs.addr_reg(i) {
            assert!(*r >= base && *r < base + size);
            i += 1;
        }
    }
}

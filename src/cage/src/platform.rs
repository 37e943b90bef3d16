use std::os::raw::c_void;
use std::sync::Arc;

use boxmap::BoxMap;

use crate::error::{seterr, Error, Result};
use crate::{host, signal};

/// Oracle deciding whether a byte range, interpreted as code at `addr`,
/// satisfies the isolation rewriter's safety property. Read-only after
/// platform construction and shared without further synchronization.
pub trait Verifier: Send + Sync {
    fn verify(&self, code: &[u8], addr: u64) -> bool;
}

/// Host policy invoked on every guest system call. Receives the opaque
/// per-guest context pointer, the syscall number and six arguments; the
/// return value is written to the guest's syscall-return register. The
/// handler may call [`crate::proc_exit`] instead of returning.
pub type SysHandler = fn(ctx: *mut c_void, sysno: u64, args: [u64; 6]) -> u64;

fn default_syshandler(_ctx: *mut c_void, _sysno: u64, _args: [u64; 6]) -> u64 {
    0
}

/// Process-wide runtime configuration, immutable after [`Platform::new`].
#[derive(Clone)]
pub struct Options {
    /// Guest page granularity in bytes; 0 selects the host page size.
    pub page_size: usize,
    /// Per-guest stack reservation.
    pub stack_size: usize,
    /// Sandbox slot size; a power of two.
    pub vm_size: u64,
    /// Width of the varying low bits of in-sandbox pointers; 0 disables
    /// tagging. When nonzero, `vm_size` must equal `1 << tag_bits`.
    pub tag_bits: u32,
    /// Initial gas value for metered guests; 0 disables metering.
    pub gas: u64,
    /// Place the system page outside the sandbox instead of in its first
    /// page.
    pub sys_external: bool,
    /// Deliberately allow executable mappings without a verifier.
    pub no_verify: bool,
    pub verifier: Option<Arc<dyn Verifier>>,
    pub syshandler: SysHandler,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: 0,
            stack_size: 2 * 1024 * 1024,
            vm_size: 4 * 1024 * 1024 * 1024,
            tag_bits: 32,
            gas: 0,
            sys_external: false,
            no_verify: false,
            verifier: None,
            syshandler: default_syshandler,
        }
    }
}

/// Process-wide runtime singleton: configuration, the slot allocator and
/// the verifier. `add_proc` and `add_vaspaces` are safe to call
/// concurrently.
pub struct Platform {
    opts: Options,
    boxmap: BoxMap,
}

impl Platform {
    pub fn new(mut opts: Options) -> Result<Arc<Platform>> {
        if opts.page_size == 0 {
            opts.page_size = host::page_size();
        }
        let page = opts.page_size;
        if !page.is_power_of_two() || page < host::page_size() {
            return Err(seterr(Error::Config("bad page size")));
        }
        if !opts.vm_size.is_power_of_two() {
            return Err(seterr(Error::Config("sandbox size must be a power of two")));
        }
        if opts.tag_bits != 0 && opts.vm_size != 1u64 << opts.tag_bits {
            return Err(seterr(Error::Config("sandbox size does not match tag width")));
        }
        if opts.tag_bits != 0 && opts.tag_bits != 32 && !arch::supports_mask() {
            return Err(seterr(Error::Config(
                "non-canonical tag width needs a mask register",
            )));
        }
        if opts.stack_size == 0 || opts.stack_size % page != 0 {
            return Err(seterr(Error::Config("bad stack size")));
        }
        if crate::GUARD1_SIZE % page as u64 != 0 || crate::GUARD2_SIZE % page as u64 != 0 {
            return Err(seterr(Error::Config("page size incompatible with guard sizes")));
        }
        let floor = page as u64
            + crate::GUARD1_SIZE
            + crate::GUARD2_SIZE
            + opts.stack_size as u64
            + page as u64;
        if opts.vm_size < floor {
            return Err(seterr(Error::Config("sandbox too small for its layout")));
        }

        // Guest faults must be catchable before the first guest runs.
        signal::install();

        let boxmap = BoxMap::new(opts.vm_size);
        Ok(Arc::new(Platform { opts, boxmap }))
    }

    /// Reserve room for `count` sandboxes; 0 picks an automatic reservation,
    /// starting large and halving until the host accepts one.
    pub fn add_vaspaces(&self, count: usize) -> Result<()> {
        if count > 0 {
            self.boxmap
                .add_region(count as u64 * self.opts.vm_size)
                .map_err(|e| seterr(e.into()))?;
            return Ok(());
        }
        let mut n = 64u64;
        while n > 0 {
            if self.boxmap.add_region(n * self.opts.vm_size).is_ok() {
                return Ok(());
            }
            n /= 2;
        }
        Err(seterr(Error::Nomem))
    }

    /// Upper bound on concurrently live guests given the current
    /// reservations.
    pub fn max_procs(&self) -> usize {
        self.boxmap.total_slots()
    }

    pub fn free_procs(&self) -> usize {
        self.boxmap.free_slots()
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn boxmap(&self) -> &BoxMap {
        &self.boxmap
    }

    /// Create a guest bound to a fresh address space. `ctxp` is handed back
    /// verbatim to the syscall handler.
    pub fn add_proc(self: &Arc<Self>, ctxp: *mut c_void) -> Result<Box<crate::Proc>> {
        crate::Proc::new(self.clone(), ctxp)
    }
}

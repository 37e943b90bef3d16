//! Minimal driver: load a guest ELF, run it, report its exit code. The
//! syscall surface is just enough for freestanding test guests: write to
//! stdout/stderr and exit.

use std::os::raw::c_void;
use std::process::exit;
use std::time::Instant;

use anyhow::{anyhow, Context};
use lfi::{current_proc, proc_exit, BoxPtr, Options, Platform};
use tracing::warn;

#[cfg(target_arch = "x86_64")]
mod sysno {
    pub const WRITE: u64 = 1;
    pub const EXIT: u64 = 60;
    pub const EXIT_GROUP: u64 = 231;
}

#[cfg(target_arch = "aarch64")]
mod sysno {
    pub const WRITE: u64 = 64;
    pub const EXIT: u64 = 93;
    pub const EXIT_GROUP: u64 = 94;
}

const ENOSYS: u64 = -38i64 as u64;

fn syshandler(_ctx: *mut c_void, no: u64, args: [u64; 6]) -> u64 {
    match no {
        sysno::WRITE => {
            let (fd, buf, len) = (args[0], args[1], args[2]);
            if fd != 1 && fd != 2 {
                return ENOSYS;
            }
            let proc = unsafe { &*current_proc() };
            let host = proc.addrspace().from_ptr(BoxPtr::new(buf)) as u64;
            let sandbox_end = proc.base() + proc.size();
            if len == 0 || host.checked_add(len).is_none_or(|end| end > sandbox_end) {
                return ENOSYS;
            }
            let n = unsafe { libc::write(fd as i32, host as *const c_void, len as usize) };
            n as u64
        }
        sysno::EXIT | sysno::EXIT_GROUP => proc_exit(args[0]),
        _ => {
            warn!("unhandled guest syscall {}", no);
            ENOSYS
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or_else(|| anyhow!("no input binary"))?;
    let iterations = match args.next() {
        Some(flag) if flag == "--loop" => args
            .next()
            .ok_or_else(|| anyhow!("--loop needs a count"))?
            .parse::<usize>()?,
        Some(flag) => return Err(anyhow!("unknown flag {flag}")),
        None => 1,
    };

    let image = std::fs::read(&path).with_context(|| format!("reading {path}"))?;

    let plat = Platform::new(Options {
        no_verify: true,
        syshandler,
        ..Default::default()
    })?;
    plat.add_vaspaces(0)?;
    eprintln!("max procs: {}", plat.max_procs());

    let mut proc = plat.add_proc(std::ptr::null_mut())?;

    let begin = Instant::now();
    let mut code = 0;
    for _ in 0..iterations {
        let info = proc.exec(&image)?;
        proc.init_regs(
            info.elf_entry,
            info.stack.addr() + info.stack_size as u64 - 16,
        )?;
        code = proc.start();
    }
    if iterations > 1 {
        eprintln!("{:.3}", begin.elapsed().as_secs_f64());
    }

    eprintln!("exited with code {code}");
    exit(code as i32 & 0xff);
}

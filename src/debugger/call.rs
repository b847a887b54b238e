//! Function calls inside a stopped target.
//!
//! A call is performed from a temporary anonymous mapping: `mmap` syscall instruction is
//! written at current pc and executed by a single step, then `CALL RAX; INT3` is written
//! into a new region together with string arguments. After the call, original registers and
//! instructions are restored and the region is released with `munmap`.

use crate::controller::escape::EncodingError;
use crate::controller::Arg;
use crate::debugger::address::{page_align_up, RelocatedAddress};
use crate::debugger::register::{Register, RegisterMap, ARGUMENT_REGISTERS};
use crate::error::Error;
use crate::error::Error::{Ptrace, Waitpid};
use log::{debug, warn};
use nix::libc::{c_long, c_void};
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::mem::size_of;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("at most 6 integer arguments allowed, got {0}")]
    TooManyArguments(usize),
    #[error("mmap call failed")]
    Mmap,
    #[error("munmap call failed")]
    Munmap,
    #[error("target exit with code {0} during a call")]
    Exited(i32),
    #[error("target receive signal {0} during a call")]
    Signaled(Signal),
}

/// Size of `CALL RAX; INT3` instructions slot at the start of a call region.
const CODE_SLOT: usize = 16;
/// Bytes below a current stack pointer that a called function must not touch.
const RED_ZONE: u64 = 256;

/// Read `read_n` bytes from target memory.
pub fn read_memory(pid: Pid, addr: usize, read_n: usize) -> nix::Result<Vec<u8>> {
    let mut result = Vec::with_capacity(read_n);
    let mut addr = addr;
    while result.len() < read_n {
        let value = sys::ptrace::read(pid, addr as *mut c_void)?;
        let take = (read_n - result.len()).min(size_of::<c_long>());
        result.extend_from_slice(&value.to_ne_bytes()[..take]);
        addr += size_of::<c_long>();
    }
    Ok(result)
}

fn write_word(pid: Pid, addr: usize, value: usize) -> Result<(), Error> {
    unsafe { sys::ptrace::write(pid, addr as *mut c_void, value as *mut c_void) }.map_err(Ptrace)
}

/// Write bytes into target memory, tail is padded with zeroes up to a machine word.
fn write_padded(pid: Pid, addr: usize, bytes: &[u8]) -> Result<(), Error> {
    for (i, chunk) in bytes.chunks(size_of::<usize>()).enumerate() {
        let mut word = [0u8; size_of::<usize>()];
        word[..chunk.len()].copy_from_slice(chunk);
        write_word(pid, addr + i * size_of::<usize>(), usize::from_ne_bytes(word))?;
    }
    Ok(())
}

/// Arguments placed into a call region.
#[derive(Debug, PartialEq)]
struct CallLayout {
    /// Value for each argument register, string pointers are offsets in a region.
    args: Vec<ArgSlot>,
    /// NUL terminated strings and their offsets.
    strings: Vec<(usize, Vec<u8>)>,
    /// Required region size before page alignment.
    size: usize,
}

#[derive(Debug, PartialEq)]
enum ArgSlot {
    Value(u64),
    Offset(usize),
}

impl CallLayout {
    fn new(args: &[Arg]) -> Result<Self, Error> {
        if args.len() > ARGUMENT_REGISTERS.len() {
            return Err(CallError::TooManyArguments(args.len()).into());
        }

        let mut offset = CODE_SLOT;
        let mut strings = vec![];
        let mut slots = Vec::with_capacity(args.len());
        for arg in args {
            let slot = match arg {
                Arg::Int(v) => ArgSlot::Value(*v as u64),
                Arg::Null => ArgSlot::Value(0),
                Arg::Str(bytes) => {
                    if let Some(pos) = bytes.iter().position(|b| *b == 0) {
                        return Err(EncodingError::InteriorNul(pos).into());
                    }
                    let mut c_str = bytes.clone();
                    c_str.push(0);
                    let str_offset = offset;
                    offset += c_str.len().next_multiple_of(size_of::<usize>());
                    strings.push((str_offset, c_str));
                    ArgSlot::Offset(str_offset)
                }
            };
            slots.push(slot);
        }

        Ok(Self {
            args: slots,
            strings,
            size: offset,
        })
    }

    fn prepare_registers(&self, region: u64, regs: &mut RegisterMap) {
        for (slot, reg) in self.args.iter().zip(ARGUMENT_REGISTERS) {
            let value = match slot {
                ArgSlot::Value(v) => *v,
                ArgSlot::Offset(off) => region + *off as u64,
            };
            regs.update(reg, value);
        }
    }
}

/// Thread state before a call.
struct CallContext {
    pid: Pid,
    pc: RelocatedAddress,
    regs: RegisterMap,
    text: usize,
}

impl CallContext {
    fn new(pid: Pid) -> Result<Self, Error> {
        let regs = RegisterMap::current(pid).map_err(Ptrace)?;
        let pc = RelocatedAddress::from(regs.value(Register::Rip));
        let text = sys::ptrace::read(pid, pc.as_usize() as *mut c_void).map_err(Ptrace)? as usize;

        Ok(Self {
            pid,
            pc,
            regs,
            text,
        })
    }

    fn retrieve_original_state(&self) -> Result<(), Error> {
        self.regs.persist(self.pid).map_err(Ptrace)?;
        write_word(self.pid, self.pc.as_usize(), self.text)
    }

    fn with_ctx<F, T>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Self) -> Result<T, Error>,
    {
        let result = f(&self);

        debug!(target: "debugger", "retrieve original registers and instructions");
        self.retrieve_original_state()?;

        result
    }

    /// Execute `syscall` instruction at current pc with given registers, return `rax`.
    fn syscall(&self, regs: RegisterMap) -> Result<u64, Error> {
        // 0F 05 - syscall
        const SYSCALL: usize = 0x050F;
        const SYSCALL_MASK: usize = 0xFFFF_FFFF_FFFF_0000;

        write_word(self.pid, self.pc.as_usize(), (self.text & SYSCALL_MASK) | SYSCALL)?;
        regs.persist(self.pid).map_err(Ptrace)?;

        sys::ptrace::step(self.pid, None).map_err(Ptrace)?;
        wait_trap(self.pid, TrapSite::Syscall(self.pc))?;

        let result = RegisterMap::current(self.pid).map_err(Ptrace)?.value(Register::Rax);
        write_word(self.pid, self.pc.as_usize(), self.text)?;
        Ok(result)
    }
}

/// Address where a thread must trap when a call step is done.
#[derive(Clone, Copy, Debug, PartialEq)]
enum TrapSite {
    /// A single step over `syscall` written at this pc.
    Syscall(RelocatedAddress),
    /// The `int3` after `CALL RAX` at the start of this region.
    CallReturn(u64),
}

impl TrapSite {
    fn expected_pc(self) -> u64 {
        match self {
            TrapSite::Syscall(pc) => pc.as_u64() + 2,
            TrapSite::CallReturn(region) => region + 3,
        }
    }

    fn is_reached(self, pc: u64) -> bool {
        pc == self.expected_pc()
    }

    fn resume(self, pid: Pid) -> nix::Result<()> {
        match self {
            TrapSite::Syscall(_) => sys::ptrace::step(pid, None),
            TrapSite::CallReturn(_) => sys::ptrace::cont(pid, None),
        }
    }
}

/// Wait until a thread traps at `site`, quiet signals and stray traps are dropped.
fn wait_trap(pid: Pid, site: TrapSite) -> Result<(), Error> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let pc = RegisterMap::current(pid).map_err(Ptrace)?.value(Register::Rip);
                if site.is_reached(pc) {
                    return Ok(());
                }
                warn!(
                    target: "debugger",
                    "drop SIGTRAP at {pc:#x} during a call, wait for {:#x}",
                    site.expected_pc()
                );
                site.resume(pid).map_err(Ptrace)?;
            }
            WaitStatus::Stopped(_, signal)
                if matches!(signal, Signal::SIGCHLD | Signal::SIGALRM | Signal::SIGURG) =>
            {
                debug!(target: "debugger", "drop signal {signal} during a call");
                site.resume(pid).map_err(Ptrace)?;
            }
            WaitStatus::Stopped(_, signal) => return Err(CallError::Signaled(signal).into()),
            WaitStatus::Exited(_, code) => return Err(CallError::Exited(code).into()),
            WaitStatus::Signaled(_, signal, _) => return Err(CallError::Signaled(signal).into()),
            _ => site.resume(pid).map_err(Ptrace)?,
        }
    }
}

struct CallHelper;

impl CallHelper {
    fn mmap(ctx: &CallContext, size: u64) -> Result<u64, Error> {
        const MMAP: u64 = 9;
        const PROT: u64 =
            (nix::libc::PROT_READ | nix::libc::PROT_EXEC | nix::libc::PROT_WRITE) as u64;
        const FLAGS: u64 = (nix::libc::MAP_PRIVATE | nix::libc::MAP_ANONYMOUS) as u64;

        let mut regs = ctx.regs;
        regs.update(Register::Rax, MMAP);
        regs.update(Register::Rdi, 0);
        regs.update(Register::Rsi, size);
        regs.update(Register::Rdx, PROT);
        regs.update(Register::R10, FLAGS);
        regs.update(Register::R8, -1i64 as u64);
        regs.update(Register::R9, 0);

        let alloc_ptr = ctx.syscall(regs)?;
        // kernel returns -errno on failure
        if (alloc_ptr as i64) < 0 && (alloc_ptr as i64) > -4096 {
            return Err(CallError::Mmap.into());
        }
        Ok(alloc_ptr)
    }

    fn munmap(ctx: &CallContext, addr: u64, size: u64) -> Result<(), Error> {
        const MUNMAP: u64 = 11;

        let mut regs = ctx.regs;
        regs.update(Register::Rax, MUNMAP);
        regs.update(Register::Rdi, addr);
        regs.update(Register::Rsi, size);

        if ctx.syscall(regs)? != 0 {
            return Err(CallError::Munmap.into());
        }
        Ok(())
    }

    fn call_fn(
        ctx: &CallContext,
        region: u64,
        fn_addr: RelocatedAddress,
        layout: &CallLayout,
    ) -> Result<u64, Error> {
        // FF D0 - CALL %rax
        // CC - int3
        const CALL_FN: usize = 0xFF | (0xD0 << 0x8) | (0xCC << 0x10);

        debug!(target: "debugger", "add call instructions and arguments");
        write_word(ctx.pid, region as usize, CALL_FN)?;
        for (offset, c_str) in &layout.strings {
            write_padded(ctx.pid, region as usize + offset, c_str)?;
        }

        let mut regs = ctx.regs;
        layout.prepare_registers(region, &mut regs);
        regs.update(Register::Rax, fn_addr.as_u64());
        regs.update(Register::Rip, region);
        regs.update(Register::Rsp, (regs.value(Register::Rsp) - RED_ZONE) & !0xF);
        // no syscall restart
        regs.update(Register::OrigRax, u64::MAX);
        regs.persist(ctx.pid).map_err(Ptrace)?;

        debug!(target: "debugger", "call a function, wait until int3 is hit");
        sys::ptrace::cont(ctx.pid, None).map_err(Ptrace)?;
        wait_trap(ctx.pid, TrapSite::CallReturn(region))?;

        Ok(RegisterMap::current(ctx.pid)
            .map_err(Ptrace)?
            .value(Register::Rax))
    }
}

/// Call a function at `fn_addr` inside a stopped thread, return `rax` value.
///
/// Breakpoints must be disabled by the caller.
pub fn call_fn_raw(pid: Pid, fn_addr: RelocatedAddress, args: &[Arg]) -> Result<u64, Error> {
    let layout = CallLayout::new(args)?;
    let page_size = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) as usize };
    let size = page_align_up(layout.size, page_size) as u64;

    CallContext::new(pid)?.with_ctx(|ctx| {
        debug!(target: "debugger", "alloc temporary memory area of {size} bytes");
        let region = CallHelper::mmap(ctx, size)?;

        let result = CallHelper::call_fn(ctx, region, fn_addr, &layout);

        debug!(target: "debugger", "going to original rip");
        ctx.regs.persist(ctx.pid).map_err(Ptrace)?;

        debug!(target: "debugger", "dealloc temporary memory area");
        CallHelper::munmap(ctx, region, size)?;

        result
    })
}

//! Native ptrace controller (x86_64 Linux).

pub mod address;
pub mod breakpoint;
pub mod call;
pub mod process;
pub mod register;
pub mod symbol;
pub mod tracer;

use crate::controller::{Arg, BreakpointId, Controller, Stop, Value};
use crate::debugger::breakpoint::BreakpointRegistry;
use crate::debugger::call::{call_fn_raw, read_memory};
use crate::debugger::process::{Child, Template};
use crate::debugger::register::{Register, RegisterMap};
use crate::debugger::symbol::SymbolResolver;
use crate::debugger::tracer::{StopReason, TraceContext, Tracer};
use crate::error::Error;
use crate::error::Error::Ptrace;
use crate::{muted_error, weak_error};
use log::{debug, info, warn};
use nix::sys::ptrace::Options;
use object::SymbolKind;
use std::path::Path;

/// Name of glibc function returning a thread local `errno` address.
const ERRNO_LOCATION: &str = "__errno_location";

macro_rules! disable_when_not_started {
    ($this: expr) => {
        if $this.tracer.is_none() {
            return Err(Error::ProcessNotStarted);
        }
    };
}

/// Native debugger, controls a target with ptrace.
#[derive(Default)]
pub struct Debugger {
    program: Option<Child<Template>>,
    tracer: Option<Tracer>,
    breakpoints: BreakpointRegistry,
    symbols: SymbolResolver,
    /// Breakpoints may be written into a target memory. False until a target image is
    /// loaded and while a `vfork` child shares memory with a detached parent.
    armable: bool,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tracer(&mut self) -> Result<&mut Tracer, Error> {
        self.tracer.as_mut().ok_or(Error::ProcessNotStarted)
    }

    fn pid(&self) -> Result<nix::unistd::Pid, Error> {
        self.tracer
            .as_ref()
            .map(Tracer::proc_pid)
            .ok_or(Error::ProcessNotStarted)
    }

    /// Try to resolve and enable all pending breakpoints.
    fn arm_pending(&mut self) -> Result<(), Error> {
        if !self.armable {
            return Ok(());
        }
        let pid = self.pid()?;

        for brkpt in self.breakpoints.pending() {
            let Some(symbol) = self.symbols.resolve(pid, &brkpt.location)? else {
                debug!(target: "debugger", "breakpoint {} at `{}` still pending", brkpt.id, brkpt.location);
                continue;
            };
            brkpt.arm(pid, symbol.addr)?;
            info!(target: "debugger", "breakpoint {} set at `{}` ({})", brkpt.id, brkpt.location, symbol.addr);
        }
        Ok(())
    }

    /// If a focused thread stays at a breakpoint, execute the original instruction.
    fn step_over_breakpoint(&mut self) -> Result<(), Error> {
        if self.breakpoints.active().next().is_none() {
            return Ok(());
        }
        let tracer = self.tracer.as_mut().ok_or(Error::ProcessNotStarted)?;
        let pid = tracer.focus();
        let pc = RegisterMap::current(pid).map_err(Ptrace)?.value(Register::Rip);

        if let Some(brkpt) = self.breakpoints.find_by_addr(pc.into()) {
            debug!(target: "debugger", "step over breakpoint {}", brkpt.id);
            brkpt.disable(pid)?;
            tracer.single_step(pid)?;
            brkpt.enable(pid)?;
        }
        Ok(())
    }

    /// Forget breakpoint addresses, they are resolved again in a new image.
    fn on_exec(&mut self) {
        debug!(target: "debugger", "process image replaced, breakpoints are pending now");
        for brkpt in self.breakpoints.iter() {
            brkpt.reset();
        }
        self.symbols.reset();
        self.armable = true;
    }

    fn on_fork(&mut self, parent: nix::unistd::Pid, child: nix::unistd::Pid, vfork: bool) -> Result<(), Error> {
        info!(target: "debugger", "follow child {child} of {parent}");

        if vfork {
            // memory is shared until the child exec, parent must not meet an int3 after detach
            for brkpt in self.breakpoints.iter() {
                brkpt.disable(child)?;
                brkpt.reset();
            }
            self.armable = false;
        } else {
            // child has own copy of breakpoints, parent copy must be clean
            for brkpt in self.breakpoints.active() {
                brkpt.restore_in(parent)?;
            }
        }

        self.tracer()?.switch_to(child);
        Ok(())
    }

    fn resume(&mut self) -> Result<Stop, Error> {
        loop {
            self.arm_pending()?;
            self.step_over_breakpoint()?;

            let addresses = self.breakpoints.addresses();
            let reason = self.tracer()?.resume(TraceContext::new(&addresses))?;

            match reason {
                StopReason::Exec(pid) => {
                    debug!(target: "debugger", "process {pid} call exec");
                    self.on_exec();
                }
                StopReason::Fork {
                    parent,
                    child,
                    vfork,
                } => self.on_fork(parent, child, vfork)?,
                StopReason::Breakpoint(pid, addr) => {
                    if let Some(brkpt) = self.breakpoints.find_by_addr(addr) {
                        info!(target: "debugger", "thread {pid} hit breakpoint {} at `{}`", brkpt.id, brkpt.location);
                        return Ok(Stop::Breakpoint(brkpt.id));
                    }
                    warn!(target: "debugger", "stop at unknown breakpoint {addr}");
                }
                StopReason::Exited(code) => {
                    self.tracer = None;
                    return Ok(Stop::Exited(code));
                }
                StopReason::Killed(signal) => {
                    self.tracer = None;
                    return Ok(Stop::Signaled(signal.as_str().to_string()));
                }
                StopReason::FatalSignal(pid, signal) => {
                    info!(target: "debugger", "thread {pid} receive signal {signal}");
                    return Ok(Stop::Signaled(signal.as_str().to_string()));
                }
            }
        }
    }

    /// Run a closure with all breakpoints removed from a target memory.
    fn with_disabled_brkpts<F, T>(&mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        let pid = self.pid()?;
        let active: Vec<BreakpointId> = self.breakpoints.active().map(|b| b.id).collect();

        debug!(target: "debugger", "disable all active breakpoints");
        for brkpt in self.breakpoints.active() {
            brkpt.disable(pid)?;
        }

        let result = f(self);

        debug!(target: "debugger", "enable all active breakpoints");
        for brkpt in self.breakpoints.iter().filter(|b| active.contains(&b.id)) {
            weak_error!(brkpt.enable(pid), "enable breakpoint after call:");
        }

        result
    }

    fn resolve(&mut self, name: &str) -> Result<symbol::Symbol, Error> {
        let pid = self.pid()?;
        self.symbols
            .resolve(pid, name)?
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
    }
}

impl Controller for Debugger {
    fn attach(&mut self, executable: &Path) -> Result<(), Error> {
        let program = Child::new(executable, Vec::<String>::new())?;
        info!(target: "debugger", "program {:?} loaded", program.program());
        self.program = Some(program);
        Ok(())
    }

    fn follow_child_on_fork(&mut self) -> Result<(), Error> {
        let program = self.program.as_mut().ok_or(Error::ProcessNotStarted)?;
        program.follow_fork();

        if let Some(tracer) = self.tracer.as_ref() {
            tracer.set_options(
                Options::PTRACE_O_TRACECLONE
                    | Options::PTRACE_O_TRACEEXEC
                    | Options::PTRACE_O_TRACEEXIT
                    | Options::PTRACE_O_TRACEFORK
                    | Options::PTRACE_O_TRACEVFORK,
            )?;
        }
        Ok(())
    }

    fn set_breakpoint(&mut self, location: &str) -> Result<BreakpointId, Error> {
        let id = self.breakpoints.add(location).id;
        if self.tracer.is_some() {
            self.arm_pending()?;
        }
        Ok(id)
    }

    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        let brkpt = self.breakpoints.remove(id)?;
        if let Ok(pid) = self.pid() {
            brkpt.disable(pid)?;
        }
        debug!(target: "debugger", "breakpoint {id} at `{}` removed", brkpt.location);
        Ok(())
    }

    fn run(&mut self) -> Result<Stop, Error> {
        let program = self.program.as_ref().ok_or(Error::ProcessNotStarted)?;
        let proc = program.install()?;
        self.tracer = Some(Tracer::new(proc.pid()));
        self.armable = false;
        self.resume()
    }

    fn continue_until_break(&mut self) -> Result<Stop, Error> {
        disable_when_not_started!(self);
        self.resume()
    }

    fn invoke(&mut self, symbol: &str, args: &[Arg]) -> Result<Value, Error> {
        disable_when_not_started!(self);

        let fn_addr = self.resolve(symbol)?.addr;
        debug!(target: "debugger", "call `{symbol}` at {fn_addr} with {} arguments", args.len());

        let pid = self.tracer()?.focus();
        let rax = self.with_disabled_brkpts(|_| call_fn_raw(pid, fn_addr, args))?;
        Ok(Value::Int(rax as i64))
    }

    fn read_variable(&mut self, name: &str) -> Result<Value, Error> {
        disable_when_not_started!(self);
        let pid = self.tracer()?.focus();

        if name == "errno" {
            let Value::Int(location) = self.invoke(ERRNO_LOCATION, &[])? else {
                return Err(Error::SymbolNotFound(ERRNO_LOCATION.to_string()));
            };
            let bytes = read_memory(pid, location as usize, 4).map_err(Ptrace)?;
            let errno = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            return Ok(Value::Int(errno as i64));
        }

        let symbol = self.resolve(name)?;
        if symbol.kind == SymbolKind::Text {
            return Ok(Value::Int(symbol.addr.as_u64() as i64));
        }
        let bytes = read_memory(pid, symbol.addr.as_usize(), 8).map_err(Ptrace)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(Value::Int(i64::from_ne_bytes(word)))
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        let Some(mut tracer) = self.tracer.take() else {
            return;
        };
        let pid = tracer.proc_pid();
        for brkpt in self.breakpoints.active() {
            muted_error!(brkpt.disable(pid), "disable breakpoint before detach:");
        }
        info!(target: "debugger", "detach from process {pid}");
        tracer.detach();
    }
}

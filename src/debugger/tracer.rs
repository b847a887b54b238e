use crate::debugger::address::RelocatedAddress;
use crate::debugger::register::{Register, RegisterMap};
use crate::error::Error;
use crate::error::Error::{ProcessExit, Ptrace, Waitpid};
use crate::weak_error;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};

/// Process breakpoint
const TRAP_BRKPT: i32 = 0x1;
/// Sent by the kernel from somewhere
const SI_KERNEL: i32 = 0x80;

/// List of signals that dont interrupt a target and send to it directly on fire.
static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

/// Signals that stop a session, target will not survive them.
static FATAL_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGBUS,
    Signal::SIGABRT,
    Signal::SIGFPE,
];

#[derive(Debug)]
pub enum StopReason {
    /// Process image replaced by `exec`
    Exec(Pid),
    /// Thread stopped at breakpoint
    Breakpoint(Pid, RelocatedAddress),
    /// New process created by `fork` or `vfork`, child is attached and stopped
    Fork { parent: Pid, child: Pid, vfork: bool },
    /// Whole process exited with code
    Exited(i32),
    /// Whole process killed by signal
    Killed(Signal),
    /// Thread received a signal that is fatal for it
    FatalSignal(Pid, Signal),
}

#[derive(Clone, Copy)]
pub struct TraceContext<'a> {
    /// Addresses of enabled breakpoints.
    pub breakpoints: &'a [RelocatedAddress],
}

impl<'a> TraceContext<'a> {
    pub fn new(breakpoints: &'a [RelocatedAddress]) -> Self {
        Self { breakpoints }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TraceeStatus {
    Stopped,
    Running,
}

/// Thread attached with ptrace.
#[derive(Clone, Debug)]
struct Tracee {
    pid: Pid,
    status: TraceeStatus,
    /// Signal that will be injected at next resume.
    pending_signal: Option<Signal>,
}

impl Tracee {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            status: TraceeStatus::Stopped,
            pending_signal: None,
        }
    }

    fn r#continue(&mut self) -> nix::Result<()> {
        let sig = self.pending_signal.take();
        debug!(target: "tracer", "continue thread {} with signal {sig:?}", self.pid);
        sys::ptrace::cont(self.pid, sig)?;
        self.status = TraceeStatus::Running;
        Ok(())
    }
}

/// Ptrace tracer of a single process, all threads of it are traced.
pub struct Tracer {
    proc_pid: Pid,
    focus: Pid,
    tracees: HashMap<Pid, Tracee>,
    /// Auto-attached threads and processes whose initial stop came before
    /// the clone or fork event of a parent. They stay stopped until claimed.
    parked: HashSet<Pid>,
}

impl Tracer {
    pub fn new(proc_pid: Pid) -> Self {
        Self {
            proc_pid,
            focus: proc_pid,
            tracees: HashMap::from([(proc_pid, Tracee::new(proc_pid))]),
            parked: HashSet::new(),
        }
    }

    /// Return pid of a traced process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.proc_pid
    }

    /// Return a thread that caused the last stop.
    pub fn focus(&self) -> Pid {
        self.focus
    }

    /// Continue all threads until a stop happened.
    pub fn resume(&mut self, ctx: TraceContext) -> Result<StopReason, Error> {
        loop {
            self.cont_stopped()?;

            debug!(target: "tracer", "resume target execution, wait for updates");
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => return Ok(StopReason::Exited(-1)),
                Err(e) => return Err(Waitpid(e)),
            };

            debug!(target: "tracer", "received new thread status: {status:?}");
            if let Some(stop) = self.apply_new_status(ctx, status)? {
                debug!(target: "tracer", "target stopped, reason: {stop:?}");
                return Ok(stop);
            }
        }
    }

    fn cont_stopped(&mut self) -> Result<(), Error> {
        let mut gone = vec![];
        for tracee in self.tracees.values_mut() {
            if tracee.status != TraceeStatus::Stopped {
                continue;
            }
            if let Err(e) = tracee.r#continue() {
                // thread may exit at this point
                if e == Errno::ESRCH {
                    warn!(target: "tracer", "thread {} not found, ESRCH", tracee.pid);
                    gone.push(tracee.pid);
                    continue;
                }
                return Err(Ptrace(e));
            }
        }
        for pid in gone {
            self.tracees.remove(&pid);
        }
        Ok(())
    }

    /// Consume an initial stop of an auto-attached thread or process.
    fn wait_initial_stop(&mut self, pid: Pid) -> Result<(), Error> {
        if self.parked.remove(&pid) {
            debug!(target: "tracer", "initial stop of {pid} already received");
            return Ok(());
        }
        let status = waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
        debug!(target: "tracer", "initial status of {pid}: {status:?}");
        Ok(())
    }

    /// Register a new thread of a traced process, it is stopped.
    fn add_thread(&mut self, tid: Pid) -> Result<(), Error> {
        if self.tracees.contains_key(&tid) {
            return Ok(());
        }
        self.wait_initial_stop(tid)?;
        self.tracees.insert(tid, Tracee::new(tid));
        Ok(())
    }

    fn set_stopped(&mut self, pid: Pid) -> &mut Tracee {
        let tracee = self.tracees.entry(pid).or_insert_with(|| Tracee::new(pid));
        tracee.status = TraceeStatus::Stopped;
        tracee
    }

    /// Handle event fired by `waitpid`. If a stop of the whole process is detected,
    /// returns a stop reason.
    fn apply_new_status(
        &mut self,
        ctx: TraceContext,
        status: WaitStatus,
    ) -> Result<Option<StopReason>, Error> {
        match status {
            WaitStatus::Exited(pid, code) => {
                self.tracees.remove(&pid);
                if pid == self.proc_pid {
                    return Ok(Some(StopReason::Exited(code)));
                }
                Ok(None)
            }
            WaitStatus::Signaled(pid, signal, _) => {
                self.tracees.remove(&pid);
                if pid == self.proc_pid {
                    return Ok(Some(StopReason::Killed(signal)));
                }
                Ok(None)
            }
            WaitStatus::PtraceEvent(pid, _, code) => match code {
                libc::PTRACE_EVENT_EXEC => {
                    // all other threads are destroyed by exec
                    self.tracees.clear();
                    self.set_stopped(pid);
                    self.proc_pid = pid;
                    self.focus = pid;
                    Ok(Some(StopReason::Exec(pid)))
                }
                libc::PTRACE_EVENT_CLONE => {
                    self.set_stopped(pid);
                    let new_tid = Pid::from_raw(sys::ptrace::getevent(pid).map_err(Ptrace)? as i32);
                    self.add_thread(new_tid)?;
                    Ok(None)
                }
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                    self.set_stopped(pid);
                    let child = Pid::from_raw(sys::ptrace::getevent(pid).map_err(Ptrace)? as i32);
                    debug!(target: "tracer", "new process {child} created");
                    self.wait_initial_stop(child)?;

                    self.focus = pid;
                    self.group_stop(ctx, pid)?;
                    Ok(Some(StopReason::Fork {
                        parent: pid,
                        child,
                        vfork: code == libc::PTRACE_EVENT_VFORK,
                    }))
                }
                libc::PTRACE_EVENT_STOP => {
                    // new thread started or PTRACE_INTERRUPT called
                    if self.tracees.contains_key(&pid) {
                        self.set_stopped(pid);
                    } else {
                        // a parent event is not received yet, it's unknown whether
                        // this is a thread or a forked process
                        debug!(target: "tracer", "park auto-attached {pid}");
                        self.parked.insert(pid);
                    }
                    Ok(None)
                }
                libc::PTRACE_EVENT_EXIT => {
                    // let thread exit, `Exited` status arrive later
                    self.set_stopped(pid);
                    Ok(None)
                }
                _ => {
                    warn!(target: "tracer", "unsupported (ignored) ptrace event, code: {code}");
                    self.set_stopped(pid);
                    Ok(None)
                }
            },
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                let info = match sys::ptrace::getsiginfo(pid) {
                    Ok(info) => info,
                    Err(Errno::ESRCH) => {
                        self.tracees.remove(&pid);
                        return Ok(None);
                    }
                    Err(e) => return Err(Ptrace(e)),
                };
                self.set_stopped(pid);

                if !matches!(info.si_code, TRAP_BRKPT | SI_KERNEL) {
                    debug!(target: "tracer", "unexpected SIGTRAP code {}", info.si_code);
                    return Ok(None);
                }

                let Some(pc) = rewind_to_breakpoint(pid, ctx)? else {
                    warn!(target: "tracer", "thread {pid} trapped outside of known breakpoints");
                    return Ok(None);
                };

                self.focus = pid;
                self.group_stop(ctx, pid)?;
                Ok(Some(StopReason::Breakpoint(pid, pc)))
            }
            WaitStatus::Stopped(pid, signal) => {
                self.set_stopped(pid).pending_signal = Some(signal);

                if FATAL_SIGNALS.contains(&signal) {
                    self.focus = pid;
                    self.group_stop(ctx, pid)?;
                    return Ok(Some(StopReason::FatalSignal(pid, signal)));
                }

                if !QUIET_SIGNALS.contains(&signal) {
                    debug!(target: "tracer", "pass signal {signal} to thread {pid}");
                }
                Ok(None)
            }
            _ => {
                warn!(target: "tracer", "unexpected wait status: {status:?}");
                Ok(None)
            }
        }
    }

    /// Stop all running threads one by one using PTRACE_INTERRUPT request.
    ///
    /// # Arguments
    ///
    /// * `initiator`: thread already stopped, there is no need to interrupt it.
    fn group_stop(&mut self, ctx: TraceContext, initiator: Pid) -> Result<(), Error> {
        let running: Vec<Pid> = self
            .tracees
            .values()
            .filter(|t| t.pid != initiator && t.status == TraceeStatus::Running)
            .map(|t| t.pid)
            .collect();
        if running.is_empty() {
            return Ok(());
        }
        debug!(target: "tracer", "initiate group stop, initiator: {initiator}, threads: {running:?}");

        for tid in running {
            if let Err(e) = sys::ptrace::interrupt(tid) {
                if e == Errno::ESRCH {
                    warn!(target: "tracer", "thread {tid} not found, ESRCH");
                    self.tracees.remove(&tid);
                    continue;
                }
                return Err(Ptrace(e));
            }

            loop {
                let status = waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
                match status {
                    WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {
                        let new_tid =
                            Pid::from_raw(sys::ptrace::getevent(tid).map_err(Ptrace)? as i32);
                        self.add_thread(new_tid)?;
                        self.set_stopped(tid);
                        break;
                    }
                    WaitStatus::PtraceEvent(..) => {
                        self.set_stopped(tid);
                        break;
                    }
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                        // hit a breakpoint before interrupt, it fires again after resume
                        rewind_to_breakpoint(tid, ctx)?;
                        self.set_stopped(tid);
                        break;
                    }
                    WaitStatus::Stopped(_, signal) => {
                        self.set_stopped(tid).pending_signal = Some(signal);
                        break;
                    }
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                        self.tracees.remove(&tid);
                        break;
                    }
                    _ => continue,
                }
            }
        }

        debug!(target: "tracer", "group stop complete");
        Ok(())
    }

    /// Execute single instruction in a thread.
    pub fn single_step(&mut self, pid: Pid) -> Result<(), Error> {
        sys::ptrace::step(pid, None).map_err(Ptrace)?;
        loop {
            let status = waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
            match status {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(()),
                WaitStatus::Stopped(_, signal) => {
                    // deliver it at next resume
                    self.set_stopped(pid).pending_signal = Some(signal);
                }
                WaitStatus::Exited(_, code) => {
                    self.tracees.remove(&pid);
                    return Err(ProcessExit(code));
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.tracees.remove(&pid);
                    return Err(Error::ProcessSignaled(signal.as_str().to_string()));
                }
                _ => {}
            }
            sys::ptrace::step(pid, None).map_err(Ptrace)?;
        }
    }

    /// Update trace options for all threads, threads must be stopped.
    pub fn set_options(&self, options: sys::ptrace::Options) -> Result<(), Error> {
        for pid in self.tracees.keys() {
            sys::ptrace::setoptions(*pid, options).map_err(Ptrace)?;
        }
        Ok(())
    }

    /// Detach all threads of a current process and continue tracing of a new one.
    pub fn switch_to(&mut self, child: Pid) {
        debug!(target: "tracer", "follow process {child}, detach from {}", self.proc_pid);
        self.detach();
        self.parked.remove(&child);
        for pid in self.parked.drain() {
            weak_error!(sys::ptrace::detach(pid, None), "detach unclaimed process:");
        }
        self.tracees = HashMap::from([(child, Tracee::new(child))]);
        self.proc_pid = child;
        self.focus = child;
    }

    /// Detach from all threads, pending signals are delivered.
    pub fn detach(&mut self) {
        for (pid, tracee) in self.tracees.drain() {
            weak_error!(
                sys::ptrace::detach(pid, tracee.pending_signal),
                "detach thread:"
            );
        }
    }
}

/// If a thread trapped right after a breakpoint instruction, move pc back onto it.
fn rewind_to_breakpoint(pid: Pid, ctx: TraceContext) -> Result<Option<RelocatedAddress>, Error> {
    let mut regs = RegisterMap::current(pid).map_err(Ptrace)?;
    let pc = RelocatedAddress::from(regs.value(Register::Rip) - 1);
    if !ctx.breakpoints.contains(&pc) {
        return Ok(None);
    }
    regs.update(Register::Rip, pc.as_u64());
    regs.persist(pid).map_err(Ptrace)?;
    Ok(Some(pc))
}

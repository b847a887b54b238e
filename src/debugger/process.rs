use crate::error::Error;
use crate::error::Error::{Attach, Syscall, Waitpid};
use log::debug;
use nix::sys;
use nix::sys::ptrace::Options;
use nix::sys::signal::SIGSTOP;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed;

impl State for Installed {}

/// Process prepared for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// Target process.
pub struct Child<S: State> {
    program: PathBuf,
    args: Vec<String>,
    follow_fork: bool,
    pid: Option<Pid>,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create a process template, process is not started.
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<PathBuf>,
        args: ARGS,
    ) -> Result<Child<Template>, Error> {
        let program = program.into();
        if !program.is_file() {
            return Err(Error::ExecutableNotFound(program));
        }

        Ok(Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            follow_fork: false,
            pid: None,
            _p: PhantomData,
        })
    }

    /// Trace children created by `fork` and `vfork`.
    pub fn follow_fork(&mut self) {
        self.follow_fork = true;
    }

    fn trace_options(&self) -> Options {
        let options = Options::PTRACE_O_TRACECLONE
            .union(Options::PTRACE_O_TRACEEXEC)
            .union(Options::PTRACE_O_TRACEEXIT);
        if self.follow_fork {
            options
                .union(Options::PTRACE_O_TRACEFORK)
                .union(Options::PTRACE_O_TRACEVFORK)
        } else {
            options
        }
    }

    /// Instantiate process by `fork()` system call with caller as a parent process.
    /// After installation the process is stopped by `SIGSTOP` right before `exec`.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        match unsafe { fork() }.map_err(|e| Syscall("fork", e))? {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, self.trace_options()).map_err(Attach)?;
                debug!(target: "tracer", "process {pid} installed, program: {:?}", self.program);

                Ok(Child {
                    program: self.program.clone(),
                    args: self.args.clone(),
                    follow_fork: self.follow_fork,
                    pid: Some(pid),
                    _p: PhantomData,
                })
            }
            ForkResult::Child => {
                if sys::signal::raise(SIGSTOP).is_ok() {
                    let err = cmd.exec();
                    eprintln!("run {:?} fail with: {err}", self.program);
                }
                std::process::exit(127)
            }
        }
    }
}

impl Child<Installed> {
    /// Return pid of running process.
    pub fn pid(&self) -> Pid {
        self.pid.expect("installed process always has a pid")
    }
}

impl<S: State> Child<S> {
    pub fn program(&self) -> &Path {
        self.program.as_path()
    }
}

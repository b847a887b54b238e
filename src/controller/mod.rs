//! Debugger control capability consumed by the injection pipeline.
//!
//! Two implementations exist: a native ptrace controller ([`crate::debugger::Debugger`])
//! and a controller that drives an external gdb through its machine interface
//! ([`gdb::Gdb`]).

pub mod escape;
pub mod gdb;

use crate::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Breakpoint identifier, assigned monotonically starting from 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl Display for BreakpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reason why a target stops after a resume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stop {
    /// Target stopped at breakpoint.
    Breakpoint(BreakpointId),
    /// Target process exited with code.
    Exited(i32),
    /// Target stopped or killed by a signal that is not passed through transparently.
    Signaled(String),
}

/// Argument of a function invoked inside a target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// Integer passed in a general purpose register.
    Int(i64),
    /// C string, bytes are copied into a target memory and NUL terminated.
    Str(Vec<u8>),
    /// Null pointer.
    Null,
}

impl Arg {
    pub fn str(s: impl AsRef<[u8]>) -> Self {
        Arg::Str(s.as_ref().to_vec())
    }
}

/// Value returned from a target function or read from a target variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Void,
}

impl Value {
    /// True if value is a null pointer (or zero integer).
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Int(0))
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Void => f.write_str("void"),
        }
    }
}

/// Control over a single target process.
///
/// All operations are synchronous: a resume returns only when the target stops again.
pub trait Controller {
    /// Load an executable, after this call a target may be started with [`Controller::run`].
    fn attach(&mut self, executable: &Path) -> Result<(), Error>;

    /// Follow a child process instead of a parent on `fork`. Must be called before
    /// a duplication happens.
    fn follow_child_on_fork(&mut self) -> Result<(), Error>;

    /// Set breakpoint at function entry.
    fn set_breakpoint(&mut self, location: &str) -> Result<BreakpointId, Error>;

    /// Remove breakpoint, it never fire again.
    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error>;

    /// Start a target and wait until it stops.
    fn run(&mut self) -> Result<Stop, Error>;

    /// Resume a stopped target and wait until it stops.
    fn continue_until_break(&mut self) -> Result<Stop, Error>;

    /// Call a function inside a stopped target.
    fn invoke(&mut self, symbol: &str, args: &[Arg]) -> Result<Value, Error>;

    /// Read a variable from a stopped target.
    fn read_variable(&mut self, name: &str) -> Result<Value, Error>;
}

impl<C: Controller + ?Sized> Controller for Box<C> {
    fn attach(&mut self, executable: &Path) -> Result<(), Error> {
        (**self).attach(executable)
    }

    fn follow_child_on_fork(&mut self) -> Result<(), Error> {
        (**self).follow_child_on_fork()
    }

    fn set_breakpoint(&mut self, location: &str) -> Result<BreakpointId, Error> {
        (**self).set_breakpoint(location)
    }

    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        (**self).delete_breakpoint(id)
    }

    fn run(&mut self) -> Result<Stop, Error> {
        (**self).run()
    }

    fn continue_until_break(&mut self) -> Result<Stop, Error> {
        (**self).continue_until_break()
    }

    fn invoke(&mut self, symbol: &str, args: &[Arg]) -> Result<Value, Error> {
        (**self).invoke(symbol, args)
    }

    fn read_variable(&mut self, name: &str) -> Result<Value, Error> {
        (**self).read_variable(name)
    }
}

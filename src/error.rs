use crate::controller::escape::EncodingError;
use crate::controller::{BreakpointId, Stop};
use crate::debugger::call::CallError;
use crate::inject::injector::InjectionError;
use std::path::PathBuf;
use std::string::FromUtf8Error;

/// Coarse error classes reported to an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    /// Control over the target could not be gained.
    Attach,
    /// The sandbox skeleton or a bind mount could not be established.
    Environment,
    /// Module loading or entry point invocation failed.
    Injection,
    /// A payload could not be represented for the command channel.
    Encoding,
    /// The controller itself failed (ptrace, gdb protocol, unexpected stops).
    Control,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("session already reached terminal phase")]
    SessionFinished,

    // --------------------------------- attach errors ---------------------------------------------
    #[error("executable {0:?} not found")]
    ExecutableNotFound(PathBuf),
    #[error("attach to a target: {0}")]
    Attach(nix::Error),
    #[error("spawn gdb: {0}")]
    GdbSpawn(std::io::Error),
    #[error("target rejected by controller: {0}")]
    AttachRejected(String),

    // --------------------------------- environment errors ----------------------------------------
    #[error("create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bind mount {source_path} -> {destination} failed with code {code}")]
    Environment {
        source_path: String,
        destination: String,
        code: i64,
    },

    // --------------------------------- injection errors ------------------------------------------
    #[error(transparent)]
    Injection(#[from] InjectionError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("interpreter runtime not found: {0}")]
    InterpreterNotFound(String),

    // --------------------------------- target process errors -------------------------------------
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error("target process exit with code {0}")]
    ProcessExit(i32),
    #[error("target process stopped by signal {0}")]
    ProcessSignaled(String),
    #[error("unexpected stop, expect breakpoint {expected}, got {got:?}")]
    UnexpectedStop { expected: BreakpointId, got: Stop },
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),

    // --------------------------------- native controller errors ----------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error(transparent)]
    Call(#[from] CallError),

    // --------------------------------- gdb controller errors -------------------------------------
    #[error("gdb: {0}")]
    Gdb(String),
    #[error("gdb/mi protocol: {0}")]
    GdbProtocol(String),
}

impl Error {
    /// Return a class of an error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ExecutableNotFound(_) => ErrorKind::Attach,
            Error::Attach(_) => ErrorKind::Attach,
            Error::GdbSpawn(_) => ErrorKind::Attach,
            Error::AttachRejected(_) => ErrorKind::Attach,

            Error::CreateDir { .. } => ErrorKind::Environment,
            Error::Environment { .. } => ErrorKind::Environment,

            Error::Injection(_) => ErrorKind::Injection,
            Error::InterpreterNotFound(_) => ErrorKind::Injection,

            Error::Encoding(_) => ErrorKind::Encoding,

            Error::IO(_) => ErrorKind::Control,
            Error::FromUtf8(_) => ErrorKind::Control,
            Error::Config(_) => ErrorKind::Control,
            Error::SessionFinished => ErrorKind::Control,
            Error::ProcessNotStarted => ErrorKind::Control,
            Error::ProcessExit(_) => ErrorKind::Control,
            Error::ProcessSignaled(_) => ErrorKind::Control,
            Error::UnexpectedStop { .. } => ErrorKind::Control,
            Error::BreakpointNotFound(_) => ErrorKind::Control,
            Error::SymbolNotFound(_) => ErrorKind::Control,
            Error::Waitpid(_) => ErrorKind::Control,
            Error::Ptrace(_) => ErrorKind::Control,
            Error::Syscall(_, _) => ErrorKind::Control,
            Error::ObjParsing(_) => ErrorKind::Control,
            Error::Call(_) => ErrorKind::Control,
            Error::Gdb(_) => ErrorKind::Control,
            Error::GdbProtocol(_) => ErrorKind::Control,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

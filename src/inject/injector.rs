use crate::config::PayloadConfig;
use crate::controller::{Arg, Controller, Value};
use crate::error::Error;
use crate::inject::payload::{bootstrap_script, Payload, PayloadKind, LOAD_FLAGS};
use log::{info, warn};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum InjectionError {
    #[error("`{symbol}` return null handle for {path:?}")]
    LoadFailed { symbol: String, path: PathBuf },
    #[error("payload entry `{0}` not found in a target")]
    EntryNotFound(String),
    #[error("runner `{runner}` fail with code {code}")]
    ScriptFailed { runner: String, code: i64 },
}

/// Outcome of payload execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionReport {
    pub kind: PayloadKind,
    /// Value returned by an entry point or a script runner.
    pub result: Value,
    /// Target error word read right after an entry point returns (native modules only).
    pub last_error: Option<Value>,
}

/// Loads code into a stopped target and starts a payload.
pub struct PayloadInjector<'a> {
    cfg: &'a PayloadConfig,
}

impl<'a> PayloadInjector<'a> {
    pub fn new(cfg: &'a PayloadConfig) -> Self {
        Self { cfg }
    }

    fn dlopen(&self, ctl: &mut impl Controller, path: PathBuf) -> Result<Value, Error> {
        let handle = ctl.invoke(
            &self.cfg.load_symbol,
            &[Arg::str(path.as_os_str().as_bytes()), Arg::Int(LOAD_FLAGS)],
        )?;
        if handle.is_null() {
            return Err(InjectionError::LoadFailed {
                symbol: self.cfg.load_symbol.clone(),
                path,
            }
            .into());
        }
        info!(target: "sequencer", "{path:?} loaded, handle {handle}");
        Ok(handle)
    }

    /// Load a payload module or an interpreter runtime into a target.
    pub fn load(&self, ctl: &mut impl Controller) -> Result<Value, Error> {
        match self.cfg.kind {
            PayloadKind::NativeModule => self.dlopen(ctl, self.cfg.payload_path()),
            PayloadKind::InterpreterScript => {
                let handle = self.dlopen(ctl, self.cfg.interpreter_library()?)?;
                ctl.invoke(&self.cfg.initializer, &[])?;
                info!(target: "sequencer", "interpreter initialized");
                Ok(handle)
            }
        }
    }

    /// Start a payload, a target must already contain loaded code.
    pub fn execute(&self, ctl: &mut impl Controller) -> Result<InjectionReport, Error> {
        match self.cfg.kind {
            PayloadKind::NativeModule => self.execute_native(ctl),
            PayloadKind::InterpreterScript => self.execute_script(ctl),
        }
    }

    fn execute_native(&self, ctl: &mut impl Controller) -> Result<InjectionReport, Error> {
        let entry = &self.cfg.entry_symbol;
        let result = ctl
            .invoke(entry, &[Arg::Int(self.cfg.entry_arg)])
            .map_err(|e| match e {
                Error::SymbolNotFound(_) => Error::from(InjectionError::EntryNotFound(entry.clone())),
                e => e,
            })?;
        info!(target: "sequencer", "`{entry}({})` return {result}", self.cfg.entry_arg);

        let last_error = ctl.read_variable(&self.cfg.error_variable)?;
        if last_error != Value::Int(0) {
            warn!(target: "sequencer", "{} after payload: {last_error}", self.cfg.error_variable);
        }

        Ok(InjectionReport {
            kind: PayloadKind::NativeModule,
            result,
            last_error: Some(last_error),
        })
    }

    fn execute_script(&self, ctl: &mut impl Controller) -> Result<InjectionReport, Error> {
        let payload = Payload::read(PayloadKind::InterpreterScript, &self.cfg.payload_path())?;
        let script = bootstrap_script(&payload.bytes);

        let result = ctl.invoke(&self.cfg.runner, &[Arg::str(script)])?;
        if let Value::Int(code) = result {
            // PyRun_SimpleString returns int, high half of rax is garbage
            let code = code as i32 as i64;
            if code != 0 {
                return Err(InjectionError::ScriptFailed {
                    runner: self.cfg.runner.clone(),
                    code,
                }
                .into());
            }
        }
        info!(target: "sequencer", "script {:?} executed", payload.path);

        Ok(InjectionReport {
            kind: PayloadKind::InterpreterScript,
            result,
            last_error: None,
        })
    }
}

//! Controller that drives an external gdb through the machine interface (GDB/MI).
//!
//! gdb has no way to pass structured arguments into an inferior call, so every
//! string argument goes through [`escape`](crate::controller::escape).

pub mod mi;

use crate::controller::escape::{c_string_literal, mi_c_string};
use crate::controller::gdb::mi::{AsyncKind, Record, ResultClass, StreamKind, Tuple};
use crate::controller::{Arg, BreakpointId, Controller, Stop, Value};
use crate::error::Error;
use crate::weak_error;
use log::{debug, info};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// gdb subprocess in MI mode.
pub struct Gdb {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    token: u64,
    started: bool,
    /// Breakpoints inserted and not deleted yet.
    breakpoints: Vec<BreakpointId>,
}

impl Gdb {
    /// Find gdb in `PATH` and start it.
    pub fn spawn() -> Result<Self, Error> {
        let path = which::which("gdb")
            .map_err(|e| Error::GdbSpawn(std::io::Error::new(ErrorKind::NotFound, e)))?;
        Self::spawn_with(path)
    }

    /// Start gdb from a given path.
    pub fn spawn_with(gdb: impl AsRef<Path>) -> Result<Self, Error> {
        let mut process = Command::new(gdb.as_ref())
            .args(["--interpreter=mi2", "--quiet", "--nx"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(Error::GdbSpawn)?;

        let stdin = process.stdin.take().ok_or_else(|| {
            Error::GdbSpawn(std::io::Error::new(ErrorKind::BrokenPipe, "no stdin"))
        })?;
        let stdout = process.stdout.take().ok_or_else(|| {
            Error::GdbSpawn(std::io::Error::new(ErrorKind::BrokenPipe, "no stdout"))
        })?;

        let mut gdb = Self {
            process,
            stdin,
            stdout: BufReader::new(stdout),
            token: 0,
            started: false,
            breakpoints: vec![],
        };

        // skip greeting until first prompt
        while gdb.next_record()? != Record::Prompt {}

        gdb.command("-gdb-set confirm off")?;
        gdb.command("-gdb-set breakpoint pending on")?;
        gdb.command("-gdb-set auto-solib-add on")?;

        Ok(gdb)
    }

    fn next_record(&mut self) -> Result<Record, Error> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(Error::GdbProtocol("gdb exit unexpectedly".to_string()));
        }

        let record = match mi::parse_line(&line) {
            Ok(record) => record,
            Err(e) => {
                debug!(target: "gdb", "{e}, treat as an inferior output");
                Record::Raw(line.trim_end().to_string())
            }
        };

        match &record {
            Record::Stream { kind, text } => match kind {
                StreamKind::Target => print!("{text}"),
                StreamKind::Console | StreamKind::Log => {
                    debug!(target: "gdb", "{}", text.trim_end())
                }
            },
            Record::Raw(line) => println!("{line}"),
            Record::Async { class, .. } => debug!(target: "gdb", "async record: {class}"),
            _ => {}
        }

        Ok(record)
    }

    /// Send a command and wait for its result record.
    fn command(&mut self, cmd: &str) -> Result<Tuple, Error> {
        self.token += 1;
        let token = self.token;
        debug!(target: "gdb", "<- {token}{cmd}");
        writeln!(self.stdin, "{token}{cmd}")?;
        self.stdin.flush()?;

        loop {
            if let Record::Result {
                token: Some(t),
                class,
                results,
            } = self.next_record()?
            {
                if t != token {
                    continue;
                }
                debug!(target: "gdb", "-> {token}^{class}");
                return match class {
                    ResultClass::Error => {
                        let msg = results.str("msg").unwrap_or("unknown error").to_string();
                        Err(Error::Gdb(msg))
                    }
                    ResultClass::Exit => Err(Error::GdbProtocol("gdb exit".to_string())),
                    _ => Ok(results),
                };
            }
        }
    }

    /// Wait for `*stopped` record and convert it into a [`Stop`].
    fn wait_stopped(&mut self) -> Result<Stop, Error> {
        loop {
            let Record::Async {
                kind: AsyncKind::Exec,
                class,
                results,
                ..
            } = self.next_record()?
            else {
                continue;
            };
            if class != "stopped" {
                continue;
            }

            let stop = match results.str("reason") {
                Some("breakpoint-hit") => {
                    let no = results
                        .str("bkptno")
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| Error::GdbProtocol("breakpoint number".to_string()))?;
                    Stop::Breakpoint(BreakpointId(no))
                }
                Some("exited-normally") => Stop::Exited(0),
                Some("exited") => {
                    // gdb reports exit code in octal
                    let code = results
                        .str("exit-code")
                        .and_then(|c| i32::from_str_radix(c, 8).ok())
                        .unwrap_or(-1);
                    Stop::Exited(code)
                }
                Some("signal-received" | "exited-signalled") => Stop::Signaled(
                    results.str("signal-name").unwrap_or("unknown").to_string(),
                ),
                other => {
                    debug!(target: "gdb", "ignore stop with reason {other:?}");
                    continue;
                }
            };
            info!(target: "gdb", "target stopped: {stop:?}");
            return Ok(stop);
        }
    }

    fn evaluate(&mut self, expr: &str) -> Result<Value, Error> {
        let results = self.command(&format!("-data-evaluate-expression {}", mi_c_string(expr)))?;
        let value = results
            .str("value")
            .ok_or_else(|| Error::GdbProtocol("evaluation without value".to_string()))?;
        parse_value(value)
    }

    /// Run a closure with all breakpoints disabled, so an inferior call never stops inside.
    fn with_disabled_brkpts<F, T>(&mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        let active = self.breakpoints.clone();
        if let Some(cmd) = breakpoint_list_command("-break-disable", &active) {
            self.command(&cmd)?;
        }

        let result = f(self);

        if let Some(cmd) = breakpoint_list_command("-break-enable", &active) {
            weak_error!(self.command(&cmd), "enable breakpoints after call:");
        }
        result
    }
}

/// Render a breakpoint command over a list of breakpoints, `None` for an empty list.
fn breakpoint_list_command(cmd: &str, ids: &[BreakpointId]) -> Option<String> {
    if ids.is_empty() {
        return None;
    }
    let ids: Vec<String> = ids.iter().map(|id| id.0.to_string()).collect();
    Some(format!("{cmd} {}", ids.join(" ")))
}

/// Render a function call expression, strings rendered as C literals.
pub fn call_expression(symbol: &str, args: &[Arg]) -> Result<String, Error> {
    let args = args
        .iter()
        .map(|arg| match arg {
            Arg::Int(v) => Ok(v.to_string()),
            Arg::Null => Ok("0".to_string()),
            Arg::Str(bytes) => c_string_literal(bytes).map_err(Error::from),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("(long) {symbol}({})", args.join(", ")))
}

/// Parse value printed by gdb, like `0`, `-1`, `(void *) 0x7ffff7fc1000` or `void`.
pub fn parse_value(printed: &str) -> Result<Value, Error> {
    let last = printed.split_whitespace().last().unwrap_or_default();
    if last == "void" {
        return Ok(Value::Void);
    }

    let value = if let Some(hex) = last.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).map(|v| v as i64).ok()
    } else {
        last.parse::<i64>().ok()
    };

    value
        .map(Value::Int)
        .ok_or_else(|| Error::GdbProtocol(format!("unrecognized value `{printed}`")))
}

fn map_symbol_error(symbol: &str, err: Error) -> Error {
    match err {
        Error::Gdb(msg) if msg.starts_with("No symbol") => Error::SymbolNotFound(symbol.to_string()),
        err => err,
    }
}

impl Controller for Gdb {
    fn attach(&mut self, executable: &Path) -> Result<(), Error> {
        let path = executable.to_string_lossy();
        self.command(&format!("-file-exec-and-symbols {}", mi_c_string(&path)))
            .map_err(|e| match e {
                Error::Gdb(msg) => Error::AttachRejected(msg),
                e => e,
            })?;
        Ok(())
    }

    fn follow_child_on_fork(&mut self) -> Result<(), Error> {
        self.command("-gdb-set follow-fork-mode child")?;
        self.command("-gdb-set detach-on-fork on")?;
        Ok(())
    }

    fn set_breakpoint(&mut self, location: &str) -> Result<BreakpointId, Error> {
        let results = self.command(&format!("-break-insert -f {}", mi_c_string(location)))?;
        let number = results
            .get("bkpt")
            .and_then(|b| b.as_tuple())
            .and_then(|b| b.str("number"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::GdbProtocol("breakpoint without number".to_string()))?;
        let id = BreakpointId(number);
        self.breakpoints.push(id);
        Ok(id)
    }

    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.command(&format!("-break-delete {}", id.0))
            .map_err(|_| Error::BreakpointNotFound(id))?;
        self.breakpoints.retain(|b| *b != id);
        Ok(())
    }

    fn run(&mut self) -> Result<Stop, Error> {
        self.command("-exec-run")?;
        self.started = true;
        self.wait_stopped()
    }

    fn continue_until_break(&mut self) -> Result<Stop, Error> {
        if !self.started {
            return Err(Error::ProcessNotStarted);
        }
        self.command("-exec-continue")?;
        self.wait_stopped()
    }

    fn invoke(&mut self, symbol: &str, args: &[Arg]) -> Result<Value, Error> {
        let expr = call_expression(symbol, args)?;
        self.with_disabled_brkpts(|gdb| gdb.evaluate(&expr))
            .map_err(|e| map_symbol_error(symbol, e))
    }

    fn read_variable(&mut self, name: &str) -> Result<Value, Error> {
        // `errno` is a macro over a function call in glibc
        self.with_disabled_brkpts(|gdb| gdb.evaluate(name))
            .map_err(|e| map_symbol_error(name, e))
    }
}

impl Drop for Gdb {
    fn drop(&mut self) {
        if self.started {
            // leave the target running
            weak_error!(self.command("-target-detach"), "detach from target:");
        }
        _ = writeln!(self.stdin, "-gdb-exit");
        _ = self.stdin.flush();
        weak_error!(self.process.wait(), "wait gdb exit:");
    }
}

//! spi - drives a sandpit broker through its startup and injects a payload into the sandboxed child.

use anyhow::Context;
use clap::Parser;
use sandpit_inject::config::InjectConfig;
use sandpit_inject::controller::gdb::Gdb;
use sandpit_inject::controller::Controller;
use sandpit_inject::debugger::Debugger;
use sandpit_inject::inject::payload::PayloadKind;
use sandpit_inject::inject::repair::HostFs;
use sandpit_inject::inject::sequencer::{Phase, PhaseHook, PhaseSequencer};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
enum Backend {
    /// Built-in ptrace controller.
    Native,
    /// External gdb driven through its machine interface.
    Gdb,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker executable [default: target/release/sandpit]
    executable: Option<PathBuf>,

    /// Payload kind: native-module | interpreter-script
    #[arg(short, long)]
    kind: Option<PayloadKind>,

    /// Payload path [default: /tmp/payload.so or /tmp/payload.py]
    #[arg(short, long)]
    payload: Option<PathBuf>,

    /// Debugger backend: native | gdb
    #[arg(short, long, default_value_t = Backend::Native)]
    backend: Backend,

    /// Configuration file [default: ~/.config/spi/config.toml if exists]
    #[arg(short, long, env = "SPI_CONFIG")]
    config: Option<PathBuf>,
}

/// Print session progress for an operator.
struct Progress;

impl PhaseHook for Progress {
    fn on_phase(&self, phase: Phase) {
        println!("[{phase}]");
    }

    fn on_hit(&self, phase: Phase, location: &str, hit: u32) {
        println!(
            "  `{location}` hit {hit}/{} (waiting for {phase})",
            phase.expected_hits()
        );
    }
}

fn session(args: Args) -> anyhow::Result<()> {
    let mut cfg = InjectConfig::load(args.config.as_deref()).context("load configuration")?;
    if let Some(executable) = args.executable {
        cfg.executable = executable;
    }
    if let Some(kind) = args.kind {
        cfg.payload.kind = kind;
    }
    if let Some(payload) = args.payload {
        cfg.payload.path = Some(payload);
    }

    let ctl: Box<dyn Controller> = match args.backend {
        Backend::Native => Box::new(Debugger::new()),
        Backend::Gdb => Box::new(Gdb::spawn().context("start gdb")?),
    };
    println!(
        "inject {} {:?} into {:?} ({} backend)",
        cfg.payload.kind,
        cfg.payload.payload_path(),
        cfg.executable,
        args.backend
    );

    let mut sequencer = PhaseSequencer::with_hook(ctl, HostFs, &cfg, Progress);
    let report = sequencer.run().with_context(|| match sequencer.phase() {
        Some(phase) => format!("session halted after {phase}"),
        None => "session halted before attach".to_string(),
    })?;

    if let Some(injection) = report.injection {
        println!("payload returned {}", injection.result);
    }
    if let Some(errno) = report.final_error {
        println!("{} = {errno}", cfg.payload.error_variable);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match session(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

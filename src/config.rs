//! Session configuration.
//!
//! All fields have defaults matching a release build of sandpit started from its
//! repository root. A TOML file may override any of them.

use crate::error::Error;
use crate::inject::payload::PayloadKind;
use crate::muted_error;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Host directory bind mounted into the sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path.
    pub source: String,
    /// Path relative to the sandbox root (target working directory at mount phase).
    pub destination: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

impl MountSpec {
    pub fn new(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            recursive: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Symbols a session breaks on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Breakpoints {
    pub entry: String,
    pub mount: String,
    pub privilege: String,
    pub ipc: String,
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self {
            entry: "main".to_string(),
            mount: "mount".to_string(),
            privilege: "prctl".to_string(),
            ipc: "write".to_string(),
        }
    }
}

/// Payload and symbols used to load and start it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub kind: PayloadKind,
    /// Payload file, if missing a default for [`PayloadConfig::kind`] is used.
    pub path: Option<PathBuf>,
    /// Shared object of a python runtime, discovered with `python3` if missing.
    pub interpreter_library: Option<PathBuf>,
    pub load_symbol: String,
    pub initializer: String,
    pub runner: String,
    pub entry_symbol: String,
    pub entry_arg: i64,
    pub error_variable: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            kind: PayloadKind::NativeModule,
            path: None,
            interpreter_library: None,
            load_symbol: "dlopen".to_string(),
            initializer: "Py_Initialize".to_string(),
            runner: "PyRun_SimpleString".to_string(),
            entry_symbol: "payload".to_string(),
            entry_arg: 4,
            error_variable: "errno".to_string(),
        }
    }
}

impl PayloadConfig {
    /// Payload file path.
    pub fn payload_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.kind.default_path()))
    }

    /// Interpreter runtime path, configured or discovered.
    pub fn interpreter_library(&self) -> Result<PathBuf, Error> {
        match self.interpreter_library {
            Some(ref path) => Ok(path.clone()),
            None => discover_interpreter_library(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    /// Broker executable.
    pub executable: PathBuf,
    /// Sandbox root on the host.
    pub skeleton_root: PathBuf,
    /// Directories created under [`InjectConfig::skeleton_root`].
    pub skeleton_dirs: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub breakpoints: Breakpoints,
    pub payload: PayloadConfig,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("target/release/sandpit"),
            skeleton_root: PathBuf::from("/tmp/sandpit.sandbox"),
            skeleton_dirs: ["bin", "dev", "lib", "lib64", "sbin", "tmp", "usr", "var"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            mounts: vec![
                MountSpec::new("/bin", "bin"),
                MountSpec::new("/dev/", "dev"),
                MountSpec::new("/lib/", "lib"),
                MountSpec::new("/lib64/", "lib64"),
                MountSpec::new("/sbin", "sbin"),
                MountSpec::new("/usr", "usr"),
            ],
            breakpoints: Breakpoints::default(),
            payload: PayloadConfig::default(),
        }
    }
}

impl InjectConfig {
    const DEFAULT_PATH: &'static str = ".config/spi/config.toml";

    /// Parse configuration from TOML text, missing fields take defaults.
    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Load configuration from file.
    ///
    /// If path is [`None`] a file in a home directory is used when it exists,
    /// otherwise defaults are returned. An explicitly given file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let data = match path {
            Some(path) => read_to_string(path)?,
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Self::default());
                };
                let path = home.join(Self::DEFAULT_PATH);
                match muted_error!(read_to_string(&path), "default config not loaded:") {
                    Some(data) => {
                        info!(target: "sequencer", "use config {path:?}");
                        data
                    }
                    None => return Ok(Self::default()),
                }
            }
        };
        Self::parse(&data)
    }
}

/// Ask python where its shared runtime lives.
pub fn discover_interpreter_library() -> Result<PathBuf, Error> {
    let python = which::which("python3")
        .map_err(|e| Error::InterpreterNotFound(format!("python3: {e}")))?;
    let output = Command::new(python)
        .args([
            "-c",
            "import sysconfig; print(sysconfig.get_config_var('LIBDIR')); print(sysconfig.get_config_var('INSTSONAME'))",
        ])
        .output()?;
    let output = String::from_utf8(output.stdout)?;
    let library = parse_sysconfig_output(&output)
        .ok_or_else(|| Error::InterpreterNotFound(format!("unrecognized sysconfig output: {output:?}")))?;
    debug!(target: "sequencer", "python runtime discovered at {library:?}");
    Ok(library)
}

fn parse_sysconfig_output(output: &str) -> Option<PathBuf> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let libdir = lines.next()?;
    let soname = lines.next()?;
    if libdir == "None" || soname == "None" {
        return None;
    }
    Some(Path::new(libdir).join(soname))
}

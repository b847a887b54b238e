use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use nix::libc;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Flags for a `dlopen` call, a library must stay loaded after its handle is lost.
pub const LOAD_FLAGS: i64 = (libc::RTLD_NOW | libc::RTLD_GLOBAL | libc::RTLD_NODELETE) as i64;

/// Flags for a bind mount issued inside a target.
pub fn mount_flags(recursive: bool) -> i64 {
    let flags = if recursive {
        MsFlags::MS_BIND | MsFlags::MS_REC
    } else {
        MsFlags::MS_BIND
    };
    flags.bits() as i64
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PayloadKind {
    /// Shared object with an entry function.
    #[default]
    NativeModule,
    /// Python source executed by an embedded interpreter.
    InterpreterScript,
}

impl PayloadKind {
    pub fn default_path(&self) -> &'static str {
        match self {
            PayloadKind::NativeModule => "/tmp/payload.so",
            PayloadKind::InterpreterScript => "/tmp/payload.py",
        }
    }
}

/// Operator supplied code.
#[derive(Debug)]
pub struct Payload {
    pub kind: PayloadKind,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Read payload file as is.
    pub fn read(kind: PayloadKind, path: &Path) -> Result<Self, Error> {
        let bytes = fs::read(path)?;
        debug!(target: "sequencer", "payload {path:?} read, {} bytes", bytes.len());
        Ok(Self {
            kind,
            path: path.to_path_buf(),
            bytes,
        })
    }
}

/// Build a single line python program that decodes and runs a script.
///
/// The script is carried in base64 only, so its own separators and quotes never
/// reach the interpreter's parser outside of the decoded unit.
pub fn bootstrap_script(script: &[u8]) -> String {
    let encoded = STANDARD.encode(script);
    [
        "import code".to_string(),
        "import base64".to_string(),
        format!("cmd = base64.b64decode(\"{encoded}\")"),
        "code.InteractiveInterpreter().runcode(cmd)".to_string(),
    ]
    .join(";")
}

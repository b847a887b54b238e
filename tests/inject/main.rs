mod common;

mod injector;
mod sequencer;

use sandpit_inject::config::InjectConfig;
use sandpit_inject::inject::payload::PayloadKind;
use std::path::PathBuf;

/// Configuration used across session tests, no discovery on a host is needed.
fn test_config(kind: PayloadKind, payload: Option<PathBuf>) -> InjectConfig {
    let mut cfg = InjectConfig::default();
    cfg.payload.kind = kind;
    cfg.payload.path = payload;
    cfg.payload.interpreter_library = Some(PathBuf::from("/usr/lib/libpython3.so"));
    cfg
}

use crate::config::{InjectConfig, MountSpec};
use crate::controller::{Arg, Controller, Value};
use crate::error::Error;
use crate::inject::payload::mount_flags;
use log::{debug, info};
use std::path::Path;

/// Host filesystem operations used to prepare a sandbox skeleton.
pub trait Filesystem {
    /// Create a directory with all missing parents, an existing directory is not an error.
    fn create_dir(&mut self, path: &Path) -> Result<(), Error>;
}

/// Real host filesystem.
#[derive(Default, Clone, Copy, Debug)]
pub struct HostFs;

impl Filesystem for HostFs {
    fn create_dir(&mut self, path: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(path).map_err(|source| Error::CreateDir {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Create sandbox directories, all of them exist on success.
pub fn create_skeleton(
    fs: &mut impl Filesystem,
    root: &Path,
    dirs: &[String],
) -> Result<(), Error> {
    for dir in dirs {
        let path = root.join(dir);
        debug!(target: "sequencer", "create {path:?}");
        fs.create_dir(&path)?;
    }
    Ok(())
}

/// Issue bind mounts from a stopped target, return number of mounts done.
///
/// Destinations are resolved by the target relative to its working directory.
pub fn bind_mounts(
    ctl: &mut impl Controller,
    mount_symbol: &str,
    mounts: &[MountSpec],
) -> Result<usize, Error> {
    for spec in mounts {
        let args = [
            Arg::str(&spec.source),
            Arg::str(&spec.destination),
            Arg::Null,
            Arg::Int(mount_flags(spec.recursive)),
            Arg::Null,
        ];
        let result = ctl.invoke(mount_symbol, &args)?;
        let code = match result {
            // mount returns int, only low half of a register is meaningful
            Value::Int(code) => code as i32 as i64,
            Value::Void => 0,
        };
        if code != 0 {
            return Err(Error::Environment {
                source_path: spec.source.clone(),
                destination: spec.destination.clone(),
                code,
            });
        }
        info!(target: "sequencer", "bind mount {} -> {}", spec.source, spec.destination);
    }
    Ok(mounts.len())
}

/// Make host binaries and libraries visible inside a sandbox.
pub fn repair(
    ctl: &mut impl Controller,
    fs: &mut impl Filesystem,
    cfg: &InjectConfig,
) -> Result<usize, Error> {
    create_skeleton(fs, &cfg.skeleton_root, &cfg.skeleton_dirs)?;
    bind_mounts(ctl, &cfg.breakpoints.mount, &cfg.mounts)
}

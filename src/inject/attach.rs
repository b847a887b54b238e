use crate::controller::{BreakpointId, Controller};
use crate::error::Error;
use crate::inject::expect_breakpoint;
use log::info;
use std::path::Path;

/// Load a broker executable into a controller.
pub fn attach(ctl: &mut impl Controller, executable: &Path) -> Result<(), Error> {
    ctl.attach(executable)?;
    info!(target: "sequencer", "attached to {executable:?}");
    Ok(())
}

/// Make a controller stay with a child after a broker duplicates itself.
pub fn follow_child_on_fork(ctl: &mut impl Controller) -> Result<(), Error> {
    ctl.follow_child_on_fork()
}

/// Start a target and stop it at the entry point.
///
/// Return the entry breakpoint, it stays registered.
pub fn run_to_entry(ctl: &mut impl Controller, entry_symbol: &str) -> Result<BreakpointId, Error> {
    let entry = ctl.set_breakpoint(entry_symbol)?;
    let stop = ctl.run()?;
    expect_breakpoint(stop, entry)?;
    info!(target: "sequencer", "target stopped at `{entry_symbol}`");
    Ok(entry)
}

/// Take control over a broker, return with a target stopped at its entry.
pub fn establish(
    ctl: &mut impl Controller,
    executable: &Path,
    entry_symbol: &str,
) -> Result<BreakpointId, Error> {
    attach(ctl, executable)?;
    follow_child_on_fork(ctl)?;
    run_to_entry(ctl, entry_symbol)
}

//! Injection pipeline: attach, phase sequencing, sandbox repair and payload execution.

pub mod attach;
pub mod injector;
pub mod payload;
pub mod repair;
pub mod sequencer;

use crate::controller::{BreakpointId, Stop};
use crate::error::Error;

/// Check that a target stops at a given breakpoint, any other stop is an error.
pub fn expect_breakpoint(stop: Stop, expected: BreakpointId) -> Result<(), Error> {
    match stop {
        Stop::Breakpoint(id) if id == expected => Ok(()),
        Stop::Exited(code) => Err(Error::ProcessExit(code)),
        Stop::Signaled(signal) => Err(Error::ProcessSignaled(signal)),
        got => Err(Error::UnexpectedStop { expected, got }),
    }
}

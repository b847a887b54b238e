use crate::controller::BreakpointId;
use crate::debugger::address::RelocatedAddress;
use crate::error::Error;
use crate::error::Error::Ptrace;
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::cell::Cell;

const INT3: u64 = 0xCC;

/// Software breakpoint at a function entry.
///
/// Breakpoint with unknown address is pending, it armed when a symbol appears in
/// the target address space.
#[derive(Debug)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub location: String,
    addr: Cell<Option<RelocatedAddress>>,
    saved_data: Cell<u8>,
    enabled: Cell<bool>,
}

impl Breakpoint {
    fn new(id: BreakpointId, location: &str) -> Self {
        Self {
            id,
            location: location.to_string(),
            addr: Cell::default(),
            saved_data: Cell::default(),
            enabled: Cell::default(),
        }
    }

    pub fn addr(&self) -> Option<RelocatedAddress> {
        self.addr.get()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn is_pending(&self) -> bool {
        self.addr.get().is_none()
    }

    /// Set breakpoint address and write `int3` into target memory.
    pub fn arm(&self, pid: Pid, addr: RelocatedAddress) -> Result<(), Error> {
        self.addr.set(Some(addr));
        self.enable(pid)
    }

    /// Forget an address, target memory is not touched (used when an old image is gone after `exec`).
    pub fn reset(&self) {
        self.addr.set(None);
        self.enabled.set(false);
    }

    pub fn enable(&self, pid: Pid) -> Result<(), Error> {
        let Some(addr) = self.addr.get() else {
            return Ok(());
        };
        if self.enabled.get() {
            return Ok(());
        }

        let ptr = addr.as_usize() as *mut c_void;
        let data = sys::ptrace::read(pid, ptr).map_err(Ptrace)? as u64;
        self.saved_data.set((data & 0xff) as u8);
        let data_with_bp = (data & !0xff) | INT3;
        unsafe {
            sys::ptrace::write(pid, ptr, data_with_bp as *mut c_void).map_err(Ptrace)?;
        }
        self.enabled.set(true);
        Ok(())
    }

    pub fn disable(&self, pid: Pid) -> Result<(), Error> {
        let Some(addr) = self.addr.get() else {
            return Ok(());
        };
        if !self.enabled.get() {
            return Ok(());
        }

        self.restore(pid, addr)?;
        self.enabled.set(false);
        Ok(())
    }

    /// Restore original byte in memory of `pid` without changing breakpoint state.
    /// Used for a memory copy that leaves the session (a parent after `fork`).
    pub fn restore_in(&self, pid: Pid) -> Result<(), Error> {
        match self.addr.get() {
            Some(addr) if self.enabled.get() => self.restore(pid, addr),
            _ => Ok(()),
        }
    }

    fn restore(&self, pid: Pid, addr: RelocatedAddress) -> Result<(), Error> {
        let ptr = addr.as_usize() as *mut c_void;
        let data = sys::ptrace::read(pid, ptr).map_err(Ptrace)? as u64;
        let restored = (data & !0xff) | self.saved_data.get() as u64;
        unsafe {
            sys::ptrace::write(pid, ptr, restored as *mut c_void).map_err(Ptrace)?;
        }
        Ok(())
    }
}

/// Set of breakpoints with monotonically assigned identifiers.
#[derive(Default)]
pub struct BreakpointRegistry {
    last_id: u32,
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointRegistry {
    pub fn add(&mut self, location: &str) -> &Breakpoint {
        self.last_id += 1;
        let brkpt = Breakpoint::new(BreakpointId(self.last_id), location);
        self.breakpoints.push(brkpt);
        &self.breakpoints[self.breakpoints.len() - 1]
    }

    pub fn remove(&mut self, id: BreakpointId) -> Result<Breakpoint, Error> {
        let idx = self
            .breakpoints
            .iter()
            .position(|b| b.id == id)
            .ok_or(Error::BreakpointNotFound(id))?;
        Ok(self.breakpoints.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter().filter(|b| b.is_pending())
    }

    pub fn active(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter().filter(|b| b.is_enabled())
    }

    pub fn find_by_addr(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.active().find(|b| b.addr() == Some(addr))
    }

    /// Addresses of all enabled breakpoints.
    pub fn addresses(&self) -> Vec<RelocatedAddress> {
        self.active().filter_map(Breakpoint::addr).collect()
    }
}

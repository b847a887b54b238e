use std::fmt::{Display, Formatter};

/// Address in a running target.
/// Relocated address is a [`GlobalAddress`] plus a load bias of the object it belongs to.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct RelocatedAddress(usize);

impl RelocatedAddress {
    pub fn offset(self, offset: usize) -> RelocatedAddress {
        RelocatedAddress(self.0 + offset)
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr as usize)
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#016X}", self.0)
    }
}

/// Address from an object file symbol table, unique per object file but not per process.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default)]
pub struct GlobalAddress(usize);

impl GlobalAddress {
    pub fn relocate(self, bias: usize) -> RelocatedAddress {
        RelocatedAddress(self.0 + bias)
    }
}

impl From<u64> for GlobalAddress {
    fn from(addr: u64) -> Self {
        GlobalAddress(addr as usize)
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#016X}", self.0)
    }
}

/// Round `len` up to a whole number of pages.
pub fn page_align_up(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size).max(1) * page_size
}

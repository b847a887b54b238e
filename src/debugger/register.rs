use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    OrigRax,
}

/// Integer argument registers according to System V AMD64 ABI.
pub const ARGUMENT_REGISTERS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
];

/// Snapshot of thread general purpose registers.
#[derive(Clone, Copy)]
pub struct RegisterMap(user_regs_struct);

impl From<user_regs_struct> for RegisterMap {
    fn from(value: user_regs_struct) -> Self {
        Self(value)
    }
}

impl From<RegisterMap> for user_regs_struct {
    fn from(map: RegisterMap) -> user_regs_struct {
        map.0
    }
}

impl RegisterMap {
    pub fn current(pid: Pid) -> nix::Result<Self> {
        sys::ptrace::getregs(pid).map(Into::into)
    }

    fn slot(&mut self, register: Register) -> &mut u64 {
        let regs = &mut self.0;
        match register {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rdi => &mut regs.rdi,
            Register::Rsi => &mut regs.rsi,
            Register::Rbp => &mut regs.rbp,
            Register::Rsp => &mut regs.rsp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.eflags,
            Register::OrigRax => &mut regs.orig_rax,
        }
    }

    pub fn value(&self, register: Register) -> u64 {
        let mut copy = *self;
        *copy.slot(register)
    }

    pub fn update(&mut self, register: Register, value: u64) {
        *self.slot(register) = value;
    }

    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.into())
    }
}

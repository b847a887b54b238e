use crate::config::InjectConfig;
use crate::controller::{BreakpointId, Controller, Value};
use crate::error::Error;
use crate::inject::injector::{InjectionReport, PayloadInjector};
use crate::inject::repair::{repair, Filesystem};
use crate::inject::{attach, expect_breakpoint};
use log::{debug, info};

/// Stage of a target startup, phases are entered in declaration order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum Phase {
    Attached,
    ChildEntered,
    LibraryLoaded,
    MountsEstablished,
    PrivilegeDropped,
    FirstIpcObserved,
    Injected,
    Terminal,
}

impl Phase {
    /// How many times a breakpoint fires before the phase is entered.
    pub fn expected_hits(self) -> u32 {
        match self {
            // broker entry, then a re-executed child entry
            Phase::ChildEntered => 2,
            // root, self remount and proc filesystem
            Phase::MountsEstablished => 3,
            Phase::PrivilegeDropped => 2,
            Phase::FirstIpcObserved => 1,
            Phase::Attached
            | Phase::LibraryLoaded
            | Phase::Injected
            | Phase::Terminal => 0,
        }
    }

    /// Phase entered after this one.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Attached => Some(Phase::ChildEntered),
            Phase::ChildEntered => Some(Phase::LibraryLoaded),
            Phase::LibraryLoaded => Some(Phase::MountsEstablished),
            Phase::MountsEstablished => Some(Phase::PrivilegeDropped),
            Phase::PrivilegeDropped => Some(Phase::FirstIpcObserved),
            Phase::FirstIpcObserved => Some(Phase::Injected),
            Phase::Injected => Some(Phase::Terminal),
            Phase::Terminal => None,
        }
    }
}

/// Observer of session progress.
pub trait PhaseHook {
    /// Called once a phase is entered.
    fn on_phase(&self, phase: Phase);

    /// Called for every counted breakpoint hit, `phase` is the phase being awaited.
    fn on_hit(&self, phase: Phase, location: &str, hit: u32);
}

pub struct NopHook;

impl PhaseHook for NopHook {
    fn on_phase(&self, _: Phase) {}

    fn on_hit(&self, _: Phase, _: &str, _: u32) {}
}

/// Outcome of a finished session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionReport {
    /// Breakpoints deleted by the sequencer, in deletion order.
    pub retired: Vec<BreakpointId>,
    /// Number of bind mounts issued inside a target.
    pub mounts: usize,
    pub injection: Option<InjectionReport>,
    /// Target error word read at the end of a session.
    pub final_error: Option<Value>,
}

/// Drives a target through its startup [`Phase`]s.
pub struct PhaseSequencer<'a, C: Controller, F: Filesystem, H: PhaseHook = NopHook> {
    ctl: C,
    fs: F,
    hook: H,
    cfg: &'a InjectConfig,
    phase: Option<Phase>,
    entry: Option<BreakpointId>,
    report: SessionReport,
}

impl<'a, C: Controller, F: Filesystem> PhaseSequencer<'a, C, F, NopHook> {
    pub fn new(ctl: C, fs: F, cfg: &'a InjectConfig) -> Self {
        Self::with_hook(ctl, fs, cfg, NopHook)
    }
}

impl<'a, C: Controller, F: Filesystem, H: PhaseHook> PhaseSequencer<'a, C, F, H> {
    pub fn with_hook(ctl: C, fs: F, cfg: &'a InjectConfig, hook: H) -> Self {
        Self {
            ctl,
            fs,
            hook,
            cfg,
            phase: None,
            entry: None,
            report: SessionReport::default(),
        }
    }

    /// Current phase, [`None`] until a target is attached.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn controller(&self) -> &C {
        &self.ctl
    }

    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    /// Perform exactly one transition, return the entered phase.
    pub fn advance(&mut self) -> Result<Phase, Error> {
        let next = match self.phase {
            None => Phase::Attached,
            Some(phase) => phase.next().ok_or(Error::SessionFinished)?,
        };
        debug!(target: "sequencer", "transition into {next}");

        match next {
            Phase::Attached => {
                let entry = attach::establish(
                    &mut self.ctl,
                    &self.cfg.executable,
                    &self.cfg.breakpoints.entry,
                )?;
                self.entry = Some(entry);
            }
            Phase::ChildEntered => {
                let entry = self.entry.ok_or(Error::ProcessNotStarted)?;
                let location = self.cfg.breakpoints.entry.clone();
                self.await_hits(next, &location, entry, 1)?;
                self.retire(entry)?;
            }
            Phase::LibraryLoaded => {
                PayloadInjector::new(&self.cfg.payload).load(&mut self.ctl)?;
            }
            Phase::MountsEstablished => {
                let location = self.cfg.breakpoints.mount.clone();
                let id = self.ctl.set_breakpoint(&location)?;
                self.await_hits(next, &location, id, 0)?;
                // repair calls the same function, it must not stop there
                self.retire(id)?;
                self.report.mounts = repair(&mut self.ctl, &mut self.fs, self.cfg)?;
            }
            Phase::PrivilegeDropped => {
                let location = self.cfg.breakpoints.privilege.clone();
                self.break_and_retire(next, &location)?;
            }
            Phase::FirstIpcObserved => {
                let location = self.cfg.breakpoints.ipc.clone();
                self.break_and_retire(next, &location)?;
            }
            Phase::Injected => {
                let report = PayloadInjector::new(&self.cfg.payload).execute(&mut self.ctl)?;
                self.report.injection = Some(report);
            }
            Phase::Terminal => {
                let name = &self.cfg.payload.error_variable;
                let value = self.ctl.read_variable(name)?;
                info!(target: "sequencer", "{name} = {value}");
                self.report.final_error = Some(value);
            }
        }

        info!(target: "sequencer", "phase {next} entered");
        self.phase = Some(next);
        self.hook.on_phase(next);
        if next == Phase::Attached {
            // first entry hit is observed while attaching, it is counted by the next phase
            self.hook
                .on_hit(Phase::ChildEntered, &self.cfg.breakpoints.entry, 1);
        }
        Ok(next)
    }

    /// Advance until the terminal phase.
    pub fn run(&mut self) -> Result<SessionReport, Error> {
        while self.phase != Some(Phase::Terminal) {
            self.advance()?;
        }
        Ok(self.report.clone())
    }

    /// Resume a target until breakpoint `id` fires the number of times `phase` expects.
    /// `seen` hits are already observed.
    fn await_hits(
        &mut self,
        phase: Phase,
        location: &str,
        id: BreakpointId,
        seen: u32,
    ) -> Result<(), Error> {
        for hit in seen + 1..=phase.expected_hits() {
            let stop = self.ctl.continue_until_break()?;
            expect_breakpoint(stop, id)?;
            debug!(target: "sequencer", "`{location}` hit {hit}/{}", phase.expected_hits());
            self.hook.on_hit(phase, location, hit);
        }
        Ok(())
    }

    fn break_and_retire(&mut self, phase: Phase, location: &str) -> Result<(), Error> {
        let id = self.ctl.set_breakpoint(location)?;
        self.await_hits(phase, location, id, 0)?;
        self.retire(id)
    }

    fn retire(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.ctl.delete_breakpoint(id)?;
        self.report.retired.push(id);
        Ok(())
    }
}

use sandpit_inject::controller::{Arg, BreakpointId, Controller, Stop, Value};
use sandpit_inject::error::Error;
use sandpit_inject::inject::repair::Filesystem;
use sandpit_inject::inject::sequencer::{Phase, PhaseHook};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Everything a fake target and a recording filesystem observe, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Attach(PathBuf),
    FollowChild,
    SetBreakpoint(String, BreakpointId),
    Delete(BreakpointId),
    Run,
    Continue,
    Invoke(String, Vec<Arg>),
    Read(String),
    CreateDir(PathBuf),
}

pub type Journal = Rc<RefCell<Vec<Call>>>;

/// What a target does when resumed.
#[derive(Clone, Debug)]
pub enum Event {
    /// Target calls a function, it stops only if a breakpoint is set there.
    Call(&'static str),
    /// Target stops at a breakpoint unknown to a caller.
    Stray(u32),
    Exit(i32),
    Signal(&'static str),
}

/// Startup of a sandpit broker and its sandboxed child as seen by a controller.
pub fn sandpit_startup() -> Vec<Event> {
    vec![
        Event::Call("main"),
        Event::Call("fork"),
        Event::Call("main"),
        Event::Call("mount"),
        Event::Call("mount"),
        Event::Call("mount"),
        Event::Call("mount"),
        Event::Call("pivot_root"),
        Event::Call("prctl"),
        Event::Call("prctl"),
        Event::Call("write"),
        Event::Call("write"),
        Event::Exit(0),
    ]
}

/// Scripted [`Controller`].
pub struct FakeTarget {
    journal: Journal,
    events: VecDeque<Event>,
    breakpoints: HashMap<String, BreakpointId>,
    last_id: u32,
    started: bool,
    results: HashMap<String, i64>,
    variables: HashMap<String, i64>,
    missing: HashSet<String>,
}

impl FakeTarget {
    pub fn new(journal: Journal, events: Vec<Event>) -> Self {
        Self {
            journal,
            events: events.into(),
            breakpoints: HashMap::new(),
            last_id: 0,
            started: false,
            results: HashMap::from([("dlopen".to_string(), 0x5555_0000)]),
            variables: HashMap::new(),
            missing: HashSet::new(),
        }
    }

    /// Set a value returned by a function call.
    pub fn returns(mut self, symbol: &str, value: i64) -> Self {
        self.results.insert(symbol.to_string(), value);
        self
    }

    pub fn variable(mut self, name: &str, value: i64) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    /// Make a symbol unknown to a target.
    pub fn without(mut self, symbol: &str) -> Self {
        self.missing.insert(symbol.to_string());
        self
    }

    fn record(&self, call: Call) {
        self.journal.borrow_mut().push(call);
    }

    fn next_stop(&mut self) -> Stop {
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::Call(function) => {
                    if let Some(id) = self.breakpoints.get(function) {
                        return Stop::Breakpoint(*id);
                    }
                }
                Event::Stray(id) => return Stop::Breakpoint(BreakpointId(id)),
                Event::Exit(code) => return Stop::Exited(code),
                Event::Signal(signal) => return Stop::Signaled(signal.to_string()),
            }
        }
        Stop::Exited(0)
    }
}

impl Controller for FakeTarget {
    fn attach(&mut self, executable: &Path) -> Result<(), Error> {
        self.record(Call::Attach(executable.to_path_buf()));
        Ok(())
    }

    fn follow_child_on_fork(&mut self) -> Result<(), Error> {
        self.record(Call::FollowChild);
        Ok(())
    }

    fn set_breakpoint(&mut self, location: &str) -> Result<BreakpointId, Error> {
        self.last_id += 1;
        let id = BreakpointId(self.last_id);
        self.breakpoints.insert(location.to_string(), id);
        self.record(Call::SetBreakpoint(location.to_string(), id));
        Ok(id)
    }

    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|_, bp| *bp != id);
        if before == self.breakpoints.len() {
            return Err(Error::BreakpointNotFound(id));
        }
        self.record(Call::Delete(id));
        Ok(())
    }

    fn run(&mut self) -> Result<Stop, Error> {
        self.record(Call::Run);
        self.started = true;
        Ok(self.next_stop())
    }

    fn continue_until_break(&mut self) -> Result<Stop, Error> {
        if !self.started {
            return Err(Error::ProcessNotStarted);
        }
        self.record(Call::Continue);
        Ok(self.next_stop())
    }

    fn invoke(&mut self, symbol: &str, args: &[Arg]) -> Result<Value, Error> {
        if self.missing.contains(symbol) {
            return Err(Error::SymbolNotFound(symbol.to_string()));
        }
        self.record(Call::Invoke(symbol.to_string(), args.to_vec()));
        if self.breakpoints.contains_key(symbol) {
            // a debugger stops inside a called function and abandons the call
            return Err(Error::Gdb(format!(
                "The program being debugged stopped while in a function called from GDB. ({symbol})"
            )));
        }
        Ok(Value::Int(self.results.get(symbol).copied().unwrap_or(0)))
    }

    fn read_variable(&mut self, name: &str) -> Result<Value, Error> {
        self.record(Call::Read(name.to_string()));
        Ok(Value::Int(self.variables.get(name).copied().unwrap_or(0)))
    }
}

/// Filesystem that only records requests.
pub struct RecordingFs {
    journal: Journal,
}

impl RecordingFs {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

impl Filesystem for RecordingFs {
    fn create_dir(&mut self, path: &Path) -> Result<(), Error> {
        self.journal
            .borrow_mut()
            .push(Call::CreateDir(path.to_path_buf()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct TestHooks {
    pub phases: Rc<RefCell<Vec<Phase>>>,
    pub hits: Rc<RefCell<Vec<(Phase, String, u32)>>>,
    /// Both kinds of events in arrival order.
    pub trace: Rc<RefCell<Vec<String>>>,
}

impl PhaseHook for TestHooks {
    fn on_phase(&self, phase: Phase) {
        self.phases.borrow_mut().push(phase);
        self.trace.borrow_mut().push(format!("enter {phase}"));
    }

    fn on_hit(&self, phase: Phase, location: &str, hit: u32) {
        self.hits
            .borrow_mut()
            .push((phase, location.to_string(), hit));
        self.trace
            .borrow_mut()
            .push(format!("{phase}: {location} #{hit}"));
    }
}

/// Calls to a function in journal order.
pub fn invocations(journal: &Journal, symbol: &str) -> Vec<Vec<Arg>> {
    journal
        .borrow()
        .iter()
        .filter_map(|c| match c {
            Call::Invoke(s, args) if s == symbol => Some(args.clone()),
            _ => None,
        })
        .collect()
}

/// Write a payload into a unique temporary file.
pub fn payload_file(content: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("spi-payload-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, content).unwrap();
    path
}

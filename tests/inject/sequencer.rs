use crate::common::{
    invocations, payload_file, sandpit_startup, Call, Event, FakeTarget, Journal, RecordingFs,
    TestHooks,
};
use crate::test_config;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sandpit_inject::controller::{Arg, BreakpointId, Stop, Value};
use sandpit_inject::error::Error;
use sandpit_inject::inject::payload::PayloadKind;
use sandpit_inject::inject::sequencer::{Phase, PhaseSequencer};
use std::path::PathBuf;

#[test]
fn test_native_session() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup()).variable("errno", 2);

    let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal.clone()), &cfg);
    assert_eq!(sequencer.phase(), None);
    let report = sequencer.run().unwrap();

    assert_eq!(sequencer.phase(), Some(Phase::Terminal));
    assert_eq!(
        report.retired,
        vec![
            BreakpointId(1),
            BreakpointId(2),
            BreakpointId(3),
            BreakpointId(4)
        ]
    );
    assert_eq!(report.mounts, 6);
    assert_eq!(report.final_error, Some(Value::Int(2)));
    let injection = report.injection.unwrap();
    assert_eq!(injection.kind, PayloadKind::NativeModule);
    assert_eq!(injection.last_error, Some(Value::Int(2)));

    assert_eq!(
        invocations(&journal, "dlopen"),
        vec![vec![Arg::str("/tmp/payload.so"), Arg::Int(4354)]]
    );
    assert_eq!(invocations(&journal, "payload"), vec![vec![Arg::Int(4)]]);

    let journal = journal.borrow();
    assert_eq!(journal[0], Call::Attach(PathBuf::from("target/release/sandpit")));
    assert_eq!(journal[1], Call::FollowChild);
    assert_eq!(
        journal[2],
        Call::SetBreakpoint("main".to_string(), BreakpointId(1))
    );
    assert_eq!(journal[3], Call::Run);
    assert_eq!(journal.last(), Some(&Call::Read("errno".to_string())));
}

#[test]
fn test_breakpoints_retired_once_per_phase() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup());

    let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal.clone()), &cfg);
    sequencer.run().unwrap();

    let journal = journal.borrow();
    let set: Vec<(String, BreakpointId)> = journal
        .iter()
        .filter_map(|c| match c {
            Call::SetBreakpoint(l, id) => Some((l.clone(), *id)),
            _ => None,
        })
        .collect();
    assert_eq!(
        set,
        vec![
            ("main".to_string(), BreakpointId(1)),
            ("mount".to_string(), BreakpointId(2)),
            ("prctl".to_string(), BreakpointId(3)),
            ("write".to_string(), BreakpointId(4)),
        ]
    );

    let deleted: Vec<BreakpointId> = journal
        .iter()
        .filter_map(|c| match c {
            Call::Delete(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, set.iter().map(|(_, id)| *id).collect::<Vec<_>>());

    // each breakpoint is deleted before the next one is set
    for (id, (_, next)) in deleted.iter().zip(set.iter().skip(1)) {
        let deleted_at = journal.iter().position(|c| c == &Call::Delete(*id));
        let next_at = journal
            .iter()
            .position(|c| matches!(c, Call::SetBreakpoint(_, n) if n == next));
        assert!(deleted_at < next_at);
    }

    // fourth mount of a target does not enter repair again
    let created = journal
        .iter()
        .filter(|c| matches!(c, Call::CreateDir(_)))
        .count();
    assert_eq!(created, 8);
    let mounts = journal
        .iter()
        .filter(|c| matches!(c, Call::Invoke(s, _) if s == "mount"))
        .count();
    assert_eq!(mounts, 6);
}

#[test]
fn test_phase_hook() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup());
    let hooks = TestHooks::default();

    let mut sequencer =
        PhaseSequencer::with_hook(target, RecordingFs::new(journal), &cfg, hooks.clone());
    sequencer.run().unwrap();

    assert_eq!(
        *hooks.phases.borrow(),
        vec![
            Phase::Attached,
            Phase::ChildEntered,
            Phase::LibraryLoaded,
            Phase::MountsEstablished,
            Phase::PrivilegeDropped,
            Phase::FirstIpcObserved,
            Phase::Injected,
            Phase::Terminal,
        ]
    );

    let hits = hooks.hits.borrow();
    let mount_hits: Vec<u32> = hits
        .iter()
        .filter(|(p, l, _)| *p == Phase::MountsEstablished && l == "mount")
        .map(|(_, _, n)| *n)
        .collect();
    assert_eq!(mount_hits, vec![1, 2, 3]);
    assert_eq!(hits.len(), 2 + 3 + 2 + 1);
}

#[test]
fn test_mount_breakpoint_retired_before_repair() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup());

    let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal.clone()), &cfg);
    let report = sequencer.run().unwrap();
    assert_eq!(report.mounts, 6);

    let journal = journal.borrow();
    let retired_at = journal
        .iter()
        .position(|c| c == &Call::Delete(BreakpointId(2)))
        .unwrap();
    let first_mount_call = journal
        .iter()
        .position(|c| matches!(c, Call::Invoke(s, _) if s == "mount"))
        .unwrap();
    assert!(retired_at < first_mount_call);
    // no resume between the last hit and the repair
    assert!(!journal[retired_at..first_mount_call].contains(&Call::Continue));
}

#[test]
fn test_hits_reported_between_phases() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup());
    let hooks = TestHooks::default();

    let mut sequencer =
        PhaseSequencer::with_hook(target, RecordingFs::new(journal), &cfg, hooks.clone());
    sequencer.run().unwrap();

    // a hit of a phase arrives after its predecessor is entered and before the phase itself
    assert_eq!(
        *hooks.trace.borrow(),
        vec![
            "enter Attached",
            "ChildEntered: main #1",
            "ChildEntered: main #2",
            "enter ChildEntered",
            "enter LibraryLoaded",
            "MountsEstablished: mount #1",
            "MountsEstablished: mount #2",
            "MountsEstablished: mount #3",
            "enter MountsEstablished",
            "PrivilegeDropped: prctl #1",
            "PrivilegeDropped: prctl #2",
            "enter PrivilegeDropped",
            "FirstIpcObserved: write #1",
            "enter FirstIpcObserved",
            "enter Injected",
            "enter Terminal",
        ]
    );
}

#[test]
fn test_advance_after_terminal() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup());

    let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal), &cfg);
    sequencer.run().unwrap();

    assert!(matches!(sequencer.advance(), Err(Error::SessionFinished)));
    assert_eq!(sequencer.phase(), Some(Phase::Terminal));
}

#[test]
fn test_step_by_step() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let target = FakeTarget::new(journal.clone(), sandpit_startup());

    let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal.clone()), &cfg);
    assert_eq!(sequencer.advance().unwrap(), Phase::Attached);
    assert_eq!(sequencer.advance().unwrap(), Phase::ChildEntered);
    assert_eq!(sequencer.report().retired, vec![BreakpointId(1)]);

    // library is loaded synchronously, no resume happens
    let resumes_before = count_resumes(&journal);
    assert_eq!(sequencer.advance().unwrap(), Phase::LibraryLoaded);
    assert_eq!(count_resumes(&journal), resumes_before);

    assert_eq!(sequencer.advance().unwrap(), Phase::MountsEstablished);
    assert_eq!(count_resumes(&journal), resumes_before + 3);
    assert_eq!(sequencer.report().mounts, 6);
}

fn count_resumes(journal: &Journal) -> usize {
    journal
        .borrow()
        .iter()
        .filter(|c| matches!(c, Call::Continue))
        .count()
}

#[test]
fn test_session_halts_on_unexpected_stops() {
    struct TestCase {
        events: Vec<Event>,
        halted_at: Option<Phase>,
        check: fn(&Error) -> bool,
    }
    let test_cases = [
        TestCase {
            events: vec![Event::Exit(1)],
            halted_at: None,
            check: |e| matches!(e, Error::ProcessExit(1)),
        },
        TestCase {
            events: vec![
                Event::Call("main"),
                Event::Call("main"),
                Event::Call("mount"),
                Event::Exit(3),
            ],
            halted_at: Some(Phase::LibraryLoaded),
            check: |e| matches!(e, Error::ProcessExit(3)),
        },
        TestCase {
            events: vec![
                Event::Call("main"),
                Event::Call("main"),
                Event::Call("mount"),
                Event::Call("mount"),
                Event::Call("mount"),
                Event::Call("prctl"),
                Event::Signal("SIGSEGV"),
            ],
            halted_at: Some(Phase::MountsEstablished),
            check: |e| matches!(e, Error::ProcessSignaled(s) if s == "SIGSEGV"),
        },
        TestCase {
            events: vec![Event::Call("main"), Event::Stray(7)],
            halted_at: Some(Phase::Attached),
            check: |e| {
                matches!(
                    e,
                    Error::UnexpectedStop {
                        expected: BreakpointId(1),
                        got: Stop::Breakpoint(BreakpointId(7))
                    }
                )
            },
        },
    ];

    for tc in test_cases {
        let journal = Journal::default();
        let cfg = test_config(PayloadKind::NativeModule, None);
        let target = FakeTarget::new(journal.clone(), tc.events);

        let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal), &cfg);
        let err = sequencer.run().unwrap_err();
        assert!((tc.check)(&err), "unexpected error: {err:?}");
        assert_eq!(sequencer.phase(), tc.halted_at);
    }
}

#[test]
fn test_interpreter_session() {
    let path = payload_file(b"a;b");
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::InterpreterScript, Some(path.clone()));
    let target = FakeTarget::new(journal.clone(), sandpit_startup());

    let mut sequencer = PhaseSequencer::new(target, RecordingFs::new(journal.clone()), &cfg);
    let report = sequencer.run().unwrap();
    std::fs::remove_file(path).unwrap();

    assert_eq!(report.retired.len(), 4);
    assert_eq!(report.mounts, 6);
    let injection = report.injection.unwrap();
    assert_eq!(injection.kind, PayloadKind::InterpreterScript);
    assert_eq!(injection.last_error, None);

    assert_eq!(
        invocations(&journal, "dlopen"),
        vec![vec![Arg::str("/usr/lib/libpython3.so"), Arg::Int(4354)]]
    );
    assert_eq!(invocations(&journal, "Py_Initialize"), vec![Vec::<Arg>::new()]);

    let runs = invocations(&journal, "PyRun_SimpleString");
    assert_eq!(runs.len(), 1);
    let [Arg::Str(script)] = runs[0].as_slice() else {
        panic!("runner takes a single string");
    };
    let script = String::from_utf8(script.clone()).unwrap();
    assert_eq!(script.matches(';').count(), 3);

    let encoded = script
        .split("b64decode(\"")
        .nth(1)
        .and_then(|s| s.split("\")").next())
        .unwrap();
    assert_eq!(STANDARD.decode(encoded).unwrap(), b"a;b");
}

use sandpit_inject::controller::{Arg, BreakpointId, Controller, Stop, Value};
use sandpit_inject::debugger::Debugger;
use sandpit_inject::error::Error;
use serial_test::serial;
use std::path::Path;

const STUB_APP: &str = env!("CARGO_BIN_EXE_sandbox_stub");

fn expect_hit(stop: Stop, id: BreakpointId) {
    assert!(matches!(stop, Stop::Breakpoint(hit) if hit == id), "{stop:?}");
}

/// Resume until `location` is hit `count` times, then delete the breakpoint.
fn hit_times(debugger: &mut Debugger, location: &str, count: u32) {
    let id = debugger.set_breakpoint(location).unwrap();
    for _ in 0..count {
        let stop = debugger.continue_until_break().unwrap();
        expect_hit(stop, id);
    }
    debugger.delete_breakpoint(id).unwrap();
}

#[test]
#[serial]
fn test_run_without_breakpoints() {
    let mut debugger = Debugger::new();
    debugger.attach(Path::new(STUB_APP)).unwrap();
    assert!(matches!(debugger.run().unwrap(), Stop::Exited(0)));
}

#[test]
#[serial]
fn test_not_started() {
    let mut debugger = Debugger::new();
    debugger.attach(Path::new(STUB_APP)).unwrap();
    assert!(matches!(
        debugger.continue_until_break(),
        Err(Error::ProcessNotStarted)
    ));
    assert!(matches!(
        debugger.invoke("stub_payload", &[Arg::Int(1)]),
        Err(Error::ProcessNotStarted)
    ));
}

#[test]
#[serial]
fn test_sandbox_startup_in_followed_child() {
    let mut debugger = Debugger::new();
    debugger.attach(Path::new(STUB_APP)).unwrap();
    debugger.follow_child_on_fork().unwrap();

    // broker main, then child main after fork and exec
    let main = debugger.set_breakpoint("main").unwrap();
    expect_hit(debugger.run().unwrap(), main);
    expect_hit(debugger.continue_until_break().unwrap(), main);
    debugger.delete_breakpoint(main).unwrap();

    let mount = debugger.set_breakpoint("mount").unwrap();
    for _ in 0..3 {
        expect_hit(debugger.continue_until_break().unwrap(), mount);
    }

    // calls from a breakpoint stop, the mount breakpoint stays armed
    let samples = ["", "/bin", "usr/lib", "a;b", "print('it\"s')\n"];
    for _ in 0..5 {
        for sample in samples {
            let len = debugger
                .invoke("stub_strlen", &[Arg::str(sample)])
                .unwrap();
            assert_eq!(len, Value::Int(sample.len() as i64));
        }
    }
    assert_eq!(
        debugger.invoke("stub_strlen", &[Arg::Null]).unwrap(),
        Value::Int(-1)
    );
    debugger.delete_breakpoint(mount).unwrap();

    hit_times(&mut debugger, "prctl", 2);
    hit_times(&mut debugger, "write", 1);

    assert_eq!(
        debugger.invoke("stub_payload", &[Arg::Int(4)]).unwrap(),
        Value::Int(40)
    );

    let Value::Int(rc) = debugger.invoke("close", &[Arg::Int(-1)]).unwrap() else {
        panic!("close returns int");
    };
    assert_eq!(rc as i32, -1);
    assert_eq!(
        debugger.read_variable("errno").unwrap(),
        Value::Int(nix::libc::EBADF as i64)
    );

    assert!(matches!(
        debugger.invoke("stub_not_exists", &[]),
        Err(Error::SymbolNotFound(s)) if s == "stub_not_exists"
    ));
}

#[test]
#[serial]
fn test_repeated_mount_hits_are_counted() {
    let mut debugger = Debugger::new();
    debugger.attach(Path::new(STUB_APP)).unwrap();
    debugger.follow_child_on_fork().unwrap();

    let main = debugger.set_breakpoint("main").unwrap();
    expect_hit(debugger.run().unwrap(), main);
    expect_hit(debugger.continue_until_break().unwrap(), main);
    debugger.delete_breakpoint(main).unwrap();

    // all four mounts of the child stop, then it runs to the end
    hit_times(&mut debugger, "mount", 4);
    assert!(matches!(
        debugger.continue_until_break().unwrap(),
        Stop::Exited(0)
    ));
}

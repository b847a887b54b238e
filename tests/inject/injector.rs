use crate::common::{invocations, payload_file, Call, FakeTarget, Journal};
use crate::test_config;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sandpit_inject::controller::{Arg, Value};
use sandpit_inject::error::{Error, ErrorKind};
use sandpit_inject::inject::injector::{InjectionError, PayloadInjector};
use sandpit_inject::inject::payload::PayloadKind;
use std::path::PathBuf;

#[test]
fn test_native_entry_called_once_then_errno() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let mut target = FakeTarget::new(journal.clone(), vec![])
        .returns("payload", -1)
        .variable("errno", 13);

    let report = PayloadInjector::new(&cfg.payload)
        .execute(&mut target)
        .unwrap();
    assert_eq!(report.result, Value::Int(-1));
    assert_eq!(report.last_error, Some(Value::Int(13)));

    assert_eq!(
        *journal.borrow(),
        vec![
            Call::Invoke("payload".to_string(), vec![Arg::Int(4)]),
            Call::Read("errno".to_string()),
        ]
    );
}

#[test]
fn test_native_entry_not_found() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::NativeModule, None);
    let mut target = FakeTarget::new(journal.clone(), vec![]).without("payload");

    let err = PayloadInjector::new(&cfg.payload)
        .execute(&mut target)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Injection);
    assert!(matches!(
        err,
        Error::Injection(InjectionError::EntryNotFound(ref s)) if s == "payload"
    ));
    assert!(journal.borrow().is_empty());
}

#[test]
fn test_load_failed() {
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::InterpreterScript, None);
    let mut target = FakeTarget::new(journal.clone(), vec![]).returns("dlopen", 0);

    let err = PayloadInjector::new(&cfg.payload)
        .load(&mut target)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Injection(InjectionError::LoadFailed { ref path, .. })
            if path == &PathBuf::from("/usr/lib/libpython3.so")
    ));
    // runtime is never initialized without a library
    assert!(invocations(&journal, "Py_Initialize").is_empty());
}

#[test]
fn test_bootstrap_payload_survives_transport() {
    let payloads: [&[u8]; 7] = [
        b"",
        b"'",
        b"\"",
        b"print('a')\nprint(\"b\")\n",
        "print('привет, мир')".as_bytes(),
        b"a;b",
        b"\\x00\\n;\\'",
    ];

    for content in payloads {
        let path = payload_file(content);
        let journal = Journal::default();
        let cfg = test_config(PayloadKind::InterpreterScript, Some(path.clone()));
        let mut target = FakeTarget::new(journal.clone(), vec![]);

        let report = PayloadInjector::new(&cfg.payload)
            .execute(&mut target)
            .unwrap();
        std::fs::remove_file(path).unwrap();
        assert_eq!(report.result, Value::Int(0));

        let runs = invocations(&journal, "PyRun_SimpleString");
        let [Arg::Str(script)] = runs[0].as_slice() else {
            panic!("runner takes a single string");
        };
        let script = String::from_utf8(script.clone()).unwrap();
        assert!(!script.contains('\n'));
        assert!(!script.contains('\''));
        assert_eq!(script.matches(';').count(), 3);

        let encoded = script
            .split("b64decode(\"")
            .nth(1)
            .and_then(|s| s.split("\")").next())
            .unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), content);
    }
}

#[test]
fn test_script_failure() {
    let path = payload_file(b"raise SystemError");
    let journal = Journal::default();
    let cfg = test_config(PayloadKind::InterpreterScript, Some(path.clone()));
    let mut target =
        FakeTarget::new(journal.clone(), vec![]).returns("PyRun_SimpleString", 0xffff_ffff);

    let err = PayloadInjector::new(&cfg.payload)
        .execute(&mut target)
        .unwrap_err();
    std::fs::remove_file(path).unwrap();
    assert!(matches!(
        err,
        Error::Injection(InjectionError::ScriptFailed { code: -1, .. })
    ));
}

//! Test debugee. Starts itself as a child, the child makes the same calls in the same
//! order as a sandbox does at startup. Every call fails without side effects.

use nix::libc;
use std::ffi::{c_char, CStr, CString};
use std::process::Command;

const MOUNT_TARGETS: [&str; 4] = [
    "/nonexistent-sandbox/bin",
    "/nonexistent-sandbox/lib",
    "/nonexistent-sandbox/usr",
    "/nonexistent-sandbox/proc",
];

#[no_mangle]
#[inline(never)]
pub extern "C" fn stub_payload(arg: i64) -> i64 {
    arg * 10
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn stub_strlen(s: *const c_char) -> i64 {
    if s.is_null() {
        return -1;
    }
    unsafe { CStr::from_ptr(s) }.to_bytes().len() as i64
}

fn child() {
    for target in MOUNT_TARGETS {
        let target = CString::new(target).expect("path without NUL");
        unsafe {
            libc::mount(
                std::ptr::null(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            )
        };
    }

    unsafe {
        libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
        libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
    }

    let msg = b"ready\n";
    for _ in 0..2 {
        unsafe { libc::write(libc::STDOUT_FILENO, msg.as_ptr().cast(), msg.len()) };
    }
}

fn main() {
    // keep exported functions alive
    std::hint::black_box(stub_payload as extern "C" fn(i64) -> i64);
    std::hint::black_box(stub_strlen as extern "C" fn(*const c_char) -> i64);

    if std::env::args().nth(1).as_deref() == Some("child") {
        child();
        return;
    }

    let exe = std::env::current_exe().expect("path to itself");
    let status = Command::new(exe)
        .arg("child")
        .status()
        .expect("start a child");
    std::process::exit(status.code().unwrap_or(1));
}

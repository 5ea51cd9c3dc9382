//! Shared scaffolding for the scenario tests

#![allow(dead_code)]

use ydin::filesystem::FileNo;
use ydin::{ErrorCode, Kernel, Syscall, SyscallOutcome, SyscallValue, ThreadId};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Issues a call that must complete successfully
pub fn ok(k: &mut Kernel, tid: ThreadId, call: Syscall) -> SyscallValue {
    match k.syscall(tid, call) {
        SyscallOutcome::Complete(Ok(v)) => v,
        other => panic!("expected success, got {:?}", other),
    }
}

/// Issues a call that must fail immediately with an error
pub fn err(k: &mut Kernel, tid: ThreadId, call: Syscall) -> ErrorCode {
    match k.syscall(tid, call) {
        SyscallOutcome::Complete(Err(e)) => e,
        other => panic!("expected an error, got {:?}", other),
    }
}

/// Issues a call that must park the thread
pub fn blocked(k: &mut Kernel, tid: ThreadId, call: Syscall) {
    match k.syscall(tid, call) {
        SyscallOutcome::Blocked => {},
        other => panic!("expected the call to block, got {:?}", other),
    }
}

/// Result of a previously parked call, which must have completed by now
pub fn finished(k: &mut Kernel, tid: ThreadId) -> Result<SyscallValue, ErrorCode> {
    k.take_result(tid)
        .unwrap_or_else(|| panic!("thread {} has no finished call", tid))
}

pub fn as_file(v: SyscallValue) -> FileNo {
    match v {
        SyscallValue::File(f) => f,
        other => panic!("expected a file, got {:?}", other),
    }
}

pub fn as_data(v: SyscallValue) -> Vec<u8> {
    match v {
        SyscallValue::Data(d) => d,
        other => panic!("expected data, got {:?}", other),
    }
}

pub fn as_size(v: SyscallValue) -> usize {
    match v {
        SyscallValue::Size(n) => n,
        other => panic!("expected a size, got {:?}", other),
    }
}

pub fn as_position(v: SyscallValue) -> u64 {
    match v {
        SyscallValue::Position(p) => p,
        other => panic!("expected a position, got {:?}", other),
    }
}

pub fn as_message(v: SyscallValue) -> (u8, Vec<u8>) {
    match v {
        SyscallValue::Message { id, data } => (id, data),
        other => panic!("expected a message, got {:?}", other),
    }
}

pub fn as_work(v: SyscallValue) -> (FileNo, u8, Vec<u8>) {
    match v {
        SyscallValue::Work { file, id, data } => (file, id, data),
        other => panic!("expected work, got {:?}", other),
    }
}

//! The typed system call surface and its dispatcher.
//!
//! A call that cannot complete parks the calling thread together with
//! the call itself; wake-ups re-issue it with `repeat = true` until it
//! completes. Real-path sentinels from the VFS are promoted here into
//! delegation requests to the fs driver.

use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryFrom;

use ydinabi::event::EventMask;
use ydinabi::fs::protocol::{Request, Response};
use ydinabi::fs::{DriverKind, FileInfo, OpenFlags, Whence};
use ydinabi::process::{ProcessId, ThreadId};
use ydinabi::ErrorCode;
use ydintime::Duration;

use crate::filesystem::error::{IoError, IoResult};
use crate::filesystem::gft::FileTarget;
use crate::filesystem::{FileNo, NodeId};
use crate::kernel::Kernel;
use crate::multitasking::{LockFlags, LockKey, LockScope, WaitFor, WaitObject, Wakeup};

#[derive(Debug, Clone)]
pub enum Syscall {
    Open { path: String, flags: OpenFlags },
    Close { file: FileNo },
    Read { file: FileNo, count: usize },
    Write { file: FileNo, data: Vec<u8> },
    Seek { file: FileNo, offset: i64, whence: Whence },
    Tell { file: FileNo },
    Eof { file: FileNo },
    Stat { path: String },
    Fstat { file: FileNo },
    Chmod { path: String, mode: u32 },
    Chown { path: String, uid: u32, gid: u32 },
    Link { old_path: String, new_path: String },
    Unlink { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Pipe,
    SetNoblock { file: FileNo, on: bool },
    GetAccess { file: FileNo },
    CreateDriver { name: String, kind: DriverKind },
    GetClient { files: Vec<FileNo> },
    GetClientId { file: FileNo },
    OpenClient { file: FileNo, client: NodeId },
    GetWork { files: Vec<FileNo>, size: usize },
    SendMsg { file: FileNo, id: u8, data: Vec<u8> },
    ReceiveMsg { file: FileNo, size: usize },
    SetReadable { file: FileNo, readable: bool },
    Wait { events: EventMask },
    Notify { tid: ThreadId, events: EventMask },
    Lock { ident: u32, global: bool, flags: LockFlags },
    Unlock { ident: u32, global: bool },
    WaitUnlock { ident: u32, global: bool, events: EventMask },
    Sleep { msecs: u64 },
    Yield,
    Join { tid: Option<ThreadId> },
    Suspend { tid: ThreadId },
    Resume { tid: ThreadId },
    Exit { code: i64 },
}

/// What a completed call hands back
#[derive(Debug, Clone, PartialEq)]
pub enum SyscallValue {
    None,
    Size(usize),
    Position(u64),
    Flag(bool),
    File(FileNo),
    Client(NodeId),
    Access(OpenFlags),
    Data(Vec<u8>),
    Message { id: u8, data: Vec<u8> },
    Work { file: FileNo, id: u8, data: Vec<u8> },
    Info(FileInfo),
    Pipe { read: FileNo, write: FileNo },
}

pub type SyscallResult = Result<SyscallValue, ErrorCode>;

/// Immediate outcome of issuing a call
#[derive(Debug)]
pub enum SyscallOutcome {
    Complete(SyscallResult),
    /// The thread is parked; the result arrives via
    /// [`Kernel::take_result`] once it has been woken and the call
    /// re-issued
    Blocked,
}

/// Whether a signal aborts the blocked call with `interrupted`.
/// Join deliberately rides out signals and just rechecks its predicate.
pub(crate) fn interruptible(call: &Syscall) -> bool {
    !matches!(call, Syscall::Join { .. })
}

fn real_err(code: u64) -> ErrorCode {
    ErrorCode::try_from(code).unwrap_or(ErrorCode::unsupported_op)
}

fn check_handle(k: &Kernel, pid: ProcessId, file: FileNo) -> Result<(), ErrorCode> {
    let p = k.sched.process(pid).ok_or(ErrorCode::invalid_args)?;
    if p.files.contains(&file) {
        Ok(())
    } else {
        Err(ErrorCode::invalid_file)
    }
}

fn track_handle(k: &mut Kernel, pid: ProcessId, file: FileNo) {
    k.sched
        .process_mut(pid)
        .expect("tracking handle of unknown process")
        .files
        .push(file);
}

fn untrack_handle(k: &mut Kernel, pid: ProcessId, file: FileNo) {
    if let Some(p) = k.sched.process_mut(pid) {
        if let Some(i) = p.files.iter().position(|f| *f == file) {
            p.files.remove(i);
        }
    }
}

fn delegate(
    k: &mut Kernel,
    pid: ProcessId,
    tid: ThreadId,
    req: &Request,
) -> IoResult<Response> {
    k.vfs.real_request(&mut k.sched, Some(pid), tid, req)
}

fn expect_done(resp: Response) -> IoResult<SyscallValue> {
    match resp {
        Response::Done => Ok(SyscallValue::None),
        Response::Error(c) => Err(real_err(c).into()),
        _ => Err(ErrorCode::invalid_args.into()),
    }
}

/// The level-triggered wait loop. On the first issue a wait blocks
/// unless the condition already holds; on re-issue after a wake-up the
/// condition is re-checked if every bit is kernel-verifiable, otherwise
/// the wake itself ends the wait.
fn do_wait(
    k: &Kernel,
    pid: ProcessId,
    events: EventMask,
    repeat: bool,
) -> IoResult<SyscallValue> {
    if repeat && events.intersects(!EventMask::VERIFIABLE_MASK) {
        return Ok(SyscallValue::None);
    }
    if k.vfs.msg_available_for(pid, events) {
        return Ok(SyscallValue::None);
    }
    Err(IoError::RepeatAfter(WaitFor::event(events)))
}

fn lock_key(pid: ProcessId, ident: u32, global: bool) -> LockKey {
    LockKey {
        scope: if global {
            LockScope::Global
        } else {
            LockScope::Process(pid)
        },
        ident,
    }
}

pub(crate) fn dispatch(
    k: &mut Kernel,
    tid: ThreadId,
    call: &Syscall,
    repeat: bool,
) -> IoResult<SyscallValue> {
    let pid = k
        .sched
        .thread(tid)
        .ok_or(ErrorCode::invalid_args)?
        .pid;
    let caller = k.sched.caller_of(Some(pid));

    match call {
        Syscall::Open { path, flags } => {
            match k.vfs.open_path(&mut k.sched, &caller, *flags, path) {
                Ok(file) => {
                    track_handle(k, pid, file);
                    Ok(SyscallValue::File(file))
                },
                Err(IoError::Code(ErrorCode::real_path)) => {
                    let resp = delegate(
                        k,
                        pid,
                        tid,
                        &Request::Open {
                            path: path.clone(),
                            flags: flags.bits(),
                        },
                    )?;
                    match resp {
                        Response::Opened { inode, device } => {
                            let file = k.vfs.open_file(
                                &caller,
                                *flags,
                                FileTarget::Real {
                                    inode,
                                    device: ydinabi::fs::DeviceId(device),
                                },
                            )?;
                            track_handle(k, pid, file);
                            Ok(SyscallValue::File(file))
                        },
                        Response::Error(c) => Err(real_err(c).into()),
                        _ => Err(ErrorCode::invalid_args.into()),
                    }
                },
                Err(e) => Err(e),
            }
        },

        Syscall::Close { file } => {
            check_handle(k, pid, *file)?;
            untrack_handle(k, pid, *file);
            k.vfs.close_file(&mut k.sched, *file)?;
            Ok(SyscallValue::None)
        },

        Syscall::Read { file, count } => {
            check_handle(k, pid, *file)?;
            match k.vfs.entry_target(*file)? {
                FileTarget::Virtual(_) => {
                    let data = k.vfs.read_file(&mut k.sched, &caller, *file, *count)?;
                    Ok(SyscallValue::Data(data))
                },
                FileTarget::Real { inode, device } => {
                    if !k.vfs.entry_flags(*file)?.contains(OpenFlags::READ) {
                        return Err(ErrorCode::no_read_perm.into());
                    }
                    let offset = k.vfs.entry_position(*file)?;
                    let resp = delegate(
                        k,
                        pid,
                        tid,
                        &Request::Read {
                            inode,
                            device: device.0,
                            offset,
                            count: *count as u64,
                        },
                    )?;
                    match resp {
                        Response::Data(d) => {
                            k.vfs.advance_position(*file, d.len() as u64)?;
                            Ok(SyscallValue::Data(d))
                        },
                        Response::Error(c) => Err(real_err(c).into()),
                        _ => Err(ErrorCode::invalid_args.into()),
                    }
                },
            }
        },

        Syscall::Write { file, data } => {
            check_handle(k, pid, *file)?;
            match k.vfs.entry_target(*file)? {
                FileTarget::Virtual(_) => {
                    let n = k.vfs.write_file(&mut k.sched, &caller, *file, data)?;
                    Ok(SyscallValue::Size(n))
                },
                FileTarget::Real { inode, device } => {
                    if !k.vfs.entry_flags(*file)?.contains(OpenFlags::WRITE) {
                        return Err(ErrorCode::no_write_perm.into());
                    }
                    let offset = k.vfs.entry_position(*file)?;
                    let resp = delegate(
                        k,
                        pid,
                        tid,
                        &Request::Write {
                            inode,
                            device: device.0,
                            offset,
                            data: data.clone(),
                        },
                    )?;
                    match resp {
                        Response::Written(n) => {
                            k.vfs.advance_position(*file, n)?;
                            Ok(SyscallValue::Size(n as usize))
                        },
                        Response::Error(c) => Err(real_err(c).into()),
                        _ => Err(ErrorCode::invalid_args.into()),
                    }
                },
            }
        },

        Syscall::Seek {
            file,
            offset,
            whence,
        } => {
            check_handle(k, pid, *file)?;
            match k.vfs.entry_target(*file)? {
                FileTarget::Virtual(_) => {
                    let pos = k.vfs.seek(&k.sched, *file, *offset, *whence)?;
                    Ok(SyscallValue::Position(pos))
                },
                FileTarget::Real { inode, device } => {
                    let pos = k.vfs.entry_position(*file)?;
                    let new = match whence {
                        Whence::Set => *offset,
                        Whence::Cur => pos as i64 + offset,
                        Whence::End => {
                            let resp = delegate(
                                k,
                                pid,
                                tid,
                                &Request::Istat {
                                    inode,
                                    device: device.0,
                                },
                            )?;
                            match resp {
                                Response::Info(i) => i.size as i64 + offset,
                                Response::Error(c) => return Err(real_err(c).into()),
                                _ => return Err(ErrorCode::invalid_args.into()),
                            }
                        },
                    };
                    if new < 0 {
                        return Err(ErrorCode::invalid_args.into());
                    }
                    k.vfs.set_position(*file, new as u64)?;
                    Ok(SyscallValue::Position(new as u64))
                },
            }
        },

        Syscall::Tell { file } => {
            check_handle(k, pid, *file)?;
            Ok(SyscallValue::Position(k.vfs.tell(*file)?))
        },

        Syscall::Eof { file } => {
            check_handle(k, pid, *file)?;
            Ok(SyscallValue::Flag(k.vfs.eof(&caller, *file)?))
        },

        Syscall::Stat { path } => match k.vfs.stat(path) {
            Ok(info) => Ok(SyscallValue::Info(info)),
            Err(IoError::Code(ErrorCode::real_path)) => {
                let resp = delegate(k, pid, tid, &Request::Stat { path: path.clone() })?;
                match resp {
                    Response::Info(i) => Ok(SyscallValue::Info(i)),
                    Response::Error(c) => Err(real_err(c).into()),
                    _ => Err(ErrorCode::invalid_args.into()),
                }
            },
            Err(e) => Err(e),
        },

        Syscall::Fstat { file } => {
            check_handle(k, pid, *file)?;
            match k.vfs.fstat(*file) {
                Ok(info) => Ok(SyscallValue::Info(info)),
                Err(IoError::Code(ErrorCode::real_path)) => {
                    let (inode, device) = match k.vfs.entry_target(*file)? {
                        FileTarget::Real { inode, device } => (inode, device),
                        FileTarget::Virtual(_) => unreachable!("virtual fstat is direct"),
                    };
                    let resp = delegate(
                        k,
                        pid,
                        tid,
                        &Request::Istat {
                            inode,
                            device: device.0,
                        },
                    )?;
                    match resp {
                        Response::Info(i) => Ok(SyscallValue::Info(i)),
                        Response::Error(c) => Err(real_err(c).into()),
                        _ => Err(ErrorCode::invalid_args.into()),
                    }
                },
                Err(e) => Err(e),
            }
        },

        Syscall::Chmod { path, mode } => match k.vfs.chmod(&caller, path, *mode) {
            Ok(()) => Ok(SyscallValue::None),
            Err(IoError::Code(ErrorCode::real_path)) => {
                let resp = delegate(
                    k,
                    pid,
                    tid,
                    &Request::Chmod {
                        path: path.clone(),
                        mode: *mode,
                    },
                )?;
                expect_done(resp)
            },
            Err(e) => Err(e),
        },

        Syscall::Chown { path, uid, gid } => match k.vfs.chown(&caller, path, *uid, *gid) {
            Ok(()) => Ok(SyscallValue::None),
            Err(IoError::Code(ErrorCode::real_path)) => {
                let resp = delegate(
                    k,
                    pid,
                    tid,
                    &Request::Chown {
                        path: path.clone(),
                        uid: *uid,
                        gid: *gid,
                    },
                )?;
                expect_done(resp)
            },
            Err(e) => Err(e),
        },

        Syscall::Link { old_path, new_path } => {
            match k.vfs.link(&caller, old_path, new_path) {
                Ok(()) => Ok(SyscallValue::None),
                Err(IoError::Code(ErrorCode::real_path)) => {
                    let resp = delegate(
                        k,
                        pid,
                        tid,
                        &Request::Link {
                            old_path: old_path.clone(),
                            new_path: new_path.clone(),
                        },
                    )?;
                    expect_done(resp)
                },
                Err(e) => Err(e),
            }
        },

        Syscall::Unlink { path } => match k.vfs.unlink(&mut k.sched, &caller, path) {
            Ok(()) => Ok(SyscallValue::None),
            Err(IoError::Code(ErrorCode::real_path)) => {
                let resp = delegate(k, pid, tid, &Request::Unlink { path: path.clone() })?;
                expect_done(resp)
            },
            Err(e) => Err(e),
        },

        Syscall::Mkdir { path } => match k.vfs.mkdir(&caller, path) {
            Ok(()) => Ok(SyscallValue::None),
            Err(IoError::Code(ErrorCode::real_path)) => {
                let resp = delegate(k, pid, tid, &Request::Mkdir { path: path.clone() })?;
                expect_done(resp)
            },
            Err(e) => Err(e),
        },

        Syscall::Rmdir { path } => match k.vfs.rmdir(&mut k.sched, &caller, path) {
            Ok(()) => Ok(SyscallValue::None),
            Err(IoError::Code(ErrorCode::real_path)) => {
                let resp = delegate(k, pid, tid, &Request::Rmdir { path: path.clone() })?;
                expect_done(resp)
            },
            Err(e) => Err(e),
        },

        Syscall::Pipe => {
            let (r, w) = k.vfs.create_pipe(&mut k.sched, &caller)?;
            track_handle(k, pid, r);
            track_handle(k, pid, w);
            Ok(SyscallValue::Pipe { read: r, write: w })
        },

        Syscall::SetNoblock { file, on } => {
            check_handle(k, pid, *file)?;
            k.vfs.set_noblock(*file, *on)?;
            Ok(SyscallValue::None)
        },

        Syscall::GetAccess { file } => {
            check_handle(k, pid, *file)?;
            Ok(SyscallValue::Access(k.vfs.get_access(*file)?))
        },

        Syscall::CreateDriver { name, kind } => {
            let type_bits = *kind
                & (DriverKind::BLOCK
                    | DriverKind::CHAR
                    | DriverKind::FS
                    | DriverKind::FILE
                    | DriverKind::SERVICE);
            if type_bits.bits().count_ones() != 1 {
                return Err(ErrorCode::invalid_args.into());
            }
            let file = k.vfs.create_driver(&caller, name, *kind)?;
            track_handle(k, pid, file);
            Ok(SyscallValue::File(file))
        },

        Syscall::GetClient { files } => {
            for f in files {
                check_handle(k, pid, *f)?;
            }
            let chan = k.vfs.get_client(Some(pid), files)?;
            Ok(SyscallValue::Client(chan))
        },

        Syscall::GetClientId { file } => {
            check_handle(k, pid, *file)?;
            Ok(SyscallValue::Client(k.vfs.get_client_id(*file)?))
        },

        Syscall::OpenClient { file, client } => {
            check_handle(k, pid, *file)?;
            let f = k.vfs.open_client(&caller, *file, *client)?;
            track_handle(k, pid, f);
            Ok(SyscallValue::File(f))
        },

        Syscall::GetWork { files, size } => {
            for f in files {
                check_handle(k, pid, *f)?;
            }
            match k.vfs.get_client(Some(pid), files) {
                Ok(chan) => {
                    let f = k.vfs.open_client_channel(&caller, chan)?;
                    match k.vfs.receive_msg(&mut k.sched, &caller, f, *size) {
                        Ok((id, data)) => {
                            track_handle(k, pid, f);
                            Ok(SyscallValue::Work { file: f, id, data })
                        },
                        Err(e) => {
                            let _ = k.vfs.close_file(&mut k.sched, f);
                            Err(e)
                        },
                    }
                },
                Err(IoError::Code(ErrorCode::no_client_waiting)) => Err(IoError::RepeatAfter(
                    WaitFor::event(EventMask::CLIENT),
                )),
                Err(e) => Err(e),
            }
        },

        Syscall::SendMsg { file, id, data } => {
            check_handle(k, pid, *file)?;
            k.vfs.send_msg(&mut k.sched, &caller, *file, *id, data)?;
            Ok(SyscallValue::None)
        },

        Syscall::ReceiveMsg { file, size } => {
            check_handle(k, pid, *file)?;
            let (id, data) = k.vfs.receive_msg(&mut k.sched, &caller, *file, *size)?;
            Ok(SyscallValue::Message { id, data })
        },

        Syscall::SetReadable { file, readable } => {
            check_handle(k, pid, *file)?;
            k.vfs
                .set_readable(&mut k.sched, &caller, *file, *readable)?;
            Ok(SyscallValue::None)
        },

        Syscall::Wait { events } => {
            if events.is_empty() || !EventMask::USER_WAIT_MASK.contains(*events) {
                return Err(ErrorCode::invalid_args.into());
            }
            do_wait(k, pid, *events, repeat)
        },

        Syscall::Notify { tid: target, events } => {
            if events.is_empty() || !EventMask::USER_NOTIFY_MASK.contains(*events) {
                return Err(ErrorCode::invalid_args.into());
            }
            if k.sched.thread(*target).is_none() {
                return Err(ErrorCode::invalid_args.into());
            }
            k.sched.wakeup(Wakeup::thread(*target, *events));
            Ok(SyscallValue::None)
        },

        Syscall::Lock {
            ident,
            global,
            flags,
        } => {
            k.locks.acquire(lock_key(pid, *ident, *global), tid, *flags)?;
            Ok(SyscallValue::None)
        },

        Syscall::Unlock { ident, global } => {
            let wake = k
                .locks
                .release(lock_key(pid, *ident, *global))
                .map_err(IoError::Code)?;
            if let Some(w) = wake {
                k.sched.wakeup(w);
            }
            Ok(SyscallValue::None)
        },

        Syscall::WaitUnlock {
            ident,
            global,
            events,
        } => {
            if events.is_empty() || !EventMask::USER_WAIT_MASK.contains(*events) {
                return Err(ErrorCode::invalid_args.into());
            }
            if !repeat {
                // release and wait are one kernel entry: a notify cannot
                // slip between them
                let wake = k
                    .locks
                    .release(lock_key(pid, *ident, *global))
                    .map_err(IoError::Code)?;
                if let Some(w) = wake {
                    k.sched.wakeup(w);
                }
            }
            do_wait(k, pid, *events, repeat)
        },

        Syscall::Sleep { msecs } => {
            if repeat {
                return Ok(SyscallValue::None);
            }
            let deadline = k.sched.now() + Duration::from_millis(*msecs);
            Err(IoError::RepeatAfter(WaitFor::Time(deadline)))
        },

        Syscall::Yield => Ok(SyscallValue::None),

        Syscall::Join { tid: target } => {
            if !repeat {
                if let Some(t) = target {
                    let tt = k.sched.thread(*t).ok_or(ErrorCode::invalid_args)?;
                    if *t == tid || tt.pid != pid {
                        return Err(ErrorCode::invalid_args.into());
                    }
                }
            }
            let satisfied = match target {
                // sole remaining thread of the process
                None => k
                    .sched
                    .process(pid)
                    .map_or(true, |p| p.threads.len() == 1),
                Some(t) => k.sched.thread(*t).is_none(),
            };
            if satisfied {
                Ok(SyscallValue::None)
            } else {
                Err(IoError::RepeatAfter(WaitFor::event_on(
                    EventMask::THREAD_DIED,
                    WaitObject::Process(pid),
                )))
            }
        },

        Syscall::Suspend { tid: target } => {
            let tt = k.sched.thread(*target).ok_or(ErrorCode::invalid_args)?;
            if *target == tid || tt.pid != pid {
                return Err(ErrorCode::invalid_args.into());
            }
            k.sched.suspend(*target);
            Ok(SyscallValue::None)
        },

        Syscall::Resume { tid: target } => {
            let tt = k.sched.thread(*target).ok_or(ErrorCode::invalid_args)?;
            if *target == tid || tt.pid != pid {
                return Err(ErrorCode::invalid_args.into());
            }
            k.sched.resume(*target);
            Ok(SyscallValue::None)
        },

        Syscall::Exit { code } => {
            k.teardown_thread(tid, *code);
            Ok(SyscallValue::None)
        },
    }
}

/// Helper for tests and embedders: unwraps a completed successful call
pub fn expect_complete(outcome: SyscallOutcome) -> SyscallResult {
    match outcome {
        SyscallOutcome::Complete(r) => r,
        SyscallOutcome::Blocked => panic!("system call unexpectedly blocked"),
    }
}

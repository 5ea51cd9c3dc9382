//! The kernel singleton: owns the namespace, the scheduler and the lock
//! table, and drives the park/retry cycle of blocking system calls.
//!
//! Lock order, where multiple tables are touched in one entry:
//! lock table, then node tree, then global file table, then event
//! table. On the single-CPU model every entry runs to completion, so
//! the order only matters for reading the code, but it is kept.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use ydinabi::event::EventMask;
use ydinabi::process::{ProcessId, ProcessResult, ThreadId};
use ydinabi::ErrorCode;
use ydintime::{Duration, Instant};

use crate::filesystem::error::IoError;
use crate::filesystem::{FileNo, VirtualFS};
use crate::multitasking::{LockTable, Scheduler, WaitObject, Wakeup};
use crate::syscall::{self, Syscall, SyscallOutcome, SyscallResult};

/// Capacity caps for the global tables. Hitting one behaves exactly
/// like running out of kernel heap.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_nodes: usize,
    pub max_files: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_nodes: 4096,
            max_files: 1024,
        }
    }
}

pub struct Kernel {
    pub(crate) sched: Scheduler,
    pub(crate) vfs: VirtualFS,
    pub(crate) locks: LockTable,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            sched: Scheduler::new(),
            vfs: VirtualFS::new(limits.max_nodes, limits.max_files),
            locks: LockTable::new(),
        }
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// Creates a process with one initial thread and its namespace nodes
    pub fn spawn_process(&mut self, uid: u32, gid: u32) -> (ProcessId, ThreadId) {
        let pid = self.sched.create_process(uid, gid);
        let (dir, thread_dir) = self
            .vfs
            .create_process_nodes(pid)
            .expect("out of nodes while spawning a process");
        {
            let p = self.sched.process_mut(pid).expect("process vanished");
            p.node = Some(dir);
            p.thread_dir = Some(thread_dir);
        }
        let tid = self.spawn_thread(pid);
        (pid, tid)
    }

    pub fn spawn_thread(&mut self, pid: ProcessId) -> ThreadId {
        let tid = self.sched.create_thread(pid);
        let thread_dir = self
            .sched
            .process(pid)
            .and_then(|p| p.thread_dir)
            .expect("spawning thread into unknown process");
        let node = self
            .vfs
            .create_thread_nodes(thread_dir, tid)
            .expect("out of nodes while spawning a thread");
        self.sched.thread_mut(tid).expect("thread vanished").node = Some(node);
        tid
    }

    /// Forks a process: the child gets the same credentials and inherits
    /// every handle per the sharing rules. Returns the child ids and the
    /// parent-to-child handle mapping.
    pub fn fork(
        &mut self,
        parent: ProcessId,
    ) -> Result<(ProcessId, ThreadId, Vec<(FileNo, FileNo)>), ErrorCode> {
        let (uid, gid, files) = {
            let p = self.sched.process(parent).ok_or(ErrorCode::invalid_args)?;
            (p.uid, p.gid, p.files.clone())
        };
        let (child, tid) = self.spawn_process(uid, gid);
        let child_caller = self.sched.caller_of(Some(child));
        let mut mapping = Vec::new();
        for file in files {
            match self.vfs.inherit(&child_caller, file) {
                Ok(inherited) => {
                    self.sched
                        .process_mut(child)
                        .expect("child vanished")
                        .files
                        .push(inherited);
                    mapping.push((file, inherited));
                },
                Err(e) => {
                    log::warn!("fork: handle {:?} not inherited: {:?}", file, e);
                },
            }
        }
        Ok((child, tid, mapping))
    }

    /// Thread exit as an external action (the in-kernel path is the Exit
    /// system call)
    pub fn exit_thread(&mut self, tid: ThreadId, code: i64) {
        self.teardown_thread(tid, code);
        self.run_pending();
    }

    pub(crate) fn teardown_thread(&mut self, tid: ThreadId, code: i64) {
        let pid = match self.sched.thread(tid) {
            Some(t) => t.pid,
            None => return,
        };
        // locks first, then namespace, per the documented order
        for w in self.locks.remove_thread(tid) {
            self.sched.wakeup(w);
        }
        self.vfs.real_forget(tid);
        if let Some(node) = self.sched.thread(tid).and_then(|t| t.node) {
            self.vfs.remove_nodes(&mut self.sched, node);
        }
        self.sched.remove_thread(tid);
        self.sched.wakeup(Wakeup::object(
            WaitObject::Process(pid),
            EventMask::THREAD_DIED,
        ));

        let last = self
            .sched
            .process(pid)
            .map_or(false, |p| p.threads.is_empty());
        if last {
            if let Some(p) = self.sched.process_mut(pid) {
                p.result = Some(ProcessResult::Completed(code));
            }
            let files = self
                .sched
                .process(pid)
                .map(|p| p.files.clone())
                .unwrap_or_default();
            self.vfs.on_process_over(&mut self.sched, pid, &files);
            self.locks.remove_process(pid);
            if let Some(node) = self.sched.process(pid).and_then(|p| p.node) {
                self.vfs.remove_nodes(&mut self.sched, node);
            }
            self.sched.remove_process(pid);
            log::debug!("process {} over", pid);
        }
    }

    // ------------------------------------------------------------------
    // system calls

    /// Issues a system call on behalf of `tid`. A blocking call parks
    /// the thread; collect its eventual result with [`take_result`]
    /// after the wake-up condition has been driven.
    ///
    /// [`take_result`]: Kernel::take_result
    pub fn syscall(&mut self, tid: ThreadId, call: Syscall) -> SyscallOutcome {
        let outcome = self.run_call(tid, call, false);
        // wake-ups the call caused may unpark other threads
        self.run_pending();
        outcome
    }

    fn run_call(&mut self, tid: ThreadId, call: Syscall, repeat: bool) -> SyscallOutcome {
        match syscall::dispatch(self, tid, &call, repeat) {
            Ok(v) => SyscallOutcome::Complete(Ok(v)),
            Err(IoError::Code(c)) => SyscallOutcome::Complete(Err(c)),
            Err(IoError::RepeatAfter(wait)) => {
                let signalled = self
                    .sched
                    .thread(tid)
                    .map_or(false, |t| t.pending_signal);
                if signalled && syscall::interruptible(&call) {
                    self.consume_signal(tid);
                    return SyscallOutcome::Complete(Err(ErrorCode::interrupted));
                }
                self.sched.block(tid, wait);
                if let Some(t) = self.sched.thread_mut(tid) {
                    t.parked = Some(call);
                }
                SyscallOutcome::Blocked
            },
        }
    }

    /// Re-issues parked calls of woken threads until nothing is runnable
    pub fn run_pending(&mut self) {
        while let Some(tid) = self.sched.take_runnable() {
            let (call, signalled) = match self.sched.thread_mut(tid) {
                Some(t) => (t.parked.take(), t.pending_signal),
                None => continue,
            };
            let call = match call {
                Some(c) => c,
                None => continue,
            };
            if signalled && syscall::interruptible(&call) {
                self.consume_signal(tid);
                if let Some(t) = self.sched.thread_mut(tid) {
                    t.finished = Some(Err(ErrorCode::interrupted));
                }
                continue;
            }
            match self.run_call(tid, call, true) {
                SyscallOutcome::Complete(res) => {
                    if let Some(t) = self.sched.thread_mut(tid) {
                        t.finished = Some(res);
                    }
                },
                SyscallOutcome::Blocked => {},
            }
        }
    }

    /// Clears the pending signal and scrubs the thread out of every
    /// waitset it may still be queued on
    fn consume_signal(&mut self, tid: ThreadId) {
        if let Some(t) = self.sched.thread_mut(tid) {
            t.pending_signal = false;
        }
        self.locks.forget_waiter(tid);
        self.vfs.real_forget(tid);
    }

    /// Collects the result of a parked call that has since completed
    pub fn take_result(&mut self, tid: ThreadId) -> Option<SyscallResult> {
        self.sched.thread_mut(tid).and_then(|t| t.finished.take())
    }

    // ------------------------------------------------------------------
    // external stimuli

    /// Advances the kernel clock, waking expired sleepers
    pub fn tick(&mut self, d: Duration) {
        self.sched.advance(d);
        self.run_pending();
    }

    pub fn now(&self) -> Instant {
        self.sched.now()
    }

    /// Delivers a signal: a blocked interruptible call returns
    /// `interrupted`, and the thread ends up enqueued nowhere
    pub fn deliver_signal(&mut self, tid: ThreadId) {
        self.sched.deliver_signal(tid);
        self.locks.forget_waiter(tid);
        self.vfs.real_forget(tid);
        self.run_pending();
    }

    // ------------------------------------------------------------------
    // introspection

    pub fn vfs(&self) -> &VirtualFS {
        &self.vfs
    }

    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// Process-wide kernel instance for embedders that want the
    /// singleton; tests construct their own [`Kernel`] values instead
    pub static ref KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new());
}

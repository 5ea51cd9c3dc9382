use ydinabi::process::{ProcessId, ThreadId};

use crate::filesystem::NodeId;
use crate::syscall::{Syscall, SyscallResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    /// Waiting on an event record
    Blocked,
    /// On the timer list
    Sleeping,
}

/// A kernel thread. The core keeps no register state; a thread here is
/// the unit of scheduling, blocking and signal delivery.
#[derive(Debug)]
pub struct Thread {
    pub tid: ThreadId,
    pub pid: ProcessId,
    pub state: ThreadState,
    /// Suspended threads are skipped by the scheduler even when runnable
    pub suspended: bool,
    /// A signal has been delivered and not yet consumed by a blocker
    pub pending_signal: bool,
    /// System call to re-issue when the thread runs again
    pub parked: Option<Syscall>,
    /// Completed result of the last parked call, not yet collected
    pub finished: Option<SyscallResult>,
    /// The threads/<tid> directory of this thread
    pub node: Option<NodeId>,
}

impl Thread {
    pub fn new(tid: ThreadId, pid: ProcessId) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Runnable,
            suspended: false,
            pending_signal: false,
            parked: None,
            finished: None,
            node: None,
        }
    }
}

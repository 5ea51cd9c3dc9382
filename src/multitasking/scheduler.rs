use alloc::vec::Vec;

use hashbrown::HashMap;

use ydinabi::process::{ProcessId, ThreadId};
use ydintime::{Duration, Instant};

use crate::filesystem::Caller;

use super::event::{EventTable, Wakeup};
use super::process::Process;
use super::queues::{Queues, Schedule};
use super::thread::{Thread, ThreadState};
use super::waitfor::WaitFor;

/// Thread and process bookkeeping: who exists, who is runnable, who is
/// blocked on what, and the timer list. All wake-ups go through here.
#[derive(Debug)]
pub struct Scheduler {
    processes: HashMap<ProcessId, Process>,
    threads: HashMap<ThreadId, Thread>,
    queues: Queues,
    events: EventTable,
    next_pid: ProcessId,
    next_tid: ThreadId,
    now: Instant,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
            threads: HashMap::new(),
            queues: Queues::new(),
            events: EventTable::new(),
            next_pid: ProcessId::first(),
            next_tid: ThreadId::first(),
            now: Instant::ZERO,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Advances the clock and returns the threads whose sleep expired;
    /// they have already been made runnable.
    pub fn advance(&mut self, d: Duration) -> Vec<ThreadId> {
        self.now += d;
        let due = self.queues.tick(&self.now);
        for tid in &due {
            if let Some(t) = self.threads.get_mut(tid) {
                t.state = ThreadState::Runnable;
                if !t.suspended {
                    self.queues.give(*tid, Schedule::Running);
                }
            }
        }
        due
    }

    pub fn create_process(&mut self, uid: u32, gid: u32) -> ProcessId {
        let pid = self.next_pid;
        self.next_pid = self.next_pid.next();
        self.processes.insert(pid, Process::new(pid, uid, gid));
        pid
    }

    pub fn create_thread(&mut self, pid: ProcessId) -> ThreadId {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.next();
        self.threads.insert(tid, Thread::new(tid, pid));
        self.processes
            .get_mut(&pid)
            .expect("create_thread: no such process")
            .threads
            .push(tid);
        self.queues.give(tid, Schedule::Running);
        tid
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Credentials for a VFS operation. `None` is the kernel itself.
    pub fn caller_of(&self, pid: Option<ProcessId>) -> Caller {
        match pid.and_then(|p| self.processes.get(&p)) {
            Some(p) => p.caller(),
            None => Caller::KERNEL,
        }
    }

    /// Parks a thread according to a wait instruction
    pub fn block(&mut self, tid: ThreadId, wait: WaitFor) {
        let t = self.threads.get_mut(&tid).expect("block: no such thread");
        match wait {
            WaitFor::None => {
                t.state = ThreadState::Runnable;
                if !t.suspended {
                    self.queues.give(tid, Schedule::Running);
                }
            },
            WaitFor::Time(instant) => {
                t.state = ThreadState::Sleeping;
                self.queues.remove(tid);
                self.queues.give(tid, Schedule::Sleeping(instant));
            },
            WaitFor::Event { mask, object } => {
                t.state = ThreadState::Blocked;
                self.queues.remove(tid);
                self.events.insert(tid, mask, object);
            },
        }
    }

    /// Applies a wake-up: matching blocked threads become runnable.
    /// Returns them.
    pub fn wakeup(&mut self, wake: Wakeup) -> Vec<ThreadId> {
        let threads = &self.threads;
        let woken = self
            .events
            .take_matching(wake, |tid| threads.get(&tid).map(|t| t.pid));
        for tid in &woken {
            let t = self.threads.get_mut(tid).expect("woke unknown thread");
            t.state = ThreadState::Runnable;
            if !t.suspended {
                self.queues.give(*tid, Schedule::Running);
            }
        }
        if !woken.is_empty() {
            log::trace!("wakeup {:?} -> {:?}", wake, woken);
        }
        woken
    }

    pub fn wakeup_all(&mut self, wakes: impl IntoIterator<Item = Wakeup>) {
        for w in wakes {
            self.wakeup(w);
        }
    }

    /// Marks a signal pending and kicks the thread out of any wait state
    /// so its blocked call can return `interrupted`.
    pub fn deliver_signal(&mut self, tid: ThreadId) {
        let t = match self.threads.get_mut(&tid) {
            Some(t) => t,
            None => return,
        };
        t.pending_signal = true;
        match t.state {
            ThreadState::Runnable => {},
            ThreadState::Sleeping | ThreadState::Blocked => {
                t.state = ThreadState::Runnable;
                let suspended = t.suspended;
                self.events.remove(tid);
                self.queues.remove(tid);
                if !suspended {
                    self.queues.give(tid, Schedule::Running);
                }
            },
        }
    }

    /// Next thread that can actually run. Stale queue entries (exited or
    /// re-blocked or suspended threads) are skipped.
    pub fn take_runnable(&mut self) -> Option<ThreadId> {
        while let Some(tid) = self.queues.take() {
            if let Some(t) = self.threads.get(&tid) {
                if t.state == ThreadState::Runnable && !t.suspended {
                    return Some(tid);
                }
            }
        }
        None
    }

    pub fn suspend(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.suspended = true;
            self.queues.remove(tid);
        }
    }

    pub fn resume(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.suspended = false;
            if t.state == ThreadState::Runnable {
                self.queues.give(tid, Schedule::Running);
            }
        }
    }

    /// Detaches a thread from all scheduler structures and its process.
    /// The caller handles namespace and lock-table cleanup.
    pub fn remove_thread(&mut self, tid: ThreadId) -> Option<Thread> {
        let t = self.threads.remove(&tid)?;
        self.queues.remove(tid);
        self.events.remove(tid);
        if let Some(p) = self.processes.get_mut(&t.pid) {
            p.threads.retain(|x| *x != tid);
        }
        Some(t)
    }

    pub fn remove_process(&mut self, pid: ProcessId) -> Option<Process> {
        let p = self.processes.remove(&pid)?;
        debug_assert!(p.threads.is_empty(), "removing process with live threads");
        Some(p)
    }

    /// Whether the thread is listed on the timer queue
    pub fn is_on_timer_list(&self, tid: ThreadId) -> bool {
        self.queues.is_sleeping(tid)
    }

    /// Whether the thread has a blocked-thread event record
    pub fn is_waiting(&self, tid: ThreadId) -> bool {
        self.events.contains(tid)
    }
}

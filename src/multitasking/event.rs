use alloc::vec::Vec;

use hashbrown::HashMap;

use ydinabi::event::EventMask;
use ydinabi::process::{ProcessId, ThreadId};

use super::waitfor::WaitObject;

/// What a single blocked thread is waiting for. A thread is blocked on at
/// most one record at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub mask: EventMask,
    pub object: Option<WaitObject>,
}

/// Who a wake-up is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeTarget {
    /// One specific thread (`notify`)
    Thread(ThreadId),
    /// Every thread of a process (a client arrived for its driver)
    Process(ProcessId),
    /// Every thread waiting on the object, or on no object at all
    Object(WaitObject),
    /// Every waiter of the mask (single-pipe reply broadcast)
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub target: WakeTarget,
    pub mask: EventMask,
}

impl Wakeup {
    pub fn thread(tid: ThreadId, mask: EventMask) -> Self {
        Self {
            target: WakeTarget::Thread(tid),
            mask,
        }
    }

    pub fn process(pid: ProcessId, mask: EventMask) -> Self {
        Self {
            target: WakeTarget::Process(pid),
            mask,
        }
    }

    pub fn object(object: WaitObject, mask: EventMask) -> Self {
        Self {
            target: WakeTarget::Object(object),
            mask,
        }
    }

    pub fn all(mask: EventMask) -> Self {
        Self {
            target: WakeTarget::All,
            mask,
        }
    }
}

/// One record per blocked thread, keyed by thread id
#[derive(Debug, Default)]
pub struct EventTable {
    records: HashMap<ThreadId, EventRecord>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tid: ThreadId, mask: EventMask, object: Option<WaitObject>) {
        debug_assert!(!mask.is_empty(), "waiting on an empty mask");
        let prev = self.records.insert(tid, EventRecord { mask, object });
        debug_assert!(prev.is_none(), "thread blocked twice");
    }

    /// Removes the record of `tid`. Returns whether one existed.
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        self.records.remove(&tid).is_some()
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.records.contains_key(&tid)
    }

    pub fn record(&self, tid: ThreadId) -> Option<&EventRecord> {
        self.records.get(&tid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Removes and returns all threads the wake-up applies to.
    /// `pid_of` resolves a thread to its process for process-targeted
    /// wake-ups.
    pub fn take_matching<F>(&mut self, wake: Wakeup, pid_of: F) -> Vec<ThreadId>
    where
        F: Fn(ThreadId) -> Option<ProcessId>,
    {
        let mut woken = Vec::new();
        self.records.retain(|tid, rec| {
            if !rec.mask.intersects(wake.mask) {
                return true;
            }
            let hit = match wake.target {
                WakeTarget::Thread(t) => *tid == t,
                WakeTarget::Process(p) => pid_of(*tid) == Some(p),
                WakeTarget::Object(o) => rec.object.map_or(true, |ro| ro == o),
                WakeTarget::All => true,
            };
            if hit {
                woken.push(*tid);
            }
            !hit
        });
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> ThreadId {
        ThreadId::from_u64(n)
    }

    fn p(n: u64) -> ProcessId {
        ProcessId::from_u64(n)
    }

    #[test]
    fn mask_must_intersect() {
        let mut e = EventTable::new();
        e.insert(t(1), EventMask::RECEIVED_MSG, None);
        let woken = e.take_matching(Wakeup::all(EventMask::CLIENT), |_| None);
        assert!(woken.is_empty());
        let woken = e.take_matching(
            Wakeup::all(EventMask::CLIENT | EventMask::RECEIVED_MSG),
            |_| None,
        );
        assert_eq!(woken, [t(1)]);
        assert!(!e.contains(t(1)));
    }

    #[test]
    fn object_wake_matches_exact_and_objectless_records() {
        let mut e = EventTable::new();
        let obj = WaitObject::Process(p(1));
        let other = WaitObject::Process(p(2));
        e.insert(t(1), EventMask::THREAD_DIED, Some(obj));
        e.insert(t(2), EventMask::THREAD_DIED, Some(other));
        e.insert(t(3), EventMask::THREAD_DIED, None);

        let mut woken = e.take_matching(Wakeup::object(obj, EventMask::THREAD_DIED), |_| None);
        woken.sort();
        assert_eq!(woken, [t(1), t(3)]);
        assert!(e.contains(t(2)));
    }

    #[test]
    fn process_wake_resolves_thread_owners() {
        let mut e = EventTable::new();
        e.insert(t(1), EventMask::CLIENT, None);
        e.insert(t(2), EventMask::CLIENT, None);
        let woken = e.take_matching(Wakeup::process(p(7), EventMask::CLIENT), |tid| {
            if tid == t(1) {
                Some(p(7))
            } else {
                Some(p(8))
            }
        });
        assert_eq!(woken, [t(1)]);
    }

    #[test]
    fn thread_wake_ignores_object() {
        let mut e = EventTable::new();
        e.insert(t(1), EventMask::USER_1, Some(WaitObject::Process(p(9))));
        let woken = e.take_matching(Wakeup::thread(t(1), EventMask::USER_1), |_| None);
        assert_eq!(woken, [t(1)]);
    }
}

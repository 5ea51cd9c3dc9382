use alloc::vec::Vec;

use bitflags::bitflags;
use hashbrown::HashMap;

use ydinabi::event::EventMask;
use ydinabi::process::{ProcessId, ThreadId};

use crate::filesystem::error::{ErrorCode, IoError, IoResult};

use super::event::Wakeup;
use super::waitfor::{WaitFor, WaitObject};

bitflags! {
    pub struct LockFlags: u16 {
        const EXCLUSIVE = 1 << 0;
    }
}

/// Advisory locks are keyed per process or globally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Global,
    Process(ProcessId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub scope: LockScope,
    /// Opaque token chosen by user space
    pub ident: u32,
}

#[derive(Debug)]
struct LockRecord {
    holder: Option<ThreadId>,
    flags: LockFlags,
    /// Threads blocked in `acquire`, oldest first
    waiting: Vec<ThreadId>,
}

/// Table of named advisory locks
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<LockKey, LockRecord>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock or asks the caller to wait for its release. The
    /// waiting thread stays queued, so a later retry keeps its place.
    pub fn acquire(&mut self, key: LockKey, tid: ThreadId, flags: LockFlags) -> IoResult<()> {
        match self.locks.get_mut(&key) {
            None => {
                self.locks.insert(
                    key,
                    LockRecord {
                        holder: Some(tid),
                        flags,
                        waiting: Vec::new(),
                    },
                );
                Ok(())
            },
            Some(rec) => match rec.holder {
                None => {
                    rec.holder = Some(tid);
                    rec.flags = flags;
                    rec.waiting.retain(|t| *t != tid);
                    Ok(())
                },
                Some(h) if h == tid => Err(ErrorCode::invalid_args.into()),
                Some(_) => {
                    if !rec.waiting.contains(&tid) {
                        rec.waiting.push(tid);
                    }
                    Err(IoError::RepeatAfter(WaitFor::event_on(
                        EventMask::UNLOCK,
                        WaitObject::Lock(key),
                    )))
                },
            },
        }
    }

    /// Releases the lock and hands back the wake-up for the next waiter,
    /// if any. Unknown or already-free locks are an argument error.
    pub fn release(&mut self, key: LockKey) -> Result<Option<Wakeup>, ErrorCode> {
        let rec = self
            .locks
            .get_mut(&key)
            .ok_or(ErrorCode::invalid_args)?;
        if rec.holder.is_none() {
            return Err(ErrorCode::invalid_args);
        }
        rec.holder = None;
        let wake = rec
            .waiting
            .first()
            .map(|t| Wakeup::thread(*t, EventMask::UNLOCK));
        if rec.waiting.is_empty() {
            self.locks.remove(&key);
        }
        Ok(wake)
    }

    pub fn holder(&self, key: LockKey) -> Option<ThreadId> {
        self.locks.get(&key).and_then(|r| r.holder)
    }

    /// Drops a thread's queue positions without touching what it holds.
    /// Used when a blocked `acquire` is interrupted by a signal.
    pub fn forget_waiter(&mut self, tid: ThreadId) {
        self.locks.retain(|_, rec| {
            rec.waiting.retain(|t| *t != tid);
            rec.holder.is_some() || !rec.waiting.is_empty()
        });
    }

    /// Scrubs a dying or signalled thread out of the table: releases
    /// everything it holds and forgets its queue positions. Returns the
    /// wake-ups for the next waiters.
    pub fn remove_thread(&mut self, tid: ThreadId) -> Vec<Wakeup> {
        let mut wakes = Vec::new();
        let keys: Vec<LockKey> = self.locks.keys().copied().collect();
        for key in keys {
            let rec = self.locks.get_mut(&key).expect("lock vanished");
            rec.waiting.retain(|t| *t != tid);
            if rec.holder == Some(tid) {
                rec.holder = None;
                if let Some(t) = rec.waiting.first() {
                    wakes.push(Wakeup::thread(*t, EventMask::UNLOCK));
                }
            }
            if rec.holder.is_none() && rec.waiting.is_empty() {
                self.locks.remove(&key);
            }
        }
        wakes
    }

    /// Drops all process-scoped locks of an exiting process
    pub fn remove_process(&mut self, pid: ProcessId) {
        self.locks
            .retain(|key, _| key.scope != LockScope::Process(pid));
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> ThreadId {
        ThreadId::from_u64(n)
    }

    fn key(ident: u32) -> LockKey {
        LockKey {
            scope: LockScope::Global,
            ident,
        }
    }

    #[test]
    fn uncontended_lock_cycle() {
        let mut l = LockTable::new();
        l.acquire(key(1), t(1), LockFlags::EXCLUSIVE).unwrap();
        assert_eq!(l.holder(key(1)), Some(t(1)));
        assert!(l.release(key(1)).unwrap().is_none());
        assert_eq!(l.len(), 0);
    }

    #[test]
    fn contended_lock_queues_and_wakes_in_order() {
        let mut l = LockTable::new();
        l.acquire(key(1), t(1), LockFlags::EXCLUSIVE).unwrap();
        assert!(matches!(
            l.acquire(key(1), t(2), LockFlags::EXCLUSIVE),
            Err(IoError::RepeatAfter(_))
        ));
        assert!(matches!(
            l.acquire(key(1), t(3), LockFlags::EXCLUSIVE),
            Err(IoError::RepeatAfter(_))
        ));

        let wake = l.release(key(1)).unwrap().unwrap();
        assert_eq!(wake, Wakeup::thread(t(2), EventMask::UNLOCK));
        l.acquire(key(1), t(2), LockFlags::EXCLUSIVE).unwrap();
        let wake = l.release(key(1)).unwrap().unwrap();
        assert_eq!(wake, Wakeup::thread(t(3), EventMask::UNLOCK));
    }

    #[test]
    fn relock_by_holder_is_an_error() {
        let mut l = LockTable::new();
        l.acquire(key(1), t(1), LockFlags::EXCLUSIVE).unwrap();
        assert!(matches!(
            l.acquire(key(1), t(1), LockFlags::EXCLUSIVE),
            Err(IoError::Code(ErrorCode::invalid_args))
        ));
    }

    #[test]
    fn release_of_free_lock_is_an_error() {
        let mut l = LockTable::new();
        assert_eq!(l.release(key(1)).unwrap_err(), ErrorCode::invalid_args);
    }

    #[test]
    fn dying_thread_releases_and_dequeues() {
        let mut l = LockTable::new();
        l.acquire(key(1), t(1), LockFlags::EXCLUSIVE).unwrap();
        let _ = l.acquire(key(1), t(2), LockFlags::EXCLUSIVE);
        let wakes = l.remove_thread(t(1));
        assert_eq!(wakes, [Wakeup::thread(t(2), EventMask::UNLOCK)]);
        // t2 can now take it
        l.acquire(key(1), t(2), LockFlags::EXCLUSIVE).unwrap();
    }
}

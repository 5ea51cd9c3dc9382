use alloc::collections::VecDeque;
use alloc::vec::Vec;

use ydinabi::process::ThreadId;
use ydintime::Instant;

/// Where a thread goes after its current kernel entry
#[derive(Debug, Clone, Copy)]
pub enum Schedule {
    /// Run again on the next free slot
    Running,
    /// Run after specified moment
    Sleeping(Instant),
}

#[derive(Debug, Default)]
pub struct Queues {
    /// Threads currently in the running queue
    running: VecDeque<ThreadId>,
    /// Threads sleeping until a specified time, sorted by wake-up time
    sleeping: VecDeque<(Instant, ThreadId)>,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn give(&mut self, tid: ThreadId, s: Schedule) {
        match s {
            Schedule::Running => {
                if !self.running.contains(&tid) {
                    self.running.push_back(tid);
                }
            },
            Schedule::Sleeping(instant) => {
                let i = p_index_vecdeque(&self.sleeping, &instant);
                self.sleeping.insert(i, (instant, tid));
            },
        }
    }

    pub fn take(&mut self) -> Option<ThreadId> {
        self.running.pop_front()
    }

    pub fn remove(&mut self, tid: ThreadId) {
        self.running.retain(|t| *t != tid);
        self.sleeping.retain(|(_, t)| *t != tid);
    }

    pub fn is_sleeping(&self, tid: ThreadId) -> bool {
        self.sleeping.iter().any(|(_, t)| *t == tid)
    }

    pub fn runnable_count(&self) -> usize {
        self.running.len()
    }

    /// Update when the clock ticks; returns the threads whose wake-up
    /// time has passed
    pub fn tick(&mut self, now: &Instant) -> Vec<ThreadId> {
        let mut due = Vec::new();
        while let Some((wakeup, _)) = self.sleeping.front() {
            if now >= wakeup {
                let (_, tid) = self.sleeping.pop_front().expect("sleep queue empty");
                due.push(tid);
            } else {
                break;
            }
        }
        due
    }
}

/// Priority-queue-like insertion index in a vecdeque of pairs;
/// the first item of the pair is the priority key
fn p_index_vecdeque<K: Ord, V>(v: &VecDeque<(K, V)>, t: &K) -> usize {
    let mut i = 0;
    while i < v.len() {
        if v[i].0 > *t {
            return i;
        }
        i += 1;
    }
    v.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> ThreadId {
        ThreadId::from_u64(n)
    }

    #[test]
    fn sleep_queue_stays_sorted() {
        let mut q = Queues::new();
        q.give(t(1), Schedule::Sleeping(Instant::from_millis(30)));
        q.give(t(2), Schedule::Sleeping(Instant::from_millis(10)));
        q.give(t(3), Schedule::Sleeping(Instant::from_millis(20)));

        assert!(q.tick(&Instant::from_millis(5)).is_empty());
        assert_eq!(q.tick(&Instant::from_millis(20)), [t(2), t(3)]);
        assert_eq!(q.tick(&Instant::from_millis(100)), [t(1)]);
    }

    #[test]
    fn running_queue_deduplicates() {
        let mut q = Queues::new();
        q.give(t(1), Schedule::Running);
        q.give(t(1), Schedule::Running);
        assert_eq!(q.take(), Some(t(1)));
        assert_eq!(q.take(), None);
    }

    #[test]
    fn remove_covers_both_queues() {
        let mut q = Queues::new();
        q.give(t(1), Schedule::Running);
        q.give(t(2), Schedule::Sleeping(Instant::from_millis(10)));
        q.remove(t(1));
        q.remove(t(2));
        assert_eq!(q.take(), None);
        assert!(q.tick(&Instant::from_millis(99)).is_empty());
    }
}

use ydinabi::event::EventMask;
use ydinabi::process::ProcessId;
use ydintime::Instant;

use crate::filesystem::NodeId;

use super::lock::LockKey;

/// Instructions for scheduling a thread whose system call could not
/// complete yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// Run again on the next free slot
    None,
    /// Run after the specified moment
    Time(Instant),
    /// Run when one of the masked events fires. With an object, only
    /// wake-ups for that object (or broadcasts) count.
    Event {
        mask: EventMask,
        object: Option<WaitObject>,
    },
}

impl WaitFor {
    pub fn event(mask: EventMask) -> Self {
        Self::Event { mask, object: None }
    }

    pub fn event_on(mask: EventMask, object: WaitObject) -> Self {
        Self::Event {
            mask,
            object: Some(object),
        }
    }
}

/// The object a wait is tied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitObject {
    Node(NodeId),
    Process(ProcessId),
    Lock(LockKey),
}

use core::fmt;
use core::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// ProcessId is stored as `NonZeroU64` so that `Option<ProcessId>` costs
/// no extra space. `None` in owner/caller positions denotes the kernel
/// pseudo-process, which has no id of its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ProcessId(NonZeroU64);
impl ProcessId {
    pub const fn first() -> Self {
        Self(unsafe { NonZeroU64::new_unchecked(1) })
    }

    /// Only to be used when deserializing values produced by the kernel
    pub fn from_u64(value: u64) -> Self {
        Self(NonZeroU64::new(value).expect("zero ProcessId"))
    }

    /// Only to be used by the process manager
    pub fn next(self) -> Self {
        Self(NonZeroU64::new(self.0.get() + 1).expect("ProcessId overflow"))
    }

    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}
impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread ids are globally unique, not per-process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ThreadId(NonZeroU64);
impl ThreadId {
    pub const fn first() -> Self {
        Self(unsafe { NonZeroU64::new_unchecked(1) })
    }

    pub fn from_u64(value: u64) -> Self {
        Self(NonZeroU64::new(value).expect("zero ThreadId"))
    }

    pub fn next(self) -> Self {
        Self(NonZeroU64::new(self.0.get() + 1).expect("ThreadId overflow"))
    }

    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}
impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final status of a process, stored when its last thread exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ProcessResult {
    /// The process exited with a return code
    Completed(i64),
    /// The process was terminated by a signal
    Killed,
}

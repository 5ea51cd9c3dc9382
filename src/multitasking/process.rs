use alloc::vec::Vec;

use ydinabi::process::{ProcessId, ProcessResult, ThreadId};

use crate::filesystem::{Caller, FileNo, NodeId};

/// A process: credential holder and thread container. Memory management
/// lives outside the core; the fields here are what the namespace and
/// the scheduler need.
#[derive(Debug)]
pub struct Process {
    pub pid: ProcessId,
    pub uid: u32,
    pub gid: u32,
    /// Live threads, in spawn order
    pub threads: Vec<ThreadId>,
    /// Handles this process acquired, one entry per acquisition.
    /// Shared GFT entries appear once per open.
    pub files: Vec<FileNo>,
    /// The /system/processes/<pid> directory
    pub node: Option<NodeId>,
    /// The threads/ directory below it
    pub thread_dir: Option<NodeId>,
    /// Set when the last thread exits
    pub result: Option<ProcessResult>,
}

impl Process {
    pub fn new(pid: ProcessId, uid: u32, gid: u32) -> Self {
        Self {
            pid,
            uid,
            gid,
            threads: Vec::new(),
            files: Vec::new(),
            node: None,
            thread_dir: None,
            result: None,
        }
    }

    pub fn caller(&self) -> Caller {
        Caller {
            pid: Some(self.pid),
            uid: self.uid,
            gid: self.gid,
        }
    }
}

//! Delegation of real-path operations to the filesystem driver.
//!
//! The node tree only shadows /system and /dev; everything else belongs
//! to the real filesystem. Operations on such paths are encoded as
//! [`Request`] messages and pushed onto a kernel-owned channel of the
//! driver registered under the name `fs`. The calling thread then blocks
//! like any other channel client until the [`Response`] arrives. One
//! request is in flight at a time; further delegating threads queue on
//! the channel's wake-up.

use ydinabi::fs::protocol::{Request, Response, FS_DELEGATE_MSG};
use ydinabi::process::ThreadId;

pub use ydinabi::fs::protocol as fs_protocol;

use super::gft::FileNo;
use super::node::NodeId;

#[derive(Debug)]
struct Pending {
    tid: ThreadId,
    /// Request has been pushed onto the channel
    sent: bool,
}

/// Delegation state: the kernel's client channel to the fs driver and
/// the thread currently mid-request.
#[derive(Debug, Default)]
pub struct RealFs {
    chan: Option<(FileNo, NodeId)>,
    pending: Option<Pending>,
}

impl RealFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.chan.is_some()
    }

    pub fn channel(&self) -> Option<(FileNo, NodeId)> {
        self.chan
    }

    pub fn register(&mut self, file: FileNo, node: NodeId) {
        log::debug!("fs driver registered, kernel channel {:?}", node);
        self.chan = Some((file, node));
    }

    pub fn unregister(&mut self) {
        log::debug!("fs driver gone");
        self.chan = None;
        self.pending = None;
    }

    /// Claims the single request slot for `tid`. Returns the sent state
    /// when the slot is (or already was) ours, `None` when another
    /// thread's request is in flight.
    pub fn claim(&mut self, tid: ThreadId) -> Option<bool> {
        match &self.pending {
            None => {
                self.pending = Some(Pending { tid, sent: false });
                Some(false)
            },
            Some(p) if p.tid == tid => Some(p.sent),
            Some(_) => None,
        }
    }

    pub fn mark_sent(&mut self, tid: ThreadId) {
        match &mut self.pending {
            Some(p) if p.tid == tid => p.sent = true,
            _ => debug_assert!(false, "marking someone else's request"),
        }
    }

    pub fn finish(&mut self, tid: ThreadId) {
        debug_assert!(
            matches!(&self.pending, Some(p) if p.tid == tid),
            "finishing someone else's request"
        );
        self.pending = None;
    }

    /// Drops the claim of a thread that got cancelled mid-request
    pub fn forget(&mut self, tid: ThreadId) {
        if matches!(&self.pending, Some(p) if p.tid == tid) {
            self.pending = None;
        }
    }
}

/// Encodes a request for the wire: delegation header plus pinecone body
pub fn encode_request(req: &Request) -> (u8, alloc::vec::Vec<u8>) {
    let body = pinecone::to_vec(req).expect("fs request encoding cannot fail");
    (FS_DELEGATE_MSG, body)
}

pub fn decode_response(payload: &[u8]) -> Option<Response> {
    pinecone::from_bytes(payload).ok()
}

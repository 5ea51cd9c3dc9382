use alloc::collections::VecDeque;
use alloc::vec::Vec;

use ydinabi::ErrorCode;

use super::gft::FileNo;

/// Max number of undelivered messages per direction. Hitting the limit
/// behaves like an allocation failure on message creation.
pub const CHANNEL_QUEUE_LIMIT: usize = 128;

/// Max size of a single message, header included
pub const CHANNEL_MSG_LIMIT: usize = 0x1_0000;

/// One length-delimited message. The kernel treats the bytes as opaque;
/// `send_msg`/`receive_msg` prefix and strip the 5-byte header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
}

/// Which of the two FIFOs of a channel to operate on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Client → server requests
    Send,
    /// Server → client replies
    Recv,
}

/// Payload of a CHANNEL node: two message FIFOs plus the partial-read
/// lock. A channel belongs to exactly one client process; the serving
/// side reaches it through the parent DRIVER node.
#[derive(Debug, Default)]
pub struct Channel {
    send: VecDeque<Message>,
    recv: VecDeque<Message>,
    /// Set while a handle is mid-way through a partially consumed head
    /// message of the receive list; other handles must not read then
    locked_by: Option<FileNo>,
    /// Client is gone; destroy once the send list has been drained
    doomed: bool,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, q: Queue) -> &VecDeque<Message> {
        match q {
            Queue::Send => &self.send,
            Queue::Recv => &self.recv,
        }
    }

    fn list_mut(&mut self, q: Queue) -> &mut VecDeque<Message> {
        match q {
            Queue::Send => &mut self.send,
            Queue::Recv => &mut self.recv,
        }
    }

    pub fn has_request(&self) -> bool {
        !self.send.is_empty()
    }

    pub fn has_reply(&self) -> bool {
        !self.recv.is_empty()
    }

    pub fn queued(&self, q: Queue) -> usize {
        self.list(q).len()
    }

    pub fn locked_by(&self) -> Option<FileNo> {
        self.locked_by
    }

    pub fn lock(&mut self, file: FileNo) {
        debug_assert!(self.locked_by.is_none() || self.locked_by == Some(file));
        self.locked_by = Some(file);
    }

    pub fn unlock(&mut self) {
        self.locked_by = None;
    }

    /// Releases the partial-read lock if `file` holds it.
    /// Returns whether a lock was released.
    pub fn unlock_if_held_by(&mut self, file: FileNo) -> bool {
        if self.locked_by == Some(file) {
            self.locked_by = None;
            true
        } else {
            false
        }
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Marks the channel for destruction once the send list drains, and
    /// drops the replies since no reader remains.
    pub fn doom(&mut self) {
        self.doomed = true;
        self.recv.clear();
    }

    /// Appends a message. Fails like an allocation failure when the queue
    /// or message size limit is hit; the queue is left untouched then.
    pub fn push(&mut self, q: Queue, data: Vec<u8>) -> Result<(), ErrorCode> {
        if data.len() > CHANNEL_MSG_LIMIT {
            return Err(ErrorCode::not_enough_mem);
        }
        let list = self.list_mut(q);
        if list.len() >= CHANNEL_QUEUE_LIMIT {
            return Err(ErrorCode::not_enough_mem);
        }
        list.push_back(Message { data });
        Ok(())
    }

    /// Removes and returns the head message
    pub fn pop(&mut self, q: Queue) -> Option<Message> {
        self.list_mut(q).pop_front()
    }

    /// Reads from the head message starting at `offset`, at most `count`
    /// bytes. Returns the bytes and whether the message was thereby fully
    /// consumed (and removed). `None` if the list is empty.
    pub fn read_partial(&mut self, q: Queue, offset: usize, count: usize) -> Option<(Vec<u8>, bool)> {
        let list = self.list_mut(q);
        let msg = list.front()?;
        let start = core::cmp::min(offset, msg.data.len());
        let end = core::cmp::min(start + count, msg.data.len());
        let out = msg.data[start..end].to_vec();
        let done = end >= msg.data.len();
        if done {
            list.pop_front();
        }
        Some((out, done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn fifo_per_queue() {
        let mut c = Channel::new();
        c.push(Queue::Send, vec![1]).unwrap();
        c.push(Queue::Send, vec![2]).unwrap();
        c.push(Queue::Recv, vec![9]).unwrap();
        assert_eq!(c.pop(Queue::Send).unwrap().data, [1]);
        assert_eq!(c.pop(Queue::Send).unwrap().data, [2]);
        assert_eq!(c.pop(Queue::Recv).unwrap().data, [9]);
        assert!(c.pop(Queue::Recv).is_none());
    }

    #[test]
    fn partial_read_consumes_head_only_when_exhausted() {
        let mut c = Channel::new();
        c.push(Queue::Recv, vec![0u8; 100]).unwrap();
        c.push(Queue::Recv, vec![1u8; 3]).unwrap();

        let (part, done) = c.read_partial(Queue::Recv, 0, 40).unwrap();
        assert_eq!(part.len(), 40);
        assert!(!done);
        assert_eq!(c.queued(Queue::Recv), 2);

        let (rest, done) = c.read_partial(Queue::Recv, 40, 60).unwrap();
        assert_eq!(rest.len(), 60);
        assert!(done);
        assert_eq!(c.queued(Queue::Recv), 1);

        let (next, done) = c.read_partial(Queue::Recv, 0, 10).unwrap();
        assert_eq!(next, [1u8; 3]);
        assert!(done);
    }

    #[test]
    fn queue_limit_reports_memory_pressure() {
        let mut c = Channel::new();
        for _ in 0..CHANNEL_QUEUE_LIMIT {
            c.push(Queue::Send, vec![0]).unwrap();
        }
        assert_eq!(
            c.push(Queue::Send, vec![0]),
            Err(ErrorCode::not_enough_mem)
        );
        assert_eq!(c.queued(Queue::Send), CHANNEL_QUEUE_LIMIT);
    }

    #[test]
    fn doom_clears_replies_keeps_requests() {
        let mut c = Channel::new();
        c.push(Queue::Send, vec![1]).unwrap();
        c.push(Queue::Recv, vec![2]).unwrap();
        c.doom();
        assert!(c.has_request());
        assert!(!c.has_reply());
    }
}

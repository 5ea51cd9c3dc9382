//! The virtual filesystem: one name-to-inode tree that carries ordinary
//! in-memory files, per-process state, pipes and the bidirectional typed
//! message channels drivers serve requests through.
//!
//! All tables here are owned by [`crate::kernel::Kernel`]; operations
//! that can wake blocked threads take the scheduler as an argument and
//! apply their wake-ups before returning. Operations that cannot
//! complete yet return [`IoError::RepeatAfter`] and mutate nothing that
//! would be illegal to observe from another thread.

use alloc::format;
use alloc::vec::Vec;

use ydinabi::event::EventMask;
use ydinabi::fs::protocol::Request;
use ydinabi::fs::{DeviceId, DriverKind, FileInfo, MsgHeader, OpenFlags, Whence};
use ydinabi::process::{ProcessId, ThreadId};

use crate::multitasking::{Scheduler, WaitFor, WaitObject, Wakeup};

pub mod channel;
pub mod error;
pub mod file;
pub mod gft;
pub mod info;
pub mod node;
pub mod path;
pub mod pipe;
pub mod real;
pub mod server;

use self::channel::Queue;
use self::error::ErrorCode;
use self::file::{InfoSource, MemFile};
use self::gft::Gft;
use self::node::{AccessMode, ChannelRelease, NodeArena, NodeMode, NodePayload};
use self::real::RealFs;

pub use self::error::{IoError, IoResult};
pub use self::gft::{FileNo, FileTarget};
pub use self::node::{Caller, NodeId};
pub use self::path::{Path, PathBuf};

fn access_of(flags: OpenFlags) -> AccessMode {
    let mut a = AccessMode::empty();
    if flags.contains(OpenFlags::READ) {
        a |= AccessMode::READ;
    }
    if flags.contains(OpenFlags::WRITE) {
        a |= AccessMode::WRITE;
    }
    a
}

/// The flags that live on a GFT entry; APPEND and CREATE only steer the
/// open itself
fn handle_flags() -> OpenFlags {
    OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS | OpenFlags::NOBLOCK | OpenFlags::DRIVER
}

/// Wake-up for threads blocked on a node that has just been destroyed;
/// their retried operation then reports the tombstone.
fn destroyed_wake(id: NodeId) -> Wakeup {
    Wakeup::object(
        WaitObject::Node(id),
        EventMask::RECEIVED_MSG | EventMask::DATA_READABLE | EventMask::CLIENT,
    )
}

#[derive(Debug)]
pub struct VirtualFS {
    nodes: NodeArena,
    gft: Gft,
    real: RealFs,
    /// /system/pipe
    pipe_dir: NodeId,
    /// /system/processes
    procs_dir: NodeId,
    /// /dev
    dev_dir: NodeId,
    next_pipe: u64,
}

impl VirtualFS {
    pub fn new(max_nodes: usize, max_files: usize) -> Self {
        let mut nodes = NodeArena::new(max_nodes);
        let root = nodes.root();
        let k = Caller::KERNEL;
        let sys = nodes.create_dir(&k, root, "system").expect("init: /system");
        let pipe_dir = nodes.create_dir(&k, sys, "pipe").expect("init: pipe");
        // anyone may put scratch files and pipes here
        if let Some(n) = nodes.get_mut(pipe_dir) {
            n.mode |= NodeMode::GROUP_WRITE | NodeMode::OTHER_WRITE | NodeMode::STICKY;
        }
        let procs_dir = nodes
            .create_dir(&k, sys, "processes")
            .expect("init: processes");
        let devices = nodes.create_dir(&k, sys, "devices").expect("init: devices");
        nodes
            .create_synthetic(devices, "list", InfoSource::Devices)
            .expect("init: devices list");
        let dev_dir = nodes.create_dir(&k, root, "dev").expect("init: /dev");
        Self {
            nodes,
            gft: Gft::new(max_files),
            real: RealFs::new(),
            pipe_dir,
            procs_dir,
            dev_dir,
            next_pipe: 0,
        }
    }

    pub fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    // ------------------------------------------------------------------
    // opening and closing

    /// Opens a path. Driver nodes spawn a fresh channel for the caller;
    /// CREATE makes a missing final component come into existence as an
    /// empty file. Real paths surface as the `real_path` sentinel for the
    /// syscall layer to delegate.
    pub fn open_path(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        flags: OpenFlags,
        path_str: &str,
    ) -> IoResult<FileNo> {
        let clean = flags & handle_flags();
        if !clean.intersects(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS) {
            return Err(ErrorCode::invalid_args.into());
        }
        let path = Path::new(path_str);
        let create_with = if flags.contains(OpenFlags::CREATE) {
            Some(caller)
        } else {
            None
        };
        let (mut node_id, created) = self.nodes.resolve(path, create_with, true)?;

        let mode = self.nodes.live(node_id)?.mode();
        if !created {
            self.nodes.has_access(caller, node_id, access_of(clean))?;
        }
        if mode.is_driver() {
            // every client open gets its own channel; single-pipe drivers
            // share one among all clients
            node_id = if mode.contains(NodeMode::TYPE_DRIVER_SINGLEPIPE) {
                let shared = self.nodes.children(node_id).into_iter().find(|c| {
                    self.nodes.get(*c).map_or(false, |n| {
                        !n.is_tombstoned() && n.channel().map_or(false, |ch| !ch.is_doomed())
                    })
                });
                match shared {
                    Some(existing) => existing,
                    None => self.nodes.create_channel(caller, node_id)?,
                }
            } else {
                self.nodes.create_channel(caller, node_id)?
            };
        }

        let file = self.open_file(caller, clean, FileTarget::Virtual(node_id))?;
        if flags.contains(OpenFlags::APPEND) {
            if let Err(e) = self.seek(&*sched, file, 0, Whence::End) {
                // roll the open back; append to something unseekable is
                // the caller's error
                let _ = self.close_file(sched, file);
                return Err(e);
            }
        }
        log::trace!(
            "open {} flags={:?} -> {:?} node={:?}",
            path_str,
            clean,
            file,
            node_id
        );
        Ok(file)
    }

    /// Opens a handle onto a resolved target. Channels and pipes always
    /// get a fresh handle; for everything else an existing compatible
    /// entry is shared and a conflicting foreign writer is refused.
    pub fn open_file(
        &mut self,
        caller: &Caller,
        flags: OpenFlags,
        target: FileTarget,
    ) -> IoResult<FileNo> {
        let flags = flags & handle_flags();
        debug_assert!(flags.intersects(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS));

        let fresh_handle = match target {
            FileTarget::Virtual(id) => {
                let node = self.nodes.live(id)?;
                node.mode().is_channel() || node.mode().is_pipe()
            },
            FileTarget::Real { .. } => false,
        };
        if let FileTarget::Virtual(id) = target {
            self.nodes.has_access(caller, id, access_of(flags))?;
        }
        if !fresh_handle {
            match self.gft.find_shared(caller.pid, flags, target) {
                Ok(Some(existing)) => {
                    self.gft.used_mut(existing)?.ref_count += 1;
                    return Ok(existing);
                },
                Ok(None) => {},
                Err(code) => return Err(code.into()),
            }
        }

        let file = self.gft.allocate(caller.pid, flags, target)?;
        if let FileTarget::Virtual(id) = target {
            self.nodes.inc_ref(id);
            if let Some(NodePayload::Pipe(p)) =
                self.nodes.get_mut(id).map(|n| n.payload_mut())
            {
                p.add_handle(
                    flags.contains(OpenFlags::READ),
                    flags.contains(OpenFlags::WRITE),
                );
            }
        }
        Ok(file)
    }

    /// Drops one reference of a handle. The last reference also drops a
    /// node reference and runs the node-type close hook: channels get
    /// destroyed or deferred, drained pipes disappear, partial-read
    /// locks held by this handle are released.
    pub fn close_file(&mut self, sched: &mut Scheduler, file: FileNo) -> IoResult<()> {
        let (flags, target) = {
            let e = self.gft.used_mut(file)?;
            debug_assert!(e.ref_count > 0, "close: refcount zero");
            e.ref_count -= 1;
            if e.ref_count > 0 {
                log::trace!("close {:?}, {} refs remain", file, e.ref_count);
                return Ok(());
            }
            (e.flags(), e.target())
        };

        match target {
            FileTarget::Virtual(id) => {
                let mut wakes: Vec<Wakeup> = Vec::new();
                if let Some(node) = self.nodes.get_mut(id) {
                    match node.payload_mut() {
                        NodePayload::Channel(ch) => {
                            if ch.unlock_if_held_by(file) {
                                wakes.push(Wakeup::object(
                                    WaitObject::Node(id),
                                    EventMask::RECEIVED_MSG,
                                ));
                            }
                        },
                        NodePayload::Pipe(p) => {
                            p.remove_handle(
                                flags.contains(OpenFlags::READ),
                                flags.contains(OpenFlags::WRITE),
                            );
                            if !p.has_writers() {
                                // readers must see EOF now
                                wakes.push(Wakeup::object(
                                    WaitObject::Node(id),
                                    EventMask::DATA_READABLE,
                                ));
                            }
                        },
                        _ => {},
                    }
                }
                self.nodes.release_ref(id);
                if let Some(node) = self.nodes.get(id) {
                    if node.ref_count() == 0 && !node.is_tombstoned() {
                        if node.mode().is_channel() {
                            match self.nodes.release_channel(id) {
                                ChannelRelease::Destroyed(ids) => {
                                    wakes.extend(ids.into_iter().map(destroyed_wake));
                                },
                                ChannelRelease::Deferred => {},
                            }
                        } else if node.mode().is_pipe() {
                            let ids = self.nodes.destroy(id);
                            wakes.extend(ids.into_iter().map(destroyed_wake));
                        }
                    }
                }
                sched.wakeup_all(wakes);
            },
            FileTarget::Real { inode, device } => {
                self.real_notify_close(sched, inode, device);
            },
        }
        self.gft.release(file);
        Ok(())
    }

    pub fn incref(&mut self, file: FileNo) -> IoResult<()> {
        self.gft.used_mut(file)?.ref_count += 1;
        Ok(())
    }

    /// Handle inheritance on fork. Channels of multipipe drivers get a
    /// fresh channel node for the child, pipes a fresh handle with its
    /// own position; everything else shares the entry.
    pub fn inherit(&mut self, child: &Caller, file: FileNo) -> IoResult<FileNo> {
        let (flags, target) = {
            let e = self.gft.used(file)?;
            (e.flags(), e.target())
        };
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => {
                self.gft.used_mut(file)?.ref_count += 1;
                return Ok(file);
            },
        };
        let mode = self.nodes.live(id)?.mode();
        if mode.is_channel() {
            let (parent, _owner, single_pipe) = self.channel_parent(id)?;
            if single_pipe {
                self.gft.used_mut(file)?.ref_count += 1;
                return Ok(file);
            }
            let chan = self.nodes.create_channel(child, parent)?;
            self.open_file(child, flags, FileTarget::Virtual(chan))
        } else if mode.is_pipe() {
            self.open_file(child, flags, FileTarget::Virtual(id))
        } else {
            self.gft.used_mut(file)?.ref_count += 1;
            Ok(file)
        }
    }

    // ------------------------------------------------------------------
    // byte io

    /// Reads from a handle. Blocks (repeat-after) on empty channel
    /// replies and empty pipes; drains at most one channel message per
    /// call and honors the partial-read lock.
    pub fn read_file(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        file: FileNo,
        count: usize,
    ) -> IoResult<Vec<u8>> {
        let (flags, target, pos) = {
            let e = self.gft.used(file)?;
            (e.flags(), e.target(), e.position())
        };
        if !flags.contains(OpenFlags::READ) {
            return Err(ErrorCode::no_read_perm.into());
        }
        let id = match target {
            FileTarget::Virtual(id) => id,
            // real files are delegated a layer up
            FileTarget::Real { .. } => return Err(ErrorCode::unsupported_op.into()),
        };

        let mode = self.nodes.live(id)?.mode();
        if mode.is_channel() {
            return self.read_channel(sched, caller, file, id, flags, pos as usize, count);
        }

        match self.nodes.live_mut(id)?.payload_mut() {
            NodePayload::Directory => Err(ErrorCode::is_dir.into()),
            NodePayload::Driver(_) | NodePayload::Link(_) => {
                Err(ErrorCode::unsupported_op.into())
            },
            NodePayload::File(MemFile::Cache(c)) => {
                let out = c.read_at(pos as usize, count);
                self.gft.used_mut(file)?.position = pos + out.len() as u64;
                Ok(out)
            },
            NodePayload::File(MemFile::Synthetic(src)) => {
                let src = *src;
                let text = info::render(src, sched, &self.nodes, self.dev_dir);
                let bytes = text.as_bytes();
                let start = core::cmp::min(pos as usize, bytes.len());
                let end = core::cmp::min(start + count, bytes.len());
                let out = bytes[start..end].to_vec();
                self.gft.used_mut(file)?.position = pos + out.len() as u64;
                Ok(out)
            },
            NodePayload::Channel(_) => unreachable!("handled above via mode.is_channel()"),
            NodePayload::Pipe(p) => {
                let out = p.read(count);
                if !out.is_empty() {
                    // room for blocked writers now
                    sched.wakeup(Wakeup::object(
                        WaitObject::Node(id),
                        EventMask::DATA_READABLE,
                    ));
                    return Ok(out);
                }
                if !p.has_writers() || flags.contains(OpenFlags::NOBLOCK) || caller.is_kernel()
                {
                    Ok(Vec::new())
                } else {
                    Err(IoError::RepeatAfter(WaitFor::event_on(
                        EventMask::DATA_READABLE,
                        WaitObject::Node(id),
                    )))
                }
            },
        }
    }

    fn read_channel(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        file: FileNo,
        id: NodeId,
        flags: OpenFlags,
        pos: usize,
        count: usize,
    ) -> IoResult<Vec<u8>> {
        let (_, parent_owner, _) = self.channel_parent(id)?;
        let is_server = caller.pid.is_some() && caller.pid == parent_owner;

        // reading a partially consumed message of another handle would
        // tear it; wait until the holder finishes or closes
        let locked = self.nodes.live(id)?.channel().expect("not a channel").locked_by();
        if let Some(holder) = locked {
            if holder != file {
                if caller.is_kernel() {
                    // the kernel must never block here
                    return Ok(Vec::new());
                }
                return Err(IoError::RepeatAfter(WaitFor::event_on(
                    EventMask::RECEIVED_MSG,
                    WaitObject::Node(id),
                )));
            }
        }

        let q = if is_server { Queue::Send } else { Queue::Recv };
        let read = self
            .nodes
            .live_mut(id)?
            .channel_mut()
            .expect("not a channel")
            .read_partial(q, pos, count);
        match read {
            Some((data, done)) => {
                let ch = self
                    .nodes
                    .live_mut(id)?
                    .channel_mut()
                    .expect("not a channel");
                if done {
                    ch.unlock();
                    self.gft.used_mut(file)?.position = 0;
                    // other readers may go ahead
                    sched.wakeup(Wakeup::object(
                        WaitObject::Node(id),
                        EventMask::RECEIVED_MSG,
                    ));
                } else {
                    ch.lock(file);
                    self.gft.used_mut(file)?.position = (pos + data.len()) as u64;
                }
                Ok(data)
            },
            None => {
                if is_server || caller.is_kernel() || flags.contains(OpenFlags::NOBLOCK) {
                    // server reads never block: no client is waiting
                    Ok(Vec::new())
                } else {
                    Err(IoError::RepeatAfter(WaitFor::event_on(
                        EventMask::RECEIVED_MSG,
                        WaitObject::Node(id),
                    )))
                }
            },
        }
    }

    /// Writes through a handle. On channels the buffer becomes one raw
    /// message; the position does not move then.
    pub fn write_file(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        file: FileNo,
        buf: &[u8],
    ) -> IoResult<usize> {
        let (flags, target, pos) = {
            let e = self.gft.used(file)?;
            (e.flags(), e.target(), e.position())
        };
        if !flags.contains(OpenFlags::WRITE) {
            return Err(ErrorCode::no_write_perm.into());
        }
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::unsupported_op.into()),
        };

        let mode = self.nodes.live(id)?.mode();
        if mode.is_channel() {
            self.chan_push(sched, caller, id, buf.to_vec())?;
            return Ok(buf.len());
        }

        match self.nodes.live_mut(id)?.payload_mut() {
            NodePayload::Directory => Err(ErrorCode::is_dir.into()),
            NodePayload::Driver(_) | NodePayload::Link(_) => {
                Err(ErrorCode::unsupported_op.into())
            },
            NodePayload::File(MemFile::Synthetic(_)) => Err(ErrorCode::no_write_perm.into()),
            NodePayload::Channel(_) => unreachable!("handled above via mode.is_channel()"),
            NodePayload::File(MemFile::Cache(c)) => {
                let n = c.write_at(pos as usize, buf)?;
                self.gft.used_mut(file)?.position = pos + n as u64;
                Ok(n)
            },
            NodePayload::Pipe(p) => {
                if !p.has_readers() {
                    return Err(ErrorCode::invalid_file.into());
                }
                let n = p.write(buf);
                if n == 0 {
                    return Err(IoError::RepeatAfter(WaitFor::event_on(
                        EventMask::DATA_READABLE,
                        WaitObject::Node(id),
                    )));
                }
                sched.wakeup(Wakeup::object(
                    WaitObject::Node(id),
                    EventMask::DATA_READABLE,
                ));
                Ok(n)
            },
        }
    }

    /// Appends one message to a channel, picking the direction from the
    /// writer's identity, and wakes the receiving side.
    fn chan_push(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        id: NodeId,
        data: Vec<u8>,
    ) -> IoResult<()> {
        let (_, parent_owner, single_pipe) = self.channel_parent(id)?;
        // the kernel talking to a driver is a client, even to its own
        let is_server = caller.pid.is_some() && caller.pid == parent_owner;

        let ch = self
            .nodes
            .live_mut(id)?
            .channel_mut()
            .ok_or(ErrorCode::unsupported_op)?;
        if is_server {
            if ch.is_doomed() {
                // client already gone; nobody will ever read this
                log::trace!("reply to doomed channel {:?} dropped", id);
                return Ok(());
            }
            ch.push(Queue::Recv, data).map_err(IoError::Code)?;
            if single_pipe {
                // we cannot know which client the reply is for
                sched.wakeup(Wakeup::all(EventMask::RECEIVED_MSG));
            } else {
                sched.wakeup(Wakeup::object(
                    WaitObject::Node(id),
                    EventMask::RECEIVED_MSG,
                ));
            }
        } else {
            ch.push(Queue::Send, data).map_err(IoError::Code)?;
            if let Some(owner) = parent_owner {
                sched.wakeup(Wakeup::process(owner, EventMask::CLIENT));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // typed messages

    /// Sends one typed message: 5-byte header plus payload
    pub fn send_msg(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        file: FileNo,
        msg_id: u8,
        data: &[u8],
    ) -> IoResult<()> {
        let (flags, target) = {
            let e = self.gft.used(file)?;
            (e.flags(), e.target())
        };
        if !flags.contains(OpenFlags::MSGS) {
            return Err(ErrorCode::no_exec_perm.into());
        }
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::invalid_file.into()),
        };
        if !self.nodes.live(id)?.mode().is_channel() {
            return Err(ErrorCode::unsupported_op.into());
        }
        let header = MsgHeader {
            id: msg_id,
            length: data.len() as u32,
        };
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(data);
        self.chan_push(sched, caller, id, wire)
    }

    /// Receives one whole typed message, validating its header. Returns
    /// `(0, empty)` instead of blocking for NOBLOCK handles and the
    /// kernel.
    pub fn receive_msg(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        file: FileNo,
        max: usize,
    ) -> IoResult<(u8, Vec<u8>)> {
        let _ = sched;
        let (flags, target) = {
            let e = self.gft.used(file)?;
            (e.flags(), e.target())
        };
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::invalid_file.into()),
        };
        if !self.nodes.live(id)?.mode().is_channel() {
            return Err(ErrorCode::unsupported_op.into());
        }
        let (parent, parent_owner, _) = self.channel_parent(id)?;
        let is_server = caller.pid.is_some() && caller.pid == parent_owner;

        let ch = self
            .nodes
            .live_mut(id)?
            .channel_mut()
            .expect("not a channel");
        if let Some(holder) = ch.locked_by() {
            if holder == file {
                // mixing partial reads and message receives on one handle
                return Err(ErrorCode::invalid_args.into());
            }
            if caller.is_kernel() || flags.contains(OpenFlags::NOBLOCK) {
                return Ok((0, Vec::new()));
            }
            return Err(IoError::RepeatAfter(WaitFor::event_on(
                EventMask::RECEIVED_MSG,
                WaitObject::Node(id),
            )));
        }

        let q = if is_server { Queue::Send } else { Queue::Recv };
        match ch.pop(q) {
            Some(msg) => {
                let header =
                    MsgHeader::from_bytes(&msg.data).ok_or(ErrorCode::invalid_args)?;
                let len = core::cmp::min(header.length as usize, max);
                let payload = msg.data[MsgHeader::SIZE..MsgHeader::SIZE + len].to_vec();
                Ok((header.id, payload))
            },
            None => {
                if caller.is_kernel() || flags.contains(OpenFlags::NOBLOCK) {
                    return Ok((0, Vec::new()));
                }
                if is_server {
                    Err(IoError::RepeatAfter(WaitFor::event_on(
                        EventMask::CLIENT,
                        WaitObject::Node(parent),
                    )))
                } else {
                    Err(IoError::RepeatAfter(WaitFor::event_on(
                        EventMask::RECEIVED_MSG,
                        WaitObject::Node(id),
                    )))
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // drivers

    /// Registers a driver under /dev and returns its serving handle.
    /// A driver named `fs` becomes the real-filesystem delegate.
    pub fn create_driver(
        &mut self,
        caller: &Caller,
        name: &str,
        kind: DriverKind,
    ) -> IoResult<FileNo> {
        if !server::valid_driver_name(name) {
            return Err(ErrorCode::inv_driver_name.into());
        }
        if self.nodes.find_in_dir(self.dev_dir, name).is_some() {
            return Err(ErrorCode::driver_exists.into());
        }
        let node = self
            .nodes
            .create_driver_node(caller, self.dev_dir, name, kind)?;
        let file = match self.open_file(
            caller,
            OpenFlags::MSGS | OpenFlags::DRIVER,
            FileTarget::Virtual(node),
        ) {
            Ok(f) => f,
            Err(e) => {
                self.nodes.destroy(node);
                return Err(e);
            },
        };
        if name == "fs" {
            self.register_fs_driver(node)?;
        }
        log::debug!("driver {} registered as {:?}", name, node);
        Ok(file)
    }

    /// Opens the kernel's client channel to a freshly registered fs
    /// driver
    fn register_fs_driver(&mut self, driver: NodeId) -> IoResult<()> {
        let k = Caller::KERNEL;
        let chan = self.nodes.create_channel(&k, driver)?;
        let file = self.open_file(
            &k,
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS,
            FileTarget::Virtual(chan),
        )?;
        self.real.register(file, chan);
        Ok(())
    }

    /// Scans the given driver handles in order and returns the first
    /// channel with a waiting request
    pub fn get_client(&self, pid: Option<ProcessId>, files: &[FileNo]) -> IoResult<NodeId> {
        for file in files {
            let target = self.gft.used(*file)?.target();
            let id = match target {
                FileTarget::Virtual(id) => id,
                FileTarget::Real { .. } => return Err(ErrorCode::invalid_file.into()),
            };
            let node = self.nodes.live(id)?;
            if !node.mode().is_driver() || node.owner() != pid {
                return Err(ErrorCode::not_own_driver.into());
            }
            for chan in self.nodes.children(id) {
                if let Some(n) = self.nodes.get(chan) {
                    if !n.is_tombstoned() && n.channel().map_or(false, |c| c.has_request()) {
                        return Ok(chan);
                    }
                }
            }
        }
        Err(ErrorCode::no_client_waiting.into())
    }

    /// The channel node behind a channel handle, so a driver can hand
    /// out tokens for `open_client`
    pub fn get_client_id(&self, file: FileNo) -> IoResult<NodeId> {
        let target = self.gft.used(file)?.target();
        match target {
            FileTarget::Virtual(id) if self.nodes.live(id)?.mode().is_channel() => Ok(id),
            _ => Err(ErrorCode::invalid_file.into()),
        }
    }

    /// Opens a serving handle onto a specific client channel
    pub fn open_client(
        &mut self,
        caller: &Caller,
        drv_file: FileNo,
        client: NodeId,
    ) -> IoResult<FileNo> {
        let target = self.gft.used(drv_file)?.target();
        let drv = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::invalid_file.into()),
        };
        let node = self.nodes.live(drv)?;
        if !node.mode().is_driver() || node.owner() != caller.pid {
            return Err(ErrorCode::not_own_driver.into());
        }
        if !self.nodes.children(drv).contains(&client) {
            return Err(ErrorCode::path_not_found.into());
        }
        self.open_file(
            caller,
            OpenFlags::MSGS | OpenFlags::DRIVER,
            FileTarget::Virtual(client),
        )
    }

    /// Opens a serving handle onto a channel when the caller owns its
    /// driver; used by `get_work`, which knows the channel but not which
    /// handle the driver was registered under
    pub fn open_client_channel(&mut self, caller: &Caller, chan: NodeId) -> IoResult<FileNo> {
        let (_, owner, _) = self.channel_parent(chan)?;
        if owner != caller.pid {
            return Err(ErrorCode::not_own_driver.into());
        }
        self.open_file(
            caller,
            OpenFlags::MSGS | OpenFlags::DRIVER,
            FileTarget::Virtual(chan),
        )
    }

    /// Marks a driver's data as readable or not, broadcasting
    /// `DATA_READABLE` when it becomes available
    pub fn set_readable(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
        file: FileNo,
        readable: bool,
    ) -> IoResult<()> {
        let (flags, target) = {
            let e = self.gft.used(file)?;
            (e.flags(), e.target())
        };
        if !flags.contains(OpenFlags::DRIVER) {
            return Err(ErrorCode::invalid_args.into());
        }
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::invalid_file.into()),
        };
        let node = self.nodes.live_mut(id)?;
        if node.owner() != caller.pid {
            return Err(ErrorCode::not_own_driver.into());
        }
        let server = node.server_mut().ok_or(ErrorCode::invalid_args)?;
        if server.set_readable(readable) && readable {
            sched.wakeup(Wakeup::all(EventMask::DATA_READABLE));
        }
        Ok(())
    }

    /// Whether a reply is queued on a channel handle
    pub fn has_msg(&self, file: FileNo) -> bool {
        match self.gft.used(file).map(|e| e.target()) {
            Ok(FileTarget::Virtual(id)) => self
                .nodes
                .get(id)
                .filter(|n| !n.is_tombstoned())
                .and_then(|n| n.channel())
                .map_or(false, |c| c.has_reply()),
            _ => false,
        }
    }

    /// Whether the driver behind this channel handle announces data
    pub fn has_data(&self, file: FileNo) -> bool {
        let id = match self.gft.used(file).map(|e| e.target()) {
            Ok(FileTarget::Virtual(id)) => id,
            _ => return false,
        };
        match self.channel_parent(id) {
            Ok((parent, _, _)) => self
                .nodes
                .get(parent)
                .and_then(|n| n.server())
                .map_or(false, |s| s.is_readable()),
            Err(_) => false,
        }
    }

    /// Whether any of the driver handles has a client waiting
    pub fn has_work(&self, pid: Option<ProcessId>, files: &[FileNo]) -> bool {
        match self.get_client(pid, files) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Level-triggered wake-up re-check: does a condition matching the
    /// mask already hold for this process? A process that is neither a
    /// client nor a server never has a message available.
    pub fn msg_available_for(&self, pid: ProcessId, events: EventMask) -> bool {
        if events.contains(EventMask::CLIENT) {
            for drv in self.nodes.children(self.dev_dir) {
                let node = match self.nodes.get(drv) {
                    Some(n) => n,
                    None => continue,
                };
                if node.owner() != Some(pid) || !node.mode().is_driver() {
                    continue;
                }
                for chan in self.nodes.children(drv) {
                    if self
                        .nodes
                        .get(chan)
                        .and_then(|n| n.channel())
                        .map_or(false, |c| c.has_request())
                    {
                        return true;
                    }
                }
            }
        }
        if events.intersects(EventMask::RECEIVED_MSG | EventMask::DATA_READABLE) {
            for (_, e) in self.gft.iter_used() {
                if e.owner() != Some(pid) {
                    continue;
                }
                let id = match e.target() {
                    FileTarget::Virtual(id) => id,
                    FileTarget::Real { .. } => continue,
                };
                let node = match self.nodes.get(id).filter(|n| !n.is_tombstoned()) {
                    Some(n) => n,
                    None => continue,
                };
                if !node.mode().is_channel() {
                    continue;
                }
                let (parent, parent_owner, _) = match self.channel_parent(id) {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                // reading our own driver's replies makes no sense
                if parent_owner == Some(pid) {
                    continue;
                }
                if events.contains(EventMask::RECEIVED_MSG)
                    && node.channel().map_or(false, |c| c.has_reply())
                {
                    return true;
                }
                if events.contains(EventMask::DATA_READABLE)
                    && self
                        .nodes
                        .get(parent)
                        .and_then(|n| n.server())
                        .map_or(false, |s| s.is_readable())
                {
                    return true;
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // positions and metadata

    pub fn seek(
        &mut self,
        sched: &Scheduler,
        file: FileNo,
        offset: i64,
        whence: Whence,
    ) -> IoResult<u64> {
        let (target, pos) = {
            let e = self.gft.used(file)?;
            (e.target(), e.position())
        };
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::unsupported_op.into()),
        };
        let node = self.nodes.live(id)?;
        let size = match node.payload() {
            NodePayload::File(MemFile::Cache(c)) => c.size() as i64,
            NodePayload::File(MemFile::Synthetic(src)) => {
                info::render(*src, sched, &self.nodes, self.dev_dir).len() as i64
            },
            // positions make no sense on message or byte streams
            _ => return Err(ErrorCode::unsupported_op.into()),
        };
        let new = match whence {
            Whence::Set => offset,
            Whence::Cur => pos as i64 + offset,
            Whence::End => size + offset,
        };
        if new < 0 {
            return Err(ErrorCode::invalid_args.into());
        }
        self.gft.used_mut(file)?.position = new as u64;
        Ok(new as u64)
    }

    pub fn tell(&self, file: FileNo) -> IoResult<u64> {
        Ok(self.gft.used(file)?.position())
    }

    /// End-of-file: past the cache for files, applicable list empty for
    /// channels, drained-and-writerless for pipes
    pub fn eof(&self, caller: &Caller, file: FileNo) -> IoResult<bool> {
        let e = self.gft.used(file)?;
        let (target, pos) = (e.target(), e.position());
        let id = match target {
            FileTarget::Virtual(id) => id,
            FileTarget::Real { .. } => return Err(ErrorCode::unsupported_op.into()),
        };
        let node = self.nodes.live(id)?;
        Ok(match node.payload() {
            NodePayload::File(MemFile::Cache(c)) => pos >= c.size() as u64,
            NodePayload::File(MemFile::Synthetic(_)) => false,
            NodePayload::Channel(c) => {
                let (_, parent_owner, _) = self.channel_parent(id)?;
                if caller.pid.is_some() && caller.pid == parent_owner {
                    !c.has_request()
                } else {
                    !c.has_reply()
                }
            },
            NodePayload::Pipe(p) => p.is_empty() && !p.has_writers(),
            _ => true,
        })
    }

    pub fn stat(&mut self, path_str: &str) -> IoResult<FileInfo> {
        let (id, _) = self.nodes.resolve(Path::new(path_str), None, true)?;
        self.nodes.fileinfo(id)
    }

    pub fn fstat(&self, file: FileNo) -> IoResult<FileInfo> {
        match self.gft.used(file)?.target() {
            FileTarget::Virtual(id) => self.nodes.fileinfo(id),
            FileTarget::Real { .. } => Err(ErrorCode::real_path.into()),
        }
    }

    /// Only the owner and root may change modes; type bits are fixed
    pub fn chmod(&mut self, caller: &Caller, path_str: &str, mode: u32) -> IoResult<()> {
        let (id, _) = self.nodes.resolve(Path::new(path_str), None, true)?;
        let node = self.nodes.live_mut(id)?;
        if !caller.is_kernel() && caller.uid != 0 && caller.uid != node.uid {
            return Err(ErrorCode::no_write_perm.into());
        }
        let perms = NodeMode::from_bits_truncate(mode) & NodeMode::PERM_MASK;
        node.mode.remove(NodeMode::PERM_MASK);
        node.mode.insert(perms);
        Ok(())
    }

    pub fn chown(
        &mut self,
        caller: &Caller,
        path_str: &str,
        uid: u32,
        gid: u32,
    ) -> IoResult<()> {
        let (id, _) = self.nodes.resolve(Path::new(path_str), None, true)?;
        let node = self.nodes.live_mut(id)?;
        if !caller.is_kernel() && caller.uid != 0 && caller.uid != node.uid {
            return Err(ErrorCode::no_write_perm.into());
        }
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    // ------------------------------------------------------------------
    // namespace manipulation

    pub fn link(&mut self, caller: &Caller, old_path: &str, new_path: &str) -> IoResult<()> {
        let old = self.nodes.resolve(Path::new(old_path), None, true);
        let new = self.nodes.resolve(Path::new(new_path), None, true);

        let old_id = match (old, &new) {
            (Err(IoError::Code(ErrorCode::real_path)), Err(IoError::Code(ErrorCode::real_path))) => {
                // both sides real: the fs driver does the whole thing
                return Err(ErrorCode::real_path.into());
            },
            (Err(IoError::Code(ErrorCode::real_path)), _)
            | (Ok(_), Err(IoError::Code(ErrorCode::real_path))) => {
                return Err(ErrorCode::link_device.into());
            },
            (Err(e), _) => return Err(e),
            (Ok(_), Ok(_)) => return Err(ErrorCode::file_exists.into()),
            (Ok((id, _)), Err(IoError::Code(ErrorCode::path_not_found))) => id,
            (Ok(_), Err(e)) => return Err(e.clone()),
        };

        if self.nodes.live(old_id)?.mode().is_dir() {
            return Err(ErrorCode::is_dir.into());
        }
        let new = Path::new(new_path);
        let dir_path = new.parent().ok_or(ErrorCode::path_not_found)?;
        let name = new.file_name().ok_or(ErrorCode::invalid_args)?;
        let (dir, _) = self.nodes.resolve(dir_path, None, true)?;
        if !self.nodes.live(dir)?.mode().is_dir() {
            return Err(ErrorCode::no_directory.into());
        }
        self.nodes.has_access(caller, dir, AccessMode::WRITE)?;
        if self.nodes.find_in_dir(dir, name).is_some() {
            return Err(ErrorCode::file_exists.into());
        }
        self.nodes.create_link(caller, dir, name, old_id)?;
        Ok(())
    }

    pub fn unlink(&mut self, sched: &mut Scheduler, caller: &Caller, path_str: &str) -> IoResult<()> {
        // do not dereference the final component: a link is removed, not
        // its target
        let (id, _) = self.nodes.resolve(Path::new(path_str), None, false)?;
        let node = self.nodes.live(id)?;
        if !node.mode().is_file() && !node.mode().is_link() {
            return Err(ErrorCode::no_file_or_link.into());
        }
        if let Some(parent) = node.parent() {
            self.nodes.has_access(caller, parent, AccessMode::WRITE)?;
        }
        let ids = self.nodes.destroy(id);
        sched.wakeup_all(ids.into_iter().map(destroyed_wake));
        Ok(())
    }

    pub fn mkdir(&mut self, caller: &Caller, path_str: &str) -> IoResult<()> {
        let path = Path::new(path_str);
        let dir_path = path.parent().ok_or(ErrorCode::invalid_args)?;
        let name = path.file_name().ok_or(ErrorCode::invalid_args)?;
        if dir_path.is_root() {
            // top-level directories belong to the real filesystem
            return Err(ErrorCode::real_path.into());
        }
        let (dir, _) = self.nodes.resolve(dir_path, None, true)?;
        if !self.nodes.live(dir)?.mode().is_dir() {
            return Err(ErrorCode::no_directory.into());
        }
        self.nodes.has_access(caller, dir, AccessMode::WRITE)?;
        if self.nodes.find_in_dir(dir, name).is_some() {
            return Err(ErrorCode::file_exists.into());
        }
        self.nodes.create_dir(caller, dir, name)?;
        Ok(())
    }

    pub fn rmdir(&mut self, sched: &mut Scheduler, caller: &Caller, path_str: &str) -> IoResult<()> {
        let (id, _) = self.nodes.resolve(Path::new(path_str), None, true)?;
        let node = self.nodes.live(id)?;
        if !node.mode().is_dir() {
            return Err(ErrorCode::no_directory.into());
        }
        if let Some(parent) = node.parent() {
            self.nodes.has_access(caller, parent, AccessMode::WRITE)?;
        }
        let ids = self.nodes.destroy(id);
        sched.wakeup_all(ids.into_iter().map(destroyed_wake));
        Ok(())
    }

    /// Creates an anonymous pipe under /system/pipe and returns the
    /// (read, write) handles
    pub fn create_pipe(
        &mut self,
        sched: &mut Scheduler,
        caller: &Caller,
    ) -> IoResult<(FileNo, FileNo)> {
        let name = format!("{}", self.next_pipe);
        self.next_pipe += 1;
        let node = self.nodes.create_pipe_node(caller, self.pipe_dir, &name)?;
        let r = self.open_file(caller, OpenFlags::READ, FileTarget::Virtual(node))?;
        let w = match self.open_file(caller, OpenFlags::WRITE, FileTarget::Virtual(node)) {
            Ok(w) => w,
            Err(e) => {
                let _ = self.close_file(sched, r);
                return Err(e);
            },
        };
        Ok((r, w))
    }

    // ------------------------------------------------------------------
    // process and thread lifecycle nodes

    /// Builds /system/processes/<pid>/{info,virtmem,regions,threads}.
    /// Returns the process directory and the threads directory.
    pub fn create_process_nodes(&mut self, pid: ProcessId) -> IoResult<(NodeId, NodeId)> {
        let name = format!("{}", pid);
        if self.nodes.find_in_dir(self.procs_dir, &name).is_some() {
            return Err(ErrorCode::file_exists.into());
        }
        let dir = self.nodes.create_dir(&Caller::KERNEL, self.procs_dir, &name)?;
        let cleanup = |nodes: &mut NodeArena, dir: NodeId| {
            nodes.destroy(dir);
        };
        if let Err(e) = self
            .nodes
            .create_synthetic(dir, "info", InfoSource::ProcessInfo(pid))
            .and_then(|_| {
                self.nodes
                    .create_synthetic(dir, "virtmem", InfoSource::ProcessVirtMem(pid))
            })
            .and_then(|_| {
                self.nodes
                    .create_synthetic(dir, "regions", InfoSource::ProcessRegions(pid))
            })
        {
            cleanup(&mut self.nodes, dir);
            return Err(e);
        }
        let threads = match self.nodes.create_dir(&Caller::KERNEL, dir, "threads") {
            Ok(t) => t,
            Err(e) => {
                cleanup(&mut self.nodes, dir);
                return Err(e);
            },
        };
        Ok((dir, threads))
    }

    /// Builds threads/<tid>/{info,trace} under a process's thread dir
    pub fn create_thread_nodes(&mut self, thread_dir: NodeId, tid: ThreadId) -> IoResult<NodeId> {
        let name = format!("{}", tid);
        let dir = self.nodes.create_dir(&Caller::KERNEL, thread_dir, &name)?;
        if let Err(e) = self
            .nodes
            .create_synthetic(dir, "info", InfoSource::ThreadInfo(tid))
            .and_then(|_| {
                self.nodes
                    .create_synthetic(dir, "trace", InfoSource::ThreadTrace(tid))
            })
        {
            self.nodes.destroy(dir);
            return Err(e);
        }
        Ok(dir)
    }

    pub fn remove_nodes(&mut self, sched: &mut Scheduler, id: NodeId) {
        let ids = self.nodes.destroy(id);
        sched.wakeup_all(ids.into_iter().map(destroyed_wake));
    }

    /// Process teardown: close every handle the process acquired and
    /// unregister its drivers. Blocked peers wake up and see tombstones.
    pub fn on_process_over(
        &mut self,
        sched: &mut Scheduler,
        pid: ProcessId,
        files: &[FileNo],
    ) {
        for file in files {
            if self.gft.used(*file).is_ok() {
                let _ = self.close_file(sched, *file);
            }
        }
        // drivers the process registered die with it
        let fs_chan = self.real.channel().map(|(_, node)| node);
        for drv in self.nodes.children(self.dev_dir) {
            let owned = self
                .nodes
                .get(drv)
                .map_or(false, |n| n.owner() == Some(pid) && n.mode().is_driver());
            if !owned {
                continue;
            }
            let dead_channels = self.nodes.children(drv);
            if let Some(fs_node) = fs_chan {
                if dead_channels.contains(&fs_node) {
                    self.real.unregister();
                }
            }
            let ids = self.nodes.destroy(drv);
            sched.wakeup_all(ids.into_iter().map(destroyed_wake));
            log::debug!("driver {:?} of exited process {} destroyed", drv, pid);
        }
    }

    // ------------------------------------------------------------------
    // real filesystem delegation

    /// Runs one request against the fs driver on behalf of `tid`.
    /// Blocks (repeat-after) while another request is in flight or the
    /// reply is outstanding. The fs driver process itself must never
    /// delegate, or it would deadlock against its own queue.
    pub fn real_request(
        &mut self,
        sched: &mut Scheduler,
        pid: Option<ProcessId>,
        tid: ThreadId,
        req: &Request,
    ) -> IoResult<ydinabi::fs::protocol::Response> {
        let (_, chan_node) = match self.real.channel() {
            Some(c) => c,
            None => return Err(ErrorCode::path_not_found.into()),
        };
        if self.nodes.live(chan_node).is_err() {
            self.real.unregister();
            return Err(ErrorCode::path_not_found.into());
        }
        let (_, driver_owner, _) = self.channel_parent(chan_node)?;
        if pid.is_some() && pid == driver_owner {
            // see doc comment
            return Err(ErrorCode::path_not_found.into());
        }

        let sent = match self.real.claim(tid) {
            Some(sent) => sent,
            None => {
                return Err(IoError::RepeatAfter(WaitFor::event_on(
                    EventMask::RECEIVED_MSG,
                    WaitObject::Node(chan_node),
                )));
            },
        };

        if sent {
            let popped = self
                .nodes
                .live_mut(chan_node)?
                .channel_mut()
                .expect("not a channel")
                .pop(Queue::Recv);
            if let Some(msg) = popped {
                self.real.finish(tid);
                // let the next delegator go
                sched.wakeup(Wakeup::object(
                    WaitObject::Node(chan_node),
                    EventMask::RECEIVED_MSG,
                ));
                let header =
                    MsgHeader::from_bytes(&msg.data).ok_or(ErrorCode::invalid_args)?;
                let body =
                    &msg.data[MsgHeader::SIZE..MsgHeader::SIZE + header.length as usize];
                return real::decode_response(body)
                    .ok_or_else(|| ErrorCode::invalid_args.into());
            }
        } else {
            // drop stale replies of a cancelled predecessor before
            // starting a fresh exchange
            while self
                .nodes
                .live_mut(chan_node)?
                .channel_mut()
                .expect("not a channel")
                .pop(Queue::Recv)
                .is_some()
            {}
            let (msg_id, body) = real::encode_request(req);
            let header = MsgHeader {
                id: msg_id,
                length: body.len() as u32,
            };
            let mut wire = header.to_bytes().to_vec();
            wire.extend(body);
            if let Err(e) = self.chan_push(sched, &Caller::KERNEL, chan_node, wire) {
                self.real.forget(tid);
                return Err(e);
            }
            self.real.mark_sent(tid);
        }

        Err(IoError::RepeatAfter(WaitFor::event_on(
            EventMask::RECEIVED_MSG,
            WaitObject::Node(chan_node),
        )))
    }

    /// Cancellation hook: a signalled thread abandons its delegation slot
    pub fn real_forget(&mut self, tid: ThreadId) {
        self.real.forget(tid);
    }

    /// Tells the fs driver a real file is no longer used. Fire and
    /// forget; the kernel never blocks.
    fn real_notify_close(&mut self, sched: &mut Scheduler, inode: u64, device: DeviceId) {
        if let Some((_, chan_node)) = self.real.channel() {
            let req = Request::Close {
                inode,
                device: device.0,
            };
            let (msg_id, body) = real::encode_request(&req);
            let header = MsgHeader {
                id: msg_id,
                length: body.len() as u32,
            };
            let mut wire = header.to_bytes().to_vec();
            wire.extend(body);
            let _ = self.chan_push(sched, &Caller::KERNEL, chan_node, wire);
        }
    }

    // ------------------------------------------------------------------
    // shared helpers and introspection

    /// Parent driver of a channel: (driver node, owner, single-pipe)
    fn channel_parent(&self, id: NodeId) -> IoResult<(NodeId, Option<ProcessId>, bool)> {
        let node = self.nodes.live(id)?;
        let parent = match node.parent() {
            Some(p) => p,
            None => return Err(ErrorCode::invalid_file.into()),
        };
        let p = self.nodes.live(parent)?;
        debug_assert!(p.mode().is_driver(), "channel parent is not a driver");
        Ok((
            parent,
            p.owner(),
            p.mode().contains(NodeMode::TYPE_DRIVER_SINGLEPIPE),
        ))
    }

    pub fn entry_flags(&self, file: FileNo) -> IoResult<OpenFlags> {
        Ok(self.gft.used(file)?.flags())
    }

    pub fn entry_target(&self, file: FileNo) -> IoResult<FileTarget> {
        Ok(self.gft.used(file)?.target())
    }

    pub fn entry_position(&self, file: FileNo) -> IoResult<u64> {
        Ok(self.gft.used(file)?.position())
    }

    pub fn advance_position(&mut self, file: FileNo, by: u64) -> IoResult<u64> {
        let e = self.gft.used_mut(file)?;
        e.position += by;
        Ok(e.position)
    }

    pub fn set_position(&mut self, file: FileNo, pos: u64) -> IoResult<()> {
        self.gft.used_mut(file)?.position = pos;
        Ok(())
    }

    pub fn set_noblock(&mut self, file: FileNo, on: bool) -> IoResult<()> {
        let e = self.gft.used_mut(file)?;
        if on {
            e.flags |= OpenFlags::NOBLOCK;
        } else {
            e.flags -= OpenFlags::NOBLOCK;
        }
        Ok(())
    }

    pub fn get_access(&self, file: FileNo) -> IoResult<OpenFlags> {
        Ok(self.gft.used(file)?.flags()
            & (OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS))
    }

    /// Live GFT entries; leak checks compare before and after
    pub fn open_file_count(&self) -> usize {
        self.gft.used_count()
    }

    /// Occupied node slots, tombstones included
    pub fn node_count(&self) -> usize {
        self.nodes.live_count()
    }

    /// Sum of node handle references
    pub fn node_ref_total(&self) -> u64 {
        self.nodes.total_refs()
    }
}

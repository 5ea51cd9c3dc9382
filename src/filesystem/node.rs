use alloc::string::{String, ToString};
use alloc::vec::Vec;

use bitflags::bitflags;

use ydinabi::fs::{DriverKind, FileInfo, VFS_DEV_NO};
use ydinabi::process::ProcessId;

use super::channel::Channel;
use super::error::{ErrorCode, IoResult};
use super::file::{InfoSource, MemFile};
use super::path::Path;
use super::pipe::Pipe;
use super::server::Server;

/// Index into the node arena. Stable for the lifetime of the node,
/// including its tombstone phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl NodeId {
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Node type and permission bits. Exactly one type bit is set,
    /// except that single-pipe drivers carry both driver bits.
    pub struct NodeMode: u32 {
        const TYPE_DIR     = 1 << 0;
        const TYPE_FILE    = 1 << 1;
        const TYPE_CHANNEL = 1 << 2;
        const TYPE_DRIVER  = 1 << 3;
        const TYPE_DRIVER_SINGLEPIPE = 1 << 4;
        const TYPE_PIPE    = 1 << 5;
        const TYPE_LINK    = 1 << 6;
        const TYPE_DEVICE  = 1 << 7;

        const STICKY      = 1 << 8;
        const OWNER_READ  = 1 << 9;
        const OWNER_WRITE = 1 << 10;
        const OWNER_EXEC  = 1 << 11;
        const GROUP_READ  = 1 << 12;
        const GROUP_WRITE = 1 << 13;
        const GROUP_EXEC  = 1 << 14;
        const OTHER_READ  = 1 << 15;
        const OTHER_WRITE = 1 << 16;
        const OTHER_EXEC  = 1 << 17;

        const PERM_MASK = Self::STICKY.bits
            | Self::OWNER_READ.bits | Self::OWNER_WRITE.bits | Self::OWNER_EXEC.bits
            | Self::GROUP_READ.bits | Self::GROUP_WRITE.bits | Self::GROUP_EXEC.bits
            | Self::OTHER_READ.bits | Self::OTHER_WRITE.bits | Self::OTHER_EXEC.bits;

        const ANY_EXEC = Self::OWNER_EXEC.bits | Self::GROUP_EXEC.bits | Self::OTHER_EXEC.bits;

        /// rwxr-xr-x
        const DIR_DEFAULT = Self::OWNER_READ.bits | Self::OWNER_WRITE.bits | Self::OWNER_EXEC.bits
            | Self::GROUP_READ.bits | Self::GROUP_EXEC.bits
            | Self::OTHER_READ.bits | Self::OTHER_EXEC.bits;

        /// rw-r--r--
        const FILE_DEFAULT = Self::OWNER_READ.bits | Self::OWNER_WRITE.bits
            | Self::GROUP_READ.bits | Self::OTHER_READ.bits;
    }
}

impl NodeMode {
    pub fn is_dir(self) -> bool {
        self.contains(Self::TYPE_DIR)
    }

    pub fn is_file(self) -> bool {
        self.contains(Self::TYPE_FILE)
    }

    pub fn is_channel(self) -> bool {
        self.contains(Self::TYPE_CHANNEL)
    }

    pub fn is_driver(self) -> bool {
        self.intersects(Self::TYPE_DRIVER | Self::TYPE_DRIVER_SINGLEPIPE)
    }

    pub fn is_pipe(self) -> bool {
        self.contains(Self::TYPE_PIPE)
    }

    pub fn is_link(self) -> bool {
        self.contains(Self::TYPE_LINK)
    }
}

bitflags! {
    /// What an operation needs from a node, permission-wise
    pub struct AccessMode: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// Identity an operation runs under. `pid == None` is the kernel
/// pseudo-process, which bypasses permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub pid: Option<ProcessId>,
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub const KERNEL: Caller = Caller {
        pid: None,
        uid: 0,
        gid: 0,
    };

    pub fn is_kernel(&self) -> bool {
        self.pid.is_none()
    }
}

/// Type-specific node contents
#[derive(Debug)]
pub enum NodePayload {
    Directory,
    File(MemFile),
    Channel(Channel),
    Driver(Server),
    Pipe(Pipe),
    Link(NodeId),
}

/// An entry in the namespace. Tree structure and sibling order are kept
/// as arena indices; a destroyed-but-still-referenced node keeps its slot
/// with `name == None` until the last handle closes.
#[derive(Debug)]
pub struct Node {
    /// `Some("")` for the root, `None` once tombstoned
    pub(super) name: Option<String>,
    pub(super) parent: Option<NodeId>,
    pub(super) first_child: Option<NodeId>,
    pub(super) last_child: Option<NodeId>,
    pub(super) prev: Option<NodeId>,
    pub(super) next: Option<NodeId>,
    pub(super) mode: NodeMode,
    pub(super) owner: Option<ProcessId>,
    pub(super) uid: u32,
    pub(super) gid: u32,
    /// Number of open handles targeting this node
    pub(super) ref_count: u32,
    pub(super) payload: NodePayload,
}

impl Node {
    fn new(
        name: String,
        owner: Option<ProcessId>,
        uid: u32,
        gid: u32,
        mode: NodeMode,
        payload: NodePayload,
    ) -> Self {
        Self {
            name: Some(name),
            parent: None,
            first_child: None,
            last_child: None,
            prev: None,
            next: None,
            mode,
            owner,
            uid,
            gid,
            ref_count: 0,
            payload,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.name.is_none()
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn payload(&self) -> &NodePayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut NodePayload {
        &mut self.payload
    }

    pub fn channel(&self) -> Option<&Channel> {
        match &self.payload {
            NodePayload::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        match &mut self.payload {
            NodePayload::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn server(&self) -> Option<&Server> {
        match &self.payload {
            NodePayload::Driver(s) => Some(s),
            _ => None,
        }
    }

    pub fn server_mut(&mut self) -> Option<&mut Server> {
        match &mut self.payload {
            NodePayload::Driver(s) => Some(s),
            _ => None,
        }
    }

    fn payload_size(&self) -> u64 {
        match &self.payload {
            NodePayload::File(MemFile::Cache(c)) => c.size() as u64,
            NodePayload::Pipe(p) => p.len() as u64,
            _ => 0,
        }
    }
}

/// Outcome of releasing the last handle of a channel
#[derive(Debug)]
pub enum ChannelRelease {
    /// Destroyed; the listed nodes were tombstoned
    Destroyed(Vec<NodeId>),
    /// Requests are still queued for the server; destruction is deferred
    Deferred,
}

/// The arena holding every virtual node. Slot 0 is always the root.
#[derive(Debug)]
pub struct NodeArena {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
    limit: usize,
}

impl NodeArena {
    pub fn new(limit: usize) -> Self {
        let root = Node::new(
            String::new(),
            None,
            0,
            0,
            NodeMode::TYPE_DIR | NodeMode::DIR_DEFAULT,
            NodePayload::Directory,
        );
        Self {
            slots: alloc::vec![Some(root)],
            free: Vec::new(),
            limit,
        }
    }

    pub const fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Node access for io paths: missing slot or tombstone is reported as
    /// an invalid file
    pub fn live(&self, id: NodeId) -> IoResult<&Node> {
        match self.get(id) {
            Some(n) if !n.is_tombstoned() => Ok(n),
            Some(_) | None => {
                log::trace!("access to destroyed node {:?}", id);
                Err(ErrorCode::invalid_file.into())
            },
        }
    }

    pub fn live_mut(&mut self, id: NodeId) -> IoResult<&mut Node> {
        match self.get_mut(id) {
            Some(n) if !n.is_tombstoned() => Ok(n),
            Some(_) | None => {
                log::trace!("access to destroyed node {:?}", id);
                Err(ErrorCode::invalid_file.into())
            },
        }
    }

    fn alloc(&mut self, node: Node) -> IoResult<NodeId> {
        if let Some(id) = self.free.pop() {
            self.slots[id.index()] = Some(node);
            return Ok(id);
        }
        if self.slots.len() >= self.limit {
            return Err(ErrorCode::not_enough_mem.into());
        }
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(node));
        Ok(id)
    }

    /// Appends `child` to the sibling list of `parent`
    fn attach(&mut self, parent: NodeId, child: NodeId) {
        let old_last = {
            let p = self.get_mut(parent).expect("attach: no parent");
            let old = p.last_child;
            p.last_child = Some(child);
            if p.first_child.is_none() {
                p.first_child = Some(child);
            }
            old
        };
        if let Some(last) = old_last {
            self.get_mut(last).expect("attach: bad last").next = Some(child);
        }
        let c = self.get_mut(child).expect("attach: no child");
        c.parent = Some(parent);
        c.prev = old_last;
        c.next = None;
    }

    /// Unlinks `id` from its parent's sibling list
    fn detach(&mut self, id: NodeId) {
        let (parent, prev, next) = match self.get(id) {
            Some(n) => (n.parent, n.prev, n.next),
            None => return,
        };
        if let Some(p) = prev {
            self.get_mut(p).expect("detach: bad prev").next = next;
        }
        if let Some(n) = next {
            self.get_mut(n).expect("detach: bad next").prev = prev;
        }
        if let Some(pid) = parent {
            let p = self.get_mut(pid).expect("detach: bad parent");
            if p.first_child == Some(id) {
                p.first_child = next;
            }
            if p.last_child == Some(id) {
                p.last_child = prev;
            }
        }
        if let Some(n) = self.get_mut(id) {
            n.parent = None;
            n.prev = None;
            n.next = None;
        }
    }

    fn create(
        &mut self,
        parent: NodeId,
        name: &str,
        owner: Option<ProcessId>,
        uid: u32,
        gid: u32,
        mode: NodeMode,
        payload: NodePayload,
    ) -> IoResult<NodeId> {
        debug_assert!(self.get(parent).is_some(), "create: no parent");
        let id = self.alloc(Node::new(name.to_string(), owner, uid, gid, mode, payload))?;
        self.attach(parent, id);
        Ok(id)
    }

    pub fn create_dir(&mut self, caller: &Caller, parent: NodeId, name: &str) -> IoResult<NodeId> {
        self.create(
            parent,
            name,
            caller.pid,
            caller.uid,
            caller.gid,
            NodeMode::TYPE_DIR | NodeMode::DIR_DEFAULT,
            NodePayload::Directory,
        )
    }

    pub fn create_file(&mut self, caller: &Caller, parent: NodeId, name: &str) -> IoResult<NodeId> {
        self.create(
            parent,
            name,
            caller.pid,
            caller.uid,
            caller.gid,
            NodeMode::TYPE_FILE | NodeMode::FILE_DEFAULT,
            NodePayload::File(MemFile::empty()),
        )
    }

    /// Kernel-owned read-only file whose content is materialized on read
    pub fn create_synthetic(
        &mut self,
        parent: NodeId,
        name: &str,
        src: InfoSource,
    ) -> IoResult<NodeId> {
        self.create(
            parent,
            name,
            None,
            0,
            0,
            NodeMode::TYPE_FILE
                | NodeMode::OWNER_READ
                | NodeMode::GROUP_READ
                | NodeMode::OTHER_READ,
            NodePayload::File(MemFile::synthetic(src)),
        )
    }

    pub fn create_driver_node(
        &mut self,
        caller: &Caller,
        parent: NodeId,
        name: &str,
        kind: DriverKind,
    ) -> IoResult<NodeId> {
        let mut mode = NodeMode::TYPE_DRIVER
            | NodeMode::OWNER_READ
            | NodeMode::OWNER_WRITE
            | NodeMode::OTHER_READ
            | NodeMode::OTHER_WRITE;
        if kind.contains(DriverKind::SINGLE_PIPE) {
            mode |= NodeMode::TYPE_DRIVER_SINGLEPIPE;
        }
        self.create(
            parent,
            name,
            caller.pid,
            caller.uid,
            caller.gid,
            mode,
            NodePayload::Driver(Server::new(kind)),
        )
    }

    /// Allocates a channel under a driver, owned by the opening process
    pub fn create_channel(&mut self, caller: &Caller, driver: NodeId) -> IoResult<NodeId> {
        debug_assert!(self.get(driver).map_or(false, |n| n.mode.is_driver()));
        let name = match caller.pid {
            Some(pid) => alloc::format!("{}", pid),
            None => "kernel".to_string(),
        };
        self.create(
            driver,
            &name,
            caller.pid,
            caller.uid,
            caller.gid,
            NodeMode::TYPE_CHANNEL
                | NodeMode::OWNER_READ
                | NodeMode::OWNER_WRITE
                | NodeMode::OTHER_READ
                | NodeMode::OTHER_WRITE,
            NodePayload::Channel(Channel::new()),
        )
    }

    pub fn create_pipe_node(
        &mut self,
        caller: &Caller,
        parent: NodeId,
        name: &str,
    ) -> IoResult<NodeId> {
        self.create(
            parent,
            name,
            caller.pid,
            caller.uid,
            caller.gid,
            NodeMode::TYPE_PIPE
                | NodeMode::OWNER_READ
                | NodeMode::OWNER_WRITE
                | NodeMode::OTHER_READ
                | NodeMode::OTHER_WRITE,
            NodePayload::Pipe(Pipe::new()),
        )
    }

    pub fn create_link(
        &mut self,
        caller: &Caller,
        parent: NodeId,
        name: &str,
        target: NodeId,
    ) -> IoResult<NodeId> {
        self.create(
            parent,
            name,
            caller.pid,
            caller.uid,
            caller.gid,
            NodeMode::TYPE_LINK | NodeMode::FILE_DEFAULT,
            NodePayload::Link(target),
        )
    }

    pub fn find_in_dir(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let mut cur = self.get(parent)?.first_child;
        while let Some(id) = cur {
            let n = self.get(id)?;
            if n.name.as_deref() == Some(name) {
                return Some(id);
            }
            cur = n.next;
        }
        None
    }

    /// Child node ids in sibling order
    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.get(parent).and_then(|n| n.first_child);
        while let Some(id) = cur {
            out.push(id);
            cur = self.get(id).and_then(|n| n.next);
        }
        out
    }

    /// Permission check in owner, group, other order. The kernel bypasses
    /// everything; root bypasses everything except EXEC, which still
    /// requires at least one x bit.
    pub fn has_access(&self, caller: &Caller, id: NodeId, access: AccessMode) -> IoResult<()> {
        let node = self.live(id)?;
        if caller.is_kernel() {
            return Ok(());
        }
        if caller.uid == 0 {
            if access.contains(AccessMode::EXEC) && !node.mode.intersects(NodeMode::ANY_EXEC) {
                return Err(ErrorCode::no_exec_perm.into());
            }
            return Ok(());
        }

        let (r, w, x) = if caller.uid == node.uid {
            (
                NodeMode::OWNER_READ,
                NodeMode::OWNER_WRITE,
                NodeMode::OWNER_EXEC,
            )
        } else if caller.gid == node.gid {
            (
                NodeMode::GROUP_READ,
                NodeMode::GROUP_WRITE,
                NodeMode::GROUP_EXEC,
            )
        } else {
            (
                NodeMode::OTHER_READ,
                NodeMode::OTHER_WRITE,
                NodeMode::OTHER_EXEC,
            )
        };

        if access.contains(AccessMode::READ) && !node.mode.contains(r) {
            return Err(ErrorCode::no_read_perm.into());
        }
        if access.contains(AccessMode::WRITE) && !node.mode.contains(w) {
            return Err(ErrorCode::no_write_perm.into());
        }
        if access.contains(AccessMode::EXEC) && !node.mode.contains(x) {
            return Err(ErrorCode::no_exec_perm.into());
        }
        Ok(())
    }

    /// Resolves a slash-separated path. `.` and `..` collapse; links are
    /// dereferenced, the final component only when `follow_final_link`.
    /// Paths leaving the virtual namespace produce the `real_path`
    /// sentinel. With `create_with`, a missing final component inside a
    /// writable virtual directory is created as an empty file; the bool
    /// in the result reports that.
    pub fn resolve(
        &mut self,
        path: Path<'_>,
        create_with: Option<&Caller>,
        follow_final_link: bool,
    ) -> IoResult<(NodeId, bool)> {
        let mut cur = self.root();
        let comps: Vec<&str> = path.components().collect();
        for (i, comp) in comps.iter().enumerate() {
            let is_last = i + 1 == comps.len();
            match *comp {
                "." => continue,
                ".." => {
                    cur = self.get(cur).and_then(|n| n.parent).unwrap_or_else(|| self.root());
                    continue;
                },
                _ => {},
            }
            if !self.live(cur)?.mode.is_dir() {
                return Err(ErrorCode::no_directory.into());
            }
            match self.find_in_dir(cur, comp) {
                Some(child) => {
                    let child_node = self.live(child)?;
                    cur = match child_node.payload {
                        NodePayload::Link(target) if follow_final_link || !is_last => target,
                        _ => child,
                    };
                },
                None => {
                    if cur == self.root() {
                        // the real filesystem owns everything the virtual
                        // root does not shadow
                        return Err(ErrorCode::real_path.into());
                    }
                    if is_last {
                        if let Some(caller) = create_with {
                            self.has_access(caller, cur, AccessMode::WRITE)?;
                            let id = self.create_file(caller, cur, comp)?;
                            return Ok((id, true));
                        }
                    }
                    return Err(ErrorCode::path_not_found.into());
                },
            }
        }
        Ok((cur, false))
    }

    pub fn inc_ref(&mut self, id: NodeId) {
        self.get_mut(id).expect("inc_ref: no node").ref_count += 1;
    }

    /// Drops one handle reference. Reclaims the slot when the node is
    /// already tombstoned and this was the last reference.
    pub fn release_ref(&mut self, id: NodeId) {
        let reclaim = {
            let node = match self.get_mut(id) {
                Some(n) => n,
                None => return,
            };
            assert_ne!(node.ref_count, 0, "release_ref: refcount zero");
            node.ref_count -= 1;
            node.ref_count == 0 && node.is_tombstoned()
        };
        if reclaim {
            self.reclaim(id);
        }
    }

    fn reclaim(&mut self, id: NodeId) {
        debug_assert!(id != self.root());
        self.slots[id.index()] = None;
        self.free.push(id);
    }

    /// Unlinks and tombstones a node and, recursively, its children.
    /// Slots without remaining handle references are reclaimed at once.
    /// Returns every node that was tombstoned, so the caller can wake
    /// threads blocked on them.
    pub fn destroy(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut affected = Vec::new();
        self.destroy_inner(id, &mut affected);
        affected
    }

    fn destroy_inner(&mut self, id: NodeId, affected: &mut Vec<NodeId>) {
        if self.get(id).is_none() || id == self.root() {
            return;
        }
        let mut child = self.get(id).and_then(|n| n.first_child);
        while let Some(c) = child {
            let next = self.get(c).and_then(|n| n.next);
            self.destroy_inner(c, affected);
            child = next;
        }
        self.detach(id);
        let reclaim = {
            let node = self.get_mut(id).expect("destroy: no node");
            node.name = None;
            node.first_child = None;
            node.last_child = None;
            node.ref_count == 0
        };
        affected.push(id);
        if reclaim {
            self.reclaim(id);
        }
    }

    /// Close hook for the last handle of a channel: destruction is
    /// deferred while requests are still queued for the server, but the
    /// reply list is dropped since no reader remains.
    pub fn release_channel(&mut self, id: NodeId) -> ChannelRelease {
        let defer = match self.get_mut(id).and_then(|n| n.channel_mut()) {
            Some(ch) if ch.has_request() => {
                ch.doom();
                true
            },
            Some(_) => false,
            None => false,
        };
        if defer {
            log::trace!("channel {:?} destruction deferred, requests pending", id);
            ChannelRelease::Deferred
        } else {
            ChannelRelease::Destroyed(self.destroy(id))
        }
    }

    pub fn fileinfo(&self, id: NodeId) -> IoResult<FileInfo> {
        let node = self.live(id)?;
        Ok(FileInfo {
            device: VFS_DEV_NO,
            inode: id.as_u64(),
            mode: node.mode.bits(),
            uid: node.uid,
            gid: node.gid,
            size: node.payload_size(),
        })
    }

    /// Number of occupied slots, tombstones included. Used by leak checks.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Sum of handle references over all nodes. Used by leak checks.
    pub fn total_refs(&self) -> u64 {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|n| n.ref_count as u64)
            .sum()
    }

    /// Absolute path of a live node, for diagnostics
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.get(c) {
                Some(n) => {
                    if let Some(name) = n.name.as_deref() {
                        if !name.is_empty() {
                            parts.push(name);
                        }
                    }
                    cur = n.parent;
                },
                None => break,
            }
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for p in parts.iter().rev() {
            out.push('/');
            out.push_str(p);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::error::IoError;

    fn arena() -> NodeArena {
        NodeArena::new(1024)
    }

    fn user(uid: u32) -> Caller {
        Caller {
            pid: Some(ProcessId::from_u64(uid as u64 + 10)),
            uid,
            gid: 100,
        }
    }

    #[test]
    fn tree_links_stay_consistent() {
        let mut a = arena();
        let root = a.root();
        let d1 = a.create_dir(&Caller::KERNEL, root, "sys").unwrap();
        let d2 = a.create_dir(&Caller::KERNEL, root, "dev").unwrap();
        let d3 = a.create_dir(&Caller::KERNEL, root, "tmp").unwrap();
        assert_eq!(a.children(root), [d1, d2, d3]);

        let destroyed = a.destroy(d2);
        assert_eq!(destroyed, [d2]);
        assert_eq!(a.children(root), [d1, d3]);
        assert!(a.get(d2).is_none());
    }

    #[test]
    fn destroy_is_recursive_and_tombstones_referenced_nodes() {
        let mut a = arena();
        let root = a.root();
        let d = a.create_dir(&Caller::KERNEL, root, "d").unwrap();
        let f = a.create_file(&Caller::KERNEL, d, "f").unwrap();
        a.inc_ref(f);

        let destroyed = a.destroy(d);
        assert_eq!(destroyed, [f, d]);
        // d had no references: reclaimed. f keeps a tombstone.
        assert!(a.get(d).is_none());
        let tomb = a.get(f).unwrap();
        assert!(tomb.is_tombstoned());
        assert!(a.live(f).is_err());

        a.release_ref(f);
        assert!(a.get(f).is_none());
    }

    #[test]
    fn resolve_walks_dots_and_links() {
        let mut a = arena();
        let root = a.root();
        let sys = a.create_dir(&Caller::KERNEL, root, "system").unwrap();
        let procs = a.create_dir(&Caller::KERNEL, sys, "processes").unwrap();
        let f = a.create_file(&Caller::KERNEL, procs, "x").unwrap();
        a.create_link(&Caller::KERNEL, root, "px", f).unwrap();

        let (id, created) = a
            .resolve(Path::new("/system/./processes/../processes/x"), None, true)
            .unwrap();
        assert_eq!(id, f);
        assert!(!created);

        let (id, _) = a.resolve(Path::new("/px"), None, true).unwrap();
        assert_eq!(id, f);
    }

    #[test]
    fn resolve_reports_real_paths_and_missing_paths() {
        let mut a = arena();
        let root = a.root();
        a.create_dir(&Caller::KERNEL, root, "system").unwrap();

        match a.resolve(Path::new("/home/user/x"), None, true) {
            Err(IoError::Code(ErrorCode::real_path)) => {},
            other => panic!("expected real_path, got {:?}", other),
        }
        match a.resolve(Path::new("/system/nosuch/x"), None, true) {
            Err(IoError::Code(ErrorCode::path_not_found)) => {},
            other => panic!("expected path_not_found, got {:?}", other),
        }
    }

    #[test]
    fn resolve_creates_final_component_on_demand() {
        let mut a = arena();
        let root = a.root();
        a.create_dir(&Caller::KERNEL, root, "tmp").unwrap();
        let c = user(5);
        let (id, created) = a.resolve(Path::new("/tmp/new"), Some(&c), true).unwrap();
        assert!(created);
        let n = a.get(id).unwrap();
        assert_eq!(n.name(), Some("new"));
        assert_eq!(n.uid, 5);
        assert!(n.mode().is_file());
    }

    #[test]
    fn permission_triples_selected_in_order() {
        let mut a = arena();
        let root = a.root();
        let f = a.create_file(&user(5), root, "f").unwrap();
        // strip the OTHER_READ bit
        let node = a.get_mut(f).unwrap();
        node.mode.remove(NodeMode::OTHER_READ);

        assert!(a.has_access(&user(5), f, AccessMode::READ).is_ok());
        // same gid (100): group read allowed
        assert!(a.has_access(&user(6), f, AccessMode::READ).is_ok());
        // other uid and gid: no read bit
        let stranger = Caller {
            pid: Some(ProcessId::from_u64(99)),
            uid: 9,
            gid: 9,
        };
        assert!(a.has_access(&stranger, f, AccessMode::READ).is_err());
        // write: only the owner triple has it
        assert!(a.has_access(&user(6), f, AccessMode::WRITE).is_err());
        // root bypasses rw but not exec
        let root_user = Caller {
            pid: Some(ProcessId::from_u64(1)),
            uid: 0,
            gid: 0,
        };
        assert!(a.has_access(&root_user, f, AccessMode::WRITE).is_ok());
        assert!(a.has_access(&root_user, f, AccessMode::EXEC).is_err());
    }

    #[test]
    fn channel_release_defers_while_requests_pending() {
        let mut a = arena();
        let root = a.root();
        let dev = a.create_dir(&Caller::KERNEL, root, "dev").unwrap();
        let drv = a
            .create_driver_node(&user(1), dev, "echo", ydinabi::fs::DriverKind::SERVICE)
            .unwrap();
        let chan = a.create_channel(&user(2), drv).unwrap();

        a.get_mut(chan)
            .unwrap()
            .channel_mut()
            .unwrap()
            .push(crate::filesystem::channel::Queue::Send, alloc::vec![1, 2])
            .unwrap();

        match a.release_channel(chan) {
            ChannelRelease::Deferred => {},
            other => panic!("expected deferral, got {:?}", other),
        }
        assert!(a.get(chan).unwrap().channel().unwrap().is_doomed());

        // drain the request, then release again
        a.get_mut(chan)
            .unwrap()
            .channel_mut()
            .unwrap()
            .pop(crate::filesystem::channel::Queue::Send)
            .unwrap();
        match a.release_channel(chan) {
            ChannelRelease::Destroyed(ids) => assert_eq!(ids, [chan]),
            other => panic!("expected destruction, got {:?}", other),
        }
    }

    #[test]
    fn slot_reuse_through_free_list() {
        let mut a = arena();
        let root = a.root();
        let f1 = a.create_file(&Caller::KERNEL, root, "a").unwrap();
        a.destroy(f1);
        let f2 = a.create_file(&Caller::KERNEL, root, "b").unwrap();
        assert_eq!(f1, f2);
    }

    #[test]
    fn arena_limit_behaves_like_oom() {
        let mut a = NodeArena::new(2);
        let root = a.root();
        a.create_file(&Caller::KERNEL, root, "a").unwrap();
        match a.create_file(&Caller::KERNEL, root, "b") {
            Err(IoError::Code(ErrorCode::not_enough_mem)) => {},
            other => panic!("expected not_enough_mem, got {:?}", other),
        }
    }
}

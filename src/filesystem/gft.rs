use alloc::vec::Vec;

use ydinabi::fs::{DeviceId, OpenFlags};
use ydinabi::process::ProcessId;

use super::error::{ErrorCode, IoResult};
use super::node::NodeId;

/// How many slots the table grows by when the free-list runs dry
const GFT_CHUNK: usize = 16;

/// Index into the global open-file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileNo(u32);
impl FileNo {
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What an open file points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTarget {
    /// Node in the virtual tree
    Virtual(NodeId),
    /// Inode on a real filesystem, reached through the fs driver
    Real { inode: u64, device: DeviceId },
}

impl FileTarget {
    pub fn node(self) -> Option<NodeId> {
        match self {
            Self::Virtual(id) => Some(id),
            Self::Real { .. } => None,
        }
    }
}

/// An entry in the global file table. `flags.is_empty()` marks a free
/// slot; such slots carry no references and sit on the free-list.
#[derive(Debug)]
pub struct GftEntry {
    pub(super) flags: OpenFlags,
    pub(super) owner: Option<ProcessId>,
    pub(super) ref_count: u32,
    pub(super) position: u64,
    pub(super) target: FileTarget,
    next_free: Option<FileNo>,
}

impl GftEntry {
    fn unused() -> Self {
        Self {
            flags: OpenFlags::empty(),
            owner: None,
            ref_count: 0,
            position: 0,
            target: FileTarget::Real {
                inode: 0,
                device: DeviceId(0),
            },
            next_free: None,
        }
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn target(&self) -> FileTarget {
        self.target
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// The global open-file table: a growable arena with a singly-linked
/// free-list threaded through released slots.
#[derive(Debug)]
pub struct Gft {
    entries: Vec<GftEntry>,
    free_head: Option<FileNo>,
    limit: usize,
}

impl Gft {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            limit,
        }
    }

    pub fn get(&self, file: FileNo) -> Option<&GftEntry> {
        self.entries.get(file.index())
    }

    /// Entry lookup for io paths: a free slot is an invalid file
    pub fn used(&self, file: FileNo) -> IoResult<&GftEntry> {
        match self.entries.get(file.index()) {
            Some(e) if !e.flags.is_empty() => Ok(e),
            _ => Err(ErrorCode::invalid_file.into()),
        }
    }

    pub fn used_mut(&mut self, file: FileNo) -> IoResult<&mut GftEntry> {
        match self.entries.get_mut(file.index()) {
            Some(e) if !e.flags.is_empty() => Ok(e),
            _ => Err(ErrorCode::invalid_file.into()),
        }
    }

    /// Sharing search for plain files: an entry with the same target,
    /// owner and flags is reused; a foreign entry that also writes makes
    /// the open fail. Channels and pipes never reach this; every such
    /// open gets a fresh handle with its own position and lock state.
    pub fn find_shared(
        &self,
        owner: Option<ProcessId>,
        flags: OpenFlags,
        target: FileTarget,
    ) -> Result<Option<FileNo>, ErrorCode> {
        for (i, e) in self.entries.iter().enumerate() {
            if e.flags.is_empty() || e.target != target {
                continue;
            }
            if e.owner == owner {
                if e.flags == flags {
                    return Ok(Some(FileNo(i as u32)));
                }
            } else if flags.contains(OpenFlags::WRITE) && e.flags.contains(OpenFlags::WRITE) {
                // two processes writing the same plain file at the same
                // time is never what anyone wants
                return Err(ErrorCode::file_in_use);
            }
        }
        Ok(None)
    }

    /// Takes a slot from the free-list, extending the arena by a chunk
    /// when it is empty. All new slots beyond the returned one go onto
    /// the free-list.
    pub fn allocate(
        &mut self,
        owner: Option<ProcessId>,
        flags: OpenFlags,
        target: FileTarget,
    ) -> IoResult<FileNo> {
        debug_assert!(!flags.is_empty(), "allocating a free-marked entry");
        let file = match self.free_head.take() {
            Some(f) => {
                self.free_head = self.entries[f.index()].next_free.take();
                f
            },
            None => {
                let start = self.entries.len();
                if start >= self.limit {
                    return Err(ErrorCode::no_free_file.into());
                }
                let grow = core::cmp::min(GFT_CHUNK, self.limit - start);
                for _ in 0..grow {
                    self.entries.push(GftEntry::unused());
                }
                for j in (start + 1..start + grow).rev() {
                    self.entries[j].next_free = self.free_head.take();
                    self.free_head = Some(FileNo(j as u32));
                }
                FileNo(start as u32)
            },
        };
        self.entries[file.index()] = GftEntry {
            flags,
            owner,
            ref_count: 1,
            position: 0,
            target,
            next_free: None,
        };
        Ok(file)
    }

    /// Marks the slot unused and threads it onto the free-list
    pub fn release(&mut self, file: FileNo) {
        let e = &mut self.entries[file.index()];
        debug_assert_eq!(e.ref_count, 0, "releasing a referenced entry");
        e.flags = OpenFlags::empty();
        e.owner = None;
        e.position = 0;
        e.next_free = self.free_head.take();
        self.free_head = Some(file);
    }

    /// Every live handle owned by `pid`
    pub fn owned_by(&self, pid: ProcessId) -> Vec<FileNo> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.flags.is_empty() && e.owner == Some(pid))
            .map(|(i, _)| FileNo(i as u32))
            .collect()
    }

    /// All live handles and their entries
    pub fn iter_used(&self) -> impl Iterator<Item = (FileNo, &GftEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.flags.is_empty())
            .map(|(i, e)| (FileNo(i as u32), e))
    }

    /// Number of live entries. Used by leak checks.
    pub fn used_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.flags.is_empty()).count()
    }
}

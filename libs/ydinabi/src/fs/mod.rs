use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub mod protocol;

/// Device number of the virtual filesystem itself. Real filesystems get
/// nonzero numbers assigned by their driver.
pub const VFS_DEV_NO: DeviceId = DeviceId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u16);

bitflags! {
    /// Flags of an open file. An all-zero value marks a free slot in the
    /// global file table, so every live handle carries at least one bit.
    pub struct OpenFlags: u16 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        /// Handle may exchange typed messages (`send_msg`/`receive_msg`)
        const MSGS    = 1 << 2;
        /// Reads return 0 instead of blocking
        const NOBLOCK = 1 << 3;
        /// Handle belongs to the serving side of a driver
        const DRIVER  = 1 << 4;
        const APPEND  = 1 << 5;
        const CREATE  = 1 << 6;
    }
}

bitflags! {
    /// What kind of device a driver serves
    pub struct DriverKind: u8 {
        const BLOCK   = 1 << 0;
        const CHAR    = 1 << 1;
        const FS      = 1 << 2;
        const FILE    = 1 << 3;
        const SERVICE = 1 << 4;
        /// All clients share one channel; replies wake every waiter
        const SINGLE_PIPE = 1 << 5;
    }
}

/// Origin for `seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Node metadata as returned by `stat`/`fstat`.
/// `Copy`, since the kernel hands it out by value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub device: DeviceId,
    pub inode: u64,
    /// Raw mode bits: node type and permission triples
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

/// Header prefixed to every message sent with `send_msg`: a one-byte
/// message id followed by the payload length as a little-endian u32.
/// The kernel treats the payload as opaque but validates the length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub id: u8,
    pub length: u32,
}
impl MsgHeader {
    pub const SIZE: usize = 5;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let len = self.length.to_le_bytes();
        [self.id, len[0], len[1], len[2], len[3]]
    }

    /// Parses a header. Returns `None` if the buffer is too short or the
    /// claimed payload length is not covered by the remaining bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let length = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        if (length as usize) > bytes.len() - Self::SIZE {
            return None;
        }
        Some(Self {
            id: bytes[0],
            length,
        })
    }
}

// One id byte plus four length bytes; drivers depend on this layout.
const_assert!(MsgHeader::SIZE == 1 + 4);

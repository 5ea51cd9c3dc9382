//! Interface types for the kernel ↔ filesystem-driver delegation channel.
//!
//! When path resolution leaves the virtual namespace, the kernel turns
//! the operation into a [`Request`], encodes it with `pinecone` and sends
//! it on its channel to the driver registered under the name `fs`. The
//! driver answers with a [`Response`] the same way. Message id
//! [`FS_DELEGATE_MSG`] is used in both directions.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use super::FileInfo;

/// Message id used on the delegation channel
pub const FS_DELEGATE_MSG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Open {
        path: String,
        /// Raw `OpenFlags` bits
        flags: u16,
    },
    Read {
        inode: u64,
        device: u16,
        offset: u64,
        count: u64,
    },
    Write {
        inode: u64,
        device: u16,
        offset: u64,
        data: Vec<u8>,
    },
    Stat {
        path: String,
    },
    Istat {
        inode: u64,
        device: u16,
    },
    Chmod {
        path: String,
        mode: u32,
    },
    Chown {
        path: String,
        uid: u32,
        gid: u32,
    },
    Link {
        old_path: String,
        new_path: String,
    },
    Unlink {
        path: String,
    },
    Mkdir {
        path: String,
    },
    Rmdir {
        path: String,
    },
    Close {
        inode: u64,
        device: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Result of `Open`: the real inode and device number
    Opened { inode: u64, device: u16 },
    Data(Vec<u8>),
    Written(u64),
    Info(FileInfo),
    Done,
    /// Error code magnitude, as in [`crate::ErrorCode`]
    Error(u64),
}

//! Types shared between the kernel and user space: system call error
//! codes, file flags, event masks, the message wire format and the
//! delegation protocol spoken with the filesystem driver.

#![no_std]

extern crate alloc;

pub mod event;
pub mod fs;
pub mod process;
pub mod syscall;

pub use self::syscall::ErrorCode;

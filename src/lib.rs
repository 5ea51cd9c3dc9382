//! Core of a small educational microkernel: a unified virtual
//! filesystem namespace that carries in-memory files, per-process
//! state, pipes and the typed message channels user-space drivers serve
//! requests through, together with the thread, event, lock and timer
//! primitives the blocking io paths are built on.
//!
//! The crate is freestanding (`no_std` + `alloc`); the host environment
//! provides the allocator and drives the [`kernel::Kernel`] value with
//! system calls, clock ticks and signals.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod filesystem;
pub mod kernel;
pub mod multitasking;
pub mod syscall;

pub use self::kernel::{Kernel, Limits, KERNEL};
pub use self::syscall::{Syscall, SyscallOutcome, SyscallResult, SyscallValue};

pub use ydinabi::event::EventMask;
pub use ydinabi::fs::{DriverKind, OpenFlags, Whence};
pub use ydinabi::process::{ProcessId, ThreadId};
pub use ydinabi::ErrorCode;

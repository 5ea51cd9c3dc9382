pub mod event;
pub mod lock;
pub mod process;
pub mod queues;
pub mod scheduler;
pub mod thread;
pub mod waitfor;

pub use self::event::{EventTable, WakeTarget, Wakeup};
pub use self::lock::{LockFlags, LockKey, LockScope, LockTable};
pub use self::process::Process;
pub use self::queues::{Queues, Schedule};
pub use self::scheduler::Scheduler;
pub use self::thread::{Thread, ThreadState};
pub use self::waitfor::{WaitFor, WaitObject};

pub use ydinabi::process::{ProcessId, ThreadId};

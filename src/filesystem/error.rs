pub use ydinabi::ErrorCode;

use crate::multitasking::WaitFor;

pub type IoResult<T> = Result<T, IoError>;

/// Outcome of an io operation that did not produce a value.
///
/// `RepeatAfter` is not an error in the usual sense: it instructs the
/// system call layer to park the calling thread on the given wait
/// condition and re-issue the operation once it is woken. Any state the
/// operation mutated before returning `RepeatAfter` must be legal, since
/// other threads run before the retry.
#[derive(Debug, Clone)]
#[must_use]
pub enum IoError {
    /// An actual error
    Code(ErrorCode),
    /// Park the thread and repeat the operation once the condition holds
    RepeatAfter(WaitFor),
}

impl IoError {
    /// The error code, if this is a real error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Code(c) => Some(*c),
            Self::RepeatAfter(_) => None,
        }
    }
}

impl From<ErrorCode> for IoError {
    fn from(code: ErrorCode) -> Self {
        Self::Code(code)
    }
}

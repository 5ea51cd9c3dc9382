use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Error codes carried back through the system call return slot as small
/// negative integers; the variant discriminant is the magnitude.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[allow(non_camel_case_types)]
#[repr(u64)]
pub enum ErrorCode {
    /// File number is unused, or the node behind it has been destroyed
    invalid_file = 1,
    /// Argument out of range or of the wrong kind
    invalid_args,
    /// Process has no free file descriptor slot
    no_free_fd,
    /// Global file table cannot be extended any further
    no_free_file,
    no_read_perm,
    no_write_perm,
    no_exec_perm,
    /// Allocation failed; the operation has been rolled back
    not_enough_mem,
    file_exists,
    /// Another process already has a write handle on this file
    file_in_use,
    path_not_found,
    /// Hard link would cross the virtual/real device boundary
    link_device,
    is_dir,
    no_directory,
    /// Target is neither a regular file nor a link
    no_file_or_link,
    /// Driver names must be non-empty and alphanumeric
    inv_driver_name,
    driver_exists,
    /// File is not a driver owned by the calling process
    not_own_driver,
    no_client_waiting,
    unsupported_op,
    /// A signal arrived while the thread was blocked
    interrupted,
    /// Internal sentinel: the path belongs to the real filesystem and the
    /// operation must be delegated to the fs driver. Never user-visible.
    real_path,
}

impl ErrorCode {
    /// Wire representation: small negative integer
    pub fn to_errno(self) -> i64 {
        -(self as u64 as i64)
    }

    pub fn from_errno(v: i64) -> Option<Self> {
        use core::convert::TryFrom;
        if v >= 0 {
            return None;
        }
        Self::try_from((-v) as u64).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_roundtrip() {
        let e = ErrorCode::file_in_use;
        assert!(e.to_errno() < 0);
        assert_eq!(ErrorCode::from_errno(e.to_errno()), Some(e));
        assert_eq!(ErrorCode::from_errno(0), None);
        assert_eq!(ErrorCode::from_errno(7), None);
    }
}

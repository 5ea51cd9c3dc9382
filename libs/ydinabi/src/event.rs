//! Event masks used by `wait`, `notify` and the blocking io paths.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

bitflags! {
    /// A bitset identifying a class of wake-up reasons.
    ///
    /// The kernel-owned bits (`CLIENT`, `RECEIVED_MSG`, `DATA_READABLE`,
    /// `THREAD_DIED`, `UNLOCK`) can be waited for where permitted, but
    /// never notified from user space; the `USER_*` bits can be both.
    pub struct EventMask: u32 {
        /// A client has written a request to one of the caller's drivers
        const CLIENT        = 1 << 0;
        /// A reply has arrived on a channel the caller has open
        const RECEIVED_MSG  = 1 << 1;
        /// A driver the caller is a client of has data ready
        const DATA_READABLE = 1 << 2;
        /// A thread of the watched process has exited (kernel internal)
        const THREAD_DIED   = 1 << 3;
        /// An advisory lock has been released (kernel internal)
        const UNLOCK        = 1 << 4;

        const USER_1 = 1 << 8;
        const USER_2 = 1 << 9;
        const USER_3 = 1 << 10;
        const USER_4 = 1 << 11;

        /// Bits a user thread may pass to `wait`
        const USER_WAIT_MASK = Self::CLIENT.bits
            | Self::RECEIVED_MSG.bits
            | Self::DATA_READABLE.bits
            | Self::USER_1.bits
            | Self::USER_2.bits
            | Self::USER_3.bits
            | Self::USER_4.bits;

        /// Bits a user thread may pass to `notify`
        const USER_NOTIFY_MASK = Self::USER_1.bits
            | Self::USER_2.bits
            | Self::USER_3.bits
            | Self::USER_4.bits;

        /// Bits whose condition the kernel can re-verify after a wake-up.
        /// Waits containing any other bit complete on the first wake.
        const VERIFIABLE_MASK = Self::CLIENT.bits
            | Self::RECEIVED_MSG.bits
            | Self::DATA_READABLE.bits;
    }
}

// Kernel-verifiable wait bits and user-notifiable bits must not overlap:
// a forged notify must never look like a kernel io event.
const_assert_eq!(
    EventMask::VERIFIABLE_MASK.bits() & EventMask::USER_NOTIFY_MASK.bits(),
    0
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_subsets() {
        assert!(EventMask::USER_WAIT_MASK.contains(EventMask::CLIENT));
        assert!(!EventMask::USER_NOTIFY_MASK.contains(EventMask::CLIENT));
        assert!(EventMask::USER_NOTIFY_MASK.contains(EventMask::USER_3));
        assert!(!EventMask::USER_WAIT_MASK.contains(EventMask::THREAD_DIED));
    }
}

//! Platform abstractions for the VCMD device layer.
//!
//! The scheduler sleeps in process context (admission waits, completion
//! waits, the bounded abort spin-wait) but the crate itself is freestanding.
//! All suspension goes through the [`Osal`] trait; cancellation of a blocked
//! caller is cooperative via [`CancelToken`], standing in for kernel signal
//! delivery.

use core::sync::atomic::{AtomicBool, Ordering};

/// Time type for timestamps, microseconds.
pub type TimeStamp = u64;

/// OSAL trait for platform-specific implementations.
pub trait Osal {
    /// Get current timestamp in microseconds.
    fn get_time_us(&self) -> TimeStamp;

    /// Busy-delay for the specified microseconds.
    fn udelay(&self, us: u32);

    /// Sleep for the specified milliseconds.
    fn msleep(&self, ms: u32);

    /// Check if timeout occurred.
    fn timeout_check(&self, start_time: TimeStamp, timeout_us: u32) -> bool {
        let elapsed = self.get_time_us().saturating_sub(start_time);
        elapsed >= timeout_us as u64
    }
}

/// Cooperative cancellation for interruptible waits.
///
/// The device-node layer arms the token when the calling task receives a
/// signal; every polling wait in the crate checks it between delay slices
/// and fails with `VcmdError::Interrupted`.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub const fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

//! Kernel error taxonomy.

use core::fmt;

/// Failure results returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The object is not in a state that permits the operation, e.g.
    /// resuming a thread that is not blocked or arming an armed timer.
    InvalidState,
    /// Scheduler bookkeeping is inconsistent. Never returned to a caller
    /// in normal operation: see [`fatal`].
    QueueCorruption,
    /// No free slot in a fixed pool, or a counter would overflow.
    ResourceExhausted,
    /// Out-of-range argument or a handle of the wrong kind.
    InvalidParam,
    /// A wait expired, or a non-blocking take found nothing available.
    Timeout,
    /// The object being waited on was deleted or reset.
    Deleted,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::InvalidState => "operation not valid in current state",
            KernelError::QueueCorruption => "scheduler queue corruption",
            KernelError::ResourceExhausted => "resource exhausted",
            KernelError::InvalidParam => "invalid parameter",
            KernelError::Timeout => "timed out",
            KernelError::Deleted => "object deleted while waiting",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// Halt on unrecoverable kernel state.
///
/// Scheduling on corrupted queues would misbehave silently, so this logs
/// and panics; on target `panic-halt` traps the core.
#[cold]
pub fn fatal(what: &str) -> ! {
    log::error!("kernel fatal: {}: {}", KernelError::QueueCorruption, what);
    panic!("{}: {}", KernelError::QueueCorruption, what);
}

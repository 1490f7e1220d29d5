//! # Architecture Abstraction Layer
//!
//! The narrow interface the kernel needs from the CPU: interrupt masking,
//! context switching and initial stack frames. The Cortex-M4 port is built
//! only for bare-metal targets; host builds use the simulated port in the
//! unit tests.

use crate::thread::{ThreadEntry, ThreadId};

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(test)]
pub(crate) mod sim;

/// Hardware services the scheduler delegates to.
///
/// All functions are associated, not methods: interrupt state and the
/// switch mechanism are global to the core.
pub trait Port {
    /// Interrupt state saved by [`Port::disable_interrupts`].
    type Level: Copy;

    /// Mask interrupts, returning the previous state.
    fn disable_interrupts() -> Self::Level;

    /// Restore the state returned by the matching `disable_interrupts`.
    fn restore_interrupts(level: Self::Level);

    /// Switch from `from` (none when the scheduler starts) to `to`.
    ///
    /// May be deferred (PendSV on Cortex-M) until the current critical
    /// section ends; the kernel has already updated its bookkeeping.
    fn context_switch(from: Option<ThreadId>, to: ThreadId);

    /// Build the initial frame for `entry(parameter)` on `stack` and return
    /// the saved stack pointer.
    fn init_stack(stack: &mut [u8], entry: ThreadEntry, parameter: usize) -> usize;
}

//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections. All ready-queue, timer-list and
//! wait-list state is mutated inside one, so thread-context calls and the
//! tick interrupt never observe each other's half-finished updates.
//!
//! A multi-core port would harden only this boundary.

use core::marker::PhantomData;

use crate::arch::Port;

/// Scoped interrupt-disable guard.
///
/// Interrupts are masked by [`CriticalSection::enter`] and the previous
/// state is restored when the guard drops, on every exit path including
/// early returns and `?`. Guards nest.
///
/// Keep critical sections as short as possible to minimize interrupt
/// latency, and never block while holding one.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct CriticalSection<P: Port> {
    level: P::Level,
    _port: PhantomData<P>,
}

impl<P: Port> CriticalSection<P> {
    #[inline]
    pub fn enter() -> Self {
        Self {
            level: P::disable_interrupts(),
            _port: PhantomData,
        }
    }
}

impl<P: Port> Drop for CriticalSection<P> {
    #[inline]
    fn drop(&mut self) {
        P::restore_interrupts(self.level);
    }
}

/// Execute a closure within a critical section.
///
/// # Usage
/// ```ignore
/// sync::critical_section::<CortexM4, _, _>(|| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<P, F, R>(f: F) -> R
where
    P: Port,
    F: FnOnce() -> R,
{
    let _cs = CriticalSection::<P>::enter();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{interrupts_masked, SimPort};

    #[test]
    fn test_guard_restores_on_drop() {
        assert!(!interrupts_masked());
        {
            let _cs = CriticalSection::<SimPort>::enter();
            assert!(interrupts_masked());
            {
                let _inner = CriticalSection::<SimPort>::enter();
                assert!(interrupts_masked());
            }
            // Inner guard restores the outer, still-masked state.
            assert!(interrupts_masked());
        }
        assert!(!interrupts_masked());
    }

    #[test]
    fn test_guard_released_on_early_return() {
        fn fails() -> Result<(), ()> {
            let _cs = CriticalSection::<SimPort>::enter();
            Err::<(), ()>(())?;
            Ok(())
        }
        assert!(fails().is_err());
        assert!(!interrupts_masked());
    }

    #[test]
    fn test_closure_helper() {
        let v = critical_section::<SimPort, _, _>(|| interrupts_masked());
        assert!(v);
        assert!(!interrupts_masked());
    }
}

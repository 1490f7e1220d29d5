//! Simulated port for host tests. Records every context switch and the
//! interrupt mask, per test thread.

extern crate std;

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use super::Port;
use crate::thread::{ThreadEntry, ThreadId};

std::thread_local! {
    static MASKED: Cell<bool> = const { Cell::new(false) };
    static SWITCHES: RefCell<Vec<(Option<ThreadId>, ThreadId)>> =
        const { RefCell::new(Vec::new()) };
}

pub(crate) struct SimPort;

impl Port for SimPort {
    type Level = bool;

    fn disable_interrupts() -> bool {
        MASKED.with(|m| m.replace(true))
    }

    fn restore_interrupts(level: bool) {
        MASKED.with(|m| m.set(level));
    }

    fn context_switch(from: Option<ThreadId>, to: ThreadId) {
        SWITCHES.with(|s| s.borrow_mut().push((from, to)));
    }

    fn init_stack(stack: &mut [u8], _entry: ThreadEntry, _parameter: usize) -> usize {
        (stack.as_ptr() as usize + stack.len()) & !0x07
    }
}

/// Whether interrupts are currently masked on this test thread.
pub(crate) fn interrupts_masked() -> bool {
    MASKED.with(|m| m.get())
}

/// Drain the recorded context switches.
pub(crate) fn take_switches() -> Vec<(Option<ThreadId>, ThreadId)> {
    SWITCHES.with(|s| core::mem::take(&mut *s.borrow_mut()))
}

//! # Target Runtime
//!
//! The single kernel instance for the Cortex-M4 target and the
//! thread-context API around it. Each call runs with interrupts masked for
//! its whole duration; a switch requested inside it is carried out by
//! PendSV as soon as the mask is lifted.
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► os::init()         ← kernel + idle thread
//!         ├─► os::spawn()  ×N    ← threads, Ready
//!         └─► os::start(cp)      ← SysTick on, first thread (no return)
//! ```

use core::ptr::addr_of_mut;

use crate::arch::cortex_m4::{self, CortexM4};
use crate::error::{KernelError, Result};
use crate::ipc::{Acquire, MutexId, SemId, WaitOrder};
use crate::kernel::Kernel;
use crate::sync::critical_section;
use crate::thread::{ThreadEntry, ThreadId};
use crate::tick::{Tick, Wait};
use crate::timer::{TimerAction, TimerId, TimerMode};

static mut KERNEL: Kernel<CortexM4> = Kernel::new();

/// Run `f` on the kernel with interrupts masked.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<CortexM4>) -> R) -> R {
    // SAFETY: single core, and the mask excludes every other accessor
    // (SysTick, PendSV, other threads) for the lifetime of the borrow.
    critical_section::<CortexM4, _, _>(|| f(unsafe { &mut *addr_of_mut!(KERNEL) }))
}

/// Create the idle thread. Call once before spawning.
pub fn init() -> Result<()> {
    with_kernel(|k| k.create_idle(idle_entry)).map(|_| ())
}

/// Create and start a thread.
pub fn spawn(
    name: &str,
    entry: ThreadEntry,
    parameter: usize,
    priority: u8,
    time_slice: u32,
) -> Result<ThreadId> {
    with_kernel(|k| {
        let id = k.thread_create(name, entry, parameter, priority, time_slice)?;
        k.thread_start(id)?;
        Ok(id)
    })
}

/// Start ticking and enter the highest-priority thread. Does not return.
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    // Masked until the first thread unmasks on entry.
    cortex_m::interrupt::disable();
    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    cortex_m4::set_interrupt_priorities();

    let first = with_kernel(|k| {
        let id = k.start()?;
        k.thread(id)
            .map(|t| t.stack_pointer())
            .ok_or(KernelError::InvalidState)
    });
    // The launch below replaces the switch `start` requested.
    let _ = cortex_m4::take_switch();

    match first {
        Ok(sp) => unsafe { cortex_m4::start_first_task(sp) },
        Err(e) => {
            log::error!("no thread to start: {}", e);
            loop {
                cortex_m::asm::wfi();
            }
        }
    }
}

/// The calling thread.
pub fn current() -> Option<ThreadId> {
    with_kernel(|k| k.thread_self())
}

pub fn tick_count() -> Tick {
    with_kernel(|k| k.tick())
}

pub fn yield_now() {
    with_kernel(|k| k.yield_current());
}

/// Sleep for `ticks`; returns once the thread runs again.
pub fn sleep(ticks: u32) -> Result<()> {
    with_kernel(|k| k.sleep(ticks))
}

/// Sleep until `*last + inc` for a drift-free period.
pub fn delay_until(last: &mut Tick, inc: u32) -> Result<()> {
    with_kernel(|k| k.delay_until(last, inc))
}

/// Close the calling thread.
pub fn exit() -> ! {
    if let Err(e) = with_kernel(|k| k.exit_current()) {
        log::error!("thread exit failed: {}", e);
    }
    loop {
        cortex_m::asm::wfi();
    }
}

/// Return address of every thread entry.
pub(crate) extern "C" fn thread_exit() -> ! {
    exit()
}

extern "C" fn idle_entry(_: usize) {
    loop {
        with_kernel(|k| k.reap());
        cortex_m::asm::wfi();
    }
}

/// Finish a take: by the time the blocked call returns the thread has
/// been switched out and back in, so the outcome is ready.
fn complete(acquired: Result<Acquire>) -> Result<()> {
    match acquired? {
        Acquire::Done => Ok(()),
        Acquire::Blocked => with_kernel(|k| {
            let me = k.thread_self().ok_or(KernelError::InvalidState)?;
            k.wait_result(me)
        }),
    }
}

// ---------------------------------------------------------------------------
// Semaphores and mutexes
// ---------------------------------------------------------------------------

pub fn sem_create(name: &str, value: u16, order: WaitOrder) -> Result<SemId> {
    with_kernel(|k| k.sem_create(name, value, order))
}

pub fn sem_take(id: SemId, wait: Wait) -> Result<()> {
    complete(with_kernel(|k| k.sem_take(id, wait)))
}

pub fn sem_release(id: SemId) -> Result<()> {
    with_kernel(|k| k.sem_release(id))
}

pub fn mutex_create(name: &str) -> Result<MutexId> {
    with_kernel(|k| k.mutex_create(name))
}

pub fn mutex_lock(id: MutexId, wait: Wait) -> Result<()> {
    complete(with_kernel(|k| k.mutex_take(id, wait)))
}

pub fn mutex_unlock(id: MutexId) -> Result<()> {
    with_kernel(|k| k.mutex_release(id))
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

pub fn timer_create(
    name: &str,
    action: TimerAction,
    ticks: u32,
    mode: TimerMode,
) -> Result<TimerId> {
    with_kernel(|k| k.timer_create(name, action, ticks, mode))
}

pub fn timer_start(id: TimerId) -> Result<()> {
    with_kernel(|k| k.timer_start(id))
}

pub fn timer_stop(id: TimerId) -> Result<bool> {
    with_kernel(|k| k.timer_stop(id))
}

// ---------------------------------------------------------------------------
// Exception glue
// ---------------------------------------------------------------------------

/// SysTick body.
pub(crate) fn tick() {
    with_kernel(|k| k.on_tick());
}

/// PendSV body: record the outgoing stack pointer and fetch the incoming.
pub(crate) fn swap_stack_pointers(from: Option<ThreadId>, psp: usize, to: ThreadId) -> usize {
    with_kernel(|k| {
        if let Some(f) = from {
            k.threads[f.index()].sp = psp;
        }
        k.threads[to.index()].sp
    })
}

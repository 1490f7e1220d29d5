//! # Kernel
//!
//! The kernel context: every piece of scheduler, timer and IPC state in one
//! explicitly owned value. Operations take `&mut Kernel` and mask
//! interrupts around each mutation, so the same instance can be driven
//! from thread context and from the tick interrupt.
//!
//! ## Startup Sequence
//!
//! ```text
//! Kernel::new()              ← const, can live in a static
//!   ├─► create_idle(entry)   ← lowest priority, never blocks
//!   ├─► thread_create() ×N   ← Init state
//!   ├─► thread_start()  ×N   ← Ready
//!   └─► start()              ← first scheduling decision
//! ```
//!
//! This file holds the context itself and the thread lifecycle. The
//! scheduling operations live in `scheduler.rs`, the tick path in
//! `clock.rs`, timers in `timer.rs` and semaphores/mutexes in `ipc.rs`.

use core::marker::PhantomData;

use crate::arch::Port;
use crate::config::{
    DEFAULT_TIME_SLICE, IDLE_PRIORITY, MAX_MUTEXES, MAX_SEMAPHORES, MAX_THREADS, PRIORITY_MAX,
};
use crate::error::{KernelError, Result};
use crate::ipc::{Mutex, Semaphore};
use crate::ready::ReadyQueue;
use crate::sync::CriticalSection;
use crate::thread::{
    BlockedOn, Queue, Thread, ThreadEntry, ThreadId, ThreadState, WaitOutcome,
};
use crate::tick::{Tick, TICK_MAX_WAIT};
use crate::timer::{TimerId, TimerManager};

/// Kernel context for one core.
pub struct Kernel<P: Port> {
    pub(crate) threads: [Thread; MAX_THREADS],
    pub(crate) ready: ReadyQueue,
    pub(crate) timers: TimerManager,
    pub(crate) sems: [Semaphore; MAX_SEMAPHORES],
    pub(crate) mutexes: [Mutex; MAX_MUTEXES],

    /// Global tick counter, wrapping.
    pub(crate) tick: Tick,
    /// Thread the CPU is executing (or is about to switch away from).
    pub(crate) current: Option<ThreadId>,
    pub(crate) started: bool,

    /// Scheduler lock nesting; no switches while non-zero.
    pub(crate) lock_nest: u16,
    /// Interrupt nesting; switches are deferred to the outermost exit.
    pub(crate) interrupt_nest: u8,
    /// A scheduling decision was deferred by a lock or interrupt.
    pub(crate) need_resched: bool,

    pub(crate) idle: Option<ThreadId>,
    _port: PhantomData<fn() -> P>,
}

impl<P: Port> Kernel<P> {
    pub const fn new() -> Self {
        Self {
            threads: [const { Thread::EMPTY }; MAX_THREADS],
            ready: ReadyQueue::new(),
            timers: TimerManager::new(),
            sems: [const { Semaphore::EMPTY }; MAX_SEMAPHORES],
            mutexes: [const { Mutex::EMPTY }; MAX_MUTEXES],
            tick: Tick::ZERO,
            current: None,
            started: false,
            lock_nest: 0,
            interrupt_nest: 0,
            need_resched: false,
            idle: None,
            _port: PhantomData,
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.index()).filter(|t| t.allocated)
    }

    /// The thread that owns the CPU.
    #[inline]
    pub fn thread_self(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        self.idle
    }

    /// First live thread with this (possibly truncated) name.
    pub fn thread_find(&self, name: &str) -> Option<ThreadId> {
        let name = crate::thread::object_name(name);
        self.threads
            .iter()
            .find(|t| t.is_live() && t.name == name)
            .map(|t| t.id)
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// An allocated, not yet closed thread.
    pub(crate) fn live(&self, id: ThreadId) -> Result<&Thread> {
        let t = self.thread(id).ok_or(KernelError::InvalidParam)?;
        if t.state == ThreadState::Closed {
            return Err(KernelError::InvalidState);
        }
        Ok(t)
    }

    /// The running thread, when called from thread context.
    pub(crate) fn running_thread(&self) -> Result<ThreadId> {
        if self.interrupt_nest > 0 {
            return Err(KernelError::InvalidState);
        }
        match self.current {
            Some(id) if self.threads[id.index()].state == ThreadState::Running => Ok(id),
            _ => Err(KernelError::InvalidState),
        }
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Create a thread in the `Init` state.
    ///
    /// `time_slice == 0` selects `DEFAULT_TIME_SLICE`. The port builds the
    /// initial stack frame so the first switch enters `entry(parameter)`.
    pub fn thread_create(
        &mut self,
        name: &str,
        entry: ThreadEntry,
        parameter: usize,
        priority: u8,
        time_slice: u32,
    ) -> Result<ThreadId> {
        if priority as usize >= PRIORITY_MAX || time_slice > TICK_MAX_WAIT {
            return Err(KernelError::InvalidParam);
        }
        let _cs = CriticalSection::<P>::enter();
        let slot = self
            .threads
            .iter()
            .position(|t| !t.allocated)
            .ok_or(KernelError::ResourceExhausted)?;
        let id = ThreadId(slot as u8);
        let t = &mut self.threads[slot];
        t.init(id, name, entry, parameter, priority, time_slice);
        t.sp = P::init_stack(&mut t.stack.0, entry, parameter);
        log::debug!("thread {} created as {:?}, priority {}", t.name(), id, priority);
        Ok(id)
    }

    /// Make an `Init` thread ready. Preempts the caller if it outranks it.
    pub fn thread_start(&mut self, id: ThreadId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        if self.live(id)?.state != ThreadState::Init {
            return Err(KernelError::InvalidState);
        }
        self.enqueue_ready(id);
        log::debug!("thread {:?} started", id);
        self.preempt_check(id);
        Ok(())
    }

    /// Create and start the idle thread at the lowest priority.
    ///
    /// The idle entry must never block; it is expected to call
    /// [`Kernel::reap`] and wait for interrupts.
    pub fn create_idle(&mut self, entry: ThreadEntry) -> Result<ThreadId> {
        if self.idle.is_some() {
            return Err(KernelError::InvalidState);
        }
        let id = self.thread_create("idle", entry, 0, IDLE_PRIORITY, DEFAULT_TIME_SLICE)?;
        self.thread_start(id)?;
        self.idle = Some(id);
        Ok(id)
    }

    /// Close a thread: detach it from every queue, cancel its timer and
    /// release the mutexes it holds. A closed thread is never scheduled
    /// again; its slot is freed by [`Kernel::reap`].
    ///
    /// Deleting the running thread switches away from it.
    pub fn thread_delete(&mut self, id: ThreadId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.live(id)?;
        if Some(id) == self.idle {
            return Err(KernelError::InvalidParam);
        }
        match self.threads[id.index()].queue {
            Queue::Ready => {
                if self.ready.remove(&mut self.threads, id).is_err() {
                    crate::error::fatal("ready thread missing from ready queue");
                }
            }
            Queue::Waiting => self.detach_waiter(id),
            Queue::Detached => {}
        }
        self.timers.stop(TimerId::of_thread(id));
        self.threads[id.index()].state = ThreadState::Closed;
        self.threads[id.index()].yield_pending = false;
        self.release_mutexes_owned_by(id);
        log::debug!("thread {:?} closed", id);
        if self.current == Some(id) {
            self.reschedule();
        }
        Ok(())
    }

    /// Close the running thread. Does not return to it on target.
    pub fn exit_current(&mut self) -> Result<()> {
        let id = self.current.ok_or(KernelError::InvalidState)?;
        self.thread_delete(id)
    }

    /// Free the slots of closed threads. The running thread's slot is kept
    /// until the CPU has switched off its stack. Returns how many slots
    /// were freed.
    pub fn reap(&mut self) -> usize {
        let _cs = CriticalSection::<P>::enter();
        let mut freed = 0;
        for t in self.threads.iter_mut() {
            if t.allocated && t.state == ThreadState::Closed && Some(t.id) != self.current {
                t.allocated = false;
                t.entry = None;
                freed += 1;
            }
        }
        if freed > 0 {
            log::debug!("reaped {} closed threads", freed);
        }
        freed
    }

    /// Make the first scheduling decision. Returns the thread that runs.
    pub fn start(&mut self) -> Result<ThreadId> {
        let _cs = CriticalSection::<P>::enter();
        if self.started {
            return Err(KernelError::InvalidState);
        }
        if self.ready.peek().is_none() {
            return Err(KernelError::InvalidState);
        }
        self.started = true;
        self.schedule();
        self.current.ok_or(KernelError::InvalidState)
    }

    // -----------------------------------------------------------------------
    // Timed waits
    // -----------------------------------------------------------------------

    /// Put the running thread to sleep for `ticks`. Zero yields instead.
    pub fn sleep(&mut self, ticks: u32) -> Result<()> {
        if ticks > TICK_MAX_WAIT {
            return Err(KernelError::InvalidParam);
        }
        let _cs = CriticalSection::<P>::enter();
        let id = self.running_thread()?;
        if ticks == 0 {
            self.yield_current();
            return Ok(());
        }
        let t = &mut self.threads[id.index()];
        t.state = ThreadState::Sleeping(self.tick.after(ticks));
        t.outcome = None;
        t.yield_pending = false;
        self.timers.start_thread_timer(id, self.tick, ticks);
        self.schedule();
        Ok(())
    }

    /// Sleep until `*last + inc`, then advance `*last` by `inc`, giving a
    /// drift-free period. If that point has already passed, `*last` is
    /// resynchronised to now and the call returns without sleeping.
    pub fn delay_until(&mut self, last: &mut Tick, inc: u32) -> Result<()> {
        if inc == 0 || inc > TICK_MAX_WAIT {
            return Err(KernelError::InvalidParam);
        }
        let now = self.tick;
        let target = last.after(inc);
        if target.is_after(now) {
            self.sleep(target.since(now))?;
            *last = target;
            Ok(())
        } else {
            *last = now;
            Ok(())
        }
    }

    /// Collect the outcome of the last blocking wait of `id`.
    ///
    /// After a take returned [`Acquire::Blocked`](crate::ipc::Acquire) the
    /// thread reads this once it runs again.
    pub fn wait_result(&mut self, id: ThreadId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let t = self
            .threads
            .get_mut(id.index())
            .filter(|t| t.allocated)
            .ok_or(KernelError::InvalidParam)?;
        match t.outcome.take() {
            Some(WaitOutcome::Signaled) => Ok(()),
            Some(WaitOutcome::TimedOut) => Err(KernelError::Timeout),
            Some(WaitOutcome::Deleted) => Err(KernelError::Deleted),
            None => Err(KernelError::InvalidState),
        }
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Walk every queue and verify the scheduler invariants:
    ///
    /// - ready bitmap bit `p` set iff ready list `p` is non-empty,
    /// - each TCB sits on at most one list, matching its state,
    /// - at most one thread is Running, and it is the current thread,
    /// - sleeping threads have an armed timer, the timer list is sorted.
    pub fn check_integrity(&self) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let corrupt = Err(KernelError::QueueCorruption);
        let queued = self.ready.check(&self.threads)?;
        self.timers.check()?;

        let mut ready = 0;
        let mut running = 0;
        for t in self.threads.iter().filter(|t| t.allocated) {
            let timer_armed = self
                .timers
                .get(TimerId::of_thread(t.id))
                .is_some_and(|tm| tm.is_armed());
            let ok = match t.state {
                ThreadState::Ready => {
                    ready += 1;
                    t.queue == Queue::Ready && !timer_armed
                }
                ThreadState::Running => {
                    running += 1;
                    t.queue == Queue::Detached && self.current == Some(t.id) && !timer_armed
                }
                ThreadState::Sleeping(_) => t.queue == Queue::Detached && timer_armed,
                ThreadState::Suspended(BlockedOn::Explicit) => t.queue == Queue::Detached,
                ThreadState::Suspended(BlockedOn::Semaphore(s)) => {
                    t.queue == Queue::Waiting
                        && self.sems[s.index()].waiters.contains(&self.threads, t.id.index())
                }
                ThreadState::Suspended(BlockedOn::Mutex(m)) => {
                    t.queue == Queue::Waiting
                        && self.mutexes[m.index()].waiters.contains(&self.threads, t.id.index())
                }
                ThreadState::Init | ThreadState::Closed => {
                    t.queue == Queue::Detached && !timer_armed
                }
            };
            if !ok {
                return corrupt;
            }
        }
        if ready != queued || running > 1 {
            return corrupt;
        }
        for sem in self.sems.iter() {
            for idx in sem.waiters.iter(&self.threads) {
                if self.threads[idx].queue != Queue::Waiting {
                    return corrupt;
                }
            }
        }
        for m in self.mutexes.iter() {
            for idx in m.waiters.iter(&self.threads) {
                if self.threads[idx].queue != Queue::Waiting {
                    return corrupt;
                }
            }
        }
        Ok(())
    }
}

impl<P: Port> Default for Kernel<P> {
    fn default() -> Self {
        Self::new()
    }
}

//! # Semaphores and Mutexes
//!
//! Blocking primitives layered on the scheduler. Each object owns a wait
//! list of TCBs; a thread that must wait is suspended onto it and, for a
//! timed wait, its built-in timer is armed.
//!
//! Whichever of "object signalled" and "timer expired" happens first ends
//! the wait: [`Kernel::resume`] removes the thread from the wait list and
//! stops its timer before readying it, so the other path finds nothing
//! left to wake.
//!
//! ## Blocking protocol
//!
//! A take that cannot complete returns [`Acquire::Blocked`] after the
//! switch away from the caller has been requested. When the thread runs
//! again it collects the outcome with [`Kernel::wait_result`]:
//!
//! ```ignore
//! if kernel.sem_take(sem, Wait::Ticks(50))? == Acquire::Blocked {
//!     // ...context switch happens here...
//!     kernel.wait_result(me)?; // Err(Timeout) if the 50 ticks ran out
//! }
//! ```
//!
//! ## Priority inheritance
//!
//! A mutex owner runs at the highest priority among its own base priority
//! and the first waiter of every mutex it holds. Inheritance is one level
//! deep: an owner blocked on another mutex does not pass its boost on.

use heapless::String;

use crate::arch::Port;
use crate::config::NAME_MAX;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::list::List;
use crate::sync::CriticalSection;
use crate::thread::{object_name, BlockedOn, Queue, Thread, ThreadId, WaitOutcome};
use crate::tick::{Wait, TICK_MAX_WAIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId(pub(crate) u8);

impl SemId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub(crate) u8);

impl MutexId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Order in which waiters are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    /// Arrival order.
    Fifo,
    /// Highest priority first, arrival order among equals.
    Priority,
}

/// Result of a take that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a blocked take must be completed with `wait_result`"]
pub enum Acquire {
    /// Acquired without waiting.
    Done,
    /// The caller was suspended; read the outcome with `wait_result`.
    Blocked,
}

pub struct Semaphore {
    name: String<NAME_MAX>,
    value: u16,
    order: WaitOrder,
    pub(crate) waiters: List,
    allocated: bool,
}

impl Semaphore {
    pub const EMPTY: Semaphore = Semaphore {
        name: String::new(),
        value: 0,
        order: WaitOrder::Fifo,
        waiters: List::new(),
        allocated: false,
    };

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct Mutex {
    name: String<NAME_MAX>,
    owner: Option<ThreadId>,
    /// Recursive acquisitions by the owner.
    hold: u16,
    pub(crate) waiters: List,
    allocated: bool,
}

impl Mutex {
    pub const EMPTY: Mutex = Mutex {
        name: String::new(),
        owner: None,
        hold: 0,
        waiters: List::new(),
        allocated: false,
    };

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn enqueue_waiter(list: &mut List, threads: &mut [Thread], id: ThreadId, order: WaitOrder) {
    match order {
        WaitOrder::Fifo => list.push_back(threads, id.index()),
        WaitOrder::Priority => list.insert_sorted(threads, id.index(), |new, at| {
            new.current_priority < at.current_priority
        }),
    }
    threads[id.index()].queue = Queue::Waiting;
}

/// Reject waits that cannot be armed; `Ticks(0)` means "don't wait".
fn normalize(wait: Wait) -> Result<Wait> {
    match wait {
        Wait::Ticks(0) => Ok(Wait::NoWait),
        Wait::Ticks(n) if n > TICK_MAX_WAIT => Err(KernelError::InvalidParam),
        w => Ok(w),
    }
}

impl<P: Port> Kernel<P> {
    // -----------------------------------------------------------------------
    // Shared wait path
    // -----------------------------------------------------------------------

    /// Suspend the running thread `id` onto the wait list named by `reason`
    /// and arm its timeout. The caller schedules afterwards.
    fn block_current(&mut self, id: ThreadId, reason: BlockedOn, wait: Wait) -> Result<()> {
        self.suspend(id, reason)?;
        match reason {
            BlockedOn::Semaphore(s) => {
                let sem = &mut self.sems[s.index()];
                enqueue_waiter(&mut sem.waiters, &mut self.threads, id, sem.order);
            }
            BlockedOn::Mutex(m) => {
                let list = &mut self.mutexes[m.index()].waiters;
                enqueue_waiter(list, &mut self.threads, id, WaitOrder::Priority);
            }
            BlockedOn::Explicit => {}
        }
        if let Wait::Ticks(n) = wait {
            self.timers.start_thread_timer(id, self.tick, n);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    fn sem_mut(&mut self, id: SemId) -> Result<&mut Semaphore> {
        self.sems
            .get_mut(id.index())
            .filter(|s| s.allocated)
            .ok_or(KernelError::InvalidParam)
    }

    /// Allocate a counting semaphore with an initial `value`.
    pub fn sem_create(&mut self, name: &str, value: u16, order: WaitOrder) -> Result<SemId> {
        let _cs = CriticalSection::<P>::enter();
        let idx = self
            .sems
            .iter()
            .position(|s| !s.allocated)
            .ok_or(KernelError::ResourceExhausted)?;
        self.sems[idx] = Semaphore {
            name: object_name(name),
            value,
            order,
            waiters: List::new(),
            allocated: true,
        };
        log::debug!("semaphore {} created, value {}", name, value);
        Ok(SemId(idx as u8))
    }

    /// Decrement the semaphore, or block the running thread for up to
    /// `wait`. `NoWait` may be used from interrupt context.
    pub fn sem_take(&mut self, id: SemId, wait: Wait) -> Result<Acquire> {
        let wait = normalize(wait)?;
        let _cs = CriticalSection::<P>::enter();
        let sem = self.sem_mut(id)?;
        if sem.value > 0 {
            sem.value -= 1;
            return Ok(Acquire::Done);
        }
        if wait == Wait::NoWait {
            return Err(KernelError::Timeout);
        }
        let cur = self.running_thread()?;
        self.block_current(cur, BlockedOn::Semaphore(id), wait)?;
        self.schedule();
        Ok(Acquire::Blocked)
    }

    /// Take without waiting.
    pub fn sem_try_take(&mut self, id: SemId) -> Result<()> {
        self.sem_take(id, Wait::NoWait).map(|_| ())
    }

    /// Wake the first waiter, or increment the count if nobody waits.
    /// Safe from interrupt context.
    pub fn sem_release(&mut self, id: SemId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        match self.sem_mut(id)?.waiters.front() {
            Some(w) => self.wake(ThreadId(w as u8), WaitOutcome::Signaled),
            None => {
                let sem = &mut self.sems[id.index()];
                sem.value = sem
                    .value
                    .checked_add(1)
                    .ok_or(KernelError::ResourceExhausted)?;
            }
        }
        Ok(())
    }

    /// Wake every waiter with `Deleted` and set a new count.
    pub fn sem_reset(&mut self, id: SemId, value: u16) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.sem_mut(id)?;
        self.sem_wake_all(id);
        self.sems[id.index()].value = value;
        Ok(())
    }

    /// Wake every waiter with `Deleted` and free the semaphore.
    pub fn sem_delete(&mut self, id: SemId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.sem_mut(id)?;
        self.sem_wake_all(id);
        self.sems[id.index()].allocated = false;
        Ok(())
    }

    fn sem_wake_all(&mut self, id: SemId) {
        while let Some(w) = self.sems[id.index()].waiters.front() {
            self.wake(ThreadId(w as u8), WaitOutcome::Deleted);
        }
    }

    pub fn sem_value(&self, id: SemId) -> Result<u16> {
        self.sems
            .get(id.index())
            .filter(|s| s.allocated)
            .map(|s| s.value)
            .ok_or(KernelError::InvalidParam)
    }

    // -----------------------------------------------------------------------
    // Mutexes
    // -----------------------------------------------------------------------

    fn mutex_ref(&self, id: MutexId) -> Result<&Mutex> {
        self.mutexes
            .get(id.index())
            .filter(|m| m.allocated)
            .ok_or(KernelError::InvalidParam)
    }

    pub fn mutex_create(&mut self, name: &str) -> Result<MutexId> {
        let _cs = CriticalSection::<P>::enter();
        let idx = self
            .mutexes
            .iter()
            .position(|m| !m.allocated)
            .ok_or(KernelError::ResourceExhausted)?;
        self.mutexes[idx] = Mutex {
            name: object_name(name),
            owner: None,
            hold: 0,
            waiters: List::new(),
            allocated: true,
        };
        log::debug!("mutex {} created", name);
        Ok(MutexId(idx as u8))
    }

    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<ThreadId>> {
        Ok(self.mutex_ref(id)?.owner)
    }

    /// Lock the mutex for the running thread. The owner may lock it again
    /// (recursively); anyone else waits, lending its priority to the owner.
    pub fn mutex_take(&mut self, id: MutexId, wait: Wait) -> Result<Acquire> {
        let wait = normalize(wait)?;
        let _cs = CriticalSection::<P>::enter();
        let cur = self.running_thread()?;
        let owner = self.mutex_ref(id)?.owner;
        let m = &mut self.mutexes[id.index()];
        match owner {
            None => {
                m.owner = Some(cur);
                m.hold = 1;
                Ok(Acquire::Done)
            }
            Some(o) if o == cur => {
                m.hold = m.hold.checked_add(1).ok_or(KernelError::ResourceExhausted)?;
                Ok(Acquire::Done)
            }
            Some(_) => {
                if wait == Wait::NoWait {
                    return Err(KernelError::Timeout);
                }
                self.block_current(cur, BlockedOn::Mutex(id), wait)?;
                self.mutex_update_inheritance(id);
                self.schedule();
                Ok(Acquire::Blocked)
            }
        }
    }

    /// Unlock one level. The final unlock passes ownership to the highest
    /// priority waiter and drops any priority the owner inherited.
    pub fn mutex_release(&mut self, id: MutexId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let cur = self.running_thread()?;
        if self.mutex_ref(id)?.owner != Some(cur) {
            return Err(KernelError::InvalidState);
        }
        let m = &mut self.mutexes[id.index()];
        m.hold -= 1;
        if m.hold == 0 {
            self.mutex_hand_off(id);
        }
        Ok(())
    }

    /// Wake every waiter with `Deleted` and free the mutex.
    pub fn mutex_delete(&mut self, id: MutexId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.mutex_ref(id)?;
        while let Some(w) = self.mutexes[id.index()].waiters.front() {
            self.wake(ThreadId(w as u8), WaitOutcome::Deleted);
        }
        let m = &mut self.mutexes[id.index()];
        let owner = m.owner.take();
        m.hold = 0;
        m.allocated = false;
        if let Some(o) = owner {
            let prio = self.inherited_priority(o);
            self.set_effective_priority(o, prio);
        }
        Ok(())
    }

    /// Pass ownership to the first waiter (or nobody), then recompute the
    /// previous owner's priority.
    fn mutex_hand_off(&mut self, id: MutexId) {
        let m = &mut self.mutexes[id.index()];
        let Some(old) = m.owner else {
            return;
        };
        let next = m.waiters.front().map(|w| ThreadId(w as u8));
        m.owner = next;
        m.hold = if next.is_some() { 1 } else { 0 };
        if let Some(n) = next {
            // Still boosted here, so the wake does not preempt yet.
            self.wake(n, WaitOutcome::Signaled);
        }
        let prio = self.inherited_priority(old);
        self.set_effective_priority(old, prio);
    }

    /// Base priority of `id`, raised to the first waiter of every mutex it
    /// owns.
    pub(crate) fn inherited_priority(&self, id: ThreadId) -> u8 {
        let base = self.threads[id.index()].init_priority;
        self.mutexes
            .iter()
            .filter(|m| m.allocated && m.owner == Some(id))
            .filter_map(|m| m.waiters.front())
            .map(|w| self.threads[w].current_priority)
            .fold(base, u8::min)
    }

    /// Re-derive the owner's priority after the wait list of `id` changed.
    pub(crate) fn mutex_update_inheritance(&mut self, id: MutexId) {
        if let Some(owner) = self.mutexes[id.index()].owner {
            let prio = self.inherited_priority(owner);
            self.set_effective_priority(owner, prio);
        }
    }

    /// Release every mutex held by a closing thread.
    pub(crate) fn release_mutexes_owned_by(&mut self, id: ThreadId) {
        for idx in 0..self.mutexes.len() {
            let m = &self.mutexes[idx];
            if m.allocated && m.owner == Some(id) {
                log::warn!("closing {:?} while it holds mutex {}", id, m.name.as_str());
                self.mutex_hand_off(MutexId(idx as u8));
            }
        }
    }
}

//! # Scheduler
//!
//! Strict priority-preemptive scheduling with round-robin among equal
//! priorities.
//!
//! ## Scheduling Decision
//!
//! At every scheduling point [`Kernel::schedule`] compares the head of the
//! ready queue against the running thread:
//! 1. **Higher-priority candidate**: preempt. The running thread goes back
//!    to the *front* of its ready list so it keeps its turn among peers.
//! 2. **Equal priority**: switch only if the running thread yielded or used
//!    up its slice; it then goes to the *tail* of its list (rotation).
//! 3. **Lower priority or none**: keep running.
//!
//! A thread that blocked, slept or closed is no longer Running and always
//! gives way to the candidate.
//!
//! ## Deferred Decisions
//!
//! While the scheduler is locked or an interrupt is being handled, a wake
//! that would preempt only sets `need_resched`. The unlock or the
//! outermost interrupt exit then makes one decision that sees every thread
//! readied in the meantime.

use crate::arch::Port;
use crate::config::PRIORITY_MAX;
use crate::error::{fatal, KernelError, Result};
use crate::kernel::Kernel;
use crate::sync::CriticalSection;
use crate::thread::{BlockedOn, Queue, ThreadId, ThreadState, WaitOutcome};
use crate::timer::TimerId;

impl<P: Port> Kernel<P> {
    // -----------------------------------------------------------------------
    // Ready queue operations
    // -----------------------------------------------------------------------

    /// Queue a suspended or newly created thread as Ready.
    ///
    /// Fails with `InvalidState` if the thread is already queued anywhere
    /// or is not in `Init` or `Suspended`. A sleeping thread is woken
    /// through [`Kernel::resume`]. Preempts the running thread if `id`
    /// outranks it.
    pub fn insert_ready(&mut self, id: ThreadId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let t = self.live(id)?;
        if t.queue != Queue::Detached {
            return Err(KernelError::InvalidState);
        }
        match t.state {
            ThreadState::Init | ThreadState::Suspended(_) => {}
            _ => return Err(KernelError::InvalidState),
        }
        self.timers.stop(TimerId::of_thread(id));
        self.enqueue_ready(id);
        self.preempt_check(id);
        Ok(())
    }

    /// Take a thread off its ready list, leaving it explicitly suspended
    /// until [`Kernel::insert_ready`] or [`Kernel::resume`]. Fails with
    /// `InvalidState` if it is not queued as ready.
    pub fn remove_ready(&mut self, id: ThreadId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.live(id)?;
        self.ready.remove(&mut self.threads, id)?;
        let t = &mut self.threads[id.index()];
        t.state = ThreadState::Suspended(BlockedOn::Explicit);
        t.yield_pending = false;
        Ok(())
    }

    /// Highest-priority ready thread, FIFO among equals.
    pub fn pick_next(&self) -> Option<ThreadId> {
        let _cs = CriticalSection::<P>::enter();
        self.ready.peek()
    }

    pub(crate) fn enqueue_ready(&mut self, id: ThreadId) {
        let t = &mut self.threads[id.index()];
        t.state = ThreadState::Ready;
        t.yield_pending = false;
        self.ready.push_back(&mut self.threads, id);
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Switch to the highest-priority ready thread if it should displace
    /// the running one. No-op while the scheduler is locked or before
    /// [`Kernel::start`].
    pub fn schedule(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        if !self.started {
            return;
        }
        if self.lock_nest > 0 {
            self.need_resched = true;
            return;
        }
        self.need_resched = false;

        let from = self.current;
        let running = from.filter(|c| self.threads[c.index()].state == ThreadState::Running);
        let candidate = self.ready.peek();

        let to = match (running, candidate) {
            (Some(cur), Some(next)) => {
                let cur_prio = self.threads[cur.index()].current_priority;
                let next_prio = self.threads[next.index()].current_priority;
                let yielded = self.threads[cur.index()].yield_pending;
                self.threads[cur.index()].yield_pending = false;
                if cur_prio < next_prio || (cur_prio == next_prio && !yielded) {
                    return;
                }
                self.threads[cur.index()].state = ThreadState::Ready;
                if yielded {
                    self.ready.push_back(&mut self.threads, cur);
                } else {
                    self.ready.push_front(&mut self.threads, cur);
                }
                next
            }
            (Some(cur), None) => {
                self.threads[cur.index()].yield_pending = false;
                return;
            }
            (None, Some(next)) => next,
            (None, None) => {
                if from.is_some() {
                    log::warn!("no runnable thread");
                }
                return;
            }
        };

        if self.ready.remove(&mut self.threads, to).is_err() {
            fatal("scheduled thread not on the ready queue");
        }
        self.threads[to.index()].state = ThreadState::Running;
        self.current = Some(to);
        if from != Some(to) {
            log::trace!("switch {:?} -> {:?}", from, to);
            P::context_switch(from, to);
        }
    }

    /// Run `schedule` now, or defer it to the end of the interrupt.
    pub(crate) fn reschedule(&mut self) {
        if self.interrupt_nest > 0 {
            self.need_resched = true;
        } else {
            self.schedule();
        }
    }

    /// Preempt if the newly readied `id` outranks the running thread.
    pub(crate) fn preempt_check(&mut self, id: ThreadId) {
        if !self.started {
            return;
        }
        let outranks = match self.current {
            Some(cur) => {
                let cur = &self.threads[cur.index()];
                cur.state != ThreadState::Running
                    || self.threads[id.index()].current_priority < cur.current_priority
            }
            None => true,
        };
        if outranks {
            self.reschedule();
        }
    }

    /// Give up the CPU to the next equal-priority ready thread, if any.
    /// The running thread's slice is refilled and it rotates to the tail
    /// of its ready list.
    pub fn yield_current(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        let Some(cur) = self.current else {
            return;
        };
        let t = &mut self.threads[cur.index()];
        if t.state != ThreadState::Running {
            return;
        }
        t.reset_slice();
        t.yield_pending = true;
        self.reschedule();
    }

    // -----------------------------------------------------------------------
    // Suspend / resume
    // -----------------------------------------------------------------------

    /// Take a Ready or Running thread off the CPU's candidates.
    ///
    /// The caller (a synchronization primitive) places it on its wait list
    /// if `reason` names one, then calls [`Kernel::schedule`]. Suspending
    /// cancels the thread's pending timer.
    pub fn suspend(&mut self, id: ThreadId, reason: BlockedOn) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        match self.live(id)?.state {
            ThreadState::Ready => self.ready.remove(&mut self.threads, id)?,
            ThreadState::Running => {}
            _ => return Err(KernelError::InvalidState),
        }
        self.timers.stop(TimerId::of_thread(id));
        let t = &mut self.threads[id.index()];
        t.state = ThreadState::Suspended(reason);
        t.yield_pending = false;
        t.outcome = None;
        log::trace!("thread {:?} suspended on {:?}", id, reason);
        Ok(())
    }

    /// Make a Suspended or Sleeping thread Ready again.
    ///
    /// Removes it from any wait list and cancels its timer first, so a
    /// wait can only ever be ended once. Resuming a thread that is not
    /// blocked fails with `InvalidState`.
    pub fn resume(&mut self, id: ThreadId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        if !self.live(id)?.is_blocked() {
            return Err(KernelError::InvalidState);
        }
        if self.threads[id.index()].queue == Queue::Waiting {
            self.detach_waiter(id);
        }
        self.timers.stop(TimerId::of_thread(id));
        let t = &mut self.threads[id.index()];
        if t.outcome.is_none() {
            t.outcome = Some(WaitOutcome::Signaled);
        }
        self.enqueue_ready(id);
        log::trace!("thread {:?} resumed", id);
        self.preempt_check(id);
        Ok(())
    }

    /// End a wait with `outcome`. `id` must be blocked.
    pub(crate) fn wake(&mut self, id: ThreadId, outcome: WaitOutcome) {
        self.threads[id.index()].outcome = Some(outcome);
        if self.resume(id).is_err() {
            fatal("woken thread was not blocked");
        }
    }

    /// Built-in timer expiry: ends a sleep, or times out a wait.
    pub(crate) fn wake_on_timeout(&mut self, id: ThreadId) {
        let _cs = CriticalSection::<P>::enter();
        match self.threads[id.index()].state {
            ThreadState::Sleeping(_) | ThreadState::Suspended(_) => {
                self.wake(id, WaitOutcome::TimedOut);
            }
            state => log::warn!("spurious timeout for {:?} in {:?}", id, state),
        }
    }

    /// Unlink a waiting thread from the wait list of the object it is
    /// blocked on.
    pub(crate) fn detach_waiter(&mut self, id: ThreadId) {
        match self.threads[id.index()].state {
            ThreadState::Suspended(BlockedOn::Semaphore(s)) => {
                self.sems[s.index()]
                    .waiters
                    .remove(&mut self.threads, id.index());
            }
            ThreadState::Suspended(BlockedOn::Mutex(m)) => {
                self.mutexes[m.index()]
                    .waiters
                    .remove(&mut self.threads, id.index());
                self.threads[id.index()].queue = Queue::Detached;
                self.mutex_update_inheritance(m);
            }
            _ => fatal("waiting thread not blocked on an object"),
        }
        self.threads[id.index()].queue = Queue::Detached;
    }

    // -----------------------------------------------------------------------
    // Priority
    // -----------------------------------------------------------------------

    /// Change a thread's base priority. The effective priority stays raised
    /// while the thread owns a mutex a more urgent thread waits on. A Ready
    /// thread moves to the tail of its new level; the scheduler re-evaluates
    /// at once.
    pub fn change_priority(&mut self, id: ThreadId, priority: u8) -> Result<()> {
        if priority as usize >= PRIORITY_MAX {
            return Err(KernelError::InvalidParam);
        }
        let _cs = CriticalSection::<P>::enter();
        self.live(id)?;
        self.threads[id.index()].init_priority = priority;
        let effective = self.inherited_priority(id);
        self.set_effective_priority(id, effective);
        if let ThreadState::Suspended(BlockedOn::Mutex(m)) = self.threads[id.index()].state {
            self.mutex_update_inheritance(m);
        }
        Ok(())
    }

    /// Change only the effective priority (mutex inheritance).
    pub(crate) fn set_effective_priority(&mut self, id: ThreadId, priority: u8) {
        if self.threads[id.index()].current_priority == priority {
            return;
        }
        if self.threads[id.index()].queue == Queue::Ready {
            if self.ready.remove(&mut self.threads, id).is_err() {
                fatal("ready thread missing from ready queue");
            }
            self.threads[id.index()].current_priority = priority;
            self.ready.push_back(&mut self.threads, id);
        } else {
            self.threads[id.index()].current_priority = priority;
        }
        log::debug!("thread {:?} now at priority {}", id, priority);
        if self.outranked() {
            self.reschedule();
        }
    }

    /// The running thread is no longer the best choice.
    fn outranked(&self) -> bool {
        if !self.started {
            return false;
        }
        let Some(best) = self.ready.highest_priority() else {
            return false;
        };
        match self.current {
            Some(cur) => {
                let cur = &self.threads[cur.index()];
                cur.state != ThreadState::Running || best < cur.current_priority
            }
            None => true,
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler lock and interrupt nesting
    // -----------------------------------------------------------------------

    /// Forbid context switches until the matching unlock. Nests.
    pub fn lock_scheduler(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        self.lock_nest += 1;
    }

    /// Release one level of scheduler lock; the last release makes any
    /// decision that was held back.
    pub fn unlock_scheduler(&mut self) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        if self.lock_nest == 0 {
            return Err(KernelError::InvalidState);
        }
        self.lock_nest -= 1;
        if self.lock_nest == 0 {
            self.reschedule();
        }
        Ok(())
    }

    #[inline]
    pub fn scheduler_locked(&self) -> bool {
        self.lock_nest > 0
    }

    /// Note entry into an interrupt handler that may wake threads.
    pub fn enter_interrupt(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        self.interrupt_nest = self.interrupt_nest.saturating_add(1);
    }

    /// Note exit from an interrupt handler. The outermost exit makes the
    /// scheduling decision deferred during the handler.
    pub fn leave_interrupt(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        if self.interrupt_nest == 0 {
            log::warn!("unbalanced leave_interrupt");
            return;
        }
        self.interrupt_nest -= 1;
        if self.interrupt_nest == 0 && self.need_resched {
            self.schedule();
        }
    }

    #[inline]
    pub fn in_interrupt(&self) -> bool {
        self.interrupt_nest > 0
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::arch::sim::{interrupts_masked, take_switches, SimPort};
    use crate::tick::Tick;
    use std::vec::Vec;

    extern "C" fn noop(_: usize) {}

    fn kernel() -> Kernel<SimPort> {
        let mut k = Kernel::new();
        k.create_idle(noop).unwrap();
        k
    }

    fn spawn(k: &mut Kernel<SimPort>, prio: u8, slice: u32) -> ThreadId {
        let id = k.thread_create("t", noop, 0, prio, slice).unwrap();
        k.thread_start(id).unwrap();
        id
    }

    #[test]
    fn test_insert_ready_preempts_lower_priority() {
        let mut k = kernel();
        let lo = spawn(&mut k, 8, 0);
        k.start().unwrap();
        let hi = k.thread_create("hi", noop, 0, 2, 0).unwrap();
        take_switches();

        k.insert_ready(hi).unwrap();
        assert_eq!(k.thread_self(), Some(hi));
        assert_eq!(take_switches(), [(Some(lo), hi)]);
        // Preempted thread keeps its place at the front of its level.
        assert_eq!(k.pick_next(), Some(lo));
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_insert_ready_rejects_queued_or_running() {
        let mut k = kernel();
        let a = spawn(&mut k, 4, 0);
        let b = spawn(&mut k, 4, 0);
        assert_eq!(k.insert_ready(a), Err(KernelError::InvalidState));
        k.start().unwrap();
        assert_eq!(k.insert_ready(a), Err(KernelError::InvalidState));
        assert_eq!(k.insert_ready(b), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_equal_priority_does_not_preempt() {
        let mut k = kernel();
        let a = spawn(&mut k, 5, 0);
        k.start().unwrap();
        let b = spawn(&mut k, 5, 0);
        assert_eq!(k.thread_self(), Some(a));
        assert_eq!(k.thread(b).unwrap().state(), ThreadState::Ready);
    }

    #[test]
    fn test_yield_rotates_fifo() {
        let mut k = kernel();
        let a = spawn(&mut k, 5, 0);
        let b = spawn(&mut k, 5, 0);
        let c = spawn(&mut k, 5, 0);
        k.start().unwrap();
        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(k.thread_self().unwrap());
            k.yield_current();
        }
        assert_eq!(order, [a, b, c, a, b, c]);
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_yield_alone_keeps_running() {
        let mut k = kernel();
        let a = spawn(&mut k, 5, 0);
        k.start().unwrap();
        take_switches();
        k.yield_current();
        assert_eq!(k.thread_self(), Some(a));
        assert!(take_switches().is_empty());
        assert!(!k.thread(a).unwrap().yield_pending);
    }

    #[test]
    fn test_suspend_resume_cycle() {
        let mut k = kernel();
        let a = spawn(&mut k, 3, 0);
        let b = spawn(&mut k, 6, 0);
        k.start().unwrap();

        k.suspend(a, BlockedOn::Explicit).unwrap();
        assert_eq!(
            k.thread(a).unwrap().state(),
            ThreadState::Suspended(BlockedOn::Explicit)
        );
        k.schedule();
        assert_eq!(k.thread_self(), Some(b));

        k.resume(a).unwrap();
        assert_eq!(k.thread_self(), Some(a));
        assert_eq!(k.wait_result(a), Ok(()));
        // Double resume is rejected, not silently absorbed.
        assert_eq!(k.resume(a), Err(KernelError::InvalidState));
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_suspend_ready_thread_removes_it() {
        let mut k = kernel();
        let a = spawn(&mut k, 3, 0);
        let b = spawn(&mut k, 6, 0);
        k.start().unwrap();
        k.suspend(b, BlockedOn::Explicit).unwrap();
        assert_eq!(k.ready.len_at(6), 0);
        assert_eq!(k.suspend(b, BlockedOn::Explicit), Err(KernelError::InvalidState));
        assert_eq!(k.thread_self(), Some(a));
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_insert_ready_rejects_sleeping_thread() {
        let mut k = kernel();
        let a = spawn(&mut k, 3, 0);
        k.start().unwrap();
        k.sleep(5).unwrap();
        assert_eq!(k.insert_ready(a), Err(KernelError::InvalidState));
        assert_eq!(k.thread(a).unwrap().state(), ThreadState::Sleeping(Tick(5)));
        assert_eq!(k.next_timeout(), Some(Tick(5)));
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_insert_ready_cancels_pending_timeout() {
        let mut k = kernel();
        let a = spawn(&mut k, 3, 0);
        k.start().unwrap();
        k.sleep(5).unwrap();
        // Re-mark the sleeper as explicitly suspended with its timer still armed.
        k.threads[a.index()].state = ThreadState::Suspended(BlockedOn::Explicit);
        k.insert_ready(a).unwrap();
        assert_eq!(k.thread_self(), Some(a));
        assert_eq!(k.next_timeout(), None);
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_remove_ready_leaves_thread_suspended() {
        let mut k = kernel();
        let a = spawn(&mut k, 3, 0);
        let b = spawn(&mut k, 6, 0);
        k.start().unwrap();
        k.remove_ready(b).unwrap();
        assert_eq!(k.thread(b).unwrap().state(), ThreadState::Suspended(BlockedOn::Explicit));
        assert!(k.check_integrity().is_ok());
        assert_eq!(k.remove_ready(b), Err(KernelError::InvalidState));
        assert_eq!(k.suspend(b, BlockedOn::Explicit), Err(KernelError::InvalidState));

        k.resume(b).unwrap();
        assert_eq!(k.thread(b).unwrap().state(), ThreadState::Ready);
        assert_eq!(k.thread_self(), Some(a));
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_scheduler_lock_defers_preemption() {
        let mut k = kernel();
        let lo = spawn(&mut k, 8, 0);
        k.start().unwrap();
        k.lock_scheduler();
        k.lock_scheduler();
        let hi = spawn(&mut k, 1, 0);
        assert_eq!(k.thread_self(), Some(lo));
        k.unlock_scheduler().unwrap();
        assert_eq!(k.thread_self(), Some(lo));
        k.unlock_scheduler().unwrap();
        assert_eq!(k.thread_self(), Some(hi));
        assert_eq!(k.unlock_scheduler(), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_interrupt_defers_to_outermost_exit() {
        let mut k = kernel();
        let lo = spawn(&mut k, 8, 0);
        k.start().unwrap();
        let hi = k.thread_create("hi", noop, 0, 1, 0).unwrap();
        k.enter_interrupt();
        k.enter_interrupt();
        k.thread_start(hi).unwrap();
        k.leave_interrupt();
        assert_eq!(k.thread_self(), Some(lo));
        k.leave_interrupt();
        assert_eq!(k.thread_self(), Some(hi));
    }

    #[test]
    fn test_change_priority_requeues_and_preempts() {
        let mut k = kernel();
        let a = spawn(&mut k, 4, 0);
        let b = spawn(&mut k, 7, 0);
        k.start().unwrap();
        k.change_priority(b, 2).unwrap();
        assert_eq!(k.thread_self(), Some(b));
        assert_eq!(k.thread(b).unwrap().priority(), 2);
        k.change_priority(b, 9).unwrap();
        assert_eq!(k.thread_self(), Some(a));
        assert_eq!(
            k.change_priority(a, PRIORITY_MAX as u8),
            Err(KernelError::InvalidParam)
        );
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_priority_correctness_over_mixed_sequences() {
        // Whatever mix of blocks and wakes happens, the running thread is
        // never outranked by a ready one.
        let mut k = kernel();
        let prios = [3u8, 1, 4, 1, 5, 9, 2];
        let ids: Vec<_> = prios.iter().map(|&p| spawn(&mut k, p, 0)).collect();
        k.start().unwrap();
        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..300 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let id = ids[(seed % ids.len() as u32) as usize];
            match k.thread(id).unwrap().state() {
                ThreadState::Ready | ThreadState::Running => {
                    k.suspend(id, BlockedOn::Explicit).unwrap();
                    k.schedule();
                }
                _ => k.resume(id).unwrap(),
            }
            assert!(k.check_integrity().is_ok());
            let cur = k.thread(k.thread_self().unwrap()).unwrap();
            assert_eq!(cur.state(), ThreadState::Running);
            if let Some(best) = k.ready.highest_priority() {
                assert!(cur.priority() <= best);
            }
        }
    }

    #[test]
    fn test_operations_leave_interrupts_enabled() {
        let mut k = kernel();
        let a = spawn(&mut k, 3, 0);
        k.start().unwrap();
        k.suspend(a, BlockedOn::Explicit).unwrap();
        k.schedule();
        k.resume(a).unwrap();
        k.on_tick();
        assert!(!interrupts_masked());
    }
}

//! # Timer Manager
//!
//! Software timers driven by the tick. Armed timers sit on a single list
//! sorted by absolute expiry (wrap-safe), so each tick only inspects the
//! due prefix of the list. Timers with equal expiry fire in arming order.
//!
//! Timer slots `0..MAX_THREADS` are the built-in timers of the threads
//! with the same index and always wake that thread. User timers are
//! allocated from the remaining slots.
//!
//! ## Periodic catch-up
//!
//! A periodic timer is re-armed at `expiry + period`, not `now + period`,
//! so its phase never drifts when ticks are delivered late or in steps:
//! each missed period fires once. A timer that has fallen
//! [`TIMER_CATCHUP_LIMIT`] or more periods behind is resynchronised to
//! `now + period` instead, bounding the work done in one tick.
//!
//! Callbacks run in tick context while the tick is still being processed.
//! They must be short, must not block and must not re-enter the kernel.

use heapless::String;

use crate::arch::Port;
use crate::config::{MAX_THREADS, MAX_TIMERS, NAME_MAX, TIMER_CATCHUP_LIMIT};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::list::{Link, List, Node};
use crate::sync::CriticalSection;
use crate::thread::{object_name, ThreadId};
use crate::tick::{Tick, TICK_MAX_WAIT};

const TIMER_SLOTS: usize = MAX_THREADS + MAX_TIMERS;

/// Stable handle to a timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u8);

impl TimerId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Built-in timer of a thread.
    #[inline]
    pub(crate) const fn of_thread(id: ThreadId) -> TimerId {
        TimerId(id.0)
    }

    #[inline]
    pub fn is_thread_timer(self) -> bool {
        self.index() < MAX_THREADS
    }
}

/// What happens when a timer expires.
#[derive(Debug, Clone, Copy)]
pub enum TimerAction {
    /// Resume a sleeping thread, or time out its wait.
    WakeThread(ThreadId),
    /// Call `func(arg)` in tick context.
    Callback { func: fn(usize), arg: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

pub struct Timer {
    name: String<NAME_MAX>,
    action: TimerAction,
    mode: TimerMode,
    /// Delay from start to first expiry, and the period when periodic.
    init_tick: u32,
    /// Absolute expiry, valid while armed.
    expiry: Tick,
    armed: bool,
    allocated: bool,
    link: Link,
}

fn no_callback(_: usize) {}

impl Timer {
    pub const EMPTY: Timer = Timer {
        name: String::new(),
        action: TimerAction::Callback {
            func: no_callback,
            arg: 0,
        },
        mode: TimerMode::OneShot,
        init_tick: 0,
        expiry: Tick::ZERO,
        armed: false,
        allocated: false,
        link: Link::UNLINKED,
    };

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    #[inline]
    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    #[inline]
    pub fn period(&self) -> u32 {
        self.init_tick
    }

    /// Expiry tick, when armed.
    #[inline]
    pub fn expiry(&self) -> Option<Tick> {
        self.armed.then_some(self.expiry)
    }

    #[inline]
    pub fn action(&self) -> TimerAction {
        self.action
    }
}

impl Node for Timer {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

fn validate_ticks(ticks: u32) -> Result<()> {
    if ticks == 0 || ticks > TICK_MAX_WAIT {
        Err(KernelError::InvalidParam)
    } else {
        Ok(())
    }
}

/// Timer pool and the sorted list of armed timers.
pub struct TimerManager {
    timers: [Timer; TIMER_SLOTS],
    armed: List,
}

impl TimerManager {
    pub const fn new() -> Self {
        let mut timers = [const { Timer::EMPTY }; TIMER_SLOTS];
        let mut i = 0;
        while i < MAX_THREADS {
            timers[i].action = TimerAction::WakeThread(ThreadId(i as u8));
            timers[i].allocated = true;
            i += 1;
        }
        Self {
            timers,
            armed: List::new(),
        }
    }

    pub fn get(&self, id: TimerId) -> Option<&Timer> {
        self.timers.get(id.index()).filter(|t| t.allocated)
    }

    fn slot(&mut self, id: TimerId) -> Result<&mut Timer> {
        self.timers
            .get_mut(id.index())
            .filter(|t| t.allocated)
            .ok_or(KernelError::InvalidParam)
    }

    fn user_slot(&mut self, id: TimerId) -> Result<&mut Timer> {
        if id.is_thread_timer() {
            return Err(KernelError::InvalidParam);
        }
        self.slot(id)
    }

    pub(crate) fn create(
        &mut self,
        name: &str,
        action: TimerAction,
        ticks: u32,
        mode: TimerMode,
    ) -> Result<TimerId> {
        validate_ticks(ticks)?;
        let idx = (MAX_THREADS..TIMER_SLOTS)
            .find(|&i| !self.timers[i].allocated)
            .ok_or(KernelError::ResourceExhausted)?;
        let t = &mut self.timers[idx];
        t.name = object_name(name);
        t.action = action;
        t.mode = mode;
        t.init_tick = ticks;
        t.armed = false;
        t.allocated = true;
        t.link = Link::UNLINKED;
        Ok(TimerId(idx as u8))
    }

    pub(crate) fn delete(&mut self, id: TimerId) -> Result<()> {
        self.user_slot(id)?;
        self.stop(id);
        self.timers[id.index()].allocated = false;
        Ok(())
    }

    /// Arm `id` to expire `init_tick` ticks after `now`.
    pub(crate) fn start(&mut self, id: TimerId, now: Tick) -> Result<()> {
        let t = self.user_slot(id)?;
        if t.armed {
            return Err(KernelError::InvalidState);
        }
        t.expiry = now.after(t.init_tick);
        t.armed = true;
        self.insert(id);
        Ok(())
    }

    /// Arm a thread's built-in timer for `ticks`, replacing any earlier arm.
    pub(crate) fn start_thread_timer(&mut self, thread: ThreadId, now: Tick, ticks: u32) {
        let id = TimerId::of_thread(thread);
        self.stop(id);
        self.timers[id.index()].init_tick = ticks;
        self.timers[id.index()].mode = TimerMode::OneShot;
        self.timers[id.index()].expiry = now.after(ticks);
        self.timers[id.index()].armed = true;
        self.insert(id);
    }

    fn insert(&mut self, id: TimerId) {
        self.armed
            .insert_sorted(&mut self.timers, id.index(), |new, at| {
                at.expiry.is_after(new.expiry)
            });
    }

    /// Disarm `id`. Returns whether it was armed; stopping a disarmed
    /// timer is a no-op.
    pub(crate) fn stop(&mut self, id: TimerId) -> bool {
        let Some(t) = self.timers.get(id.index()) else {
            return false;
        };
        if !t.armed {
            return false;
        }
        self.armed.remove(&mut self.timers, id.index());
        self.timers[id.index()].armed = false;
        true
    }

    pub(crate) fn set_period(&mut self, id: TimerId, ticks: u32) -> Result<()> {
        validate_ticks(ticks)?;
        self.user_slot(id)?.init_tick = ticks;
        Ok(())
    }

    pub(crate) fn set_mode(&mut self, id: TimerId, mode: TimerMode) -> Result<()> {
        self.user_slot(id)?.mode = mode;
        Ok(())
    }

    /// Expiry of the earliest armed timer.
    pub fn next_expiry(&self) -> Option<Tick> {
        self.armed.front().map(|i| self.timers[i].expiry)
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Take the earliest timer if it is due at `now`.
    ///
    /// One-shot timers are disarmed. Periodic timers are re-armed before
    /// their action is returned, so a timer several periods behind is
    /// returned again on the next call.
    pub(crate) fn pop_due(&mut self, now: Tick) -> Option<(TimerId, TimerAction)> {
        let head = self.armed.front()?;
        if !self.timers[head].expiry.is_due(now) {
            return None;
        }
        self.armed.remove(&mut self.timers, head);
        let id = TimerId(head as u8);
        let t = &mut self.timers[head];
        let action = t.action;
        match t.mode {
            TimerMode::OneShot => t.armed = false,
            TimerMode::Periodic => {
                let period = t.init_tick;
                let behind = now.since(t.expiry);
                if behind / period >= TIMER_CATCHUP_LIMIT {
                    log::warn!(
                        "timer {} {} periods behind, resyncing",
                        t.name.as_str(),
                        behind / period
                    );
                    t.expiry = now.after(period);
                } else {
                    t.expiry = t.expiry.after(period);
                }
                self.insert(id);
            }
        }
        Some((id, action))
    }

    /// Verify the armed list is sorted and matches the armed flags.
    pub(crate) fn check(&self) -> Result<()> {
        let mut prev: Option<Tick> = None;
        let mut listed = 0;
        for idx in self.armed.iter(&self.timers) {
            let t = &self.timers[idx];
            if !t.armed || !t.allocated {
                return Err(KernelError::QueueCorruption);
            }
            if let Some(p) = prev {
                if p.is_after(t.expiry) {
                    return Err(KernelError::QueueCorruption);
                }
            }
            prev = Some(t.expiry);
            listed += 1;
        }
        let flagged = self.timers.iter().filter(|t| t.armed).count();
        if listed != flagged || listed != self.armed.len() {
            return Err(KernelError::QueueCorruption);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kernel timer API
// ---------------------------------------------------------------------------

impl<P: Port> Kernel<P> {
    /// Allocate a disarmed user timer that expires `ticks` after each start.
    pub fn timer_create(
        &mut self,
        name: &str,
        action: TimerAction,
        ticks: u32,
        mode: TimerMode,
    ) -> Result<TimerId> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.timers.create(name, action, ticks, mode)?;
        log::debug!("timer {} created as {:?}", name, id);
        Ok(id)
    }

    /// Disarm and free a user timer.
    pub fn timer_delete(&mut self, id: TimerId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.timers.delete(id)
    }

    /// Arm a timer relative to the current tick. Arming an armed timer
    /// fails with `InvalidState` and leaves it untouched.
    pub fn timer_start(&mut self, id: TimerId) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.timers.start(id, self.tick)
    }

    /// Cancel a user timer. Returns whether it was armed.
    pub fn timer_stop(&mut self, id: TimerId) -> Result<bool> {
        let _cs = CriticalSection::<P>::enter();
        if id.is_thread_timer() || self.timers.get(id).is_none() {
            return Err(KernelError::InvalidParam);
        }
        Ok(self.timers.stop(id))
    }

    /// Change the period of a user timer. An armed timer keeps its current
    /// expiry; the new period applies from the next re-arm.
    pub fn timer_set_period(&mut self, id: TimerId, ticks: u32) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.timers.set_period(id, ticks)
    }

    pub fn timer_set_mode(&mut self, id: TimerId, mode: TimerMode) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        self.timers.set_mode(id, mode)
    }

    pub fn timer(&self, id: TimerId) -> Option<&Timer> {
        self.timers.get(id)
    }

    /// Earliest armed expiry, for tickless idle.
    pub fn next_timeout(&self) -> Option<Tick> {
        self.timers.next_expiry()
    }

    /// Fire every timer due at `now`, in expiry order. Returns how many
    /// actions ran.
    ///
    /// Each pop runs in its own critical section; callbacks run between
    /// them so they never extend interrupt latency.
    pub fn check_due(&mut self, now: Tick) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let _cs = CriticalSection::<P>::enter();
                self.timers.pop_due(now)
            };
            let Some((id, action)) = due else {
                break;
            };
            fired += 1;
            log::trace!("timer {:?} fired at {}", id, now);
            match action {
                TimerAction::WakeThread(thread) => self.wake_on_timeout(thread),
                TimerAction::Callback { func, arg } => func(arg),
            }
        }
        fired
    }
}

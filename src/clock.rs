//! # Clock
//!
//! The tick entry point, invoked once per hardware tick period from the
//! SysTick interrupt. Per tick:
//!
//! 1. Increment the global tick counter (wrapping).
//! 2. Charge the running thread one tick of its slice; when the slice
//!    runs out, refill it and mark the thread for rotation.
//! 3. Fire every due timer. Wakes only request a reschedule.
//! 4. Make one scheduling decision at the end of the tick.
//!
//! Timers are checked before the rotation decision, so a thread woken by
//! a timer in this tick preempts in this tick instead of the next one.

use crate::arch::Port;
use crate::kernel::Kernel;
use crate::sync::CriticalSection;
use crate::thread::ThreadState;
use crate::tick::Tick;

impl<P: Port> Kernel<P> {
    /// Current value of the global tick counter.
    #[inline]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Overwrite the global tick counter. Armed timers keep their absolute
    /// expiries.
    pub fn set_tick(&mut self, tick: Tick) {
        let _cs = CriticalSection::<P>::enter();
        self.tick = tick;
    }

    /// Handle one hardware tick.
    pub fn on_tick(&mut self) {
        self.tick_increase_by(1);
    }

    /// Handle `step` ticks at once, e.g. after a tickless idle period.
    ///
    /// The running thread's slice is charged `step` ticks and timers are
    /// checked once against the advanced counter; periodic timers fire
    /// once per period they missed.
    pub fn tick_increase_by(&mut self, step: u32) {
        if step == 0 {
            return;
        }
        self.enter_interrupt();

        let now = {
            let _cs = CriticalSection::<P>::enter();
            self.tick = self.tick.after(step);
            self.charge_slice(step);
            self.tick
        };

        self.check_due(now);

        self.leave_interrupt();
    }

    /// Step 2 of the tick: consume the running thread's slice and
    /// flag it for rotation when the slice is used up.
    fn charge_slice(&mut self, step: u32) {
        let Some(cur) = self.current else {
            return;
        };
        let t = &mut self.threads[cur.index()];
        if t.state != ThreadState::Running {
            return;
        }
        t.total_ticks = t.total_ticks.wrapping_add(step);
        if t.remaining_tick > step {
            t.remaining_tick -= step;
        } else {
            t.reset_slice();
            t.yield_pending = true;
            self.need_resched = true;
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::arch::sim::{take_switches, SimPort};
    use crate::thread::{BlockedOn, ThreadId};
    use crate::timer::{TimerAction, TimerMode};
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
    fn test_tick_counts_and_wraps() {
        let mut k = kernel();
        k.set_tick(Tick(u32::MAX - 1));
        k.on_tick();
        k.on_tick();
        assert_eq!(k.tick(), Tick(0));
        k.tick_increase_by(5);
        assert_eq!(k.tick(), Tick(5));
    }

    #[test]
    fn test_slice_exhaustion_rotates_equal_priority() {
        // Priorities 1, 2, 2: the priority-1 thread blocks, then the two
        // priority-2 threads alternate every 3 ticks.
        let mut k = kernel();
        let p1 = spawn(&mut k, 1, 3);
        let a = spawn(&mut k, 2, 3);
        let b = spawn(&mut k, 2, 3);
        k.start().unwrap();
        assert_eq!(k.thread_self(), Some(p1));

        k.suspend(p1, BlockedOn::Explicit).unwrap();
        k.schedule();
        assert_eq!(k.thread_self(), Some(a));

        let mut trace = Vec::new();
        for _ in 0..9 {
            k.on_tick();
            trace.push(k.thread_self().unwrap());
        }
        assert_eq!(trace, [a, a, b, b, b, a, a, a, b]);

        // Priority 1 preempts both as soon as it is ready again.
        k.resume(p1).unwrap();
        assert_eq!(k.thread_self(), Some(p1));
        for _ in 0..10 {
            k.on_tick();
            assert_eq!(k.thread_self(), Some(p1));
        }
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_slice_rotation_is_fifo_for_three_peers() {
        let mut k = kernel();
        let a = spawn(&mut k, 4, 1);
        let b = spawn(&mut k, 4, 1);
        let c = spawn(&mut k, 4, 1);
        k.start().unwrap();
        let mut trace = Vec::new();
        for _ in 0..6 {
            trace.push(k.thread_self().unwrap());
            k.on_tick();
        }
        assert_eq!(trace, [a, b, c, a, b, c]);
    }

    #[test]
    fn test_slice_exhaustion_without_peer_keeps_running() {
        let mut k = kernel();
        let a = spawn(&mut k, 4, 2);
        k.start().unwrap();
        take_switches();
        for _ in 0..5 {
            k.on_tick();
        }
        assert_eq!(k.thread_self(), Some(a));
        assert!(take_switches().is_empty());
        assert_eq!(k.thread(a).unwrap().total_ticks(), 5);
    }

    #[test]
    fn test_timer_wake_preempts_in_same_tick() {
        let mut k = kernel();
        let hi = spawn(&mut k, 1, 0);
        let lo = spawn(&mut k, 5, 0);
        k.start().unwrap();
        k.sleep(3).unwrap();
        assert_eq!(k.thread_self(), Some(lo));
        take_switches();

        k.on_tick();
        k.on_tick();
        assert_eq!(k.thread_self(), Some(lo));
        k.on_tick();
        assert_eq!(k.thread_self(), Some(hi));
        // One decision for the whole tick.
        assert_eq!(take_switches(), [(Some(lo), hi)]);
    }

    #[test]
    fn test_timer_wake_and_slice_expiry_in_same_tick() {
        // The slice of `a` runs out in the very tick that wakes `hi`:
        // `hi` runs, and `a` rotates behind its peer `b`.
        let mut k = kernel();
        let hi = spawn(&mut k, 1, 0);
        let a = spawn(&mut k, 3, 2);
        let b = spawn(&mut k, 3, 2);
        k.start().unwrap();
        k.sleep(2).unwrap();
        assert_eq!(k.thread_self(), Some(a));
        k.on_tick();
        k.on_tick();
        assert_eq!(k.thread_self(), Some(hi));
        let order: Vec<_> = k.ready.iter_at(&k.threads, 3).collect();
        assert_eq!(order, [b, a]);
        assert!(k.check_integrity().is_ok());
    }

    #[test]
    fn test_periodic_timer_fires_on_schedule_with_irregular_steps() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static FIRES: AtomicU32 = AtomicU32::new(0);
        fn hit(_: usize) {
            FIRES.fetch_add(1, Ordering::SeqCst);
        }

        let mut k = kernel();
        let t = k
            .timer_create(
                "p",
                TimerAction::Callback { func: hit, arg: 0 },
                10,
                TimerMode::Periodic,
            )
            .unwrap();
        k.timer_start(t).unwrap();

        let mut seen = Vec::new();
        for step in [4, 9, 2, 1, 13, 3, 1] {
            let before = FIRES.load(Ordering::SeqCst);
            k.tick_increase_by(step);
            let after = FIRES.load(Ordering::SeqCst);
            seen.push((k.tick().get(), after - before));
        }
        // Cumulative ticks 4, 13, 15, 16, 29, 32, 33: periods at 10, 20, 30.
        assert_eq!(
            seen,
            [(4, 0), (13, 1), (15, 0), (16, 0), (29, 1), (32, 1), (33, 0)]
        );
        assert_eq!(k.next_timeout(), Some(Tick(40)));
    }

    #[test]
    fn test_tick_step_charges_slice() {
        let mut k = kernel();
        let a = spawn(&mut k, 4, 10);
        let b = spawn(&mut k, 4, 10);
        k.start().unwrap();
        k.tick_increase_by(4);
        assert_eq!(k.thread(a).unwrap().remaining_tick(), 6);
        k.tick_increase_by(6);
        assert_eq!(k.thread_self(), Some(b));
        assert_eq!(k.thread(a).unwrap().remaining_tick(), 10);
    }
}

//! # TickOS Example Firmware
//!
//! Three threads and a periodic timer on an STM32F4-class part:
//!
//! | Thread | Priority | Slice | Behavior |
//! |--------|----------|-------|----------|
//! | `sampler` | 1 | 10 | Wakes every 100 ticks with `delay_until`, signals `DATA` |
//! | `filter` | 2 | 5 | Waits on `DATA` (500-tick timeout), updates shared state under `STATE` |
//! | `logger` | 2 | 5 | Busy work, shares the CPU with `filter` by time slice |
//!
//! A 250-tick periodic timer counts heartbeats from the tick interrupt.
//!
//! ## Expected Behavior
//!
//! 1. `sampler` preempts whichever priority-2 thread runs, every 100 ticks.
//! 2. `filter` wakes on each signal; if `sampler` stalls it times out and
//!    counts a miss instead.
//! 3. While `filter` is blocked, `logger` runs alone; otherwise the two
//!    alternate every 5 ticks.
//! 4. `STATE` is a priority-inheriting mutex: if `logger` holds it when
//!    `filter` wants it, `logger` finishes its section at `filter`'s
//!    priority.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m::interrupt::{self, Mutex};
    use cortex_m_rt::entry;
    use panic_halt as _;

    use tickos::os;
    use tickos::{KernelError, MutexId, SemId, TimerAction, TimerMode, Wait, WaitOrder};

    static DATA: Mutex<Cell<Option<SemId>>> = Mutex::new(Cell::new(None));
    static STATE: Mutex<Cell<Option<MutexId>>> = Mutex::new(Cell::new(None));

    static SAMPLES: AtomicU32 = AtomicU32::new(0);
    static MISSES: AtomicU32 = AtomicU32::new(0);
    static HEARTBEATS: AtomicU32 = AtomicU32::new(0);

    fn data() -> Option<SemId> {
        interrupt::free(|cs| DATA.borrow(cs).get())
    }

    fn state() -> Option<MutexId> {
        interrupt::free(|cs| STATE.borrow(cs).get())
    }

    fn spin(n: u32) {
        let mut x: u32 = 0;
        for _ in 0..n {
            x = core::hint::black_box(x.wrapping_add(1));
        }
    }

    /// Runs from the tick interrupt; must not call back into `os`.
    fn heartbeat(_: usize) {
        HEARTBEATS.fetch_add(1, Ordering::Relaxed);
    }

    extern "C" fn sampler(period: usize) {
        let Some(sem) = data() else { return };
        let mut last = os::tick_count();
        loop {
            spin(500);
            let _ = os::sem_release(sem);
            if os::delay_until(&mut last, period as u32).is_err() {
                return;
            }
        }
    }

    extern "C" fn filter(_: usize) {
        let (Some(sem), Some(m)) = (data(), state()) else {
            return;
        };
        loop {
            match os::sem_take(sem, Wait::Ticks(500)) {
                Ok(()) => {
                    SAMPLES.fetch_add(1, Ordering::Relaxed);
                }
                Err(KernelError::Timeout) => {
                    MISSES.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(_) => return,
            }
            if os::mutex_lock(m, Wait::Forever).is_ok() {
                spin(200);
                let _ = os::mutex_unlock(m);
            }
        }
    }

    extern "C" fn logger(_: usize) {
        let Some(m) = state() else { return };
        loop {
            spin(2000);
            if os::mutex_lock(m, Wait::Forever).is_ok() {
                spin(1000);
                let _ = os::mutex_unlock(m);
            }
        }
    }

    #[entry]
    fn main() -> ! {
        let Some(cp) = cortex_m::Peripherals::take() else {
            loop {
                cortex_m::asm::wfi();
            }
        };

        if let Err(e) = setup() {
            log::error!("setup failed: {}", e);
            loop {
                cortex_m::asm::wfi();
            }
        }

        os::start(cp)
    }

    fn setup() -> tickos::Result<()> {
        os::init()?;

        let sem = os::sem_create("data", 0, WaitOrder::Priority)?;
        let m = os::mutex_create("state")?;
        interrupt::free(|cs| {
            DATA.borrow(cs).set(Some(sem));
            STATE.borrow(cs).set(Some(m));
        });

        os::spawn("sampler", sampler, 100, 1, 10)?;
        os::spawn("filter", filter, 0, 2, 5)?;
        os::spawn("logger", logger, 0, 2, 5)?;

        let hb = os::timer_create(
            "heartbt",
            TimerAction::Callback { func: heartbeat, arg: 0 },
            250,
            TimerMode::Periodic,
        )?;
        os::timer_start(hb)?;

        log::info!("demo threads ready");
        Ok(())
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {
    eprintln!("tickos-demo is firmware: build it with --target thumbv7em-none-eabihf");
}

//! # TickOS Configuration
//!
//! Compile-time constants governing the scheduler, timers and IPC pools.
//! All limits are fixed at compile time, no dynamic allocation.

/// Maximum number of threads the kernel can manage simultaneously,
/// including the idle thread. Bounds the static TCB array; each thread
/// consumes `STACK_SIZE` bytes of RAM.
pub const MAX_THREADS: usize = 8;

/// Number of user timers. Every thread additionally owns one built-in
/// timer for sleeps and wait timeouts.
pub const MAX_TIMERS: usize = 8;

/// Size of the semaphore pool.
pub const MAX_SEMAPHORES: usize = 8;

/// Size of the mutex pool.
pub const MAX_MUTEXES: usize = 4;

/// Number of priority levels. 0 is the highest, `PRIORITY_MAX - 1` the
/// lowest. Must fit the `u32` ready bitmap.
pub const PRIORITY_MAX: usize = 32;

/// Priority of the idle thread.
pub const IDLE_PRIORITY: u8 = (PRIORITY_MAX - 1) as u8;

/// SysTick frequency in Hz. Determines scheduler tick granularity.
pub const TICK_HZ: u32 = 1000;

/// Default time slice in ticks, used when a thread is created with a
/// slice of 0.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Per-thread stack size in bytes. Must be large enough for the
/// deepest call chain plus the hardware exception frame (32 bytes, 104
/// with FPU state) and the software-saved context (36 bytes for R4–R11
/// and EXC_RETURN, 64 more with FPU state).
pub const STACK_SIZE: usize = 1024;

/// Object names longer than this are truncated.
pub const NAME_MAX: usize = 8;

/// A periodic timer that has fallen this many periods behind is
/// resynchronised to `now + period` instead of firing every missed period.
pub const TIMER_CATCHUP_LIMIT: u32 = 16;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

const _: () = assert!(PRIORITY_MAX > 0 && PRIORITY_MAX <= 32);
const _: () = assert!(MAX_THREADS > 0 && MAX_THREADS <= u8::MAX as usize);
// Thread, timer, semaphore and mutex handles are `u8` indices.
const _: () = assert!(MAX_THREADS + MAX_TIMERS <= u8::MAX as usize);
const _: () = assert!(MAX_SEMAPHORES <= u8::MAX as usize);
const _: () = assert!(MAX_MUTEXES <= u8::MAX as usize);

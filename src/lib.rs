//! # TickOS
//!
//! A priority-preemptive real-time kernel with tick-driven software timers
//! for ARM Cortex-M4 microcontrollers.
//!
//! ## Overview
//!
//! - **Ready queue**: one FIFO list per priority plus a 32-bit bitmap, so
//!   the highest ready priority is a single `trailing_zeros`.
//! - **Scheduling**: the highest-priority ready thread always runs; equal
//!   priorities share the CPU in time slices.
//! - **Timers**: one sorted list of armed timers, checked every tick. Each
//!   thread owns a built-in timer for sleeps and wait timeouts.
//! - **IPC**: counting semaphores and recursive mutexes with priority
//!   inheritance, with optional wait timeouts.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   Application Threads                   │
//! ├────────────────────────────────────────────────────────┤
//! │          Target Runtime (os.rs, Cortex-M4 only)         │
//! │      init() · spawn() · start() · sleep() · sem_*()     │
//! ├────────────────────────────────────────────────────────┤
//! │                  Kernel<P> (kernel.rs)                  │
//! ├──────────────┬──────────────┬────────────┬─────────────┤
//! │  Scheduler   │  Clock       │  Timers    │  IPC        │
//! │  scheduler.rs│  clock.rs    │  timer.rs  │  ipc.rs     │
//! ├──────────────┴──────────────┴────────────┴─────────────┤
//! │   ReadyQueue (ready.rs) · List (list.rs) · TCB (thread) │
//! ├────────────────────────────────────────────────────────┤
//! │         Port trait (arch/) · CriticalSection (sync)     │
//! ├────────────────────────────────────────────────────────┤
//! │            ARM Cortex-M4 Hardware (Thumb-2)             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The kernel is generic over [`Port`]: on target it runs on
//! `arch::cortex_m4::CortexM4`, and the unit tests drive the very same code
//! on the host through a simulated port.
//!
//! ## Memory Model
//!
//! - **No heap**: all state is statically allocated
//! - **No `alloc`**: pure `core`
//! - **Fixed pools**: threads, timers, semaphores and mutexes live in
//!   arrays and are addressed by index handles
//! - **Per-thread stack**: `[u8; STACK_SIZE]` inline in the TCB
//! - **Critical sections**: every kernel mutation runs with interrupts
//!   masked through [`CriticalSection`]

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod clock;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod list;
pub mod ready;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod tick;
pub mod timer;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod os;

pub use arch::Port;
pub use error::{KernelError, Result};
pub use ipc::{Acquire, MutexId, SemId, WaitOrder};
pub use kernel::Kernel;
pub use sync::CriticalSection;
pub use thread::{BlockedOn, ThreadEntry, ThreadId, ThreadState};
pub use tick::{tick_from_millisecond, Tick, Wait};
pub use timer::{TimerAction, TimerId, TimerMode};

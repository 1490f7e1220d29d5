//! # Thread Control Block
//!
//! Defines the thread model for TickOS. Every thread lives in a fixed slot
//! of the kernel's TCB array and is addressed by a [`ThreadId`] (its slot
//! index). A TCB embeds one [`Link`] that places it on at most one queue:
//! the ready list of its priority or the wait list of a synchronization
//! object. Sleeps and wait timeouts are tracked by the thread's own
//! built-in timer, never by the TCB link.

use heapless::String;

use crate::config::{DEFAULT_TIME_SLICE, NAME_MAX, STACK_SIZE};
use crate::ipc::{MutexId, SemId};
use crate::list::{Link, Node};
use crate::tick::Tick;

/// Thread entry point. Receives the parameter given at creation.
pub type ThreadEntry = extern "C" fn(usize);

/// Stable handle to a TCB slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u8);

impl ThreadId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// What a suspended thread is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedOn {
    /// Suspended directly through [`Kernel::suspend`](crate::Kernel::suspend).
    Explicit,
    Semaphore(SemId),
    Mutex(MutexId),
}

/// Execution state of a thread.
///
/// ```text
///   ┌──────┐ start ┌───────┐  schedule()   ┌─────────┐
///   │ Init │ ────► │ Ready │ ────────────► │ Running │
///   └──────┘       └───────┘ ◄──────────── └─────────┘
///                     ▲      slice / yield   │  │  │
///                     │                      │  │  │ exit
///                     │    resume / timeout  │  │  ▼
///                     │  ┌─────────────────┐ │  │ ┌────────┐
///                     └──│ Suspended/Sleep │◄┘  │ │ Closed │
///                        └─────────────────┘    │ └────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet started.
    Init,
    /// Queued on the ready list of its priority.
    Ready,
    /// Executing on the CPU. Not on any list.
    Running,
    /// Blocked on an object; on that object's wait list unless `Explicit`.
    Suspended(BlockedOn),
    /// Waiting for its built-in timer to expire at the given tick.
    Sleeping(Tick),
    /// Exited or deleted. Never scheduled again; slot reclaimed by `reap`.
    Closed,
}

/// How the last blocking wait of a thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Deleted,
}

/// Which list the TCB link currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queue {
    Detached,
    Ready,
    Waiting,
}

/// Per-thread stack memory, 8-byte aligned as AAPCS requires.
#[repr(C, align(8))]
pub struct Stack(pub [u8; STACK_SIZE]);

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Thread Control Block (TCB).
///
/// Stored inline in the kernel's static array. The stack is owned by the
/// TCB until the slot is reaped after the thread closes.
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: String<NAME_MAX>,
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) parameter: usize,

    pub(crate) state: ThreadState,
    /// Priority given at creation.
    pub(crate) init_priority: u8,
    /// Effective priority; raised temporarily by mutex inheritance.
    pub(crate) current_priority: u8,

    /// Time-slice budget in ticks.
    pub(crate) init_tick: u32,
    /// Ticks left in the current slice.
    pub(crate) remaining_tick: u32,
    /// Set by a voluntary yield or slice expiry; makes the next scheduling
    /// decision rotate this thread behind its equal-priority peers.
    pub(crate) yield_pending: bool,

    /// Saved stack pointer, updated by the port on every switch.
    pub(crate) sp: usize,
    pub(crate) stack: Stack,

    pub(crate) link: Link,
    pub(crate) queue: Queue,
    pub(crate) outcome: Option<WaitOutcome>,

    /// Total ticks this thread has spent Running.
    pub(crate) total_ticks: u32,
    /// Whether this slot holds a thread (including a Closed one awaiting reap).
    pub(crate) allocated: bool,
}

impl Thread {
    /// Free slot, used to initialize the static array.
    pub const EMPTY: Thread = Thread {
        id: ThreadId(0),
        name: String::new(),
        entry: None,
        parameter: 0,
        state: ThreadState::Init,
        init_priority: 0,
        current_priority: 0,
        init_tick: 0,
        remaining_tick: 0,
        yield_pending: false,
        sp: 0,
        stack: Stack([0; STACK_SIZE]),
        link: Link::UNLINKED,
        queue: Queue::Detached,
        outcome: None,
        total_ticks: 0,
        allocated: false,
    };

    /// Initialize a free slot for a new thread in the `Init` state.
    /// The stack frame is built separately by the port.
    pub(crate) fn init(
        &mut self,
        id: ThreadId,
        name: &str,
        entry: ThreadEntry,
        parameter: usize,
        priority: u8,
        time_slice: u32,
    ) {
        let slice = if time_slice > 0 { time_slice } else { DEFAULT_TIME_SLICE };
        self.id = id;
        self.name = object_name(name);
        self.entry = Some(entry);
        self.parameter = parameter;
        self.state = ThreadState::Init;
        self.init_priority = priority;
        self.current_priority = priority;
        self.init_tick = slice;
        self.remaining_tick = slice;
        self.yield_pending = false;
        self.sp = 0;
        self.link = Link::UNLINKED;
        self.queue = Queue::Detached;
        self.outcome = None;
        self.total_ticks = 0;
        self.allocated = true;
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Effective priority (0 is highest).
    #[inline]
    pub fn priority(&self) -> u8 {
        self.current_priority
    }

    #[inline]
    pub fn base_priority(&self) -> u8 {
        self.init_priority
    }

    #[inline]
    pub fn time_slice(&self) -> u32 {
        self.init_tick
    }

    #[inline]
    pub fn remaining_tick(&self) -> u32 {
        self.remaining_tick
    }

    #[inline]
    pub fn total_ticks(&self) -> u32 {
        self.total_ticks
    }

    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    /// Suspended or Sleeping: the states `resume` accepts.
    #[inline]
    pub fn is_blocked(&self) -> bool {
        matches!(self.state, ThreadState::Suspended(_) | ThreadState::Sleeping(_))
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.allocated && self.state != ThreadState::Closed
    }

    pub(crate) fn reset_slice(&mut self) {
        self.remaining_tick = self.init_tick;
    }
}

impl Node for Thread {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Copy `name` into a fixed-capacity object name, truncating at a char
/// boundary when it does not fit.
pub(crate) fn object_name(name: &str) -> String<NAME_MAX> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_: usize) {}

    #[test]
    fn test_tcb_initialization() {
        let mut tcb = Thread::EMPTY;
        assert!(!tcb.allocated);

        tcb.init(ThreadId(3), "worker", noop, 7, 5, 15);

        assert!(tcb.allocated);
        assert_eq!(tcb.id(), ThreadId(3));
        assert_eq!(tcb.state(), ThreadState::Init);
        assert_eq!(tcb.priority(), 5);
        assert_eq!(tcb.base_priority(), 5);
        assert_eq!(tcb.time_slice(), 15);
        assert_eq!(tcb.remaining_tick(), 15);
        assert_eq!(tcb.parameter, 7);
        assert_eq!(tcb.queue, Queue::Detached);
    }

    #[test]
    fn test_default_time_slice() {
        let mut tcb = Thread::EMPTY;
        tcb.init(ThreadId(0), "t", noop, 0, 1, 0);
        assert_eq!(tcb.time_slice(), DEFAULT_TIME_SLICE);
    }

    #[test]
    fn test_name_truncation() {
        let name = object_name("a_rather_long_thread_name");
        assert_eq!(name.len(), NAME_MAX);
        assert_eq!(name.as_str(), &"a_rather_long_thread_name"[..NAME_MAX]);
        // Multi-byte chars are never split.
        let name = object_name("ééééé");
        assert_eq!(name.as_str(), "éééé");
    }

    #[test]
    fn test_blocked_states() {
        let mut tcb = Thread::EMPTY;
        tcb.init(ThreadId(0), "t", noop, 0, 1, 0);
        assert!(!tcb.is_blocked());
        tcb.state = ThreadState::Sleeping(Tick(9));
        assert!(tcb.is_blocked());
        tcb.state = ThreadState::Suspended(BlockedOn::Explicit);
        assert!(tcb.is_blocked());
        tcb.state = ThreadState::Closed;
        assert!(!tcb.is_blocked());
        assert!(!tcb.is_live());
    }
}

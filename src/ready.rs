//! # Ready Queue
//!
//! One FIFO list per priority level plus a presence bitmap: bit `p` is
//! set iff the list at priority `p` is non-empty. The highest ready
//! priority is the lowest set bit, found in one `trailing_zeros`.
//!
//! ```text
//!  bitmap: 0b...0100110
//!                 │  ││
//!  prio 1 ────────┼──┘└─ [T3] → [T5]
//!  prio 2 ────────┼───── [T1]
//!  prio 5 ────────┘───── [T0] → [T2] → [T4]
//! ```
//!
//! The running thread is never on the ready queue.

use crate::config::PRIORITY_MAX;
use crate::error::{fatal, KernelError, Result};
use crate::list::List;
use crate::thread::{Queue, Thread, ThreadId, ThreadState};

pub struct ReadyQueue {
    lists: [List; PRIORITY_MAX],
    bitmap: u32,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            lists: [List::new(); PRIORITY_MAX],
            bitmap: 0,
        }
    }

    /// Append `id` behind its equal-priority peers.
    pub(crate) fn push_back(&mut self, threads: &mut [Thread], id: ThreadId) {
        let prio = threads[id.index()].current_priority as usize;
        self.lists[prio].push_back(threads, id.index());
        self.mark(threads, id, prio);
    }

    /// Put `id` ahead of its equal-priority peers. Used for a thread that
    /// was preempted before its slice ran out, so it keeps its turn.
    pub(crate) fn push_front(&mut self, threads: &mut [Thread], id: ThreadId) {
        let prio = threads[id.index()].current_priority as usize;
        match self.lists[prio].front() {
            Some(head) => self.lists[prio].insert_before(threads, head, id.index()),
            None => self.lists[prio].push_back(threads, id.index()),
        }
        self.mark(threads, id, prio);
    }

    fn mark(&mut self, threads: &mut [Thread], id: ThreadId, prio: usize) {
        self.bitmap |= 1 << prio;
        threads[id.index()].queue = Queue::Ready;
    }

    /// Unlink `id` from its priority list, clearing the bitmap bit if the
    /// list empties. The thread's state is left to the caller.
    pub(crate) fn remove(&mut self, threads: &mut [Thread], id: ThreadId) -> Result<()> {
        if threads[id.index()].queue != Queue::Ready {
            return Err(KernelError::InvalidState);
        }
        let prio = threads[id.index()].current_priority as usize;
        self.lists[prio].remove(threads, id.index());
        threads[id.index()].queue = Queue::Detached;
        if self.lists[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
        Ok(())
    }

    /// Highest ready priority, if any thread is ready.
    #[inline]
    pub fn highest_priority(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as u8)
        }
    }

    /// Head of the highest-priority non-empty list.
    pub fn peek(&self) -> Option<ThreadId> {
        let prio = self.highest_priority()?;
        match self.lists[prio as usize].front() {
            Some(head) => Some(ThreadId(head as u8)),
            None => fatal("ready bitmap bit set for an empty list"),
        }
    }

    #[inline]
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    pub fn len_at(&self, prio: u8) -> usize {
        self.lists[prio as usize].len()
    }

    /// Ready threads at `prio`, head first.
    pub fn iter_at<'a>(
        &self,
        threads: &'a [Thread],
        prio: u8,
    ) -> impl Iterator<Item = ThreadId> + 'a {
        self.lists[prio as usize]
            .iter(threads)
            .map(|i| ThreadId(i as u8))
    }

    /// Verify bitmap/list agreement and that every queued thread is a
    /// Ready thread at that list's priority.
    pub(crate) fn check(&self, threads: &[Thread]) -> Result<usize> {
        let mut queued = 0;
        for (prio, list) in self.lists.iter().enumerate() {
            let bit = self.bitmap & (1 << prio) != 0;
            if bit == list.is_empty() {
                return Err(KernelError::QueueCorruption);
            }
            let mut count = 0;
            for idx in list.iter(threads) {
                let t = &threads[idx];
                if t.queue != Queue::Ready
                    || t.state != ThreadState::Ready
                    || t.current_priority as usize != prio
                {
                    return Err(KernelError::QueueCorruption);
                }
                count += 1;
            }
            if count != list.len() {
                return Err(KernelError::QueueCorruption);
            }
            queued += count;
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec::Vec;

    extern "C" fn noop(_: usize) {}

    fn threads(prios: &[u8]) -> [Thread; 8] {
        let mut threads = [const { Thread::EMPTY }; 8];
        for (i, &p) in prios.iter().enumerate() {
            threads[i].init(ThreadId(i as u8), "t", noop, 0, p, 0);
            threads[i].state = ThreadState::Ready;
        }
        threads
    }

    #[test]
    fn test_pick_highest_priority() {
        let mut threads = threads(&[5, 2, 7, 2]);
        let mut rq = ReadyQueue::new();
        for i in 0..4 {
            rq.push_back(&mut threads, ThreadId(i));
        }
        assert_eq!(rq.highest_priority(), Some(2));
        assert_eq!(rq.peek(), Some(ThreadId(1)));
        assert_eq!(rq.bitmap(), (1 << 2) | (1 << 5) | (1 << 7));
        assert_eq!(rq.check(&threads), Ok(4));
    }

    #[test]
    fn test_fifo_within_level() {
        let mut threads = threads(&[3, 3, 3]);
        let mut rq = ReadyQueue::new();
        rq.push_back(&mut threads, ThreadId(2));
        rq.push_back(&mut threads, ThreadId(0));
        rq.push_front(&mut threads, ThreadId(1));
        let order: Vec<_> = rq.iter_at(&threads, 3).collect();
        assert_eq!(order, [ThreadId(1), ThreadId(2), ThreadId(0)]);
    }

    #[test]
    fn test_bitmap_tracks_list_emptiness() {
        let mut threads = threads(&[4, 4, 9]);
        let mut rq = ReadyQueue::new();
        for i in 0..3 {
            rq.push_back(&mut threads, ThreadId(i));
        }
        rq.remove(&mut threads, ThreadId(0)).unwrap();
        assert_eq!(rq.bitmap() & (1 << 4), 1 << 4);
        rq.remove(&mut threads, ThreadId(1)).unwrap();
        assert_eq!(rq.bitmap(), 1 << 9);
        assert_eq!(rq.peek(), Some(ThreadId(2)));
        rq.remove(&mut threads, ThreadId(2)).unwrap();
        assert_eq!(rq.bitmap(), 0);
        assert_eq!(rq.peek(), None);
        assert_eq!(rq.check(&threads), Ok(0));
    }

    #[test]
    fn test_remove_unqueued_is_invalid_state() {
        let mut threads = threads(&[1]);
        let mut rq = ReadyQueue::new();
        assert_eq!(
            rq.remove(&mut threads, ThreadId(0)),
            Err(KernelError::InvalidState)
        );
        rq.push_back(&mut threads, ThreadId(0));
        rq.remove(&mut threads, ThreadId(0)).unwrap();
        assert_eq!(
            rq.remove(&mut threads, ThreadId(0)),
            Err(KernelError::InvalidState)
        );
    }

    #[test]
    fn test_check_detects_state_mismatch() {
        let mut threads = threads(&[1, 1]);
        let mut rq = ReadyQueue::new();
        rq.push_back(&mut threads, ThreadId(0));
        rq.push_back(&mut threads, ThreadId(1));
        threads[1].state = ThreadState::Running;
        assert_eq!(rq.check(&threads), Err(KernelError::QueueCorruption));
    }

    #[test]
    fn test_bitmap_consistency_over_random_sequence() {
        // Deterministic pseudo-random insert/remove mix across levels.
        let mut threads = threads(&[0, 3, 3, 7, 12, 31, 7, 0]);
        let mut rq = ReadyQueue::new();
        let mut queued = [false; 8];
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let i = (seed % 8) as usize;
            if queued[i] {
                rq.remove(&mut threads, ThreadId(i as u8)).unwrap();
            } else {
                rq.push_back(&mut threads, ThreadId(i as u8));
            }
            queued[i] = !queued[i];
            assert!(rq.check(&threads).is_ok());
            let best = (0..8)
                .filter(|&j| queued[j])
                .map(|j| threads[j].priority())
                .min();
            assert_eq!(rq.highest_priority(), best);
        }
    }
}

//! FIFO ready queue with O(1) unlink.
//!
//! Entries are stamped with the context's link token at enqueue time. An
//! unlink bumps the token and leaves the entry in place; the pop skips and
//! discards entries whose stamp no longer matches. Queue lengths are tiny
//! (one per nice level), so the lazily-discarded entries never accumulate
//! beyond a handful.

use std::collections::VecDeque;
use std::sync::Arc;

use super::FiberContext;

struct Entry {
    ctx: Arc<FiberContext>,
    token: u64,
}

/// FIFO queue of ready fiber contexts.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    entries: VecDeque<Entry>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Links `ctx` at the tail.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is already linked somewhere.
    pub(crate) fn push_back(&mut self, ctx: &Arc<FiberContext>) {
        let token = ctx.link();
        self.entries.push_back(Entry {
            ctx: Arc::clone(ctx),
            token,
        });
    }

    /// Unlinks and returns the head, skipping stale entries.
    pub(crate) fn pop_front(&mut self) -> Option<Arc<FiberContext>> {
        while let Some(entry) = self.entries.pop_front() {
            if entry.ctx.link_matches(entry.token) {
                entry.ctx.unlink();
                return Some(entry.ctx);
            }
        }
        None
    }

    /// Number of live (non-stale) entries.
    pub(crate) fn live_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.ctx.link_matches(entry.token))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberProperties;
    use crate::types::FiberKind;

    fn worker(nice: usize) -> Arc<FiberContext> {
        FiberContext::new(FiberKind::Worker, FiberProperties::new("w", nice), false)
    }

    #[test]
    fn fifo_order() {
        let mut q = ReadyQueue::new();
        let a = worker(0);
        let b = worker(0);
        q.push_back(&a);
        q.push_back(&b);
        assert_eq!(q.pop_front().unwrap().id(), a.id());
        assert_eq!(q.pop_front().unwrap().id(), b.id());
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn pop_clears_link_flag() {
        let mut q = ReadyQueue::new();
        let a = worker(0);
        q.push_back(&a);
        assert!(a.is_linked());
        let popped = q.pop_front().unwrap();
        assert!(!popped.is_linked());
    }

    #[test]
    fn unlinked_entry_is_skipped() {
        let mut q = ReadyQueue::new();
        let a = worker(0);
        let b = worker(0);
        q.push_back(&a);
        q.push_back(&b);
        a.unlink();
        assert_eq!(q.live_len(), 1);
        assert_eq!(q.pop_front().unwrap().id(), b.id());
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn relinked_context_is_not_resurrected_by_stale_entry() {
        let mut q = ReadyQueue::new();
        let mut q2 = ReadyQueue::new();
        let a = worker(1);
        q.push_back(&a);
        // Moved to another queue: the first entry must stay dead.
        a.unlink();
        q2.push_back(&a);
        assert!(q.pop_front().is_none());
        assert_eq!(q2.pop_front().unwrap().id(), a.id());
    }
}

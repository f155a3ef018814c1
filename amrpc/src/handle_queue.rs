//! Completion queue for posted network operations.
//!
//! Handles enter in post order and are polled by [`burst`] during
//! progress. A scan walks from the head so old handles are tested first,
//! but gives up after a bounded run of consecutive misses; the bound
//! adapts to how the caller is using progress.
//!
//! [`burst`]: HandleQueue::burst

use std::collections::VecDeque;

/// An in-flight network operation.
pub trait NetHandle {
    /// Test for completion. Cheap and non-blocking; called repeatedly.
    fn is_ready(&mut self) -> bool;

    /// Consume the handle and run its completion work. Called exactly
    /// once, after `is_ready` returned true.
    ///
    /// Runs inside a queue scan: implementations must not reach back into
    /// the queue. Follow-up operations go through a persona inbox and are
    /// posted after the scan.
    fn complete(self: Box<Self>);
}

/// FIFO of posted-but-unfinished handles with an adaptive scan cutoff.
pub struct HandleQueue {
    queue: VecDeque<Box<dyn NetHandle>>,
    miss_limit: usize,
    base: usize,
    max: usize,
}

impl HandleQueue {
    pub fn new(base: usize, max: usize) -> Self {
        debug_assert!(base >= 1 && max >= base);
        Self {
            queue: VecDeque::new(),
            miss_limit: base,
            base,
            max,
        }
    }

    pub fn push(&mut self, handle: Box<dyn NetHandle>) {
        self.queue.push_back(handle);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Current consecutive-miss cutoff.
    pub fn miss_limit(&self) -> usize {
        self.miss_limit
    }

    /// Scan from the head, completing every ready handle, until the queue
    /// is exhausted or `miss_limit` consecutive handles were not ready.
    /// Returns the number completed.
    ///
    /// Any completion resets the cutoff to its base. A fruitless scan
    /// while the caller is spin-polling doubles it (up to the cap), so a
    /// spinner probes deeper past a cluster of not-yet-ready handles at
    /// the front instead of re-testing them forever.
    pub fn burst(&mut self, spinning: bool) -> usize {
        let mut executed = 0;
        let mut misses = 0;
        let mut idx = 0;
        while idx < self.queue.len() {
            let ready = match self.queue.get_mut(idx) {
                Some(handle) => handle.is_ready(),
                None => break,
            };
            if ready {
                if let Some(handle) = self.queue.remove(idx) {
                    handle.complete();
                }
                executed += 1;
                misses = 0;
                // The next handle slid into this index.
            } else {
                misses += 1;
                if misses >= self.miss_limit {
                    break;
                }
                idx += 1;
            }
        }
        if executed > 0 {
            self.miss_limit = self.base;
        } else if spinning {
            self.miss_limit = (self.miss_limit * 2).min(self.max);
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct TestHandle {
        id: usize,
        remaining_polls: usize,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl NetHandle for TestHandle {
        fn is_ready(&mut self) -> bool {
            if self.remaining_polls == 0 {
                true
            } else {
                self.remaining_polls -= 1;
                false
            }
        }

        fn complete(self: Box<Self>) {
            self.log.borrow_mut().push(self.id);
        }
    }

    fn queue_with(handles: &[(usize, usize)]) -> (HandleQueue, Rc<RefCell<Vec<usize>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = HandleQueue::new(4, 64);
        for &(id, polls) in handles {
            q.push(Box::new(TestHandle {
                id,
                remaining_polls: polls,
                log: Rc::clone(&log),
            }));
        }
        (q, log)
    }

    #[test]
    fn ready_handles_complete_in_queue_order() {
        let (mut q, log) = queue_with(&[(0, 0), (1, 0), (2, 0)]);
        assert_eq!(q.burst(false), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn scattered_ready_handles_all_complete_eventually() {
        // Ready at scattered positions, others need several more polls.
        let (mut q, log) = queue_with(&[(0, 3), (1, 0), (2, 5), (3, 0), (4, 9), (5, 0)]);
        let mut total = 0;
        for _ in 0..32 {
            total += q.burst(true);
            if q.is_empty() {
                break;
            }
        }
        assert_eq!(total, 6);
        let mut seen = log.borrow().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn scan_stops_at_miss_limit() {
        // Head is a wall of four never-ready handles, limit is four.
        let (mut q, log) = queue_with(&[(0, 100), (1, 100), (2, 100), (3, 100), (4, 0)]);
        assert_eq!(q.burst(false), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn spinning_widens_the_limit_past_a_front_cluster() {
        let (mut q, log) = queue_with(&[(0, 100), (1, 100), (2, 100), (3, 100), (4, 0)]);
        assert_eq!(q.miss_limit(), 4);
        // First fruitless spin doubles the limit, the next scan reaches
        // past the cluster.
        assert_eq!(q.burst(true), 0);
        assert_eq!(q.miss_limit(), 8);
        assert_eq!(q.burst(true), 1);
        assert_eq!(*log.borrow(), vec![4]);
    }

    #[test]
    fn completion_resets_the_limit_to_base() {
        let (mut q, _log) = queue_with(&[(0, 100), (1, 100), (2, 100), (3, 100), (4, 1)]);
        q.burst(true);
        q.burst(true);
        assert!(q.miss_limit() > 4);
        // Handle 4 is now ready; completing it snaps the limit back.
        assert_eq!(q.burst(true), 1);
        assert_eq!(q.miss_limit(), 4);
    }

    #[test]
    fn limit_growth_is_capped() {
        let (mut q, _log) = queue_with(&[(0, usize::MAX)]);
        for _ in 0..20 {
            q.burst(true);
        }
        assert_eq!(q.miss_limit(), 64);
    }

    #[test]
    fn non_spinning_scans_do_not_widen() {
        let (mut q, _log) = queue_with(&[(0, 100)]);
        q.burst(false);
        q.burst(false);
        assert_eq!(q.miss_limit(), 4);
    }
}

//! Local procedure call nodes and queues.
//!
//! An LPC is an owned, type-erased closure executed once by the persona
//! that drains the queue it sits in. Same-thread work goes through a
//! [`LocalQueue`]; work crossing threads rides an mpsc channel to the
//! target persona's inbox and must be `Send`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::persona::UserMsg;

/// A queued unit of deferred local work.
pub type LpcNode = Box<dyn FnOnce() + 'static>;

/// An LPC crossing a thread boundary.
pub type SendLpcNode = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of same-thread deferred work.
///
/// Cloning shares the queue; personas hand clones to completion states so
/// deferred resolutions land back on the owning queue.
#[derive(Clone, Default)]
pub struct LocalQueue {
    inner: Rc<RefCell<VecDeque<LpcNode>>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, node: LpcNode) {
        self.inner.borrow_mut().push_back(node);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    /// Execute up to `budget` nodes in FIFO order. Returns the number run.
    ///
    /// Only nodes present at entry are eligible; work a node pushes onto
    /// the same queue runs in a later call, never recursively.
    pub fn run(&self, budget: usize) -> usize {
        let batch = self.inner.borrow().len().min(budget);
        let mut ran = 0;
        while ran < batch {
            let node = self.inner.borrow_mut().pop_front();
            match node {
                Some(node) => {
                    node();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

/// A sendable reference to a persona's user-level inbox.
///
/// Carries the persona's wire key, the inbox sender, and the undischarged
/// work counter quiescence detection reads.
#[derive(Clone)]
pub struct PersonaRef {
    key: u64,
    inbox: Sender<UserMsg>,
    undischarged: Arc<AtomicU64>,
}

impl PersonaRef {
    pub(crate) fn new(key: u64, inbox: Sender<UserMsg>, undischarged: Arc<AtomicU64>) -> Self {
        Self {
            key,
            inbox,
            undischarged,
        }
    }

    /// The persona's wire key.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Work registered but not yet enqueued or abandoned.
    pub fn undischarged(&self) -> u64 {
        self.undischarged.load(Ordering::Acquire)
    }

    /// Register one unit of in-flight work against this persona.
    pub(crate) fn register_work(&self) {
        self.undischarged.fetch_add(1, Ordering::AcqRel);
    }

    /// Balance one [`register_work`](Self::register_work).
    pub(crate) fn discharge(&self) {
        let prev = self.undischarged.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "undischarged counter underflow");
    }

    /// Enqueue work onto the persona's user inbox.
    ///
    /// A send to a persona that has been dropped loses the node; the work
    /// was destined for an execution context that no longer exists.
    pub fn enqueue(&self, node: SendLpcNode) {
        if self.inbox.send(UserMsg::Lpc(node)).is_err() {
            log::warn!("lpc dropped: persona {:#x} no longer exists", self.key);
        }
    }
}

//! Runtime state of a completion list, one slot per action.
//!
//! An operation builds a [`CompletionState`] from the caller's
//! [`Completions`], marks events that completed during the send with
//! [`set_done`], folds the future slots into a [`Returned`] for the
//! caller, and then fires or cancels the rest as the protocol reports
//! progress. Every slot sees exactly one terminal transition.
//!
//! [`set_done`]: CompletionState::set_done

use crate::command::Command;
use crate::completion::{Action, Completions, Event};
use crate::error::protocol_fatal;
use crate::future::{OpFuture, Promise};
use crate::lpc::{LocalQueue, PersonaRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    /// Satisfied before anything observed it, the eager shortcut.
    Done,
    Fired,
    Cancelled,
}

enum SlotKind<T: Clone + Default> {
    Future {
        deferred: bool,
        backing: Option<Promise<T>>,
    },
    UserPromise {
        promise: Promise<T>,
    },
    Lpc {
        target: PersonaRef,
        func: Option<Box<dyn FnOnce(T) + Send>>,
    },
    /// Stateless sync kinds: their effect happened inside the operation
    /// call itself, so firing and cancelling pass them by.
    Sync,
}

struct Slot<T: Clone + Default> {
    event: Event,
    state: SlotState,
    kind: SlotKind<T>,
}

impl<T: Clone + Default> Slot<T> {
    fn is_sync(&self) -> bool {
        matches!(self.kind, SlotKind::Sync)
    }
}

/// What an operation hands back: zero, one, or several futures, in the
/// order their actions appeared in the completion list.
#[derive(Debug)]
pub enum Returned<T: Clone + Default> {
    None,
    One(OpFuture<T>),
    Many(Vec<OpFuture<T>>),
}

impl<T: Clone + Default> Returned<T> {
    /// Assert no futures were requested.
    pub fn expect_none(self) {
        match self {
            Returned::None => {}
            Returned::One(_) => panic!("operation returned a future where none was expected"),
            Returned::Many(f) => panic!(
                "operation returned {} futures where none was expected",
                f.len()
            ),
        }
    }

    /// Unwrap the single requested future.
    pub fn into_future(self) -> OpFuture<T> {
        match self {
            Returned::One(f) => f,
            Returned::None => panic!("operation returned no future"),
            Returned::Many(f) => panic!("operation returned {} futures, expected one", f.len()),
        }
    }

    /// Unwrap exactly two futures, in completion-list order.
    pub fn into_pair(self) -> (OpFuture<T>, OpFuture<T>) {
        match self {
            Returned::Many(mut f) if f.len() == 2 => {
                let b = f.pop().unwrap_or_else(|| unreachable!());
                let a = f.pop().unwrap_or_else(|| unreachable!());
                (a, b)
            }
            Returned::Many(f) => panic!("operation returned {} futures, expected two", f.len()),
            Returned::One(_) => panic!("operation returned one future, expected two"),
            Returned::None => panic!("operation returned no future"),
        }
    }

    pub fn future_count(&self) -> usize {
        match self {
            Returned::None => 0,
            Returned::One(_) => 1,
            Returned::Many(f) => f.len(),
        }
    }
}

/// Per-operation completion state.
pub struct CompletionState<T: Clone + Default> {
    slots: Vec<Slot<T>>,
    remote: Vec<Command>,
    origin: LocalQueue,
    folded: bool,
}

// Fired values cross into boxed queue nodes, some bound for other
// threads, so the payload must be owned and sendable.
impl<T: Clone + Default + Send + 'static> CompletionState<T> {
    /// Instantiate the list. User promises gain their dependency and LPC
    /// targets their undischarged count here; both are balanced by the
    /// eventual fire or cancel. `origin` receives deferred future
    /// resolutions and belongs to the invoking persona.
    pub fn new(cxs: Completions<T>, origin: LocalQueue) -> Self {
        let mut slots = Vec::with_capacity(cxs.len());
        let mut remote = Vec::new();
        for action in cxs.into_actions() {
            match action {
                Action::Future { event, deferred } => slots.push(Slot {
                    event,
                    state: SlotState::Pending,
                    kind: SlotKind::Future {
                        deferred,
                        backing: None,
                    },
                }),
                Action::Promise { event, promise } => {
                    promise.require(1);
                    slots.push(Slot {
                        event,
                        state: SlotState::Pending,
                        kind: SlotKind::UserPromise { promise },
                    });
                }
                Action::Lpc {
                    event,
                    target,
                    func,
                } => {
                    target.register_work();
                    slots.push(Slot {
                        event,
                        state: SlotState::Pending,
                        kind: SlotKind::Lpc {
                            target,
                            func: Some(func),
                        },
                    });
                }
                Action::Rpc { command } => remote.push(command),
                Action::SyncBuffered | Action::SyncBlocking => slots.push(Slot {
                    event: Event::Source,
                    state: SlotState::Done,
                    kind: SlotKind::Sync,
                }),
            }
        }
        Self {
            slots,
            remote,
            origin,
            folded: false,
        }
    }

    /// Pull out the commands destined for remote execution. The transport
    /// ships them; they never fire here.
    pub fn take_remote(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.remote)
    }

    /// Mark `event` as satisfied before anyone could observe it.
    ///
    /// Future slots then fold into ready futures without a backing
    /// promise; user promises and LPCs discharge immediately.
    pub fn set_done(&mut self, event: Event) {
        for slot in &mut self.slots {
            if slot.event != event || slot.is_sync() {
                continue;
            }
            if slot.state != SlotState::Pending {
                protocol_fatal("event marked done on a slot that already completed");
            }
            match &mut slot.kind {
                SlotKind::Future { .. } => {}
                SlotKind::UserPromise { promise } => promise.fulfill_anonymous(1),
                SlotKind::Lpc { target, func } => {
                    if let Some(func) = func.take() {
                        target.enqueue(Box::new(move || func(T::default())));
                    }
                    target.discharge();
                }
                SlotKind::Sync => unreachable!(),
            }
            slot.state = SlotState::Done;
        }
    }

    /// Fold the future slots, in list order, into the caller's return
    /// value. Must run before any [`fire`](Self::fire): a future that can
    /// fire before it was requested is a return-value accounting bug.
    pub fn take_returned(&mut self) -> Returned<T> {
        assert!(!self.folded, "completion state folded twice");
        self.folded = true;
        let mut futures = Vec::new();
        for slot in &mut self.slots {
            if let SlotKind::Future { backing, .. } = &mut slot.kind {
                match slot.state {
                    SlotState::Done => futures.push(OpFuture::ready(T::default())),
                    SlotState::Cancelled => futures.push(OpFuture::cancelled()),
                    SlotState::Pending => {
                        let promise = Promise::new();
                        futures.push(promise.internal_future());
                        *backing = Some(promise);
                    }
                    SlotState::Fired => unreachable!("future slot fired before the fold"),
                }
            }
        }
        match futures.len() {
            0 => Returned::None,
            1 => match futures.pop() {
                Some(f) => Returned::One(f),
                None => unreachable!(),
            },
            _ => Returned::Many(futures),
        }
    }

    /// Fire every slot answering `event` with `value`, exactly once each.
    ///
    /// Firing a slot twice, after cancellation, or before its future was
    /// folded out is fatal.
    pub fn fire(&mut self, event: Event, value: T) {
        for slot in &mut self.slots {
            if slot.event != event || slot.is_sync() {
                continue;
            }
            match slot.state {
                SlotState::Pending => {}
                SlotState::Fired | SlotState::Done => {
                    protocol_fatal("completion event fired twice");
                }
                SlotState::Cancelled => {
                    protocol_fatal("completion event fired after cancellation");
                }
            }
            match &mut slot.kind {
                SlotKind::Future { deferred, backing } => match backing.take() {
                    Some(promise) => {
                        if *deferred {
                            let value = value.clone();
                            self.origin
                                .push(Box::new(move || promise.fulfill(value)));
                        } else {
                            promise.fulfill(value.clone());
                        }
                    }
                    None => protocol_fatal("future fired before it was requested"),
                },
                SlotKind::UserPromise { promise } => promise.fulfill(value.clone()),
                SlotKind::Lpc { target, func } => {
                    match func.take() {
                        Some(func) => {
                            let value = value.clone();
                            target.enqueue(Box::new(move || func(value)));
                        }
                        None => protocol_fatal("callback fired twice"),
                    }
                    target.discharge();
                }
                SlotKind::Sync => unreachable!(),
            }
            slot.state = SlotState::Fired;
        }
    }

    /// Cancel every un-fired slot, balancing the increments made at
    /// construction. Valid only while nothing has fired.
    pub fn cancel(&mut self) {
        for slot in &mut self.slots {
            if slot.is_sync() {
                continue;
            }
            match slot.state {
                SlotState::Pending => {}
                SlotState::Done | SlotState::Fired => {
                    protocol_fatal("operation cancelled after a completion fired");
                }
                SlotState::Cancelled => protocol_fatal("operation cancelled twice"),
            }
            match &mut slot.kind {
                SlotKind::Future { backing, .. } => {
                    if let Some(promise) = backing.take() {
                        promise.cancel();
                    }
                }
                SlotKind::UserPromise { promise } => promise.fulfill_anonymous(1),
                SlotKind::Lpc { target, func } => {
                    func.take();
                    target.discharge();
                }
                SlotKind::Sync => unreachable!(),
            }
            slot.state = SlotState::Cancelled;
        }
    }

    /// Whether any slot still awaits a fire.
    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|s| s.state == SlotState::Pending)
    }

    /// Whether any slot answering `event` still awaits a fire.
    #[cfg(test)]
    pub fn pending_for(&self, event: Event) -> bool {
        self.slots
            .iter()
            .any(|s| s.event == event && s.state == SlotState::Pending)
    }
}

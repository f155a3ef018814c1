//! Completion events, actions, and the composable descriptor list.
//!
//! Every asynchronous operation accepts a [`Completions`] list describing
//! who gets notified as each phase of the operation finishes. Lists build
//! by `|` concatenation:
//!
//! ```ignore
//! let cxs = Completions::source_future() | Completions::operation_promise(&p);
//! ```
//!
//! The list itself is inert; an operation turns it into live completion
//! state at invocation time.

use std::ops::BitOr;

use crate::command::Command;
use crate::future::Promise;
use crate::lpc::PersonaRef;

/// Phases of an asynchronous operation.
///
/// The phases are ordered: firing `Operation` means `Remote` and `Source`
/// have already fired, and firing `Remote` means `Source` has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Event {
    /// Source buffers are safe to reuse.
    Source = 0,
    /// The message was delivered and injected at the target.
    Remote = 1,
    /// The whole operation, including remote execution, is done.
    Operation = 2,
}

impl Event {
    #[inline]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Event::Source),
            1 => Some(Event::Remote),
            2 => Some(Event::Operation),
            _ => None,
        }
    }

    /// Whether completing `self` guarantees `other` has completed.
    #[inline]
    pub fn implies(self, other: Event) -> bool {
        self as u32 >= other as u32
    }
}

/// Discriminant of an [`Action`], payload-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Future,
    Promise,
    Lpc,
    Rpc,
    SyncBuffered,
    SyncBlocking,
}

/// One requested completion action.
///
/// `T` is the value type the operation produces; events with no natural
/// value fire with `T::default()`.
pub enum Action<T: Clone + Default> {
    /// Produce a future resolving when the event fires. Deferred futures
    /// resolve during user-level progress instead of at the firing site.
    Future { event: Event, deferred: bool },
    /// Add a dependency to an existing promise, discharged by the event.
    Promise { event: Event, promise: Promise<T> },
    /// Run a callback on a target persona when the event fires.
    Lpc {
        event: Event,
        target: PersonaRef,
        func: Box<dyn FnOnce(T) + Send>,
    },
    /// Ship a command to run on the destination. Only the `Remote` event
    /// carries these; they never fire locally.
    Rpc { command: Command },
    /// The source buffer was copied out before the operation returned.
    /// Stateless: the effect already happened.
    SyncBuffered,
    /// The operation spins progress until the source event before
    /// returning. Stateless for the same reason.
    SyncBlocking,
}

impl<T: Clone + Default> Action<T> {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Future { .. } => ActionKind::Future,
            Action::Promise { .. } => ActionKind::Promise,
            Action::Lpc { .. } => ActionKind::Lpc,
            Action::Rpc { .. } => ActionKind::Rpc,
            Action::SyncBuffered => ActionKind::SyncBuffered,
            Action::SyncBlocking => ActionKind::SyncBlocking,
        }
    }

    /// The event this action answers.
    pub fn event(&self) -> Event {
        match self {
            Action::Future { event, .. }
            | Action::Promise { event, .. }
            | Action::Lpc { event, .. } => *event,
            Action::Rpc { .. } => Event::Remote,
            Action::SyncBuffered | Action::SyncBlocking => Event::Source,
        }
    }
}

/// An ordered list of completion actions.
///
/// `|` concatenates, preserving the relative order of both operands;
/// [`Completions::empty`] is the identity. Lists are consumed by the
/// operation they are passed to.
pub struct Completions<T: Clone + Default = Vec<u8>> {
    actions: Vec<Action<T>>,
}

impl<T: Clone + Default> Completions<T> {
    /// The empty list: no notifications, operations return no futures.
    pub fn empty() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    fn single(action: Action<T>) -> Self {
        Self {
            actions: vec![action],
        }
    }

    /// A future for `event`, resolved where the event fires.
    ///
    /// `event` must not be [`Event::Remote`]; remote completion can only
    /// run commands at the destination.
    pub fn future_at(event: Event) -> Self {
        assert!(
            event != Event::Remote,
            "remote completion cannot produce a local future"
        );
        Self::single(Action::Future {
            event,
            deferred: false,
        })
    }

    /// A future for `event`, resolved during user-level progress.
    pub fn deferred_future_at(event: Event) -> Self {
        assert!(
            event != Event::Remote,
            "remote completion cannot produce a local future"
        );
        Self::single(Action::Future {
            event,
            deferred: true,
        })
    }

    pub fn source_future() -> Self {
        Self::future_at(Event::Source)
    }

    pub fn operation_future() -> Self {
        Self::future_at(Event::Operation)
    }

    /// Register `promise` against `event`. The promise gains a dependency
    /// when the operation is invoked and loses it when the event fires.
    pub fn promise_at(event: Event, promise: &Promise<T>) -> Self {
        assert!(
            event != Event::Remote,
            "remote completion cannot fulfill a local promise"
        );
        Self::single(Action::Promise {
            event,
            promise: promise.clone(),
        })
    }

    pub fn operation_promise(promise: &Promise<T>) -> Self {
        Self::promise_at(Event::Operation, promise)
    }

    /// Run `func` on `target` when `event` fires.
    pub fn lpc_at<F>(event: Event, target: &PersonaRef, func: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        assert!(
            event != Event::Remote,
            "remote completion cannot enqueue a local callback"
        );
        Self::single(Action::Lpc {
            event,
            target: target.clone(),
            func: Box::new(func),
        })
    }

    pub fn source_lpc<F>(target: &PersonaRef, func: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self::lpc_at(Event::Source, target, func)
    }

    pub fn operation_lpc<F>(target: &PersonaRef, func: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self::lpc_at(Event::Operation, target, func)
    }

    /// Run `command` on the destination when the message is injected.
    pub fn remote_rpc(command: Command) -> Self {
        Self::single(Action::Rpc { command })
    }

    /// Source completion by buffering: the operation copies the payload
    /// before returning.
    pub fn source_buffered() -> Self {
        Self::single(Action::SyncBuffered)
    }

    /// Source completion by blocking: the operation returns only after
    /// the source event has fired.
    pub fn source_blocking() -> Self {
        Self::single(Action::SyncBlocking)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// `(event, kind)` of each action in list order.
    pub fn shape(&self) -> Vec<(Event, ActionKind)> {
        self.actions.iter().map(|a| (a.event(), a.kind())).collect()
    }

    /// Whether any action answers `event`.
    pub fn wants(&self, event: Event) -> bool {
        self.actions.iter().any(|a| a.event() == event)
    }

    /// Whether the list contains an action of `kind`.
    pub fn has_kind(&self, kind: ActionKind) -> bool {
        self.actions.iter().any(|a| a.kind() == kind)
    }

    /// Whether the initiator must hear back when `event` fires remotely.
    ///
    /// True for actions that observe the event here (futures, promises,
    /// callbacks, and the blocking-source spin); false for shipped
    /// commands and the buffered marker, whose effects need no reply.
    pub fn needs_ack(&self, event: Event) -> bool {
        self.actions.iter().any(|a| {
            a.event() == event
                && matches!(
                    a.kind(),
                    ActionKind::Future
                        | ActionKind::Promise
                        | ActionKind::Lpc
                        | ActionKind::SyncBlocking
                )
        })
    }

    pub(crate) fn into_actions(self) -> Vec<Action<T>> {
        self.actions
    }
}

impl<T: Clone + Default> BitOr for Completions<T> {
    type Output = Self;

    fn bitor(mut self, mut rhs: Self) -> Self {
        self.actions.append(&mut rhs.actions);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f() -> Completions<u32> {
        Completions::source_future()
    }

    fn b() -> Completions<u32> {
        Completions::source_buffered()
    }

    fn o() -> Completions<u32> {
        Completions::operation_future()
    }

    #[test]
    fn event_implication_order() {
        use Event::*;
        assert!(Operation.implies(Remote));
        assert!(Operation.implies(Source));
        assert!(Remote.implies(Source));
        assert!(!Source.implies(Remote));
        assert!(!Remote.implies(Operation));
        assert!(Source.implies(Source));
    }

    #[test]
    fn event_wire_roundtrip() {
        for e in [Event::Source, Event::Remote, Event::Operation] {
            assert_eq!(Event::from_u32(e as u32), Some(e));
        }
        assert_eq!(Event::from_u32(3), None);
    }

    #[test]
    fn concat_is_associative() {
        let left = (f() | b()) | o();
        let right = f() | (b() | o());
        assert_eq!(left.shape(), right.shape());
    }

    #[test]
    fn empty_is_identity() {
        let a = f() | o();
        let shape = a.shape();
        assert_eq!((Completions::empty() | (f() | o())).shape(), shape);
        assert_eq!(((f() | o()) | Completions::empty()).shape(), shape);
    }

    #[test]
    fn concat_preserves_operand_order() {
        let list = o() | f() | b();
        assert_eq!(
            list.shape(),
            vec![
                (Event::Operation, ActionKind::Future),
                (Event::Source, ActionKind::Future),
                (Event::Source, ActionKind::SyncBuffered),
            ]
        );
    }

    #[test]
    fn rpc_answers_remote_without_needing_an_ack() {
        let list: Completions = Completions::remote_rpc(crate::command::Command::new(1, vec![]));
        assert!(list.wants(Event::Remote));
        assert!(!list.needs_ack(Event::Remote));
    }

    #[test]
    fn blocking_source_needs_an_ack_but_buffered_does_not() {
        let blocking = Completions::<u32>::source_blocking();
        assert!(blocking.needs_ack(Event::Source));
        let buffered = Completions::<u32>::source_buffered();
        assert!(!buffered.needs_ack(Event::Source));
        assert!(buffered.has_kind(ActionKind::SyncBuffered));
    }

    #[test]
    #[should_panic]
    fn remote_future_rejected() {
        let _ = Completions::<u32>::future_at(Event::Remote);
    }
}

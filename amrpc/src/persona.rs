//! Personas: per-thread execution contexts that drive progress.
//!
//! A [`Persona`] owns the state no other thread may touch: the pending
//! completion table, the handle completion queue, and the local queue
//! deferred futures resolve on. Other threads reach it only through its
//! two inboxes, a user-level one for LPCs and command blocks and an
//! internal one for protocol notifications. Everything the persona does
//! happens inside [`progress`], at one of two levels: `Internal` runs the
//! transport and completion plumbing, `User` additionally executes
//! command blocks and queued callbacks.
//!
//! [`progress`]: Persona::progress

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::command::{self, Command, CommandCtx, ExecId};
use crate::completion::{ActionKind, Completions, Event};
use crate::error::{protocol_fatal, Result};
use crate::fabric::Rank;
use crate::handle_queue::HandleQueue;
use crate::lpc::{LocalQueue, PersonaRef, SendLpcNode};
use crate::protocol::{self, event_bit, NO_REPLY};
use crate::runtime::{lock, PendingReply, Shared};
use crate::state::{CompletionState, Returned};
use crate::wire::{cmd_flags, WirePersona, MASTER_SLOT};

/// How much work a progress call is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Transport and completion plumbing only. Safe to call from inside
    /// a blocking operation; never executes user code.
    Internal,
    /// Everything, including command blocks and user LPCs.
    User,
}

/// Work delivered to a persona's user-level inbox.
pub(crate) enum UserMsg {
    /// A callback to run during user progress.
    Lpc(SendLpcNode),
    /// A received command block to execute.
    Block {
        source: Rank,
        data: Vec<u8>,
        reply: u64,
        flags: u32,
    },
}

impl fmt::Debug for UserMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserMsg::Lpc(_) => f.write_str("Lpc"),
            UserMsg::Block { source, data, .. } => f
                .debug_struct("Block")
                .field("source", source)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Internal notifications delivered to a persona.
pub(crate) enum ProtocolMsg {
    /// Fire `event` on in-flight operation `slot`.
    Fire {
        slot: u32,
        event: Event,
        value: Vec<u8>,
    },
    /// Ship a command block once its prerequisite completed, used for
    /// remote actions attached to one-sided operations.
    SendBlock { dest: Rank, cmds: Vec<Command> },
}

/// A persona's reachable surface, stored in the rank-wide registry.
pub(crate) struct PersonaEntry {
    user_tx: Sender<UserMsg>,
    internal_tx: Sender<ProtocolMsg>,
    undischarged: Arc<AtomicU64>,
}

/// Rank-wide table of live personas.
///
/// Keys are even, so a key and a well-known slot number pack into one
/// wire word with the low bit as the discriminator. Slot bindings map
/// well-known numbers to keys; slot 0 is the master persona.
pub(crate) struct PersonaRegistry {
    entries: Mutex<HashMap<u64, PersonaEntry>>,
    slots: Mutex<HashMap<u32, u64>>,
    next_key: AtomicU64,
}

impl PersonaRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            // Starting above zero keeps key 0 off the wire entirely.
            next_key: AtomicU64::new(2),
        }
    }

    fn register(
        &self,
        user_tx: Sender<UserMsg>,
        internal_tx: Sender<ProtocolMsg>,
        undischarged: Arc<AtomicU64>,
    ) -> u64 {
        let key = self.next_key.fetch_add(2, Ordering::Relaxed);
        lock(&self.entries).insert(
            key,
            PersonaEntry {
                user_tx,
                internal_tx,
                undischarged,
            },
        );
        key
    }

    fn unregister(&self, key: u64) {
        lock(&self.entries).remove(&key);
        lock(&self.slots).retain(|_, bound| *bound != key);
    }

    fn bind_slot(&self, slot: u32, key: u64) -> bool {
        use std::collections::hash_map::Entry;
        match lock(&self.slots).entry(slot) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(key);
                true
            }
        }
    }

    fn resolve_key(&self, target: WirePersona) -> Option<u64> {
        match target {
            WirePersona::Direct(key) => Some(key),
            WirePersona::Slot(slot) => lock(&self.slots).get(&slot).copied(),
        }
    }

    /// Deliver `msg` to the persona `target` names. False if it does not
    /// exist or is shutting down.
    pub(crate) fn route_user(&self, target: WirePersona, msg: UserMsg) -> bool {
        let Some(key) = self.resolve_key(target) else {
            return false;
        };
        match lock(&self.entries).get(&key) {
            Some(entry) => entry.user_tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Deliver an internal notification, logging if the persona is gone.
    pub(crate) fn send_internal(&self, key: u64, msg: ProtocolMsg) {
        let delivered = match lock(&self.entries).get(&key) {
            Some(entry) => entry.internal_tx.send(msg).is_ok(),
            None => false,
        };
        if !delivered {
            log::warn!(
                "completion notification dropped: persona {:#x} no longer exists",
                key
            );
        }
    }

    /// A sendable reference to a live persona.
    pub(crate) fn user_ref(&self, key: u64) -> Option<PersonaRef> {
        lock(&self.entries)
            .get(&key)
            .map(|e| PersonaRef::new(key, e.user_tx.clone(), Arc::clone(&e.undischarged)))
    }
}

/// An operation whose completion list still awaits remote events.
struct PendingOp {
    state: CompletionState<Vec<u8>>,
    /// Remote events not yet fired.
    awaiting: u8,
    /// Bitmask of events that have fired, read by blocking-source spins.
    fired: u8,
}

/// A per-thread execution context and progress driver.
///
/// Not `Send`: a persona lives and dies on the thread that created it.
/// Hand out [`PersonaRef`]s (see [`Persona::self_ref`]) for other threads
/// to target it.
pub struct Persona {
    key: u64,
    shared: Arc<Shared>,
    local: LocalQueue,
    user_rx: Receiver<UserMsg>,
    internal_rx: Receiver<ProtocolMsg>,
    internal_tx: Sender<ProtocolMsg>,
    pending: Slab<PendingOp>,
    handles: HandleQueue,
    self_ref: PersonaRef,
}

impl Persona {
    pub(crate) fn new(shared: Arc<Shared>, well_known: Option<u32>) -> Self {
        let (user_tx, user_rx) = mpsc::channel();
        let (internal_tx, internal_rx) = mpsc::channel();
        let undischarged = Arc::new(AtomicU64::new(0));
        let key = shared.personas.register(
            user_tx.clone(),
            internal_tx.clone(),
            Arc::clone(&undischarged),
        );
        if let Some(slot) = well_known {
            assert!(
                shared.personas.bind_slot(slot, key),
                "well-known persona slot {} is already bound",
                slot
            );
        }
        let handles = HandleQueue::new(shared.config.miss_limit_base, shared.config.miss_limit_max);
        let self_ref = PersonaRef::new(key, user_tx, undischarged);
        Self {
            key,
            shared,
            local: LocalQueue::new(),
            user_rx,
            internal_rx,
            internal_tx,
            pending: Slab::new(),
            handles,
            self_ref,
        }
    }

    /// This persona's wire key.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The rank this persona runs on.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.shared.fabric.num_ranks()
    }

    /// A sendable reference other threads and completion lists can target.
    pub fn self_ref(&self) -> PersonaRef {
        self.self_ref.clone()
    }

    /// In-flight operations whose completions have not all fired.
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Make progress. Returns the number of work items processed; zero
    /// means the call found nothing to do.
    pub fn progress(&mut self, level: Level) -> usize {
        self.progress_inner(level, false)
    }

    /// Progress inside a wait loop: completion-queue scans widen their
    /// miss limit instead of resetting it.
    pub(crate) fn progress_spin(&mut self, level: Level) -> usize {
        self.progress_inner(level, true)
    }

    fn progress_inner(&mut self, level: Level, spinning: bool) -> usize {
        let budget = self.shared.config.progress_budget;
        let mut did = 0;

        let frames = self.shared.fabric.poll(budget);
        if !frames.is_empty() {
            let mut arrived = Vec::new();
            for (source, frame) in frames {
                protocol::dispatch(&self.shared, source, &frame, &mut arrived);
                did += 1;
            }
            for handle in arrived {
                self.handles.push(handle);
            }
        }

        did += self.handles.burst(spinning);

        for _ in 0..budget {
            match self.internal_rx.try_recv() {
                Ok(msg) => {
                    self.handle_protocol_msg(msg);
                    did += 1;
                }
                Err(_) => break,
            }
        }

        if level == Level::User {
            for _ in 0..budget {
                match self.user_rx.try_recv() {
                    Ok(UserMsg::Lpc(node)) => {
                        node();
                        did += 1;
                    }
                    Ok(UserMsg::Block {
                        source,
                        data,
                        reply,
                        flags,
                    }) => {
                        self.exec_block(source, &data, reply, flags);
                        did += 1;
                    }
                    Err(_) => break,
                }
            }
            did += self.local.run(budget);
        }

        did
    }

    fn handle_protocol_msg(&mut self, msg: ProtocolMsg) {
        match msg {
            ProtocolMsg::Fire { slot, event, value } => {
                let idx = slot as usize;
                let Some(entry) = self.pending.get_mut(idx) else {
                    protocol_fatal(&format!(
                        "completion fired for unknown operation slot {}",
                        slot
                    ));
                };
                debug_assert_eq!(entry.fired & event_bit(event), 0);
                entry.state.fire(event, value);
                entry.fired |= event_bit(event);
                debug_assert!(entry.awaiting > 0);
                entry.awaiting -= 1;
                if entry.awaiting == 0 {
                    self.pending.remove(idx);
                }
            }
            ProtocolMsg::SendBlock { dest, cmds } => {
                let mut sent = Vec::new();
                match protocol::send_commands(
                    &self.shared,
                    dest,
                    &cmds,
                    WirePersona::Slot(MASTER_SLOT),
                    NO_REPLY,
                    0,
                    &mut sent,
                ) {
                    Ok(_) => {
                        for handle in sent {
                            self.handles.push(handle);
                        }
                    }
                    Err(e) => log::error!("follow-up commands to rank {} failed: {}", dest, e),
                }
            }
        }
    }

    /// Execute a received command block and acknowledge it if asked.
    fn exec_block(&mut self, source: Rank, data: &[u8], reply: u64, flags: u32) {
        let ctx = CommandCtx {
            initiator: source,
            target: self.shared.rank,
        };
        let results = self.shared.registry.run_block(&ctx, data);
        self.shared
            .stats
            .blocks_executed
            .fetch_add(1, Ordering::Relaxed);
        if flags & cmd_flags::WANTS_OP_ACK != 0 {
            let mut sent = Vec::new();
            protocol::push_reply(&self.shared, source, reply, Event::Operation, results, &mut sent);
            for handle in sent {
                self.handles.push(handle);
            }
        }
    }

    /// Run `dest`'s master-persona command, with completion notifications
    /// from `cxs`. Operation-event actions resolve with the concatenated
    /// bytes the remote handlers returned; those results ride the
    /// acknowledgement frame and must fit the fabric's payload ceiling.
    pub fn rpc(
        &mut self,
        dest: Rank,
        cmd: Command,
        cxs: Completions<Vec<u8>>,
    ) -> Result<Returned<Vec<u8>>> {
        self.rpc_on(dest, WirePersona::Slot(MASTER_SLOT), cmd, cxs)
    }

    /// Like [`rpc`](Self::rpc), addressed to a specific persona on `dest`.
    pub fn rpc_on(
        &mut self,
        dest: Rank,
        target: WirePersona,
        cmd: Command,
        cxs: Completions<Vec<u8>>,
    ) -> Result<Returned<Vec<u8>>> {
        let blocking = cxs.has_kind(ActionKind::SyncBlocking);
        let wants_op = cxs.needs_ack(Event::Operation);
        let wants_src = cxs.needs_ack(Event::Source);
        let mut state = CompletionState::new(cxs, self.local.clone());

        let mut cmds = vec![cmd];
        cmds.extend(state.take_remote());
        let eager = protocol::is_eager(&self.shared, dest, command::block_len(&cmds));

        // Which events will be announced by the far side. Under the eager
        // path the source event completes locally instead.
        let mut awaited = 0u8;
        let mut flags = 0u32;
        if wants_op {
            awaited |= event_bit(Event::Operation);
            flags |= cmd_flags::WANTS_OP_ACK;
        }
        if !eager && wants_src {
            awaited |= event_bit(Event::Source);
            flags |= cmd_flags::WANTS_SOURCE_REPLY;
        }

        let slot = self.pending.insert(PendingOp {
            state,
            awaiting: awaited.count_ones() as u8,
            fired: 0,
        }) as u32;
        let reply = if awaited != 0 {
            lock(&self.shared.replies).insert(PendingReply {
                persona: self.key,
                slot,
                events: awaited,
            }) as u64
        } else {
            NO_REPLY
        };

        let mut sent = Vec::new();
        if let Err(e) = protocol::send_commands(&self.shared, dest, &cmds, target, reply, flags, &mut sent)
        {
            if reply != NO_REPLY {
                let _ = lock(&self.shared.replies).try_remove(reply as usize);
            }
            let mut op = self.pending.remove(slot as usize);
            op.state.cancel();
            return Err(e);
        }
        for handle in sent {
            self.handles.push(handle);
        }

        let entry = match self.pending.get_mut(slot as usize) {
            Some(entry) => entry,
            None => unreachable!(),
        };
        if eager {
            entry.state.set_done(Event::Source);
        }
        let returned = entry.state.take_returned();
        if entry.awaiting == 0 {
            self.pending.remove(slot as usize);
        } else if blocking && !eager {
            self.spin_until_source(slot);
        }
        Ok(returned)
    }

    /// Fire-and-forget: run `exec` inline on `dest`'s receive path. The
    /// arguments must fit one frame; there is no completion and no result.
    pub fn send_restricted(&mut self, dest: Rank, exec: ExecId, args: &[u8]) -> Result<()> {
        let mut sent = Vec::new();
        protocol::send_restricted(&self.shared, dest, exec, args, &mut sent)?;
        for handle in sent {
            self.handles.push(handle);
        }
        Ok(())
    }

    /// One-sided write of `bytes` into `dest`'s segment at `dst_offset`.
    ///
    /// The source event completes at posting, the bytes having moved into
    /// the fabric. The operation event fires when the write is visible at
    /// the destination; remote actions ship after that.
    pub fn rput(
        &mut self,
        dest: Rank,
        dst_offset: usize,
        bytes: Vec<u8>,
        cxs: Completions<Vec<u8>>,
    ) -> Result<Returned<Vec<u8>>> {
        let wants_op = cxs.needs_ack(Event::Operation);
        let mut state = CompletionState::new(cxs, self.local.clone());
        let remote = state.take_remote();

        let slot = self.pending.insert(PendingOp {
            state,
            awaiting: u8::from(wants_op),
            fired: 0,
        }) as u32;
        let fire_slot = wants_op.then_some(slot);
        let internal = self.internal_tx.clone();
        let on_done = Box::new(move || {
            if !remote.is_empty() {
                // The receiver lives in the persona draining this handle.
                let _ = internal.send(ProtocolMsg::SendBlock { dest, cmds: remote });
            }
            if let Some(slot) = fire_slot {
                let _ = internal.send(ProtocolMsg::Fire {
                    slot,
                    event: Event::Operation,
                    value: Vec::new(),
                });
            }
        });

        match self.shared.fabric.rma_put(dest, dst_offset, bytes, on_done) {
            Ok(handle) => self.handles.push(handle),
            Err(e) => {
                let mut op = self.pending.remove(slot as usize);
                op.state.cancel();
                return Err(e);
            }
        }

        let entry = match self.pending.get_mut(slot as usize) {
            Some(entry) => entry,
            None => unreachable!(),
        };
        entry.state.set_done(Event::Source);
        let returned = entry.state.take_returned();
        if entry.awaiting == 0 {
            self.pending.remove(slot as usize);
        }
        Ok(returned)
    }

    /// One-sided read of `len` bytes from `src`'s segment at `src_offset`.
    ///
    /// Operation-event actions resolve with the fetched bytes.
    pub fn rget(
        &mut self,
        src: Rank,
        src_offset: usize,
        len: usize,
        cxs: Completions<Vec<u8>>,
    ) -> Result<Returned<Vec<u8>>> {
        let wants_op = cxs.needs_ack(Event::Operation);
        let mut state = CompletionState::new(cxs, self.local.clone());
        let remote = state.take_remote();

        let slot = self.pending.insert(PendingOp {
            state,
            awaiting: u8::from(wants_op),
            fired: 0,
        }) as u32;
        let fire_slot = wants_op.then_some(slot);
        let internal = self.internal_tx.clone();
        let on_done = Box::new(move |bytes: Vec<u8>| {
            if !remote.is_empty() {
                let _ = internal.send(ProtocolMsg::SendBlock {
                    dest: src,
                    cmds: remote,
                });
            }
            if let Some(slot) = fire_slot {
                let _ = internal.send(ProtocolMsg::Fire {
                    slot,
                    event: Event::Operation,
                    value: bytes,
                });
            }
        });

        match self.shared.fabric.rma_get(src, src_offset, len, on_done) {
            Ok(handle) => self.handles.push(handle),
            Err(e) => {
                let mut op = self.pending.remove(slot as usize);
                op.state.cancel();
                return Err(e);
            }
        }

        let entry = match self.pending.get_mut(slot as usize) {
            Some(entry) => entry,
            None => unreachable!(),
        };
        entry.state.set_done(Event::Source);
        let returned = entry.state.take_returned();
        if entry.awaiting == 0 {
            self.pending.remove(slot as usize);
        }
        Ok(returned)
    }

    /// Spin internal progress until the source event of `slot` fires.
    fn spin_until_source(&mut self, slot: u32) {
        loop {
            match self.pending.get(slot as usize) {
                // Fully completed and retired.
                None => return,
                Some(entry) if entry.fired & event_bit(Event::Source) != 0 => return,
                Some(_) => {}
            }
            self.progress_spin(Level::Internal);
        }
    }
}

impl Drop for Persona {
    fn drop(&mut self) {
        let leftover = self.self_ref.undischarged();
        if leftover != 0 {
            log::warn!(
                "persona {:#x} dropped with {} undischarged callbacks",
                self.key,
                leftover
            );
        }
        self.shared.personas.unregister(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_one() -> (PersonaRegistry, u64, Receiver<UserMsg>, Receiver<ProtocolMsg>) {
        let reg = PersonaRegistry::new();
        let (user_tx, user_rx) = mpsc::channel();
        let (internal_tx, internal_rx) = mpsc::channel();
        let key = reg.register(user_tx, internal_tx, Arc::new(AtomicU64::new(0)));
        (reg, key, user_rx, internal_rx)
    }

    #[test]
    fn keys_are_even_and_distinct() {
        let (reg, key, _u, _i) = registry_with_one();
        assert_eq!(key % 2, 0);
        let (user_tx, _user_rx) = mpsc::channel();
        let (internal_tx, _internal_rx) = mpsc::channel();
        let second = reg.register(user_tx, internal_tx, Arc::new(AtomicU64::new(0)));
        assert_eq!(second % 2, 0);
        assert_ne!(key, second);
    }

    #[test]
    fn direct_and_slot_routing() {
        let (reg, key, user_rx, _i) = registry_with_one();
        assert!(reg.bind_slot(MASTER_SLOT, key));
        assert!(reg.route_user(WirePersona::Direct(key), UserMsg::Lpc(Box::new(|| {}))));
        assert!(reg.route_user(WirePersona::Slot(MASTER_SLOT), UserMsg::Lpc(Box::new(|| {}))));
        assert_eq!(user_rx.try_iter().count(), 2);
    }

    #[test]
    fn slot_binding_is_exclusive() {
        let (reg, key, _u, _i) = registry_with_one();
        assert!(reg.bind_slot(0, key));
        assert!(!reg.bind_slot(0, key + 2));
    }

    #[test]
    fn unregister_clears_slots_and_routes() {
        let (reg, key, _u, _i) = registry_with_one();
        assert!(reg.bind_slot(0, key));
        reg.unregister(key);
        assert!(!reg.route_user(WirePersona::Direct(key), UserMsg::Lpc(Box::new(|| {}))));
        assert!(!reg.route_user(WirePersona::Slot(0), UserMsg::Lpc(Box::new(|| {}))));
        // The slot is free for a successor.
        let (user_tx, _user_rx) = mpsc::channel();
        let (internal_tx, _internal_rx) = mpsc::channel();
        let next = reg.register(user_tx, internal_tx, Arc::new(AtomicU64::new(0)));
        assert!(reg.bind_slot(0, next));
    }

    #[test]
    fn fire_messages_reach_the_internal_inbox() {
        let (reg, key, _u, internal_rx) = registry_with_one();
        reg.send_internal(
            key,
            ProtocolMsg::Fire {
                slot: 3,
                event: Event::Operation,
                value: vec![1],
            },
        );
        match internal_rx.try_recv() {
            Ok(ProtocolMsg::Fire { slot, event, value }) => {
                assert_eq!(slot, 3);
                assert_eq!(event, Event::Operation);
                assert_eq!(value, vec![1]);
            }
            _ => panic!("expected a fire message"),
        }
    }

    #[test]
    fn user_ref_round_trips_key() {
        let (reg, key, _u, _i) = registry_with_one();
        let r = reg.user_ref(key).unwrap();
        assert_eq!(r.key(), key);
        assert!(reg.user_ref(key + 2).is_none());
    }
}

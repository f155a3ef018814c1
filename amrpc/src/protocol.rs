//! Send-path selection and receive-path dispatch.
//!
//! Sending chooses among three encodings by serialized size: eager (one
//! frame, command block inline), packed rendezvous (one frame above the
//! cutover but within the payload ceiling), or fragmented rendezvous
//! (command part plus payload parts through the reassembly table).
//! Receiving walks the fixed handler table and either executes inline
//! (restricted commands, replies, reassembly bookkeeping) or routes a
//! command block to the addressed persona's inbox.

use std::sync::atomic::Ordering;

use crate::command::{self, Command, CommandCtx, ExecId};
use crate::completion::Event;
use crate::error::{protocol_fatal, Error, Result};
use crate::fabric::Rank;
use crate::handle_queue::NetHandle;
use crate::persona::{ProtocolMsg, UserMsg};
use crate::reassembly::BlockMeta;
use crate::runtime::{lock, Shared};
use crate::wire::{
    cmd_flags, decode_frame, encode_frame, EagerMasterArgs, EagerPersonaArgs, EagerRestrictedArgs,
    HandlerId, RdzvCommandPartArgs, RdzvPackedArgs, RdzvPayloadPartArgs, ReplyCallbackArgs,
    WirePersona, MASTER_SLOT,
};

/// Wire value of "no reply requested".
pub(crate) const NO_REPLY: u64 = u64::MAX;

/// Bit of `event` in a pending-reply mask.
#[inline]
pub(crate) fn event_bit(event: Event) -> u8 {
    1 << (event as u32)
}

/// Which encoding a send took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendMode {
    Eager,
    RdzvPacked,
    RdzvParts(u32),
}

fn noop() -> Box<dyn FnOnce()> {
    Box::new(|| {})
}

/// The eager condition: fits under the cutover negotiated for `dest`.
/// Cutovers were clamped against the fabric at startup, so eager frames
/// always fit one payload.
pub(crate) fn is_eager(shared: &Shared, dest: Rank, size: usize) -> bool {
    let cutover = if shared.fabric.is_local(dest) {
        shared.config.eager_cutover_local
    } else {
        shared.config.eager_cutover
    };
    size <= cutover
}

/// Ship a command block to `dest`, addressed to `target`. Posted handles
/// land in `handles`; the caller owns polling them.
pub(crate) fn send_commands(
    shared: &Shared,
    dest: Rank,
    cmds: &[Command],
    target: WirePersona,
    reply: u64,
    flags: u32,
    handles: &mut Vec<Box<dyn NetHandle>>,
) -> Result<SendMode> {
    if cmds.is_empty() {
        protocol_fatal("remote dispatch with nothing to execute");
    }
    let block = command::encode_block(cmds);
    let size = block.len();

    if is_eager(shared, dest, size) {
        let args = match target {
            WirePersona::Slot(slot) if slot == MASTER_SLOT => {
                EagerMasterArgs { reply, flags }.to_args()
            }
            persona => EagerPersonaArgs {
                reply,
                flags,
                persona,
            }
            .to_args(),
        };
        let handler = match target {
            WirePersona::Slot(slot) if slot == MASTER_SLOT => HandlerId::EagerMaster,
            _ => HandlerId::EagerPersona,
        };
        let frame = encode_frame(handler, &args, &block);
        handles.push(shared.fabric.send_am(dest, frame, noop())?);
        shared.stats.eager_sent.fetch_add(1, Ordering::Relaxed);
        return Ok(SendMode::Eager);
    }

    let max_payload = shared.fabric.max_am_payload();
    if size <= max_payload {
        let args = RdzvPackedArgs {
            reply,
            flags,
            persona: target,
        }
        .to_args();
        let frame = encode_frame(HandlerId::RdzvPacked, &args, &block);
        handles.push(shared.fabric.send_am(dest, frame, noop())?);
        shared.stats.rdzv_packed_sent.fetch_add(1, Ordering::Relaxed);
        return Ok(SendMode::RdzvPacked);
    }

    let total_parts = match u32::try_from(size.div_ceil(max_payload)) {
        Ok(parts) => parts,
        Err(_) => {
            return Err(Error::MessageTooLarge {
                size,
                max: max_payload * u32::MAX as usize,
            })
        }
    };
    let nonce = shared.nonce.fetch_add(1, Ordering::Relaxed);
    for (i, piece) in block.chunks(max_payload).enumerate() {
        let offset = (i * max_payload) as u64;
        let common = RdzvPayloadPartArgs {
            nonce,
            total_len: size as u64,
            total_parts,
            offset,
        };
        let frame = if offset == 0 {
            let args = RdzvCommandPartArgs {
                nonce: common.nonce,
                total_len: common.total_len,
                total_parts,
                offset,
                reply,
                persona: target,
                flags,
            }
            .to_args();
            encode_frame(HandlerId::RdzvCommandPart, &args, piece)
        } else {
            encode_frame(HandlerId::RdzvPayloadPart, &common.to_args(), piece)
        };
        handles.push(shared.fabric.send_am(dest, frame, noop())?);
    }
    shared.stats.rdzv_fragmented_sent.fetch_add(1, Ordering::Relaxed);
    shared
        .stats
        .rdzv_parts_sent
        .fetch_add(total_parts as u64, Ordering::Relaxed);
    Ok(SendMode::RdzvParts(total_parts))
}

/// Fire-and-forget restricted command: runs inline on the receiving poll
/// path, no persona, no reply.
pub(crate) fn send_restricted(
    shared: &Shared,
    dest: Rank,
    exec: ExecId,
    args: &[u8],
    handles: &mut Vec<Box<dyn NetHandle>>,
) -> Result<()> {
    let max = shared.fabric.max_am_payload();
    if args.len() > max {
        return Err(Error::MessageTooLarge {
            size: args.len(),
            max,
        });
    }
    let frame = encode_frame(
        HandlerId::EagerRestricted,
        &EagerRestrictedArgs { exec }.to_args(),
        args,
    );
    handles.push(shared.fabric.send_am(dest, frame, noop())?);
    shared.stats.restricted_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Send a completion notification back to `dest`.
///
/// Failure here is logged, not returned: replies run inside the receive
/// path, and the only sender errors are teardown races.
pub(crate) fn push_reply(
    shared: &Shared,
    dest: Rank,
    token: u64,
    event: Event,
    payload: Vec<u8>,
    handles: &mut Vec<Box<dyn NetHandle>>,
) {
    debug_assert_ne!(token, NO_REPLY);
    let args = ReplyCallbackArgs { token, event }.to_args();
    let frame = encode_frame(HandlerId::ReplyCallback, &args, &payload);
    match shared.fabric.send_am(dest, frame, noop()) {
        Ok(handle) => {
            handles.push(handle);
            shared.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => log::error!("completion reply to rank {} failed: {}", dest, e),
    }
}

/// Hand a received command block to the persona it addresses.
fn route_block(
    shared: &Shared,
    source: Rank,
    target: WirePersona,
    reply: u64,
    flags: u32,
    data: Vec<u8>,
) {
    if command::block_count(&data) == 0 {
        protocol_fatal("received a command block with nothing to execute");
    }
    if !shared.personas.route_user(target, UserMsg::Block {
        source,
        data,
        reply,
        flags,
    }) {
        log::warn!(
            "dropping command block from rank {}: target persona {:?} does not exist",
            source,
            target
        );
    }
}

fn finish_part(
    shared: &Shared,
    source: Rank,
    part: &RdzvPayloadPartArgs,
    payload: &[u8],
    meta: Option<BlockMeta>,
    handles: &mut Vec<Box<dyn NetHandle>>,
) {
    if let Some(block) = shared.reassembly.add_part(source, part, payload, meta) {
        let m = block.meta;
        // The staging release goes out first; execution can take
        // arbitrarily long under user progress.
        if m.flags & cmd_flags::WANTS_SOURCE_REPLY != 0 {
            push_reply(shared, source, m.reply, Event::Source, Vec::new(), handles);
        }
        route_block(shared, source, m.persona, m.reply, m.flags, block.data);
    }
}

/// Decode one received frame and act on it. Reply sends triggered here
/// push their handles into `handles` for the polling persona to adopt.
pub(crate) fn dispatch(
    shared: &Shared,
    source: Rank,
    bytes: &[u8],
    handles: &mut Vec<Box<dyn NetHandle>>,
) {
    let frame = decode_frame(bytes);
    match frame.handler {
        HandlerId::EagerRestricted => {
            let args = EagerRestrictedArgs::from_args(&frame.args);
            let ctx = CommandCtx {
                initiator: source,
                target: shared.rank,
            };
            shared.registry.run(&ctx, args.exec, frame.payload);
        }
        HandlerId::EagerMaster => {
            let args = EagerMasterArgs::from_args(&frame.args);
            route_block(
                shared,
                source,
                WirePersona::Slot(MASTER_SLOT),
                args.reply,
                args.flags,
                frame.payload.to_vec(),
            );
        }
        HandlerId::EagerPersona => {
            let args = EagerPersonaArgs::from_args(&frame.args);
            route_block(
                shared,
                source,
                args.persona,
                args.reply,
                args.flags,
                frame.payload.to_vec(),
            );
        }
        HandlerId::RdzvPacked => {
            let args = RdzvPackedArgs::from_args(&frame.args);
            if args.flags & cmd_flags::WANTS_SOURCE_REPLY != 0 {
                push_reply(shared, source, args.reply, Event::Source, Vec::new(), handles);
            }
            route_block(
                shared,
                source,
                args.persona,
                args.reply,
                args.flags,
                frame.payload.to_vec(),
            );
        }
        HandlerId::RdzvCommandPart => {
            let args = RdzvCommandPartArgs::from_args(&frame.args);
            let meta = BlockMeta {
                reply: args.reply,
                persona: args.persona,
                flags: args.flags,
            };
            finish_part(
                shared,
                source,
                &args.payload_part(),
                frame.payload,
                Some(meta),
                handles,
            );
        }
        HandlerId::RdzvPayloadPart => {
            let args = RdzvPayloadPartArgs::from_args(&frame.args);
            finish_part(shared, source, &args, frame.payload, None, handles);
        }
        HandlerId::ReplyCallback => {
            let args = ReplyCallbackArgs::from_args(&frame.args);
            if args.token == NO_REPLY {
                protocol_fatal("completion reply for a message that requested none");
            }
            let (persona, slot) = {
                let mut replies = lock(&shared.replies);
                let Some(entry) = replies.get_mut(args.token as usize) else {
                    protocol_fatal(&format!("completion reply for unknown token {}", args.token));
                };
                let bit = event_bit(args.event);
                if entry.events & bit == 0 {
                    protocol_fatal(&format!(
                        "duplicate {:?} reply for token {}",
                        args.event, args.token
                    ));
                }
                entry.events &= !bit;
                let routed = (entry.persona, entry.slot);
                if entry.events == 0 {
                    replies.remove(args.token as usize);
                }
                routed
            };
            shared.personas.send_internal(
                persona,
                ProtocolMsg::Fire {
                    slot,
                    event: args.event,
                    value: frame.payload.to_vec(),
                },
            );
        }
    }
}

//! Wire formats for the active-message protocol.
//!
//! Every message is a frame: an 8-byte header, up to [`MAX_ARG_WORDS`]
//! 32-bit argument words, and an optional payload. The argument layout of
//! each handler is fixed here so both sides agree without negotiation.
//! 64-bit values (persona keys, reply tokens, nonces, lengths) travel as
//! two words, low word first.

use crate::completion::Event;
use crate::error::protocol_fatal;

/// Frame header size in bytes.
pub const FRAME_HDR_SIZE: usize = 8;

/// Magic number for valid frames.
pub const AM_MAGIC: u8 = 0xA9;

/// Maximum number of 32-bit argument words per message.
pub const MAX_ARG_WORDS: usize = 16;

/// The well-known persona slot resolving to the destination's master.
pub const MASTER_SLOT: u32 = 0;

/// Handler table of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerId {
    /// Short command executed inline on the receive path. No payload
    /// beyond the serialized arguments, no reply.
    EagerRestricted = 0,
    /// Eager command block executed by the destination master persona.
    EagerMaster = 1,
    /// Eager command block executed by a named persona.
    EagerPersona = 2,
    /// Rendezvous block that fits one message. Carries the full command
    /// block as payload, skipping the reassembly table.
    RdzvPacked = 3,
    /// One chunk of a fragmented rendezvous block, data only.
    RdzvPayloadPart = 4,
    /// The chunk at offset zero of a fragmented block. Also carries the
    /// execution metadata (reply identity, target persona, flags).
    RdzvCommandPart = 5,
    /// Completion notification for an earlier send, addressed by token.
    ReplyCallback = 6,
}

impl HandlerId {
    /// Decode a handler id from its wire byte.
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(HandlerId::EagerRestricted),
            1 => Some(HandlerId::EagerMaster),
            2 => Some(HandlerId::EagerPersona),
            3 => Some(HandlerId::RdzvPacked),
            4 => Some(HandlerId::RdzvPayloadPart),
            5 => Some(HandlerId::RdzvCommandPart),
            6 => Some(HandlerId::ReplyCallback),
            _ => None,
        }
    }
}

/// Flag bits carried by eager and rendezvous command messages.
pub mod cmd_flags {
    /// Sender wants a reply once the commands have executed.
    pub const WANTS_OP_ACK: u32 = 1 << 0;
    /// Sender holds staging until the payload is safely copied out.
    pub const WANTS_SOURCE_REPLY: u32 = 1 << 1;
}

/// Split a 64-bit value into `(lo, hi)` wire words.
#[inline]
pub fn split_u64(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

/// Rebuild a 64-bit value from its `(lo, hi)` wire words.
#[inline]
pub fn join_u64(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

/// Wire form of a persona address.
///
/// A persona is named either directly by its key or indirectly through a
/// well-known slot the destination resolves at delivery time. The low bit
/// discriminates: keys are allocated even, slots encode as
/// `(slot << 1) | 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WirePersona {
    /// A concrete persona key on the destination rank.
    Direct(u64),
    /// A well-known slot; [`MASTER_SLOT`] is the master persona.
    Slot(u32),
}

impl WirePersona {
    #[inline]
    pub fn encode(self) -> u64 {
        match self {
            WirePersona::Direct(key) => {
                debug_assert_eq!(key & 1, 0, "persona keys are allocated even");
                key
            }
            WirePersona::Slot(slot) => ((slot as u64) << 1) | 1,
        }
    }

    #[inline]
    pub fn decode(v: u64) -> Self {
        if v & 1 == 1 {
            WirePersona::Slot((v >> 1) as u32)
        } else {
            WirePersona::Direct(v)
        }
    }
}

/// Fixed-capacity argument word list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Args {
    words: [u32; MAX_ARG_WORDS],
    len: u8,
}

impl Args {
    /// Build an argument list. Panics if `words` exceeds [`MAX_ARG_WORDS`];
    /// every layout in this module fits, so an overflow is a handler bug.
    pub fn new(words: &[u32]) -> Self {
        assert!(
            words.len() <= MAX_ARG_WORDS,
            "{} argument words exceed the limit of {}",
            words.len(),
            MAX_ARG_WORDS
        );
        let mut buf = [0u32; MAX_ARG_WORDS];
        buf[..words.len()].copy_from_slice(words);
        Self {
            words: buf,
            len: words.len() as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.words[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Frame header (8 bytes).
///
/// ```text
/// Offset  Size  Field
/// 0       1     magic
/// 1       1     handler
/// 2       1     argc
/// 3       1     reserved
/// 4       4     payload_len
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHdr {
    magic: u8,
    handler: u8,
    argc: u8,
    reserved: u8,
    payload_len: u32,
}

impl FrameHdr {
    /// Serialize into the first [`FRAME_HDR_SIZE`] bytes of `dst`.
    /// Multi-byte fields are little-endian, like the argument words.
    #[inline]
    fn write_to(&self, dst: &mut [u8]) {
        dst[0] = self.magic;
        dst[1] = self.handler;
        dst[2] = self.argc;
        dst[3] = self.reserved;
        dst[4..FRAME_HDR_SIZE].copy_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Deserialize from the first [`FRAME_HDR_SIZE`] bytes of `src`.
    #[inline]
    fn read_from(src: &[u8]) -> Self {
        let mut len = [0u8; 4];
        len.copy_from_slice(&src[4..FRAME_HDR_SIZE]);
        Self {
            magic: src[0],
            handler: src[1],
            argc: src[2],
            reserved: src[3],
            payload_len: u32::from_le_bytes(len),
        }
    }
}

/// A decoded frame borrowing the payload from the receive buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub handler: HandlerId,
    pub args: Args,
    pub payload: &'a [u8],
}

/// Serialize a frame.
pub fn encode_frame(handler: HandlerId, args: &Args, payload: &[u8]) -> Vec<u8> {
    let hdr = FrameHdr {
        magic: AM_MAGIC,
        handler: handler as u8,
        argc: args.len() as u8,
        reserved: 0,
        payload_len: payload.len() as u32,
    };
    let mut buf = vec![0u8; FRAME_HDR_SIZE + args.len() * 4 + payload.len()];
    hdr.write_to(&mut buf);
    let mut off = FRAME_HDR_SIZE;
    for w in args.as_slice() {
        buf[off..off + 4].copy_from_slice(&w.to_le_bytes());
        off += 4;
    }
    buf[off..].copy_from_slice(payload);
    buf
}

/// Deserialize a frame.
///
/// Corruption here means a broken transport or a broken peer, which the
/// protocol cannot recover from, so every malformation aborts.
pub fn decode_frame(bytes: &[u8]) -> Frame<'_> {
    if bytes.len() < FRAME_HDR_SIZE {
        protocol_fatal(&format!("truncated frame of {} bytes", bytes.len()));
    }
    let hdr = FrameHdr::read_from(bytes);
    if hdr.magic != AM_MAGIC {
        protocol_fatal(&format!("bad frame magic {:#04x}", hdr.magic));
    }
    if hdr.argc as usize > MAX_ARG_WORDS {
        protocol_fatal(&format!("frame declares {} argument words", hdr.argc));
    }
    let Some(handler) = HandlerId::from_u8(hdr.handler) else {
        protocol_fatal(&format!("unknown handler id {}", hdr.handler));
    };
    let payload_len = hdr.payload_len as usize;
    let args_len = hdr.argc as usize * 4;
    if bytes.len() != FRAME_HDR_SIZE + args_len + payload_len {
        protocol_fatal(&format!(
            "frame length {} does not match header ({} args, {} payload)",
            bytes.len(),
            hdr.argc,
            payload_len
        ));
    }
    let mut words = [0u32; MAX_ARG_WORDS];
    let mut off = FRAME_HDR_SIZE;
    for w in words.iter_mut().take(hdr.argc as usize) {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[off..off + 4]);
        *w = u32::from_le_bytes(raw);
        off += 4;
    }
    Frame {
        handler,
        args: Args::new(&words[..hdr.argc as usize]),
        payload: &bytes[off..],
    }
}

// ============================================================================
// Per-handler argument layouts
// ============================================================================

fn expect_argc<'a>(args: &'a Args, want: usize, handler: &str) -> &'a [u32] {
    let words = args.as_slice();
    if words.len() != want {
        protocol_fatal(&format!(
            "{} expects {} argument words, got {}",
            handler,
            want,
            words.len()
        ));
    }
    words
}

/// Arguments of [`HandlerId::EagerRestricted`]: `[exec]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EagerRestrictedArgs {
    pub exec: u32,
}

impl EagerRestrictedArgs {
    pub fn to_args(self) -> Args {
        Args::new(&[self.exec])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 1, "EagerRestricted");
        Self { exec: w[0] }
    }
}

/// Arguments of [`HandlerId::EagerMaster`]: `[reply_lo, reply_hi, flags]`.
///
/// `reply` is the sender's pending-reply token, zero when no ack was
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EagerMasterArgs {
    pub reply: u64,
    pub flags: u32,
}

impl EagerMasterArgs {
    pub fn to_args(self) -> Args {
        let (rl, rh) = split_u64(self.reply);
        Args::new(&[rl, rh, self.flags])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 3, "EagerMaster");
        Self {
            reply: join_u64(w[0], w[1]),
            flags: w[2],
        }
    }
}

/// Arguments of [`HandlerId::EagerPersona`]:
/// `[reply_lo, reply_hi, flags, persona_lo, persona_hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EagerPersonaArgs {
    pub reply: u64,
    pub flags: u32,
    pub persona: WirePersona,
}

impl EagerPersonaArgs {
    pub fn to_args(self) -> Args {
        let (rl, rh) = split_u64(self.reply);
        let (pl, ph) = split_u64(self.persona.encode());
        Args::new(&[rl, rh, self.flags, pl, ph])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 5, "EagerPersona");
        Self {
            reply: join_u64(w[0], w[1]),
            flags: w[2],
            persona: WirePersona::decode(join_u64(w[3], w[4])),
        }
    }
}

/// Arguments of [`HandlerId::RdzvPacked`]:
/// `[reply_lo, reply_hi, flags, persona_lo, persona_hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdzvPackedArgs {
    pub reply: u64,
    pub flags: u32,
    pub persona: WirePersona,
}

impl RdzvPackedArgs {
    pub fn to_args(self) -> Args {
        let (rl, rh) = split_u64(self.reply);
        let (pl, ph) = split_u64(self.persona.encode());
        Args::new(&[rl, rh, self.flags, pl, ph])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 5, "RdzvPacked");
        Self {
            reply: join_u64(w[0], w[1]),
            flags: w[2],
            persona: WirePersona::decode(join_u64(w[3], w[4])),
        }
    }
}

/// Arguments of [`HandlerId::RdzvPayloadPart`]:
/// `[nonce_lo, nonce_hi, total_lo, total_hi, total_parts, off_lo, off_hi]`.
///
/// Every part restates the block totals so arrival order does not matter;
/// whichever part lands first creates the reassembly entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdzvPayloadPartArgs {
    pub nonce: u64,
    pub total_len: u64,
    pub total_parts: u32,
    pub offset: u64,
}

impl RdzvPayloadPartArgs {
    pub fn to_args(self) -> Args {
        let (nl, nh) = split_u64(self.nonce);
        let (tl, th) = split_u64(self.total_len);
        let (ol, oh) = split_u64(self.offset);
        Args::new(&[nl, nh, tl, th, self.total_parts, ol, oh])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 7, "RdzvPayloadPart");
        Self {
            nonce: join_u64(w[0], w[1]),
            total_len: join_u64(w[2], w[3]),
            total_parts: w[4],
            offset: join_u64(w[5], w[6]),
        }
    }
}

/// Arguments of [`HandlerId::RdzvCommandPart`]:
/// `[nonce_lo, nonce_hi, total_lo, total_hi, total_parts, off_lo, off_hi,
///   reply_lo, reply_hi, persona_lo, persona_hi, flags]`.
///
/// The part at offset zero. Its extra words carry what the reassembled
/// block needs to execute and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdzvCommandPartArgs {
    pub nonce: u64,
    pub total_len: u64,
    pub total_parts: u32,
    pub offset: u64,
    pub reply: u64,
    pub persona: WirePersona,
    pub flags: u32,
}

impl RdzvCommandPartArgs {
    pub fn to_args(self) -> Args {
        let (nl, nh) = split_u64(self.nonce);
        let (tl, th) = split_u64(self.total_len);
        let (ol, oh) = split_u64(self.offset);
        let (rl, rh) = split_u64(self.reply);
        let (pl, ph) = split_u64(self.persona.encode());
        Args::new(&[
            nl,
            nh,
            tl,
            th,
            self.total_parts,
            ol,
            oh,
            rl,
            rh,
            pl,
            ph,
            self.flags,
        ])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 12, "RdzvCommandPart");
        Self {
            nonce: join_u64(w[0], w[1]),
            total_len: join_u64(w[2], w[3]),
            total_parts: w[4],
            offset: join_u64(w[5], w[6]),
            reply: join_u64(w[7], w[8]),
            persona: WirePersona::decode(join_u64(w[9], w[10])),
            flags: w[11],
        }
    }

    /// The payload-part view of this part, for shared reassembly handling.
    pub fn payload_part(&self) -> RdzvPayloadPartArgs {
        RdzvPayloadPartArgs {
            nonce: self.nonce,
            total_len: self.total_len,
            total_parts: self.total_parts,
            offset: self.offset,
        }
    }
}

/// Arguments of [`HandlerId::ReplyCallback`]: `[token_lo, token_hi, event]`.
///
/// The payload carries the produced bytes (command results for operation
/// acks, empty otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCallbackArgs {
    pub token: u64,
    pub event: Event,
}

impl ReplyCallbackArgs {
    pub fn to_args(self) -> Args {
        let (tl, th) = split_u64(self.token);
        Args::new(&[tl, th, self.event as u32])
    }

    pub fn from_args(args: &Args) -> Self {
        let w = expect_argc(args, 3, "ReplyCallback");
        let Some(event) = Event::from_u32(w[2]) else {
            protocol_fatal(&format!("reply carries unknown event {}", w[2]));
        };
        Self {
            token: join_u64(w[0], w[1]),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_join_roundtrip() {
        for v in [0u64, 1, 0xFFFF_FFFF, 0x1_0000_0000, u64::MAX] {
            let (lo, hi) = split_u64(v);
            assert_eq!(join_u64(lo, hi), v);
        }
    }

    #[test]
    fn persona_discriminator() {
        let direct = WirePersona::Direct(0x1234_5678_9ABC_DEF0 & !1);
        let encoded = direct.encode();
        assert_eq!(encoded & 1, 0);
        assert_eq!(WirePersona::decode(encoded), direct);

        let slot = WirePersona::Slot(7);
        let encoded = slot.encode();
        assert_eq!(encoded & 1, 1);
        assert_eq!(WirePersona::decode(encoded), slot);

        assert_eq!(
            WirePersona::decode(WirePersona::Slot(MASTER_SLOT).encode()),
            WirePersona::Slot(0)
        );
    }

    #[test]
    fn frame_roundtrip() {
        let args = Args::new(&[1, 2, 0xDEAD_BEEF]);
        let payload = vec![9u8; 100];
        let bytes = encode_frame(HandlerId::EagerMaster, &args, &payload);
        let frame = decode_frame(&bytes);
        assert_eq!(frame.handler, HandlerId::EagerMaster);
        assert_eq!(frame.args.as_slice(), &[1, 2, 0xDEAD_BEEF]);
        assert_eq!(frame.payload, &payload[..]);
    }

    #[test]
    fn frame_header_layout_is_little_endian() {
        let args = Args::new(&[0x0102_0304]);
        let bytes = encode_frame(HandlerId::RdzvPacked, &args, &[0u8; 5]);
        assert_eq!(bytes[0], AM_MAGIC);
        assert_eq!(bytes[1], HandlerId::RdzvPacked as u8);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[3], 0);
        // payload_len, least significant byte first, regardless of host.
        assert_eq!(&bytes[4..8], &[5, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn frame_roundtrip_no_payload() {
        let args = EagerRestrictedArgs { exec: 42 }.to_args();
        let bytes = encode_frame(HandlerId::EagerRestricted, &args, &[]);
        let frame = decode_frame(&bytes);
        assert_eq!(frame.handler, HandlerId::EagerRestricted);
        assert!(frame.payload.is_empty());
        assert_eq!(EagerRestrictedArgs::from_args(&frame.args).exec, 42);
    }

    #[test]
    #[should_panic]
    fn arg_word_ceiling() {
        let _ = Args::new(&[0u32; MAX_ARG_WORDS + 1]);
    }

    #[test]
    #[should_panic]
    fn corrupt_magic_aborts() {
        let args = Args::new(&[]);
        let mut bytes = encode_frame(HandlerId::EagerMaster, &args, &[]);
        bytes[0] = 0x00;
        let _ = decode_frame(&bytes);
    }

    #[test]
    fn command_part_roundtrip() {
        let part = RdzvCommandPartArgs {
            nonce: 0xABCD_0001_0002_0003,
            total_len: 123_456,
            total_parts: 31,
            offset: 0,
            reply: 77,
            persona: WirePersona::Slot(MASTER_SLOT),
            flags: cmd_flags::WANTS_OP_ACK | cmd_flags::WANTS_SOURCE_REPLY,
        };
        let decoded = RdzvCommandPartArgs::from_args(&part.to_args());
        assert_eq!(decoded, part);
        assert_eq!(decoded.payload_part().nonce, part.nonce);
        assert!(part.to_args().len() <= MAX_ARG_WORDS);
    }

    #[test]
    fn payload_part_roundtrip() {
        let part = RdzvPayloadPartArgs {
            nonce: 3,
            total_len: 1 << 33,
            total_parts: 9000,
            offset: 4096,
        };
        assert_eq!(RdzvPayloadPartArgs::from_args(&part.to_args()), part);
    }

    #[test]
    fn reply_args_roundtrip() {
        let args = ReplyCallbackArgs {
            token: u64::MAX - 1,
            event: Event::Operation,
        };
        assert_eq!(ReplyCallbackArgs::from_args(&args.to_args()), args);
    }
}

//! Commands: the executable payload of an active message.
//!
//! A command is an execution id plus opaque argument bytes; serialization
//! of real argument types belongs to the caller. Ranks agree on the id
//! table out of band by building identical registries before the runtime
//! starts.

use std::collections::HashMap;

use crate::error::protocol_fatal;
use crate::fabric::Rank;

/// Process-wide command table index.
pub type ExecId = u32;

/// Per-command overhead in an encoded block (id + length).
const CMD_HDR_LEN: usize = 8;

/// A bound, shippable unit of remote execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub exec: ExecId,
    pub args: Vec<u8>,
}

impl Command {
    pub fn new(exec: ExecId, args: impl Into<Vec<u8>>) -> Self {
        Self {
            exec,
            args: args.into(),
        }
    }

    /// Bytes this command contributes to an encoded block.
    pub fn encoded_len(&self) -> usize {
        CMD_HDR_LEN + self.args.len()
    }
}

/// Serialized size of a command block.
pub fn block_len(cmds: &[Command]) -> usize {
    4 + cmds.iter().map(Command::encoded_len).sum::<usize>()
}

/// Number of commands in an encoded block, without decoding it.
pub fn block_count(bytes: &[u8]) -> usize {
    if bytes.len() < 4 {
        protocol_fatal(&format!("command block of {} bytes", bytes.len()));
    }
    read_u32(bytes, 0) as usize
}

/// Encode commands into a block: `count`, then per command `exec`, `len`,
/// and the argument bytes, all little-endian.
pub fn encode_block(cmds: &[Command]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block_len(cmds));
    buf.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
    for cmd in cmds {
        buf.extend_from_slice(&cmd.exec.to_le_bytes());
        buf.extend_from_slice(&(cmd.args.len() as u32).to_le_bytes());
        buf.extend_from_slice(&cmd.args);
    }
    buf
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(raw)
}

/// Decode a command block. Malformed blocks abort: they can only come from
/// a corrupt transport or a registry that disagrees about the codec.
pub fn decode_block(bytes: &[u8]) -> Vec<Command> {
    if bytes.len() < 4 {
        protocol_fatal(&format!("command block of {} bytes", bytes.len()));
    }
    let count = read_u32(bytes, 0) as usize;
    let mut cmds = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        if bytes.len() - off < CMD_HDR_LEN {
            protocol_fatal("command block truncated in header");
        }
        let exec = read_u32(bytes, off);
        let len = read_u32(bytes, off + 4) as usize;
        off += CMD_HDR_LEN;
        if bytes.len() - off < len {
            protocol_fatal("command block truncated in arguments");
        }
        cmds.push(Command {
            exec,
            args: bytes[off..off + len].to_vec(),
        });
        off += len;
    }
    if off != bytes.len() {
        protocol_fatal("command block has trailing bytes");
    }
    cmds
}

/// Where and on whose behalf a command runs.
#[derive(Debug, Clone, Copy)]
pub struct CommandCtx {
    /// Rank that sent the command.
    pub initiator: Rank,
    /// Rank executing it.
    pub target: Rank,
}

type CommandFn = Box<dyn Fn(&CommandCtx, &[u8]) -> Vec<u8> + Send + Sync>;

/// The agreed table of executable commands.
///
/// Built before the runtime starts and immutable afterwards. Handlers run
/// on whichever persona the message addressed (or inline on the receive
/// path for restricted messages), so they must be `Send + Sync`.
#[derive(Default)]
pub struct CommandRegistry {
    table: HashMap<ExecId, CommandFn>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `exec` to a handler. Re-registering an id replaces the handler;
    /// ranks must perform identical registrations in the same order.
    pub fn register<F>(mut self, exec: ExecId, f: F) -> Self
    where
        F: Fn(&CommandCtx, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.table.insert(exec, Box::new(f));
        self
    }

    pub fn contains(&self, exec: ExecId) -> bool {
        self.table.contains_key(&exec)
    }

    /// Run one command. An unknown id is version skew between binaries,
    /// not wire corruption; it is logged and skipped.
    pub fn run(&self, ctx: &CommandCtx, exec: ExecId, args: &[u8]) -> Vec<u8> {
        match self.table.get(&exec) {
            Some(f) => f(ctx, args),
            None => {
                log::warn!(
                    "unknown command {} from rank {}, skipping",
                    exec,
                    ctx.initiator
                );
                Vec::new()
            }
        }
    }

    /// Decode and run a whole block, concatenating the results in block order.
    pub fn run_block(&self, ctx: &CommandCtx, block: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for cmd in decode_block(block) {
            out.extend_from_slice(&self.run(ctx, cmd.exec, &cmd.args));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CommandCtx {
        CommandCtx {
            initiator: 0,
            target: 1,
        }
    }

    #[test]
    fn block_roundtrip() {
        let cmds = vec![
            Command::new(1, vec![1, 2, 3]),
            Command::new(2, Vec::new()),
            Command::new(7, vec![0xFF; 300]),
        ];
        let block = encode_block(&cmds);
        assert_eq!(block.len(), block_len(&cmds));
        assert_eq!(decode_block(&block), cmds);
    }

    #[test]
    fn empty_block_roundtrip() {
        let block = encode_block(&[]);
        assert_eq!(block.len(), 4);
        assert!(decode_block(&block).is_empty());
    }

    #[test]
    #[should_panic]
    fn truncated_block_aborts() {
        let block = encode_block(&[Command::new(1, vec![9; 8])]);
        let _ = decode_block(&block[..block.len() - 1]);
    }

    #[test]
    fn registry_runs_and_concatenates_in_order() {
        let reg = CommandRegistry::new()
            .register(1, |_, args| args.to_vec())
            .register(2, |_, _| vec![0xAB]);
        let block = encode_block(&[
            Command::new(2, Vec::new()),
            Command::new(1, vec![1, 2]),
        ]);
        assert_eq!(reg.run_block(&ctx(), &block), vec![0xAB, 1, 2]);
    }

    #[test]
    fn unknown_command_is_skipped() {
        let reg = CommandRegistry::new().register(1, |_, _| vec![1]);
        let block = encode_block(&[Command::new(99, vec![5]), Command::new(1, Vec::new())]);
        assert_eq!(reg.run_block(&ctx(), &block), vec![1]);
    }

    #[test]
    fn handler_sees_context() {
        let reg = CommandRegistry::new().register(3, |ctx, _| vec![ctx.initiator as u8]);
        assert_eq!(reg.run(&ctx(), 3, &[]), vec![0]);
    }
}

//! amrpc - Asynchronous active-message RPC with composable completion notification.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Runtime (one rank)                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐   │
//! │  │   Command    │  │ Reply tokens │  │ Reassembly            │   │
//! │  │   registry   │  │    (slab)    │  │ (rank, nonce) → block │   │
//! │  └──────────────┘  └──────────────┘  └───────────────────────┘   │
//! │                                                                  │
//! │  fabric poll → frame → handler table → inline | persona inbox    │
//! └──────────────────────────────────────────────────────────────────┘
//!                     │
//!           ┌─────────┼─────────┐
//!           ▼         ▼         ▼
//!     ┌──────────┐ ┌──────────┐ ┌──────────┐
//!     │  master  │ │ persona  │ │ persona  │
//!     │ (slot 0) │ │  (key)   │ │  (key)   │
//!     └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! - **Eager vs rendezvous**: command blocks at or under the per-peer cutover
//!   ride one frame; larger blocks go packed, or fragmented through
//!   credit-counted reassembly
//! - **Completions**: `|`-composed lists of futures, promises, callbacks,
//!   shipped commands, and sync markers, each bound to one of the
//!   source/remote/operation events
//! - **Personas**: per-thread progress drivers; cross-thread work reaches them
//!   through inboxes, never through shared mutable state

pub mod command;
pub mod completion;
pub mod config;
pub mod error;
pub mod fabric;
pub mod future;
pub mod handle_queue;
pub mod lpc;
pub mod persona;
mod protocol;
mod reassembly;
pub mod runtime;
mod state;
pub mod wire;

pub use command::{Command, CommandCtx, CommandRegistry, ExecId};
pub use completion::{ActionKind, Completions, Event};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use fabric::{Fabric, MeshFabric, MeshOptions, Rank, Segment};
pub use future::{FutureState, OpFuture, Promise};
pub use handle_queue::{HandleQueue, NetHandle};
pub use lpc::{LocalQueue, LpcNode, PersonaRef, SendLpcNode};
pub use persona::{Level, Persona};
pub use runtime::{Runtime, StatsSnapshot};
pub use state::Returned;
pub use wire::WirePersona;

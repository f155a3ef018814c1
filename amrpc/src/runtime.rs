//! One rank's runtime: the shared core every persona drives.
//!
//! [`Runtime`] wires a [`Fabric`] endpoint, the command registry, and the
//! cross-thread tables (personas, pending replies, reassembly) into an
//! [`Arc`] the rank's personas share. It is cheap to clone and safe to
//! move across threads; the personas it creates are not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use slab::Slab;

use crate::command::CommandRegistry;
use crate::config::RuntimeConfig;
use crate::fabric::{Fabric, MeshFabric, MeshOptions, Rank, Segment};
use crate::lpc::PersonaRef;
use crate::persona::{Persona, PersonaRegistry};
use crate::reassembly::ReassemblyTable;
use crate::wire::MASTER_SLOT;

/// Lock that shrugs off poisoning: a panicking peer thread is already
/// aborting the job, and these tables stay structurally valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// An outstanding completion reply, keyed by its wire token.
pub(crate) struct PendingReply {
    pub(crate) persona: u64,
    pub(crate) slot: u32,
    /// Events still allowed to answer this token. A reply for a cleared
    /// bit is a protocol violation; the entry retires when all clear.
    pub(crate) events: u8,
}

#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) eager_sent: AtomicU64,
    pub(crate) rdzv_packed_sent: AtomicU64,
    pub(crate) rdzv_fragmented_sent: AtomicU64,
    pub(crate) rdzv_parts_sent: AtomicU64,
    pub(crate) restricted_sent: AtomicU64,
    pub(crate) replies_sent: AtomicU64,
    pub(crate) blocks_executed: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            eager_sent: self.eager_sent.load(Ordering::Relaxed),
            rdzv_packed_sent: self.rdzv_packed_sent.load(Ordering::Relaxed),
            rdzv_fragmented_sent: self.rdzv_fragmented_sent.load(Ordering::Relaxed),
            rdzv_parts_sent: self.rdzv_parts_sent.load(Ordering::Relaxed),
            restricted_sent: self.restricted_sent.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            blocks_executed: self.blocks_executed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time protocol counters for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Command blocks sent on the eager path.
    pub eager_sent: u64,
    /// Blocks sent as a single rendezvous frame.
    pub rdzv_packed_sent: u64,
    /// Blocks sent fragmented.
    pub rdzv_fragmented_sent: u64,
    /// Individual rendezvous parts sent.
    pub rdzv_parts_sent: u64,
    /// Restricted fire-and-forget sends.
    pub restricted_sent: u64,
    /// Completion replies sent back to initiators.
    pub replies_sent: u64,
    /// Command blocks executed on this rank.
    pub blocks_executed: u64,
}

/// State shared by all personas of one rank.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) rank: Rank,
    pub(crate) fabric: Arc<dyn Fabric>,
    pub(crate) registry: Arc<CommandRegistry>,
    pub(crate) personas: PersonaRegistry,
    pub(crate) replies: Mutex<Slab<PendingReply>>,
    pub(crate) reassembly: ReassemblyTable,
    pub(crate) nonce: AtomicU64,
    pub(crate) stats: Stats,
}

/// One rank's communication runtime.
///
/// Cloning shares the rank; personas created from any clone see the same
/// tables and fabric endpoint.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Assemble a runtime over an existing fabric endpoint. Cutovers are
    /// clamped against the fabric's payload ceiling here, once.
    pub fn new(
        fabric: Arc<dyn Fabric>,
        mut config: RuntimeConfig,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        config.clamp_cutovers(fabric.max_am_payload());
        let rank = fabric.rank();
        Self {
            shared: Arc::new(Shared {
                config,
                rank,
                fabric,
                registry,
                personas: PersonaRegistry::new(),
                replies: Mutex::new(Slab::new()),
                reassembly: ReassemblyTable::new(),
                nonce: AtomicU64::new(0),
                stats: Stats::default(),
            }),
        }
    }

    /// Build an `n`-rank in-process job. Element `i` is rank `i`'s
    /// runtime; move each to its own thread or drive them round-robin.
    pub fn create_mesh(
        n: usize,
        config: RuntimeConfig,
        registry: Arc<CommandRegistry>,
    ) -> Vec<Runtime> {
        let opts = MeshOptions::new().with_segment_size(config.segment_size);
        MeshFabric::create_mesh(n, opts)
            .into_iter()
            .map(|fabric| Runtime::new(Arc::new(fabric), config.clone(), Arc::clone(&registry)))
            .collect()
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.shared.fabric.num_ranks()
    }

    /// The configuration in force, after clamping.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// This rank's one-sided memory segment.
    pub fn segment(&self) -> Arc<Segment> {
        self.shared.fabric.segment()
    }

    /// Claim the master persona, the rank's default execution context and
    /// the target of plain [`rpc`](Persona::rpc) calls. Panics if it is
    /// already claimed; dropping it frees the claim.
    pub fn master(&self) -> Persona {
        Persona::new(Arc::clone(&self.shared), Some(MASTER_SLOT))
    }

    /// Create an additional persona, addressable only by its key.
    pub fn create_persona(&self) -> Persona {
        Persona::new(Arc::clone(&self.shared), None)
    }

    /// A sendable reference to a live persona on this rank.
    pub fn persona_ref(&self, key: u64) -> Option<PersonaRef> {
        self.shared.personas.user_ref(key)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_EAGER_CUTOVER;

    fn mesh(n: usize) -> Vec<Runtime> {
        Runtime::create_mesh(n, RuntimeConfig::default(), Arc::new(CommandRegistry::new()))
    }

    #[test]
    fn mesh_assigns_ranks_in_order() {
        let rts = mesh(3);
        assert_eq!(rts.len(), 3);
        for (i, rt) in rts.iter().enumerate() {
            assert_eq!(rt.rank(), i as Rank);
            assert_eq!(rt.num_ranks(), 3);
        }
    }

    #[test]
    fn config_is_clamped_at_construction() {
        let config = RuntimeConfig::new()
            .with_eager_cutover(1)
            .with_eager_cutover_local(1 << 30);
        let rt = mesh_with(config);
        assert_eq!(rt.config().eager_cutover, MIN_EAGER_CUTOVER);
        // The mesh caps payloads at 4096 by default.
        assert_eq!(rt.config().eager_cutover_local, 4096);
    }

    fn mesh_with(config: RuntimeConfig) -> Runtime {
        Runtime::create_mesh(1, config, Arc::new(CommandRegistry::new()))
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn master_claim_is_exclusive_until_dropped() {
        let rt = mesh_with(RuntimeConfig::default());
        let master = rt.master();
        drop(master);
        // Reclaimable after release.
        let _again = rt.master();
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn double_master_claim_panics() {
        let rt = mesh_with(RuntimeConfig::default());
        let _first = rt.master();
        let _second = rt.master();
    }

    #[test]
    fn persona_refs_resolve_only_live_keys() {
        let rt = mesh_with(RuntimeConfig::default());
        let persona = rt.create_persona();
        let key = persona.key();
        assert!(rt.persona_ref(key).is_some());
        drop(persona);
        assert!(rt.persona_ref(key).is_none());
    }

    #[test]
    fn segments_are_sized_from_config() {
        let rt = mesh_with(RuntimeConfig::new().with_segment_size(256));
        assert_eq!(rt.segment().len(), 256);
    }
}

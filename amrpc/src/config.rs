//! Configuration types for amrpc.

/// Smallest accepted eager cutover. Commands below this size always fit the
/// eager path, so cutovers are clamped up to it.
pub const MIN_EAGER_CUTOVER: usize = 64;

/// Runtime configuration.
///
/// Controls the eager/rendezvous protocol split, progress batching, and
/// segment sizing.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Largest command block sent eagerly to a remote rank, in bytes.
    /// Blocks above this go through the rendezvous path. Clamped to
    /// `[MIN_EAGER_CUTOVER, fabric max payload]` when the runtime starts.
    /// Default: 512
    pub eager_cutover: usize,
    /// Eager cutover for ranks the fabric reports as local. Local delivery
    /// amortizes copies better, so this is usually larger.
    /// Default: 1024
    pub eager_cutover_local: usize,
    /// Maximum queue nodes executed per progress call.
    /// Default: 32
    pub progress_budget: usize,
    /// Bytes of one-sided memory exposed by each rank.
    /// Default: 1 MiB
    pub segment_size: usize,
    /// Base consecutive-miss limit for the handle completion queue.
    /// Default: 4
    pub miss_limit_base: usize,
    /// Ceiling the miss limit grows to while progress spins without work.
    /// Default: 64
    pub miss_limit_max: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            eager_cutover: 512,
            eager_cutover_local: 1024,
            progress_budget: 32,
            segment_size: 1 << 20,
            miss_limit_base: 4,
            miss_limit_max: 64,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the remote eager cutover.
    pub fn with_eager_cutover(mut self, eager_cutover: usize) -> Self {
        self.eager_cutover = eager_cutover;
        self
    }

    /// Set the local eager cutover.
    pub fn with_eager_cutover_local(mut self, eager_cutover_local: usize) -> Self {
        self.eager_cutover_local = eager_cutover_local;
        self
    }

    /// Set the progress budget.
    pub fn with_progress_budget(mut self, progress_budget: usize) -> Self {
        self.progress_budget = progress_budget;
        self
    }

    /// Set the segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Set the base miss limit of the handle completion queue.
    pub fn with_miss_limit_base(mut self, miss_limit_base: usize) -> Self {
        self.miss_limit_base = miss_limit_base;
        self
    }

    /// Set the maximum miss limit of the handle completion queue.
    pub fn with_miss_limit_max(mut self, miss_limit_max: usize) -> Self {
        self.miss_limit_max = miss_limit_max;
        self
    }

    /// Clamp both cutovers into `[MIN_EAGER_CUTOVER, max_payload]`.
    ///
    /// Called once when the runtime starts, with the fabric's AM payload
    /// ceiling. After this, `size <= cutover` is exactly the eager
    /// condition.
    pub(crate) fn clamp_cutovers(&mut self, max_payload: usize) {
        self.eager_cutover = self.eager_cutover.clamp(MIN_EAGER_CUTOVER, max_payload);
        self.eager_cutover_local = self
            .eager_cutover_local
            .clamp(MIN_EAGER_CUTOVER, max_payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.eager_cutover, 512);
        assert_eq!(config.eager_cutover_local, 1024);
        assert_eq!(config.progress_budget, 32);
    }

    #[test]
    fn builder_chain() {
        let config = RuntimeConfig::new()
            .with_eager_cutover(256)
            .with_segment_size(4096)
            .with_progress_budget(8);
        assert_eq!(config.eager_cutover, 256);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.progress_budget, 8);
    }

    #[test]
    fn cutover_clamping() {
        let mut config = RuntimeConfig::new()
            .with_eager_cutover(8)
            .with_eager_cutover_local(1 << 20);
        config.clamp_cutovers(4096);
        assert_eq!(config.eager_cutover, MIN_EAGER_CUTOVER);
        assert_eq!(config.eager_cutover_local, 4096);
    }
}

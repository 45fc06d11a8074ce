use std::path::PathBuf;

use typed_builder::TypedBuilder;

use super::mad::TransportKind;

/// Configuration for one subnet manager instance.
///
/// There is no process-wide state: the config and the shared subnet handle
/// are threaded explicitly through every entry point, so independent
/// routing runs (and tests) never observe each other.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SmConfig {
    /// The number of virtual lanes every link in the fabric is known to
    /// provide. Cycle-breaking that needs more lanes than this fails the
    /// sweep with UnsupportedTopology.
    #[builder(default = 1)]
    pub vl_min: u8,
    /// Bound on how unevenly equal-cost alternatives may load a switch's
    /// egress ports: the deterministic choice is abandoned once its usage
    /// exceeds the least-used alternative by more than this.
    #[builder(default = 4)]
    pub balance_limit: u64,
    /// Number of dispatch workers draining the MAD work queue.
    #[builder(default = 4)]
    pub workers: usize,
    /// Which MAD transport backend to run against, selected at runtime.
    #[builder(default = TransportKind::Loopback)]
    pub transport: TransportKind,
    /// Optional node-name-map file, loaded once at startup.
    #[builder(default, setter(strip_option))]
    pub node_name_map: Option<PathBuf>,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

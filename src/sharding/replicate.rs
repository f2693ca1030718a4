//! Pre-sharding device replication for local multi-device emulation.
//!
//! A single physical harness invocation can emulate an N-device sharded run
//! by expanding its one device slot into N slots before any sharding
//! decision is made. Replica slots carry a stub build provider since the
//! real build comes from the primary slot's fetch.

use tracing::{debug, info};

use crate::build::StubBuildProvider;
use crate::harness::ShardConfig;

/// Expands a single-device configuration to one slot per shard.
pub struct ParentShardReplicate;

impl ParentShardReplicate {
    /// Appends `shard_count - 1` replica device slots to `config`.
    ///
    /// Applies only when replicate-setup was requested, the configuration
    /// currently targets exactly one device, and no shard index has been
    /// assigned yet (a shard clone must never re-replicate). Anything else
    /// leaves the configuration untouched.
    pub fn replicate_shared_setup(config: &mut ShardConfig, shard_count: usize) {
        if !config.options.replicate_setup {
            return;
        }
        if config.options.shard_index.is_some() {
            debug!("shard clone detected, skipping replication");
            return;
        }
        if config.devices.len() != 1 || shard_count < 2 {
            return;
        }

        let primary = config.devices[0].clone();
        for slot in 1..shard_count {
            let mut replica = primary.clone();
            replica.name = format!("{}-{}", primary.name, slot);
            replica.build_provider = Box::new(StubBuildProvider);
            config.devices.push(replica);
        }
        info!(
            primary = %primary.name,
            slots = config.devices.len(),
            "replicated single-device setup for local sharding"
        );
    }
}

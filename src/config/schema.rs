//! Configuration schema definitions for shardpool.
//!
//! This module defines the configuration types deserialized from TOML. The
//! schema is intentionally small: the engine is a library, and only the
//! sharding knobs live here.
//!
//! # Schema Overview
//!
//! ```text
//! Options (root)
//! └── ShardingOptions        - Shard count, dispatch flags, recovery tuning
//! ```

use serde::{Deserialize, Serialize};

/// Root configuration structure for shardpool.
///
/// # TOML Structure
///
/// ```toml
/// [sharding]
/// shard_count = 4
/// token_sharding = true
/// recovery_window_secs = 600
/// ```
///
/// # Example
///
/// ```
/// use shardpool::config::Options;
///
/// let options: Options = toml::from_str(r#"
///     [sharding]
///     shard_count = 2
/// "#).unwrap();
/// assert_eq!(options.sharding.shard_count, Some(2));
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Options {
    /// Sharding-engine settings.
    #[serde(default)]
    pub sharding: ShardingOptions,
}

/// Settings steering the sharding engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardingOptions {
    /// Requested number of parallel shards.
    ///
    /// Absent means auto-sharding: one shard per splittable candidate.
    #[serde(default)]
    pub shard_count: Option<usize>,

    /// Pool candidates dynamically even under pure auto-sharding.
    #[serde(default)]
    pub dynamic_sharding: bool,

    /// Partition token-requiring units into their own pool.
    #[serde(default)]
    pub token_sharding: bool,

    /// Replicate a single device configuration across shard slots for
    /// local/virtual multi-device emulation.
    #[serde(default)]
    pub replicate_setup: bool,

    /// How long a poller waits for a lost device to come back, in seconds.
    #[serde(default = "default_recovery_window_secs")]
    pub recovery_window_secs: u64,

    /// Reboot a recovered device before resuming the poll loop.
    #[serde(default = "default_true")]
    pub reboot_on_recovery: bool,
}

impl Default for ShardingOptions {
    fn default() -> Self {
        Self {
            shard_count: None,
            dynamic_sharding: false,
            token_sharding: false,
            replicate_setup: false,
            recovery_window_secs: default_recovery_window_secs(),
            reboot_on_recovery: default_true(),
        }
    }
}

fn default_recovery_window_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

//! shardpool: a test-sharding and pool-polling engine.
//!
//! This crate provides the sharding core of a device-test harness: it takes
//! one configuration holding many test units and turns it into N parallel
//! shard invocations that drain a shared work pool, one worker per device.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **ShardHelper**: Decides whether/how to shard and wires everything up
//! - **PoolPoller**: Work-stealing worker draining the shared pools
//! - **ShardBuildCloner**: Per-shard build-info views without re-downloads
//! - **ShardResultForwarder**: Fans per-shard results back into one stream
//! - **ParentShardReplicate**: Single-device to N-slot expansion for local runs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardpool::config::load_options;
//! use shardpool::device::TokenProviderRegistry;
//! use shardpool::harness::{CommandOptions, ShardConfig};
//! use shardpool::sharding::{LocalRescheduler, ShardHelper};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = load_options(std::path::Path::new("shardpool.toml"))?;
//!     let mut config = ShardConfig::new("my-suite");
//!     config.options = CommandOptions::from(&options.sharding);
//!     // ... add devices, tests, listeners ...
//!     let helper = ShardHelper::new(Arc::new(TokenProviderRegistry::new()));
//!     let rescheduler = LocalRescheduler::new();
//!     if helper.shard_config(&mut config, &rescheduler)? {
//!         rescheduler.wait_all().await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod config;
pub mod device;
pub mod harness;
pub mod invocation;
pub mod sharding;
pub mod unit;

// Re-export commonly used types
pub use build::{BuildInfo, BuildProvider};
pub use config::{load_options, Options, ShardingOptions};
pub use device::{DeviceHandle, TokenProvider, TokenProviderRegistry};
pub use harness::ShardConfig;
pub use invocation::{InvocationContext, RunListener};
pub use sharding::{LocalRescheduler, PoolPoller, Rescheduler, RunSummary, ShardHelper};
pub use unit::{TestUnit, Token};

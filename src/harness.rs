//! Harness configuration objects and per-shard cloning.
//!
//! A [`ShardConfig`] is the configuration an invocation runs: its devices,
//! test units, listener chain, and the collaborators that must either be
//! private to a shard or shared across all of them.
//!
//! # Clone-by-allowlist
//!
//! When the orchestrator shards a configuration, it does not deep-clone the
//! whole object graph. Exactly the categories in [`SHARD_PRIVATE_OBJECTS`]
//! are copied per shard; everything else is shared by reference and must be
//! treated as read-only by shards. The list is versioned so callers can
//! detect when the contract changes.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;

use crate::build::{BuildInfo, BuildProvider, StubBuildProvider};
use crate::config::ShardingOptions;
use crate::device::DeviceHandle;
use crate::invocation::{InvocationContext, MetricCollector, RunListener};
use crate::unit::TestUnit;

use async_trait::async_trait;
use std::sync::Arc;

/// Version of the per-shard-private allowlist below.
pub const SHARD_PRIVATE_OBJECTS_VERSION: u32 = 1;

/// The configuration-object categories every shard owns privately.
///
/// [`ShardConfig::clone_for_shard`] copies exactly these; all other state
/// is shared by reference between the parent and its shards.
pub const SHARD_PRIVATE_OBJECTS: &[&str] = &[
    "system_status_checkers",
    "metric_collectors",
    "build_provider",
    "target_preparers",
    "multi_preparers",
    "device_recovery",
    "device_options",
    "command_options",
    "log_saver",
    "retry_decision",
];

/// Identity and scheduling flags of a configuration.
#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    /// Configuration name.
    pub name: String,

    /// Whether this configuration runs inside a sandbox.
    ///
    /// Only the parent runs sandboxed; shard clones are always marked
    /// unsandboxed.
    pub sandboxed: bool,

    /// Suffix appended to host-log names, unique per shard.
    pub host_log_suffix: Option<String>,
}

impl ConfigDescriptor {
    /// Creates a descriptor with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sandboxed: false,
            host_log_suffix: None,
        }
    }
}

/// Command-level options steering the sharding engine.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `shard_count` | `None` (auto-sharding) |
/// | `dynamic_sharding` | `false` |
/// | `token_sharding` | `false` |
/// | `replicate_setup` | `false` |
/// | `recovery_window` | 600 seconds |
/// | `reboot_on_recovery` | `true` |
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Requested number of parallel shards, if any.
    pub shard_count: Option<usize>,

    /// Index of this shard, assigned by the orchestrator on clones.
    pub shard_index: Option<usize>,

    /// Pool candidates dynamically even under pure auto-sharding.
    pub dynamic_sharding: bool,

    /// Partition token-requiring units into their own pool.
    pub token_sharding: bool,

    /// Replicate a single device configuration to all shard slots before
    /// sharding (local/virtual multi-device emulation).
    pub replicate_setup: bool,

    /// How long a poller waits for a lost device to come back.
    pub recovery_window: Duration,

    /// Reboot a recovered device before resuming the poll loop.
    pub reboot_on_recovery: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            shard_count: None,
            shard_index: None,
            dynamic_sharding: false,
            token_sharding: false,
            replicate_setup: false,
            recovery_window: Duration::from_secs(600),
            reboot_on_recovery: true,
        }
    }
}

impl From<&ShardingOptions> for CommandOptions {
    fn from(options: &ShardingOptions) -> Self {
        Self {
            shard_count: options.shard_count,
            shard_index: None,
            dynamic_sharding: options.dynamic_sharding,
            token_sharding: options.token_sharding,
            replicate_setup: options.replicate_setup,
            recovery_window: Duration::from_secs(options.recovery_window_secs),
            reboot_on_recovery: options.reboot_on_recovery,
        }
    }
}

/// Per-device tuning knobs, clone-scoped per shard.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// How long to wait for a device to finish booting.
    pub boot_timeout: Duration,

    /// Capture device logs during execution.
    pub capture_logs: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(120),
            capture_logs: true,
        }
    }
}

/// What a worker does when its device misbehaves mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Never attempt recovery.
    None,
    /// Reboot immediately without waiting.
    Reboot,
    /// Wait out the recovery window, then reboot.
    #[default]
    WaitThenReboot,
}

/// Retry-orchestration policy, clone-scoped per shard.
#[derive(Debug, Clone, Default)]
pub struct RetryDecision {
    /// Maximum retry attempts per unit.
    pub max_retries: usize,

    /// Re-run retries on a freshly prepared device.
    pub retry_isolation: bool,
}

/// Collects host logs for one invocation.
///
/// Clone-scoped: each shard writes its logs through its own saver, with the
/// shard's host-log suffix keeping file names distinct.
#[derive(Debug, Default)]
pub struct LogSaver {
    entries: Mutex<Vec<String>>,
}

impl LogSaver {
    /// Creates an empty log saver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a named log.
    pub fn save_log(&self, name: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(name.into());
        }
    }

    /// Names of the logs saved so far.
    pub fn saved_logs(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl Clone for LogSaver {
    fn clone(&self) -> Self {
        Self {
            entries: Mutex::new(self.saved_logs()),
        }
    }
}

/// Prepares a device before test execution.
#[async_trait]
pub trait TargetPreparer: Send + Sync {
    /// Preparer name, for logging.
    fn name(&self) -> &str;

    /// Runs the preparation step.
    async fn set_up(&self, device: &dyn DeviceHandle, build: &BuildInfo) -> anyhow::Result<()>;

    /// Clones this preparer behind a box.
    fn clone_boxed(&self) -> Box<dyn TargetPreparer>;
}

impl Clone for Box<dyn TargetPreparer> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Checks system health around an invocation.
#[async_trait]
pub trait SystemStatusChecker: Send + Sync {
    /// Checker name, for logging.
    fn name(&self) -> &str;

    /// Runs before the invocation's tests.
    async fn pre_execution(&self, _device: &dyn DeviceHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the invocation's tests.
    async fn post_execution(&self, _device: &dyn DeviceHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Clones this checker behind a box.
    fn clone_boxed(&self) -> Box<dyn SystemStatusChecker>;
}

impl Clone for Box<dyn SystemStatusChecker> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Configuration for one device slot.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Slot name ("device1", "device2", ...).
    pub name: String,

    /// Supplies this device's build artifacts.
    pub build_provider: Box<dyn BuildProvider>,

    /// Per-device tuning.
    pub device_options: DeviceOptions,

    /// Recovery behavior on device faults.
    pub recovery: RecoveryPolicy,

    /// Preparation steps run against this device.
    pub target_preparers: Vec<Box<dyn TargetPreparer>>,
}

impl DeviceConfig {
    /// Creates a device slot with a stub build provider and defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            build_provider: Box::new(StubBuildProvider),
            device_options: DeviceOptions::default(),
            recovery: RecoveryPolicy::default(),
            target_preparers: Vec::new(),
        }
    }

    /// Replaces the build provider.
    pub fn with_build_provider(mut self, provider: Box<dyn BuildProvider>) -> Self {
        self.build_provider = provider;
        self
    }
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("name", &self.name)
            .field("device_options", &self.device_options)
            .field("recovery", &self.recovery)
            .field("target_preparers", &self.target_preparers.len())
            .finish()
    }
}

/// The configuration an invocation runs.
///
/// The orchestrator reads the test list and options, produces per-shard
/// clones via [`clone_for_shard`](Self::clone_for_shard), and empties the
/// parent's test list once sharding succeeds (signaling "do not also run
/// the parent").
pub struct ShardConfig {
    /// Identity and scheduling flags.
    pub descriptor: ConfigDescriptor,

    /// Command-level options.
    pub options: CommandOptions,

    /// Device slots this configuration targets.
    pub devices: Vec<DeviceConfig>,

    /// Preparers that span all devices.
    pub multi_preparers: Vec<Box<dyn TargetPreparer>>,

    /// The runnable test units.
    pub tests: Vec<Box<dyn TestUnit>>,

    /// The invocation-lifecycle listener chain.
    pub listeners: Vec<Arc<dyn RunListener>>,

    /// Host-log sink.
    pub log_saver: LogSaver,

    /// Retry-orchestration policy.
    pub retry_decision: RetryDecision,

    /// System health checkers.
    pub status_checkers: Vec<Box<dyn SystemStatusChecker>>,

    /// Cross-cutting metric collectors.
    pub metric_collectors: Vec<Box<dyn MetricCollector>>,

    /// This invocation's context (device builds, execution files).
    pub context: InvocationContext,
}

impl ShardConfig {
    /// Creates a configuration with the given name and defaults everywhere.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ConfigDescriptor::new(name),
            options: CommandOptions::default(),
            devices: Vec::new(),
            multi_preparers: Vec::new(),
            tests: Vec::new(),
            listeners: Vec::new(),
            log_saver: LogSaver::new(),
            retry_decision: RetryDecision::default(),
            status_checkers: Vec::new(),
            metric_collectors: Vec::new(),
            context: InvocationContext::new(),
        }
    }

    /// Produces the clone for shard `index` of `total`.
    ///
    /// Copies exactly the [`SHARD_PRIVATE_OBJECTS`] categories. The clone
    /// starts with an empty test list and listener chain (the orchestrator
    /// wires both), a unique host-log suffix, a cleared shard-count option
    /// (a shard must not re-shard), and an unsandboxed descriptor (only the
    /// parent runs sandboxed).
    pub fn clone_for_shard(&self, index: usize, total: usize) -> ShardConfig {
        let mut descriptor = self.descriptor.clone();
        descriptor.sandboxed = false;
        descriptor.host_log_suffix = Some(format!("shard_{index}_of_{total}"));

        let mut options = self.options.clone();
        options.shard_count = None;
        options.shard_index = Some(index);

        ShardConfig {
            descriptor,
            options,
            devices: self.devices.clone(),
            multi_preparers: self.multi_preparers.clone(),
            tests: Vec::new(),
            listeners: Vec::new(),
            log_saver: self.log_saver.clone(),
            retry_decision: self.retry_decision.clone(),
            status_checkers: self.status_checkers.clone(),
            metric_collectors: self.metric_collectors.clone(),
            context: self.context.clone(),
        }
    }

    /// Validates resolved options eagerly, before scheduling.
    ///
    /// Surfacing configuration errors here keeps them out of the middle of
    /// a run.
    pub fn validate_options(&self) -> anyhow::Result<()> {
        if self.devices.is_empty() {
            bail!(
                "configuration '{}' has no device slots",
                self.descriptor.name
            );
        }
        if self.options.recovery_window.is_zero() {
            bail!("recovery window must be non-zero");
        }
        // Zero shards would drop every unit without a report.
        if self.options.shard_count == Some(0) {
            bail!(
                "configuration '{}' requests zero shards",
                self.descriptor.name
            );
        }
        // A shard clone carries a host-log suffix; it must not re-shard.
        if self.descriptor.host_log_suffix.is_some() && self.options.shard_count.is_some() {
            bail!(
                "shard clone '{}' still carries a shard count",
                self.descriptor.name
            );
        }
        for test in &self.tests {
            let caps = test.capabilities();
            if caps.manages_collectors && !caps.collectors {
                bail!(
                    "unit '{}' manages collectors but does not accept them",
                    test.id()
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("descriptor", &self.descriptor)
            .field("options", &self.options)
            .field("devices", &self.devices)
            .field("tests", &self.tests.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_gets_suffix_and_cleared_shard_count() {
        let mut config = ShardConfig::new("parent");
        config.devices.push(DeviceConfig::new("device1"));
        config.options.shard_count = Some(4);
        config.descriptor.sandboxed = true;

        let shard = config.clone_for_shard(1, 4);

        assert_eq!(shard.descriptor.host_log_suffix.as_deref(), Some("shard_1_of_4"));
        assert!(shard.options.shard_count.is_none());
        assert_eq!(shard.options.shard_index, Some(1));
        assert!(!shard.descriptor.sandboxed);
        assert!(shard.tests.is_empty());
        assert!(shard.listeners.is_empty());
    }

    #[test]
    fn clone_scoped_log_savers_are_independent() {
        let mut config = ShardConfig::new("parent");
        config.devices.push(DeviceConfig::new("device1"));

        let first = config.clone_for_shard(0, 2);
        let second = config.clone_for_shard(1, 2);

        first.log_saver.save_log("host_log_shard_0");

        assert_eq!(first.log_saver.saved_logs(), vec!["host_log_shard_0"]);
        assert!(second.log_saver.saved_logs().is_empty());
        assert!(config.log_saver.saved_logs().is_empty());
    }

    #[test]
    fn validation_rejects_deviceless_configurations() {
        let config = ShardConfig::new("empty");
        assert!(config.validate_options().is_err());
    }

    #[test]
    fn validation_rejects_a_zero_shard_count() {
        let mut config = ShardConfig::new("parent");
        config.devices.push(DeviceConfig::new("device1"));
        config.options.shard_count = Some(0);

        assert!(config.validate_options().is_err());
    }

    #[test]
    fn validation_rejects_resharding_clones() {
        let mut config = ShardConfig::new("parent");
        config.devices.push(DeviceConfig::new("device1"));
        config.options.shard_count = Some(2);

        let mut shard = config.clone_for_shard(0, 2);
        shard.options.shard_count = Some(2);

        assert!(shard.validate_options().is_err());
    }

    #[test]
    fn allowlist_is_versioned_and_covers_the_clone_scoped_fields() {
        assert_eq!(SHARD_PRIVATE_OBJECTS_VERSION, 1);
        assert!(SHARD_PRIVATE_OBJECTS.contains(&"log_saver"));
        assert!(SHARD_PRIVATE_OBJECTS.contains(&"build_provider"));
        assert!(SHARD_PRIVATE_OBJECTS.contains(&"command_options"));
    }
}

//! The sharding orchestrator.
//!
//! [`ShardHelper`] turns one configuration holding N candidate units into
//! up to N independently scheduled shard invocations that drain a shared
//! pool:
//!
//! ```text
//!                 ┌────────────────────────────┐
//!                 │ parent ShardConfig         │
//!                 │   tests: [t1 t2 t3 t4 t5]  │
//!                 └─────────────┬──────────────┘
//!                        split + partition
//!                               │
//!            ┌─────────────┐    │    ┌─────────────┐
//!            │ generic pool│◄───┴───►│ token pool  │
//!            └──────┬──────┘         └──────┬──────┘
//!                   │   shared claims       │
//!         ┌─────────┼───────────────────────┼────────┐
//!         ▼         ▼                       ▼        ▼
//!      shard 0   shard 1       ...       shard k  (one poller each)
//!         │         │                       │        │
//!         └─────────┴───────── fan-in ──────┴────────┘
//!                               │
//!                     ShardResultForwarder
//!                               │
//!                      original listeners
//! ```
//!
//! Each shard is a clone of the parent configuration restricted to the
//! [`SHARD_PRIVATE_OBJECTS`](crate::harness::SHARD_PRIVATE_OBJECTS)
//! categories, carrying its own build-info view and exactly one test: a
//! [`PoolPoller`] over the shared pools (or, for static auto-sharding, one
//! candidate unit directly). The parent's test list is emptied once
//! sharding succeeds, signaling that the parent itself must not also run.

pub mod cloner;
pub mod forwarder;
pub mod poller;
pub mod pool;
pub mod replicate;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, TokenProviderRegistry};
use crate::harness::ShardConfig;
use crate::invocation::{ListenerChain, RunListener};
use crate::unit::{Injection, TestUnit};

pub use cloner::ShardBuildCloner;
pub use forwarder::{LastShardDetector, RunSummary, ShardResultForwarder};
pub use poller::PoolPoller;
pub use pool::{partition_token_units, CompletionLatch, UnitPool};
pub use replicate::ParentShardReplicate;

/// Errors surfaced while sharding a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// A shard clone failed eager option validation.
    #[error("shard '{name}' failed option validation: {source}")]
    Validation {
        /// Name of the offending shard configuration.
        name: String,
        /// The underlying validation failure.
        #[source]
        source: anyhow::Error,
    },

    /// The rescheduler refused a prepared shard.
    #[error("failed to reschedule shard {index}: {source}")]
    Reschedule {
        /// Index of the shard that could not be scheduled.
        index: usize,
        /// The underlying scheduling failure.
        #[source]
        source: anyhow::Error,
    },
}

/// Accepts a fully prepared shard configuration for independent execution.
///
/// Scheduling itself is outside the engine's scope; implementations hand
/// the shard to whatever actually runs invocations. `reschedule` must not
/// block on the shard finishing.
pub trait Rescheduler: Send + Sync {
    /// Schedules one prepared shard.
    fn reschedule(&self, config: ShardConfig) -> anyhow::Result<()>;
}

/// Decides whether and how to shard a configuration.
pub struct ShardHelper {
    registry: Arc<TokenProviderRegistry>,
}

impl ShardHelper {
    /// Creates a helper resolving token capabilities through `registry`.
    pub fn new(registry: Arc<TokenProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Shards `config`, scheduling each shard through `rescheduler`.
    ///
    /// Returns `Ok(false)` with the configuration untouched when no test
    /// declared itself shardable. On success the parent's test list is
    /// emptied (the parent must not also run) and its build providers are
    /// cleaned up.
    ///
    /// Any clone-wiring or validation fault aborts the attempt before a
    /// single shard reaches the rescheduler, with the parent's unit list
    /// restored. A rescheduler refusal aborts with the earlier shards
    /// already accepted; the latch accounting stays exact so running lanes
    /// still drain the shared pool, and units no lane can reach go back to
    /// the parent.
    pub fn shard_config(
        &self,
        config: &mut ShardConfig,
        rescheduler: &dyn Rescheduler,
    ) -> Result<bool, ShardError> {
        // Zero shards would silently drop every unit.
        if config.options.shard_count == Some(0) {
            return Err(ShardError::Validation {
                name: config.descriptor.name.clone(),
                source: anyhow::anyhow!("shard count must be non-zero"),
            });
        }
        if let Some(requested) = config.options.shard_count {
            ParentShardReplicate::replicate_shared_setup(config, requested);
        }

        let requested = config.options.shard_count;
        let Some(candidates) = split_candidates(&mut config.tests, requested) else {
            debug!(
                config = %config.descriptor.name,
                "no shardable test found, leaving configuration as-is"
            );
            return Ok(false);
        };

        // A shard never gets less than one candidate.
        let shard_count = match requested {
            Some(count) => count.min(candidates.len()),
            None => candidates.len(),
        };
        info!(
            config = %config.descriptor.name,
            candidates = candidates.len(),
            shards = shard_count,
            "sharding configuration"
        );

        let assignment = self.build_shard_tests(config, candidates, shard_count);
        self.schedule_shards(config, assignment, rescheduler)?;

        // The parent will not run; release its fetched builds.
        for device in &config.devices {
            if let Some(build) = config.context.build_for(&device.name) {
                device.build_provider.clean_up(build);
            }
        }
        config.tests.clear();
        Ok(true)
    }

    /// Produces the per-shard test lists: pooled pollers when an explicit
    /// count (or dynamic pooling) was requested, one unit per shard under
    /// pure static auto-sharding.
    fn build_shard_tests(
        &self,
        config: &ShardConfig,
        mut candidates: Vec<Box<dyn TestUnit>>,
        shard_count: usize,
    ) -> ShardAssignment {
        let options = &config.options;
        let pooled = options.shard_count.is_some() || options.dynamic_sharding;
        if !pooled {
            return ShardAssignment {
                shard_tests: candidates.into_iter().map(|unit| vec![unit]).collect(),
                generic_pool: None,
                token_pool: None,
                latch: None,
            };
        }

        // Shuffling keeps sub-units of one logical test from clustering in
        // lane order, which would make per-lane timing lumpy.
        if options.shard_count.is_some() {
            candidates.shuffle(&mut rand::thread_rng());
        }

        let (generic, token) = if options.token_sharding {
            let (generic, token) = partition_token_units(candidates);
            (generic, Some(token))
        } else {
            (candidates, None)
        };

        let generic_pool = Arc::new(UnitPool::from_units(generic));
        let token_pool = token.map(|units| Arc::new(UnitPool::from_units(units)));
        let latch = Arc::new(CompletionLatch::new(shard_count));

        let shard_tests = (0..shard_count)
            .map(|index| {
                let poller = PoolPoller::new(
                    index,
                    generic_pool.clone(),
                    token_pool.clone(),
                    latch.clone(),
                    self.registry.clone(),
                )
                .with_recovery_window(options.recovery_window)
                .with_reboot_on_recovery(options.reboot_on_recovery);
                vec![Box::new(poller) as Box<dyn TestUnit>]
            })
            .collect();

        ShardAssignment {
            shard_tests,
            generic_pool: Some(generic_pool),
            token_pool,
            latch: Some(latch),
        }
    }

    /// Clones, wires, validates, and schedules the shards.
    ///
    /// Two phases: every shard is constructed and validated before any is
    /// handed to the rescheduler, so a construction fault leaves no
    /// partial sharding behind.
    fn schedule_shards(
        &self,
        config: &mut ShardConfig,
        assignment: ShardAssignment,
        rescheduler: &dyn Rescheduler,
    ) -> Result<(), ShardError> {
        let ShardAssignment {
            shard_tests,
            generic_pool,
            token_pool,
            latch,
        } = assignment;
        let shard_count = shard_tests.len();
        let detector: Arc<LastShardDetector> = Arc::new(LastShardDetector::new(shard_count));

        // Shardable listeners are cloned per shard; the rest are retained
        // once behind the fan-in forwarder.
        let retained: Vec<Arc<dyn RunListener>> = config
            .listeners
            .iter()
            .filter(|listener| listener.for_shard().is_none())
            .cloned()
            .collect();
        let forwarder = Arc::new(ShardResultForwarder::new(shard_count, retained));

        // Phase one: construct and validate every shard.
        let mut pending = shard_tests;
        let mut prepared: Vec<ShardConfig> = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let mut shard = config.clone_for_shard(index, shard_count);
            shard.tests = std::mem::take(&mut pending[index]);
            for listener in &config.listeners {
                if let Some(clone) = listener.for_shard() {
                    shard.listeners.push(clone);
                }
            }
            shard.listeners.push(forwarder.clone());
            shard.listeners.push(detector.clone());

            ShardBuildCloner::clone_build_infos(&config.context, &mut shard);

            if let Err(source) = shard.validate_options() {
                let name = shard.descriptor.name.clone();
                prepared.push(shard);
                recover_units(
                    config,
                    prepared,
                    pending,
                    generic_pool.as_deref(),
                    token_pool.as_deref(),
                );
                return Err(ShardError::Validation { name, source });
            }
            prepared.push(shard);
        }

        // Phase two: every shard validated; hand them over.
        let mut queue = prepared.into_iter();
        let mut index = 0;
        while let Some(shard) = queue.next() {
            if let Err(source) = rescheduler.reschedule(shard) {
                let unscheduled: Vec<ShardConfig> = queue.collect();
                error!(
                    index,
                    unscheduled = unscheduled.len(),
                    "rescheduler refused a shard, aborting the attempt"
                );
                if let Some(latch) = &latch {
                    // The refused shard and everything after never run;
                    // arriving for each keeps the latch exact for the
                    // lanes already accepted. If no lane is running (or
                    // our arrival was the last), the pool's units go back
                    // to the parent.
                    let mut observed_zero = false;
                    for _ in 0..=unscheduled.len() {
                        observed_zero |= latch.arrive();
                    }
                    if index == 0 || observed_zero {
                        recover_units(
                            config,
                            Vec::new(),
                            Vec::new(),
                            generic_pool.as_deref(),
                            token_pool.as_deref(),
                        );
                    }
                } else {
                    recover_units(config, unscheduled, Vec::new(), None, None);
                }
                return Err(ShardError::Reschedule { index, source });
            }
            index += 1;
        }

        config.listeners.push(detector);
        Ok(())
    }
}

/// Per-shard test lists plus, on pooled paths, the shared machinery
/// backing them.
struct ShardAssignment {
    shard_tests: Vec<Vec<Box<dyn TestUnit>>>,
    generic_pool: Option<Arc<UnitPool>>,
    token_pool: Option<Arc<UnitPool>>,
    latch: Option<Arc<CompletionLatch>>,
}

/// Returns unscheduled units to the parent's test list.
///
/// On pooled paths the real units live in the shared pools (the shard
/// configs only carry pollers), so the pools are drained; on static paths
/// the units sit in the shard configs and pending lists directly.
fn recover_units(
    config: &mut ShardConfig,
    shards: Vec<ShardConfig>,
    pending: Vec<Vec<Box<dyn TestUnit>>>,
    generic_pool: Option<&UnitPool>,
    token_pool: Option<&UnitPool>,
) {
    if let Some(pool) = generic_pool {
        while let Some(unit) = pool.take_next() {
            config.tests.push(unit);
        }
        if let Some(pool) = token_pool {
            while let Some(unit) = pool.take_next() {
                config.tests.push(unit);
            }
        }
        return;
    }
    for mut shard in shards {
        config.tests.append(&mut shard.tests);
    }
    for mut tests in pending {
        config.tests.append(&mut tests);
    }
}

/// Splits every shardable test into its sub-units.
///
/// Returns `None` (leaving `tests` untouched) when nothing split; otherwise
/// drains `tests` and returns the full candidate list, with unsplittable
/// units carried through unsplit.
fn split_candidates(
    tests: &mut Vec<Box<dyn TestUnit>>,
    shard_hint: Option<usize>,
) -> Option<Vec<Box<dyn TestUnit>>> {
    if !tests.iter().any(|test| test.split(shard_hint).is_some()) {
        return None;
    }
    let mut candidates = Vec::new();
    for test in tests.drain(..) {
        match test.split(shard_hint) {
            Some(sub_units) => candidates.extend(sub_units),
            None => candidates.push(test),
        }
    }
    Some(candidates)
}

/// Runs prepared shards on local tokio tasks.
///
/// The in-process stand-in for a real harness scheduler, used for
/// local/virtual multi-device emulation. Each rescheduled shard becomes one
/// task that injects a device from the configured pool, runs the shard's
/// tests sequentially, and emits the invocation lifecycle around them.
pub struct LocalRescheduler {
    devices: Mutex<Vec<Arc<dyn DeviceHandle>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalRescheduler {
    /// Creates a rescheduler with no devices to hand out.
    pub fn new() -> Self {
        Self::with_devices(Vec::new())
    }

    /// Creates a rescheduler assigning one device per shard from `devices`.
    pub fn with_devices(devices: Vec<Arc<dyn DeviceHandle>>) -> Self {
        Self {
            devices: Mutex::new(devices),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Waits for every rescheduled shard to finish.
    pub async fn wait_all(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("rescheduler handle lock");
            guard.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "shard task panicked");
            }
        }
    }
}

impl Default for LocalRescheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Rescheduler for LocalRescheduler {
    fn reschedule(&self, mut config: ShardConfig) -> anyhow::Result<()> {
        let device = self.devices.lock().expect("rescheduler device lock").pop();
        let handle = tokio::spawn(async move {
            let chain = ListenerChain::new(std::mem::take(&mut config.listeners));
            let start = Instant::now();
            chain.invocation_started(&config.context).await;
            for test in &mut config.tests {
                let caps = test.capabilities();
                let mut injection = Injection::default();
                if caps.build_info {
                    injection.build_info = config.context.primary_build().cloned();
                }
                if caps.device {
                    injection.device = device.clone();
                }
                if caps.invocation_context {
                    injection.context = Some(config.context.clone());
                }
                if caps.collectors {
                    injection.collectors = config.metric_collectors.clone();
                }
                test.inject(injection);
                if let Err(e) = test.run(&chain).await {
                    warn!(
                        shard = ?config.descriptor.host_log_suffix,
                        test = test.id(),
                        error = %e,
                        "shard test exited with an error"
                    );
                }
            }
            chain.invocation_ended(start.elapsed()).await;
        });
        self.handles
            .lock()
            .expect("rescheduler handle lock")
            .push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::build::{BuildInfo, BuildProvider, BuildResult};
    use crate::device::testutil::FakeDevice;
    use crate::harness::DeviceConfig;
    use crate::invocation::InvocationContext;
    use crate::unit::UnitResult;

    /// A suite splitting into `cases` passing sub-units.
    struct SuiteUnit {
        id: String,
        cases: usize,
    }

    impl SuiteUnit {
        fn boxed(id: &str, cases: usize) -> Box<dyn TestUnit> {
            Box::new(Self {
                id: id.to_string(),
                cases,
            })
        }
    }

    #[async_trait]
    impl TestUnit for SuiteUnit {
        fn id(&self) -> &str {
            &self.id
        }

        fn split(&self, _shard_hint: Option<usize>) -> Option<Vec<Box<dyn TestUnit>>> {
            Some(
                (0..self.cases)
                    .map(|case| CaseUnit::boxed(&format!("{}#{case}", self.id)))
                    .collect(),
            )
        }

        async fn run(&mut self, listener: &dyn crate::invocation::RunListener) -> UnitResult<()> {
            listener.unit_passed(&self.id).await;
            Ok(())
        }
    }

    struct CaseUnit {
        id: String,
    }

    impl CaseUnit {
        fn boxed(id: &str) -> Box<dyn TestUnit> {
            Box::new(Self { id: id.to_string() })
        }
    }

    #[async_trait]
    impl TestUnit for CaseUnit {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&mut self, listener: &dyn crate::invocation::RunListener) -> UnitResult<()> {
            listener.unit_passed(&self.id).await;
            Ok(())
        }
    }

    /// Collects rescheduled shards instead of running them.
    #[derive(Default)]
    struct CapturingRescheduler {
        shards: StdMutex<Vec<ShardConfig>>,
    }

    impl Rescheduler for CapturingRescheduler {
        fn reschedule(&self, config: ShardConfig) -> anyhow::Result<()> {
            self.shards.lock().unwrap().push(config);
            Ok(())
        }
    }

    fn helper() -> ShardHelper {
        ShardHelper::new(Arc::new(TokenProviderRegistry::new()))
    }

    fn sharded_config(shard_count: Option<usize>) -> ShardConfig {
        let mut config = ShardConfig::new("parent");
        config.devices.push(DeviceConfig::new("device1"));
        config.options.shard_count = shard_count;
        config
    }

    #[test]
    fn unsplittable_tests_mean_no_sharding() {
        let mut config = sharded_config(Some(4));
        config.tests.push(CaseUnit::boxed("solo"));
        let rescheduler = CapturingRescheduler::default();

        let sharded = helper().shard_config(&mut config, &rescheduler).unwrap();

        assert!(!sharded);
        assert_eq!(config.tests.len(), 1, "test list untouched");
        assert!(rescheduler.shards.lock().unwrap().is_empty());
    }

    #[test]
    fn shard_count_is_capped_to_the_candidate_count() {
        let mut config = sharded_config(Some(10));
        config.tests.push(SuiteUnit::boxed("suite", 6));
        let rescheduler = CapturingRescheduler::default();

        let sharded = helper().shard_config(&mut config, &rescheduler).unwrap();

        assert!(sharded);
        let shards = rescheduler.shards.lock().unwrap();
        assert_eq!(shards.len(), 6, "never more shards than candidates");
    }

    #[test]
    fn pooled_shards_carry_one_poller_each() {
        let mut config = sharded_config(Some(2));
        config.tests.push(SuiteUnit::boxed("suite", 5));
        let rescheduler = CapturingRescheduler::default();

        helper().shard_config(&mut config, &rescheduler).unwrap();

        let shards = rescheduler.shards.lock().unwrap();
        assert_eq!(shards.len(), 2);
        for (index, shard) in shards.iter().enumerate() {
            assert_eq!(shard.tests.len(), 1);
            assert_eq!(
                shard.descriptor.host_log_suffix.as_deref(),
                Some(format!("shard_{index}_of_2").as_str())
            );
            assert!(shard.options.shard_count.is_none(), "shards must not re-shard");
            assert!(!shard.descriptor.sandboxed);
        }
        assert!(config.tests.is_empty(), "parent test list emptied");
    }

    #[test]
    fn static_auto_sharding_wraps_each_candidate_directly() {
        let mut config = sharded_config(None);
        config.tests.push(SuiteUnit::boxed("suite", 3));
        let rescheduler = CapturingRescheduler::default();

        helper().shard_config(&mut config, &rescheduler).unwrap();

        let shards = rescheduler.shards.lock().unwrap();
        assert_eq!(shards.len(), 3);
        let mut ids: Vec<_> = shards
            .iter()
            .map(|shard| shard.tests[0].id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["suite#0", "suite#1", "suite#2"]);
    }

    struct CountingProvider {
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BuildProvider for CountingProvider {
        async fn fetch(&self) -> BuildResult<BuildInfo> {
            Ok(BuildInfo::new("counted"))
        }

        fn clean_up(&self, _build: &BuildInfo) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }

        fn clone_boxed(&self) -> Box<dyn BuildProvider> {
            Box::new(Self {
                cleanups: self.cleanups.clone(),
            })
        }
    }

    #[test]
    fn parent_build_providers_are_cleaned_up_after_sharding() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut config = sharded_config(Some(2));
        config.devices[0] = DeviceConfig::new("device1").with_build_provider(Box::new(
            CountingProvider {
                cleanups: cleanups.clone(),
            },
        ));
        config
            .context
            .add_device_build("device1", BuildInfo::new("12345"));
        config.tests.push(SuiteUnit::boxed("suite", 4));
        let rescheduler = CapturingRescheduler::default();

        helper().shard_config(&mut config, &rescheduler).unwrap();

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        // Shards got existing-artifact providers, not the parent's.
        let shards = rescheduler.shards.lock().unwrap();
        assert_eq!(
            shards[0]
                .context
                .build_for("device1")
                .map(BuildInfo::build_id),
            Some("12345")
        );
    }

    struct ShardableListener {
        clones: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::invocation::RunListener for ShardableListener {
        fn for_shard(&self) -> Option<Arc<dyn RunListener>> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(crate::invocation::NullListener))
        }
    }

    #[test]
    fn shardable_listeners_are_cloned_into_every_shard() {
        let clones = Arc::new(AtomicUsize::new(0));
        let mut config = sharded_config(Some(3));
        config.listeners.push(Arc::new(ShardableListener {
            clones: clones.clone(),
        }));
        config.tests.push(SuiteUnit::boxed("suite", 9));
        let rescheduler = CapturingRescheduler::default();

        helper().shard_config(&mut config, &rescheduler).unwrap();

        // One call during retention filtering, one per shard wiring pass.
        assert!(clones.load(Ordering::SeqCst) >= 3);
        let shards = rescheduler.shards.lock().unwrap();
        for shard in shards.iter() {
            // Shardable clone + forwarder + detector.
            assert_eq!(shard.listeners.len(), 3);
        }
    }

    struct FailingRescheduler;

    impl Rescheduler for FailingRescheduler {
        fn reschedule(&self, _config: ShardConfig) -> anyhow::Result<()> {
            anyhow::bail!("scheduler queue full")
        }
    }

    #[test]
    fn reschedule_failure_aborts_the_attempt() {
        let mut config = sharded_config(Some(2));
        config.tests.push(SuiteUnit::boxed("suite", 4));

        let result = helper().shard_config(&mut config, &FailingRescheduler);

        assert!(matches!(
            result,
            Err(ShardError::Reschedule { index: 0, .. })
        ));
        assert_eq!(config.tests.len(), 4, "pooled units returned to the parent");
    }

    #[test]
    fn zero_shard_count_is_rejected_up_front() {
        let mut config = sharded_config(Some(0));
        config.tests.push(SuiteUnit::boxed("suite", 4));
        let rescheduler = CapturingRescheduler::default();

        let result = helper().shard_config(&mut config, &rescheduler);

        assert!(matches!(result, Err(ShardError::Validation { .. })));
        assert_eq!(config.tests.len(), 1, "test list untouched");
        assert!(rescheduler.shards.lock().unwrap().is_empty());
    }

    /// A suite whose middle sub-unit declares contradictory capabilities.
    struct MixedSuite;

    struct BadCapsUnit;

    #[async_trait]
    impl TestUnit for BadCapsUnit {
        fn id(&self) -> &str {
            "bad-caps"
        }

        fn capabilities(&self) -> crate::unit::UnitCapabilities {
            crate::unit::UnitCapabilities {
                manages_collectors: true,
                ..Default::default()
            }
        }

        async fn run(&mut self, _listener: &dyn crate::invocation::RunListener) -> UnitResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TestUnit for MixedSuite {
        fn id(&self) -> &str {
            "mixed-suite"
        }

        fn split(&self, _shard_hint: Option<usize>) -> Option<Vec<Box<dyn TestUnit>>> {
            Some(vec![
                CaseUnit::boxed("good-0"),
                Box::new(BadCapsUnit),
                CaseUnit::boxed("good-1"),
            ])
        }

        async fn run(&mut self, _listener: &dyn crate::invocation::RunListener) -> UnitResult<()> {
            Ok(())
        }
    }

    #[test]
    fn validation_failure_on_a_later_shard_schedules_nothing() {
        let mut config = sharded_config(None);
        config.tests.push(Box::new(MixedSuite));
        let rescheduler = CapturingRescheduler::default();

        let result = helper().shard_config(&mut config, &rescheduler);

        assert!(matches!(result, Err(ShardError::Validation { .. })));
        assert!(
            rescheduler.shards.lock().unwrap().is_empty(),
            "earlier shards must not have been handed out"
        );
        assert_eq!(config.tests.len(), 3, "every candidate returned to the parent");
    }

    /// Accepts the first `accept` shards, refuses the rest.
    struct RefusingAfter {
        accept: usize,
        accepted: StdMutex<Vec<ShardConfig>>,
    }

    impl RefusingAfter {
        fn new(accept: usize) -> Self {
            Self {
                accept,
                accepted: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Rescheduler for RefusingAfter {
        fn reschedule(&self, config: ShardConfig) -> anyhow::Result<()> {
            let mut accepted = self.accepted.lock().unwrap();
            if accepted.len() >= self.accept {
                anyhow::bail!("scheduler queue full");
            }
            accepted.push(config);
            Ok(())
        }
    }

    #[test]
    fn static_reschedule_failure_restores_unscheduled_units() {
        let mut config = sharded_config(None);
        config.tests.push(SuiteUnit::boxed("suite", 3));
        let rescheduler = RefusingAfter::new(1);

        let result = helper().shard_config(&mut config, &rescheduler);

        assert!(matches!(
            result,
            Err(ShardError::Reschedule { index: 1, .. })
        ));
        // The refused shard's unit is consumed by the refusal; the shard
        // after it comes back to the parent.
        assert_eq!(config.tests.len(), 1);
    }

    #[tokio::test]
    async fn reschedule_failure_on_a_later_shard_keeps_work_accounted() {
        struct TokenCase {
            id: String,
            tokens: Vec<crate::unit::Token>,
        }

        #[async_trait]
        impl TestUnit for TokenCase {
            fn id(&self) -> &str {
                &self.id
            }

            fn required_tokens(&self) -> &[crate::unit::Token] {
                &self.tokens
            }

            async fn run(
                &mut self,
                listener: &dyn crate::invocation::RunListener,
            ) -> UnitResult<()> {
                listener.unit_passed(&self.id).await;
                Ok(())
            }
        }

        struct BigTokenSuite;

        #[async_trait]
        impl TestUnit for BigTokenSuite {
            fn id(&self) -> &str {
                "big-token-suite"
            }

            fn split(&self, _shard_hint: Option<usize>) -> Option<Vec<Box<dyn TestUnit>>> {
                let mut units: Vec<Box<dyn TestUnit>> = (0..5)
                    .map(|case| {
                        Box::new(TokenCase {
                            id: format!("generic-{case}"),
                            tokens: Vec::new(),
                        }) as Box<dyn TestUnit>
                    })
                    .collect();
                units.push(Box::new(TokenCase {
                    id: "sim-case".to_string(),
                    tokens: vec![crate::unit::Token::SimCard],
                }));
                Some(units)
            }

            async fn run(
                &mut self,
                _listener: &dyn crate::invocation::RunListener,
            ) -> UnitResult<()> {
                Ok(())
            }
        }

        #[derive(Default)]
        struct OutcomeListener {
            passed: AtomicUsize,
            skipped: StdMutex<Vec<String>>,
        }

        #[async_trait]
        impl crate::invocation::RunListener for OutcomeListener {
            async fn unit_passed(&self, _unit_id: &str) {
                self.passed.fetch_add(1, Ordering::SeqCst);
            }

            async fn unit_not_executed(&self, _unit_id: &str, reason: &str) {
                self.skipped.lock().unwrap().push(reason.to_string());
            }
        }

        let listener = Arc::new(OutcomeListener::default());
        let mut config = sharded_config(Some(2));
        config.options.token_sharding = true;
        config.options.recovery_window = Duration::from_millis(50);
        config.listeners.push(listener.clone());
        config.tests.push(Box::new(BigTokenSuite));

        let rescheduler = RefusingAfter::new(1);
        let result = helper().shard_config(&mut config, &rescheduler);
        assert!(matches!(
            result,
            Err(ShardError::Reschedule { index: 1, .. })
        ));

        // The accepted lane still runs and must drain the whole pool,
        // reporting the unit no device can service.
        let mut shard = rescheduler.accepted.lock().unwrap().remove(0);
        let mut test = shard.tests.remove(0);
        test.inject(Injection {
            device: Some(Arc::new(FakeDevice::new("SERIAL-A")) as Arc<dyn DeviceHandle>),
            ..Default::default()
        });
        let chain = ListenerChain::new(std::mem::take(&mut shard.listeners));
        test.run(&chain).await.unwrap();

        assert_eq!(listener.passed.load(Ordering::SeqCst), 5);
        let skipped = listener.skipped.lock().unwrap();
        assert_eq!(skipped.len(), 1);
        assert!(
            skipped[0].contains("no token 'SIM'"),
            "reason was: {}",
            skipped[0]
        );
    }

    #[derive(Default)]
    struct SummaryListener {
        passed: AtomicUsize,
        started: AtomicUsize,
        ended: AtomicUsize,
    }

    #[async_trait]
    impl crate::invocation::RunListener for SummaryListener {
        async fn invocation_started(&self, _context: &InvocationContext) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn unit_passed(&self, _unit_id: &str) {
            self.passed.fetch_add(1, Ordering::SeqCst);
        }

        async fn invocation_ended(&self, _elapsed: Duration) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn end_to_end_pooled_run_reports_one_merged_invocation() {
        let listener = Arc::new(SummaryListener::default());
        let mut config = sharded_config(Some(2));
        config.options.recovery_window = Duration::from_millis(50);
        config.listeners.push(listener.clone());
        config.tests.push(SuiteUnit::boxed("suite", 8));

        let rescheduler = LocalRescheduler::with_devices(vec![
            Arc::new(FakeDevice::new("SERIAL-A")),
            Arc::new(FakeDevice::new("SERIAL-B")),
        ]);
        let sharded = helper().shard_config(&mut config, &rescheduler).unwrap();
        assert!(sharded);
        rescheduler.wait_all().await;

        assert_eq!(listener.passed.load(Ordering::SeqCst), 8, "all cases ran");
        assert_eq!(listener.started.load(Ordering::SeqCst), 1, "single started");
        assert_eq!(listener.ended.load(Ordering::SeqCst), 1, "single ended");
    }

    #[tokio::test]
    async fn end_to_end_token_run_reports_the_unserviceable_unit() {
        struct TokenCase {
            id: String,
            tokens: Vec<crate::unit::Token>,
        }

        #[async_trait]
        impl TestUnit for TokenCase {
            fn id(&self) -> &str {
                &self.id
            }

            fn required_tokens(&self) -> &[crate::unit::Token] {
                &self.tokens
            }

            async fn run(
                &mut self,
                listener: &dyn crate::invocation::RunListener,
            ) -> UnitResult<()> {
                listener.unit_passed(&self.id).await;
                Ok(())
            }
        }

        struct TokenSuite;

        #[async_trait]
        impl TestUnit for TokenSuite {
            fn id(&self) -> &str {
                "token-suite"
            }

            fn split(&self, _shard_hint: Option<usize>) -> Option<Vec<Box<dyn TestUnit>>> {
                Some(vec![
                    Box::new(TokenCase {
                        id: "generic-case".to_string(),
                        tokens: Vec::new(),
                    }),
                    Box::new(TokenCase {
                        id: "sim-case".to_string(),
                        tokens: vec![crate::unit::Token::SimCard],
                    }),
                ])
            }

            async fn run(
                &mut self,
                _listener: &dyn crate::invocation::RunListener,
            ) -> UnitResult<()> {
                Ok(())
            }
        }

        #[derive(Default)]
        struct SkipListener {
            reasons: StdMutex<Vec<String>>,
        }

        #[async_trait]
        impl crate::invocation::RunListener for SkipListener {
            async fn unit_not_executed(&self, _unit_id: &str, reason: &str) {
                self.reasons.lock().unwrap().push(reason.to_string());
            }
        }

        let listener = Arc::new(SkipListener::default());
        let mut config = sharded_config(Some(2));
        config.options.token_sharding = true;
        config.options.recovery_window = Duration::from_millis(50);
        config.listeners.push(listener.clone());
        config.tests.push(Box::new(TokenSuite));

        // No token provider registered: the SIM unit can never run.
        let rescheduler = LocalRescheduler::with_devices(vec![
            Arc::new(FakeDevice::new("SERIAL-A")),
            Arc::new(FakeDevice::new("SERIAL-B")),
        ]);
        helper().shard_config(&mut config, &rescheduler).unwrap();
        rescheduler.wait_all().await;

        let reasons = listener.reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("no token 'SIM'"), "reason was: {}", reasons[0]);
    }
}

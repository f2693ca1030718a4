//! Invocation context and the listener chain.
//!
//! Every invocation, the parent and each shard alike, carries an
//! [`InvocationContext`]: the per-device build-info map, shared
//! execution-file paths, and free-form attributes. Shards get their own
//! cloned context so concurrent mutation never crosses lanes.
//!
//! Results flow through [`RunListener`], the standard invocation-lifecycle
//! sink. Several listeners compose into one via [`ListenerChain`], the same
//! way the result forwarder fans shard streams back into the original
//! listener set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::{artifact, BuildInfo};

/// Keys for execution-file path entries shared across an invocation.
///
/// These entries commonly point into the primary build's artifact tree;
/// the build cloner re-links them so path-equality checks keep holding
/// against the shard's own build-info view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFileKey {
    /// Root of the extracted tests directory.
    TestsDirectory,
    /// Host-side test tree.
    HostTestsDirectory,
    /// Target-side test tree.
    TargetTestsDirectory,
}

impl ExecutionFileKey {
    /// All keys, in a fixed order.
    pub const ALL: [ExecutionFileKey; 3] = [
        ExecutionFileKey::TestsDirectory,
        ExecutionFileKey::HostTestsDirectory,
        ExecutionFileKey::TargetTestsDirectory,
    ];

    /// The build-info artifact key this entry mirrors.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            ExecutionFileKey::TestsDirectory => artifact::TESTS_DIR,
            ExecutionFileKey::HostTestsDirectory => artifact::HOST_TESTS,
            ExecutionFileKey::TargetTestsDirectory => artifact::TARGET_TESTS,
        }
    }
}

/// Per-invocation state: device builds, execution files, attributes.
///
/// Device order is preserved; the first registered device is the *primary*
/// device, whose build anchors the shared execution-file entries.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    invocation_id: String,
    device_names: Vec<String>,
    builds: HashMap<String, BuildInfo>,
    execution_files: HashMap<ExecutionFileKey, PathBuf>,
    attributes: HashMap<String, String>,
}

impl InvocationContext {
    /// Creates an empty context with a fresh invocation id.
    pub fn new() -> Self {
        Self {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            device_names: Vec::new(),
            builds: HashMap::new(),
            execution_files: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// The unique id of this invocation.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Registers (or replaces) the build fetched for a device.
    pub fn add_device_build(&mut self, device_name: impl Into<String>, build: BuildInfo) {
        let name = device_name.into();
        if !self.builds.contains_key(&name) {
            self.device_names.push(name.clone());
        }
        self.builds.insert(name, build);
    }

    /// The build registered for a device, if any.
    pub fn build_for(&self, device_name: &str) -> Option<&BuildInfo> {
        self.builds.get(device_name)
    }

    /// Device-name/build pairs in registration order.
    pub fn builds(&self) -> impl Iterator<Item = (&str, &BuildInfo)> {
        self.device_names
            .iter()
            .filter_map(|name| self.builds.get(name).map(|build| (name.as_str(), build)))
    }

    /// The primary (first-registered) device's build.
    pub fn primary_build(&self) -> Option<&BuildInfo> {
        self.device_names
            .first()
            .and_then(|name| self.builds.get(name))
    }

    /// Sets a shared execution-file entry.
    pub fn set_execution_file(&mut self, key: ExecutionFileKey, path: impl Into<PathBuf>) {
        self.execution_files.insert(key, path.into());
    }

    /// Looks up a shared execution-file entry.
    pub fn execution_file(&self, key: ExecutionFileKey) -> Option<&Path> {
        self.execution_files.get(&key).map(PathBuf::as_path)
    }

    /// Sets a free-form invocation attribute.
    pub fn add_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Looks up an invocation attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives invocation-lifecycle events.
///
/// Units report per-test results through the listener they are handed;
/// the engine adds `unit_not_executed` for work that never got to run.
/// Result completeness (account for every submitted unit) is a hard
/// guarantee of the sharding engine.
#[async_trait]
pub trait RunListener: Send + Sync {
    /// The invocation has started.
    async fn invocation_started(&self, _context: &InvocationContext) {}

    /// A unit has been claimed and is about to execute.
    async fn unit_started(&self, _unit_id: &str) {}

    /// A unit finished successfully.
    async fn unit_passed(&self, _unit_id: &str) {}

    /// A unit finished with a failure.
    async fn unit_failed(&self, _unit_id: &str, _message: &str) {}

    /// A unit never got to run; `reason` explains why.
    async fn unit_not_executed(&self, _unit_id: &str, _reason: &str) {}

    /// The invocation has ended.
    async fn invocation_ended(&self, _elapsed: Duration) {}

    /// Produces a per-shard clone of this listener.
    ///
    /// Returns `None` for non-shardable listeners, which are then retained
    /// once at the result aggregator instead of being cloned into every
    /// shard's chain.
    fn for_shard(&self) -> Option<Arc<dyn RunListener>> {
        None
    }
}

#[async_trait]
impl<T: RunListener + ?Sized> RunListener for Arc<T> {
    async fn invocation_started(&self, context: &InvocationContext) {
        (**self).invocation_started(context).await;
    }

    async fn unit_started(&self, unit_id: &str) {
        (**self).unit_started(unit_id).await;
    }

    async fn unit_passed(&self, unit_id: &str) {
        (**self).unit_passed(unit_id).await;
    }

    async fn unit_failed(&self, unit_id: &str, message: &str) {
        (**self).unit_failed(unit_id, message).await;
    }

    async fn unit_not_executed(&self, unit_id: &str, reason: &str) {
        (**self).unit_not_executed(unit_id, reason).await;
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        (**self).invocation_ended(elapsed).await;
    }

    fn for_shard(&self) -> Option<Arc<dyn RunListener>> {
        (**self).for_shard()
    }
}

/// A listener that does nothing (for tests or when output is not needed).
pub struct NullListener;

#[async_trait]
impl RunListener for NullListener {}

/// Fans one event stream out to several listeners.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shardpool::invocation::{ListenerChain, NullListener, RunListener};
///
/// let chain = ListenerChain::new(vec![Arc::new(NullListener) as Arc<dyn RunListener>]);
/// assert_eq!(chain.len(), 1);
/// ```
pub struct ListenerChain {
    listeners: Vec<Arc<dyn RunListener>>,
}

impl ListenerChain {
    /// Creates a chain over the given listeners.
    pub fn new(listeners: Vec<Arc<dyn RunListener>>) -> Self {
        Self { listeners }
    }

    /// Appends a listener to the chain.
    pub fn push(&mut self, listener: Arc<dyn RunListener>) {
        self.listeners.push(listener);
    }

    /// Number of listeners in the chain.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns `true` if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl RunListener for ListenerChain {
    async fn invocation_started(&self, context: &InvocationContext) {
        for listener in &self.listeners {
            listener.invocation_started(context).await;
        }
    }

    async fn unit_started(&self, unit_id: &str) {
        for listener in &self.listeners {
            listener.unit_started(unit_id).await;
        }
    }

    async fn unit_passed(&self, unit_id: &str) {
        for listener in &self.listeners {
            listener.unit_passed(unit_id).await;
        }
    }

    async fn unit_failed(&self, unit_id: &str, message: &str) {
        for listener in &self.listeners {
            listener.unit_failed(unit_id, message).await;
        }
    }

    async fn unit_not_executed(&self, unit_id: &str, reason: &str) {
        for listener in &self.listeners {
            listener.unit_not_executed(unit_id, reason).await;
        }
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        for listener in &self.listeners {
            listener.invocation_ended(elapsed).await;
        }
    }
}

/// A cross-cutting metric collector.
///
/// Collectors are clone-scoped per shard. The poller wraps every unit
/// execution with the start/end hooks, unless the unit declares that it
/// manages its own collector wiring.
pub trait MetricCollector: Send + Sync {
    /// Collector name, for logging.
    fn name(&self) -> &str;

    /// A unit is about to execute.
    fn on_unit_start(&self, _unit_id: &str) {}

    /// A unit finished executing (any outcome).
    fn on_unit_end(&self, _unit_id: &str) {}

    /// Clones this collector behind a box.
    fn clone_boxed(&self) -> Box<dyn MetricCollector>;
}

impl Clone for Box<dyn MetricCollector> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn primary_build_is_the_first_registered() {
        let mut context = InvocationContext::new();
        context.add_device_build("device1", BuildInfo::new("100"));
        context.add_device_build("device2", BuildInfo::new("200"));

        assert_eq!(context.primary_build().unwrap().build_id(), "100");
        let names: Vec<_> = context.builds().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["device1", "device2"]);
    }

    #[test]
    fn re_registering_a_device_replaces_its_build() {
        let mut context = InvocationContext::new();
        context.add_device_build("device1", BuildInfo::new("100"));
        context.add_device_build("device1", BuildInfo::new("101"));

        assert_eq!(context.builds().count(), 1);
        assert_eq!(context.build_for("device1").unwrap().build_id(), "101");
    }

    struct CountingListener {
        passed: AtomicUsize,
    }

    #[async_trait]
    impl RunListener for CountingListener {
        async fn unit_passed(&self, _unit_id: &str) {
            self.passed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn chain_fans_out_to_every_listener() {
        let first = Arc::new(CountingListener {
            passed: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingListener {
            passed: AtomicUsize::new(0),
        });
        let chain = ListenerChain::new(vec![
            first.clone() as Arc<dyn RunListener>,
            second.clone() as Arc<dyn RunListener>,
        ]);

        chain.unit_passed("unit-1").await;

        assert_eq!(first.passed.load(Ordering::SeqCst), 1);
        assert_eq!(second.passed.load(Ordering::SeqCst), 1);
    }
}

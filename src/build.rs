//! Build-info handles and build providers.
//!
//! A [`BuildInfo`] is an opaque handle to a set of already-downloaded build
//! artifacts: a build id plus keyed file paths. The sharding engine never
//! downloads anything itself: it only clones references so each shard gets
//! an independent build-info view, and swaps in providers that hand back
//! existing artifacts without re-fetching.
//!
//! | Provider | Behavior |
//! |----------|----------|
//! | [`ExistingBuildProvider`] | Returns a pre-cloned build untouched |
//! | [`StubBuildProvider`] | Returns an empty placeholder build |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for build-provider operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors that can occur while providing build artifacts.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The provider could not produce a build.
    #[error("failed to fetch build: {0}")]
    FetchFailed(String),

    /// Other build-related errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Well-known artifact file keys shared across the harness.
pub mod artifact {
    /// Root of the extracted tests directory.
    pub const TESTS_DIR: &str = "tests_dir";
    /// Host-side test tree.
    pub const HOST_TESTS: &str = "host_tests";
    /// Target-side test tree.
    pub const TARGET_TESTS: &str = "target_tests";
}

/// A value handle to downloaded build artifacts.
///
/// Cloning a `BuildInfo` is a shallow value clone: the artifact files on
/// disk are shared, only the reference map is copied. This is exactly what
/// per-shard isolation needs: independent mutable views over the same
/// already-downloaded files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    build_id: String,
    branch: Option<String>,
    files: HashMap<String, PathBuf>,
    attributes: HashMap<String, String>,
}

impl BuildInfo {
    /// Creates a build-info handle for the given build id.
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            branch: None,
            files: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// Sets the source branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Adds an artifact file under the given key.
    pub fn with_file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(name.into(), path.into());
        self
    }

    /// The build id.
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// The source branch, if known.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Looks up an artifact file by key.
    pub fn file(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    /// Replaces or inserts an artifact file.
    pub fn set_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.insert(name.into(), path.into());
    }

    /// Looks up a build attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Sets a build attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }
}

/// Supplies build artifacts to an invocation.
///
/// The engine installs stand-in providers on shard configurations so that
/// shards never re-trigger expensive downloads; the real downloading
/// provider only ever runs in the parent.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Produces the build for this invocation.
    async fn fetch(&self) -> BuildResult<BuildInfo>;

    /// Releases resources associated with a fetched build.
    ///
    /// Called on the parent's providers once sharding succeeds, since the
    /// parent itself will not run. Default is a no-op.
    fn clean_up(&self, _build: &BuildInfo) {}

    /// Clones this provider behind a box.
    fn clone_boxed(&self) -> Box<dyn BuildProvider>;
}

impl Clone for Box<dyn BuildProvider> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// A provider that returns a pre-cloned build untouched.
///
/// Installed on every shard's device configuration by the build cloner:
/// when the shard's invocation asks to "fetch", it gets the already-cloned
/// build-info back, guaranteeing no redundant download or copy.
#[derive(Debug, Clone)]
pub struct ExistingBuildProvider {
    build: BuildInfo,
}

impl ExistingBuildProvider {
    /// Wraps an already-fetched build.
    pub fn new(build: BuildInfo) -> Self {
        Self { build }
    }
}

#[async_trait]
impl BuildProvider for ExistingBuildProvider {
    async fn fetch(&self) -> BuildResult<BuildInfo> {
        Ok(self.build.clone())
    }

    fn clone_boxed(&self) -> Box<dyn BuildProvider> {
        Box::new(self.clone())
    }
}

/// A no-op provider returning an empty placeholder build.
///
/// Installed on replicated device slots, whose real build comes from the
/// primary device's fetch.
#[derive(Debug, Clone, Default)]
pub struct StubBuildProvider;

#[async_trait]
impl BuildProvider for StubBuildProvider {
    async fn fetch(&self) -> BuildResult<BuildInfo> {
        Ok(BuildInfo::new("stub"))
    }

    fn clone_boxed(&self) -> Box<dyn BuildProvider> {
        Box::new(self.clone())
    }
}

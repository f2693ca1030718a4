//! Per-shard build-info cloning.
//!
//! Concurrent shards must never mutate one shared build-info object, but
//! re-downloading artifacts once per shard would be wasteful. The cloner
//! threads the needle: each shard's context gets a value clone of every
//! device's build-info, the shard's device slots get an
//! [`ExistingBuildProvider`] wrapping the clone (so a "fetch" from inside
//! the shard returns the already-downloaded artifacts untouched), and the
//! shared execution-file entries are re-linked to the cloned primary
//! build's paths so path-equality checks elsewhere keep holding.

use tracing::debug;

use crate::build::ExistingBuildProvider;
use crate::harness::ShardConfig;
use crate::invocation::{ExecutionFileKey, InvocationContext};

/// Clones build-info references from a parent invocation into a shard.
pub struct ShardBuildCloner;

impl ShardBuildCloner {
    /// Gives `shard` an independent build-info view of `parent_context`.
    ///
    /// For every shard device slot with a build registered in the parent
    /// context: value-clone the build into the shard's context and install
    /// an existing-artifact provider on the slot. Slots without a parent
    /// build keep their current provider. Finishes by re-linking the
    /// shard's execution-file entries against its own primary build.
    pub fn clone_build_infos(parent_context: &InvocationContext, shard: &mut ShardConfig) {
        for device in &mut shard.devices {
            let Some(build) = parent_context.build_for(&device.name) else {
                continue;
            };
            let cloned = build.clone();
            debug!(
                device = %device.name,
                build_id = cloned.build_id(),
                "installing existing-artifact provider on shard device"
            );
            device.build_provider = Box::new(ExistingBuildProvider::new(cloned.clone()));
            shard.context.add_device_build(device.name.clone(), cloned);
        }
        Self::relink_execution_files(&mut shard.context);
    }

    /// Points shared execution-file entries at the context's own primary
    /// build, for every entry whose key the primary build carries.
    fn relink_execution_files(context: &mut InvocationContext) {
        let mut updates = Vec::new();
        if let Some(primary) = context.primary_build() {
            for key in ExecutionFileKey::ALL {
                if context.execution_file(key).is_none() {
                    continue;
                }
                if let Some(path) = primary.file(key.artifact_name()) {
                    updates.push((key, path.to_path_buf()));
                }
            }
        }
        for (key, path) in updates {
            context.set_execution_file(key, path);
        }
    }
}

//! Test units: the opaque runnable work items distributed across shards.
//!
//! A [`TestUnit`] is the atom of work the sharding engine schedules. Units
//! come in two kinds:
//!
//! - **Generic** units may run on any device.
//! - **Token-bound** units declare one or more required capability
//!   [`Token`]s (a SIM card, a particular hardware feature) and may only be
//!   claimed by a worker whose attached device can supply every one of them.
//!
//! # Context injection
//!
//! Instead of runtime type inspection, every unit declares up front which
//! execution-context fields it accepts via [`UnitCapabilities`]. The poller
//! builds an [`Injection`] filtered to exactly those fields and hands it to
//! [`TestUnit::inject`] before execution.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use shardpool::unit::{Injection, TestUnit, Token, UnitCapabilities, UnitResult};
//! use shardpool::invocation::RunListener;
//!
//! struct SimTest;
//!
//! #[async_trait]
//! impl TestUnit for SimTest {
//!     fn id(&self) -> &str {
//!         "sim-test"
//!     }
//!
//!     fn required_tokens(&self) -> &[Token] {
//!         &[Token::SimCard]
//!     }
//!
//!     async fn run(&mut self, listener: &dyn RunListener) -> UnitResult<()> {
//!         listener.unit_started(self.id()).await;
//!         // ... exercise the device ...
//!         listener.unit_passed(self.id()).await;
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::BuildInfo;
use crate::device::DeviceHandle;
use crate::invocation::{InvocationContext, MetricCollector, RunListener};

/// Result type for unit operations.
pub type UnitResult<T> = Result<T, UnitError>;

/// Errors surfaced by test-unit execution.
///
/// The variants map directly onto the poller's failure semantics:
///
/// | Variant | Effect on the worker |
/// |---------|----------------------|
/// | `ExecutionFailed` | Logged, loop continues with the next unit |
/// | `DeviceRecovered` | Logged as informational, loop continues |
/// | `InvalidOptions` | Unit is skipped, loop continues |
/// | `DeviceUnavailable` | Bounded recovery attempt, else the lane dies |
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// The attached device was lost and has not come back.
    ///
    /// Fatal to the worker's lane unless the device recovers within the
    /// configured window.
    #[error("device {serial} became unavailable: {reason}")]
    DeviceUnavailable {
        /// Serial of the lost device.
        serial: String,
        /// What the unit observed when the device dropped.
        reason: String,
    },

    /// The device briefly dropped but came back on its own.
    ///
    /// Non-fatal: the worker logs the event and keeps polling.
    #[error("device {serial} became unresponsive but recovered: {reason}")]
    DeviceRecovered {
        /// Serial of the affected device.
        serial: String,
        /// What happened during the drop.
        reason: String,
    },

    /// The unit's declared options failed validation or dynamic-download
    /// resolution against the attached device.
    #[error("invalid options for unit {unit}: {reason}")]
    InvalidOptions {
        /// Id of the unit whose options are invalid.
        unit: String,
        /// Why validation failed.
        reason: String,
    },

    /// The unit threw during execution.
    ///
    /// A single bad unit must never kill the worker.
    #[error("unit {unit} failed during execution: {reason}")]
    ExecutionFailed {
        /// Id of the failing unit.
        unit: String,
        /// The failure message.
        reason: String,
    },

    /// Other unit-related errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A device capability a test unit can require.
///
/// Tokens are coarse hardware/provisioning capabilities. A token-bound unit
/// is only claimed by a worker whose device satisfies every required token,
/// as decided by the [`TokenProviderRegistry`](crate::device::TokenProviderRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    /// A provisioned SIM card.
    SimCard,
    /// A UICC SIM with carrier privileges.
    UiccSimCard,
    /// A secure-element-backed SIM.
    SecureElementSimCard,
    /// A physical battery (excludes bench-powered boards).
    Battery,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Token::SimCard => "SIM",
            Token::UiccSimCard => "UICC_SIM",
            Token::SecureElementSimCard => "SECURE_ELEMENT_SIM",
            Token::Battery => "BATTERY",
        };
        f.write_str(name)
    }
}

/// Declares which execution-context fields a unit accepts.
///
/// Checked at construction time rather than via runtime type inspection:
/// the poller injects only the fields a unit declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitCapabilities {
    /// The unit wants the shard's build-info view.
    pub build_info: bool,

    /// The unit wants the attached device handle.
    pub device: bool,

    /// The unit wants the invocation context.
    pub invocation_context: bool,

    /// The unit wants the cross-cutting metric collectors.
    pub collectors: bool,

    /// The unit wires its own collector hooks.
    ///
    /// When set, the poller does not wrap execution with collector
    /// start/end callbacks.
    pub manages_collectors: bool,
}

impl UnitCapabilities {
    /// Capabilities accepting every injectable field.
    pub fn all() -> Self {
        Self {
            build_info: true,
            device: true,
            invocation_context: true,
            collectors: true,
            manages_collectors: false,
        }
    }
}

/// The execution context injected into a unit before it runs.
///
/// Built by the poller, filtered to the fields the unit declared in its
/// [`UnitCapabilities`]. Undeclared fields are always `None`/empty.
#[derive(Default)]
pub struct Injection {
    /// The shard-private build-info view.
    pub build_info: Option<BuildInfo>,

    /// The device the claiming worker is attached to.
    pub device: Option<Arc<dyn DeviceHandle>>,

    /// The invocation context for this shard.
    pub context: Option<InvocationContext>,

    /// Cross-cutting metric collectors.
    pub collectors: Vec<Box<dyn MetricCollector>>,
}

impl std::fmt::Debug for Injection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injection")
            .field("build_info", &self.build_info.as_ref().map(|b| b.build_id()))
            .field("device", &self.device.as_ref().map(|d| d.serial().to_string()))
            .field("context", &self.context.as_ref().map(|c| c.invocation_id().to_string()))
            .field("collectors", &self.collectors.len())
            .finish()
    }
}

/// An opaque runnable work item.
///
/// The shared pool owns unexecuted units; once claimed, exactly one poller
/// owns a unit (the claim removes it from the pool atomically). A unit runs
/// at most once.
///
/// # Sharding
///
/// A unit that can be partitioned declares so by returning `Some` from
/// [`split`](Self::split). The orchestrator accumulates the resulting
/// sub-units (or the unsplit original) into the candidate list.
#[async_trait]
pub trait TestUnit: Send + Sync {
    /// Unique identifier for this unit within the invocation.
    fn id(&self) -> &str;

    /// Capability tokens the attached device must supply.
    ///
    /// Empty for generic units.
    fn required_tokens(&self) -> &[Token] {
        &[]
    }

    /// Returns whether this unit is token-bound.
    fn requires_token(&self) -> bool {
        !self.required_tokens().is_empty()
    }

    /// The execution-context fields this unit accepts.
    fn capabilities(&self) -> UnitCapabilities {
        UnitCapabilities::default()
    }

    /// Receives the execution context before the unit runs.
    ///
    /// Called once per claim, with an [`Injection`] filtered to the
    /// declared capabilities.
    fn inject(&mut self, _injection: Injection) {}

    /// Validates the unit's declared options against the attached device.
    ///
    /// Resolves any dynamic-download placeholders. A failure here skips the
    /// unit; it is not retried.
    async fn validate_options(&self, _device: Option<&dyn DeviceHandle>) -> UnitResult<()> {
        Ok(())
    }

    /// Splits this unit into independently runnable sub-units.
    ///
    /// `shard_hint` is the requested shard count, if any. Returns `None`
    /// when the unit is not shardable.
    fn split(&self, _shard_hint: Option<usize>) -> Option<Vec<Box<dyn TestUnit>>> {
        None
    }

    /// Executes the unit against the listener.
    ///
    /// Runs to completion or error; the sharding engine never preempts a
    /// running unit.
    async fn run(&mut self, listener: &dyn RunListener) -> UnitResult<()>;
}

//! The pool poller: one work-stealing worker per shard.
//!
//! A [`PoolPoller`] repeatedly claims one unit from the shared pool(s) and
//! executes it against its attached device until the pools are exhausted or
//! the device is unrecoverably lost. All pollers of a run are peers: there
//! is no central loop once they are launched, and coordination happens only
//! through the shared pools, each poller's private rejected-token memo, and
//! the shared [`CompletionLatch`].
//!
//! # Failure semantics
//!
//! - A single unit's runtime fault is logged; the loop continues.
//! - A transient device drop that recovered is logged as informational.
//! - Device unavailability triggers a bounded recovery attempt (wait, then
//!   reboot) unless the device is ephemeral or this is the last surviving
//!   poller; in those cases the lane is permanently lost.
//! - Pool exhaustion is the only success exit.
//!
//! On every exit the poller arrives at the latch exactly once; the poller
//! whose arrival brings the latch to zero drains both pools and reports
//! every remaining unit as not executed. This holds even when that poller
//! is itself exiting through a fatal device loss, so no submitted unit ever
//! silently disappears from results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, TokenProviderRegistry};
use crate::invocation::{InvocationContext, MetricCollector, RunListener};
use crate::sharding::pool::{CompletionLatch, UnitPool};
use crate::unit::{
    Injection, TestUnit, Token, UnitCapabilities, UnitError, UnitResult,
};
use crate::build::BuildInfo;

/// A work-stealing worker draining the shared pools against one device.
///
/// Implements [`TestUnit`] so that a shard configuration carries the poller
/// as its single test: the rescheduler runs the shard, the shard runs the
/// poller, and the poller drains the pool shared with its sibling shards.
pub struct PoolPoller {
    index: usize,
    id: String,
    generic: Arc<UnitPool>,
    token: Option<Arc<UnitPool>>,
    latch: Arc<CompletionLatch>,
    registry: Arc<TokenProviderRegistry>,
    recovery_window: Duration,
    reboot_on_recovery: bool,

    // Injected execution context.
    device: Option<Arc<dyn DeviceHandle>>,
    build: Option<BuildInfo>,
    context: Option<InvocationContext>,
    collectors: Vec<Box<dyn MetricCollector>>,

    /// Token units this poller already determined it cannot service.
    rejected: HashSet<String>,
    arrived: bool,
}

impl PoolPoller {
    /// Creates a poller over the shared pools and latch.
    ///
    /// `index` distinguishes the poller's lane; the device and the rest of
    /// the execution context arrive later via [`TestUnit::inject`].
    pub fn new(
        index: usize,
        generic: Arc<UnitPool>,
        token: Option<Arc<UnitPool>>,
        latch: Arc<CompletionLatch>,
        registry: Arc<TokenProviderRegistry>,
    ) -> Self {
        Self {
            index,
            id: format!("pool-poller-{index}"),
            generic,
            token,
            latch,
            registry,
            recovery_window: Duration::from_secs(600),
            reboot_on_recovery: true,
            device: None,
            build: None,
            context: None,
            collectors: Vec::new(),
            rejected: HashSet::new(),
            arrived: false,
        }
    }

    /// Sets how long to wait for a lost device to come back.
    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }

    /// Sets whether a recovered device is rebooted before resuming.
    pub fn with_reboot_on_recovery(mut self, reboot: bool) -> Self {
        self.reboot_on_recovery = reboot;
        self
    }

    /// Attaches the device directly (otherwise injected at run time).
    pub fn with_device(mut self, device: Arc<dyn DeviceHandle>) -> Self {
        self.device = Some(device);
        self
    }

    /// This poller's lane index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Claims the next unit this poller can service.
    ///
    /// Scans the token pool first, honoring the rejected memo and the
    /// device's token capabilities; falls back to the front of the generic
    /// pool. With `report_unexecuted` set (final drain only), the
    /// capability check is skipped entirely and the first remaining token
    /// unit is returned, its memo entry cleared.
    pub(crate) fn poll(&mut self, report_unexecuted: bool) -> Option<Box<dyn TestUnit>> {
        if let Some(token_pool) = &self.token {
            if report_unexecuted {
                if let Some(unit) = token_pool.take_next() {
                    self.rejected.remove(unit.id());
                    return Some(unit);
                }
            } else {
                let device = self.device.clone();
                let registry = &self.registry;
                let rejected = &mut self.rejected;
                let claimed = token_pool.take_where(|unit| {
                    if rejected.contains(unit.id()) {
                        return false;
                    }
                    let satisfiable = unit.required_tokens().iter().all(|token| {
                        device
                            .as_deref()
                            .is_some_and(|device| registry.device_has_token(device, token))
                    });
                    if !satisfiable {
                        rejected.insert(unit.id().to_string());
                    }
                    satisfiable
                });
                if let Some(unit) = claimed {
                    self.rejected.remove(unit.id());
                    return Some(unit);
                }
            }
        }
        self.generic.take_next()
    }

    async fn run_units(&mut self, listener: &dyn RunListener) -> UnitResult<()> {
        loop {
            let Some(mut unit) = self.poll(false) else {
                debug!(poller = %self.id, "pool exhausted, exiting loop");
                return Ok(());
            };

            let caps = unit.capabilities();
            unit.inject(self.build_injection(&caps));

            if let Err(e) = unit.validate_options(self.device.as_deref()).await {
                warn!(unit = unit.id(), error = %e, "option validation failed, skipping unit");
                continue;
            }

            let wrap_collectors = !caps.manages_collectors;
            if wrap_collectors {
                for collector in &self.collectors {
                    collector.on_unit_start(unit.id());
                }
            }
            let outcome = unit.run(listener).await;
            if wrap_collectors {
                for collector in &self.collectors {
                    collector.on_unit_end(unit.id());
                }
            }

            match outcome {
                Ok(()) => {}
                Err(UnitError::DeviceUnavailable { serial, reason }) => {
                    let fault = UnitError::DeviceUnavailable {
                        serial: serial.clone(),
                        reason,
                    };
                    if let Err(fatal) = self.try_recover_device(fault).await {
                        error!(
                            poller = %self.id,
                            serial = %serial,
                            "device lost, terminating execution lane"
                        );
                        return Err(fatal);
                    }
                }
                Err(UnitError::DeviceRecovered { serial, reason }) => {
                    info!(%serial, %reason, "device dropped and recovered, continuing");
                }
                Err(e) => {
                    error!(unit = unit.id(), error = %e, "unit failed, continuing with next unit");
                }
            }
        }
    }

    fn build_injection(&self, caps: &UnitCapabilities) -> Injection {
        let mut injection = Injection::default();
        if caps.build_info {
            injection.build_info = self.build.clone();
        }
        if caps.device {
            injection.device = self.device.clone();
        }
        if caps.invocation_context {
            injection.context = self.context.clone();
        }
        if caps.collectors {
            injection.collectors = self.collectors.clone();
        }
        injection
    }

    /// Attempts to ride out a device loss.
    ///
    /// Ephemeral/nested devices are never recovered; the fault propagates
    /// immediately. Otherwise, as long as at least one other poller is
    /// still active, the device gets the full recovery window to come back
    /// and is then rebooted; if it does, the fault was transient and the
    /// loop resumes. The last surviving poller never waits: its remaining
    /// work is better abandoned to the final drain than stalled.
    async fn try_recover_device(&self, fault: UnitError) -> UnitResult<()> {
        let Some(device) = self.device.clone() else {
            return Err(fault);
        };
        if device.is_ephemeral() {
            debug!(serial = device.serial(), "ephemeral device, no recovery attempted");
            return Err(fault);
        }
        if self.latch.remaining() <= 1 {
            return Err(fault);
        }

        match device.wait_for_available(self.recovery_window).await {
            Ok(()) => {
                if self.reboot_on_recovery {
                    if let Err(e) = device.reboot().await {
                        warn!(serial = device.serial(), error = %e, "reboot after recovery failed");
                        return Err(fault);
                    }
                }
                info!(serial = device.serial(), "device recovered, resuming polling");
                Ok(())
            }
            Err(e) => {
                warn!(serial = device.serial(), error = %e, "device did not recover within window");
                Err(fault)
            }
        }
    }

    /// Drains both pools and reports every remaining unit as not executed.
    ///
    /// Runs on exactly one poller: the one whose latch arrival hit zero.
    async fn report_unexecuted(&mut self, listener: &dyn RunListener) {
        while let Some(unit) = self.poll(true) {
            let reason = unexecuted_reason(unit.required_tokens());
            warn!(unit = unit.id(), %reason, "reporting unit as not executed");
            listener.unit_not_executed(unit.id(), &reason).await;
        }
    }
}

/// Message for a unit that never got to run, naming the unmet token when
/// the unit is token-bound.
fn unexecuted_reason(tokens: &[Token]) -> String {
    if tokens.is_empty() {
        "test pool exhausted before this unit could execute".to_string()
    } else {
        let names = tokens
            .iter()
            .map(Token::to_string)
            .collect::<Vec<_>>()
            .join("', '");
        format!("no token '{names}' matching the unit's requirements on any device")
    }
}

#[async_trait]
impl TestUnit for PoolPoller {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> UnitCapabilities {
        UnitCapabilities {
            build_info: true,
            device: true,
            invocation_context: true,
            collectors: true,
            // The poller wires collector hooks around each claimed unit
            // itself.
            manages_collectors: true,
        }
    }

    fn inject(&mut self, injection: Injection) {
        if let Some(build) = injection.build_info {
            self.build = Some(build);
        }
        if let Some(device) = injection.device {
            self.device = Some(device);
        }
        if let Some(context) = injection.context {
            self.context = Some(context);
        }
        if !injection.collectors.is_empty() {
            self.collectors = injection.collectors;
        }
    }

    async fn validate_options(&self, _device: Option<&dyn DeviceHandle>) -> UnitResult<()> {
        if self.recovery_window.is_zero() {
            return Err(UnitError::InvalidOptions {
                unit: self.id.clone(),
                reason: "recovery window must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    async fn run(&mut self, listener: &dyn RunListener) -> UnitResult<()> {
        let result = self.run_units(listener).await;
        if !self.arrived {
            self.arrived = true;
            if self.latch.arrive() {
                self.report_unexecuted(listener).await;
            }
        }
        result
    }
}

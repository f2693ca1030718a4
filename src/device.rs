//! Device handles and token-capability queries.
//!
//! The sharding engine never talks to hardware directly: it sees devices
//! through the [`DeviceHandle`] trait, which exposes exactly the operations
//! the poller needs for recovery (wait-for-available, reboot) plus an
//! ephemeral flag for virtualized devices that are never recovered in place.
//!
//! Token-capability checks go through a [`TokenProviderRegistry`] keyed by
//! [`Token`]: the registry decides whether a given device can supply a given
//! capability. Registering a [`TokenProvider`] per token keeps the decision
//! pluggable per deployment.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

use crate::unit::Token;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while interacting with a device handle.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device did not come back within the allowed window.
    #[error("device {0} did not become available within the allowed window")]
    WaitTimeout(String),

    /// The reboot command failed or the device did not come back after it.
    #[error("failed to reboot device {serial}: {reason}")]
    RebootFailed {
        /// Serial of the device that failed to reboot.
        serial: String,
        /// Why the reboot failed.
        reason: String,
    },

    /// No device with the given serial is attached.
    #[error("device {0} not found")]
    NotFound(String),

    /// Other device-related errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A handle to one attached device.
///
/// Implementations wrap whatever transport the harness uses (adb, a
/// virtual-device controller, a fake in tests). All methods must be safe to
/// call from multiple workers, though the engine attaches each device to at
/// most one poller.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// The device serial number.
    fn serial(&self) -> &str;

    /// Whether this is an ephemeral/nested (virtualized) device.
    ///
    /// Recovery is never attempted for ephemeral devices; losing one fails
    /// the lane fast.
    fn is_ephemeral(&self) -> bool {
        false
    }

    /// Blocks until the device is reachable again, up to `timeout`.
    async fn wait_for_available(&self, timeout: Duration) -> DeviceResult<()>;

    /// Reboots the device and waits for it to come back.
    async fn reboot(&self) -> DeviceResult<()>;
}

/// Decides whether a device can supply one capability token.
pub trait TokenProvider: Send + Sync {
    /// Returns `true` if `device` currently satisfies `token`.
    fn has_token(&self, device: &dyn DeviceHandle, token: &Token) -> bool;
}

/// A token provider backed by a fixed set of device serials.
///
/// Useful when the deployment knows up front which benches carry a
/// capability (e.g. the two SIM-provisioned racks).
///
/// # Example
///
/// ```
/// use shardpool::device::StaticTokenProvider;
///
/// let provider = StaticTokenProvider::new(["SERIAL-A", "SERIAL-B"]);
/// ```
pub struct StaticTokenProvider {
    serials: HashSet<String>,
}

impl StaticTokenProvider {
    /// Creates a provider that grants the token to exactly these serials.
    pub fn new<I, S>(serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            serials: serials.into_iter().map(Into::into).collect(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn has_token(&self, device: &dyn DeviceHandle, _token: &Token) -> bool {
        self.serials.contains(device.serial())
    }
}

/// Registry of token providers, keyed by token.
///
/// A token with no registered provider is never satisfiable; the poller
/// treats units requiring it as currently unserviceable and the final drain
/// reports them as not executed.
#[derive(Default)]
pub struct TokenProviderRegistry {
    providers: HashMap<Token, Box<dyn TokenProvider>>,
}

impl TokenProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the provider responsible for `token`.
    ///
    /// Replaces any previously registered provider for the same token.
    pub fn register(&mut self, token: Token, provider: Box<dyn TokenProvider>) {
        self.providers.insert(token, provider);
    }

    /// Returns `true` if `device` can currently supply `token`.
    pub fn device_has_token(&self, device: &dyn DeviceHandle, token: &Token) -> bool {
        self.providers
            .get(token)
            .is_some_and(|provider| provider.has_token(device, token))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Fake device used across the crate's unit tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// A scriptable in-memory device.
    pub(crate) struct FakeDevice {
        serial: String,
        ephemeral: bool,
        /// When set, `wait_for_available` fails (device never recovers).
        pub(crate) unreachable: AtomicBool,
        pub(crate) reboots: AtomicUsize,
        pub(crate) waits: AtomicUsize,
    }

    impl FakeDevice {
        pub(crate) fn new(serial: impl Into<String>) -> Self {
            Self {
                serial: serial.into(),
                ephemeral: false,
                unreachable: AtomicBool::new(false),
                reboots: AtomicUsize::new(0),
                waits: AtomicUsize::new(0),
            }
        }

        pub(crate) fn ephemeral(serial: impl Into<String>) -> Self {
            Self {
                ephemeral: true,
                ..Self::new(serial)
            }
        }
    }

    #[async_trait]
    impl DeviceHandle for FakeDevice {
        fn serial(&self) -> &str {
            &self.serial
        }

        fn is_ephemeral(&self) -> bool {
            self.ephemeral
        }

        async fn wait_for_available(&self, _timeout: Duration) -> DeviceResult<()> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.load(Ordering::SeqCst) {
                Err(DeviceError::WaitTimeout(self.serial.clone()))
            } else {
                Ok(())
            }
        }

        async fn reboot(&self) -> DeviceResult<()> {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

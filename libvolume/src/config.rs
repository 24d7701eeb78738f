//! Core agent configuration.
//!
//! Values come from a serialized document (YAML or JSON, durations in
//! humantime form such as `"10s"`), then per-agent environment overrides:
//!
//! | Variable | Field |
//! |---|---|
//! | `CORE_MAX_REBUILDS` | `max_rebuilds` (empty for unlimited) |
//! | `CORE_REBUILD_SCOPE` | `rebuild_scope` (`global` or `per-node`) |
//! | `CORE_RECONCILE_PERIOD` | `reconcile_period` |
//! | `CORE_CACHE_PERIOD` | `cache_period` |
//! | `CORE_FAULTED_GRACE_PERIOD` | `faulted_grace_period` |
//! | `CORE_REQUEST_TIMEOUT` | `request_timeout` |
//! | `CORE_REQUEST_RETRIES` | `request_retries` |
//! | `CORE_CLUSTER_ID` | `cluster_id` |
//! | `CORE_IO_TIMEOUT` | `io_timeout` |
//!
//! A malformed override is an error rather than silently ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;
use crate::rebuild::RebuildDomain;
use crate::retry::Retry;

/// Tunables of the volume control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Cap on concurrent rebuilds; `None` is unlimited, `Some(0)` forbids them.
    pub max_rebuilds: Option<u32>,
    pub rebuild_scope: RebuildDomain,
    #[serde(with = "humantime_serde")]
    pub reconcile_period: Duration,
    /// How often replica health is refreshed from the engine.
    #[serde(with = "humantime_serde")]
    pub cache_period: Duration,
    /// How long a faulted replica is kept before it is removed.
    #[serde(with = "humantime_serde")]
    pub faulted_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub request_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub cluster_id: String,
    /// I/O timeout handed to the node plugin for published targets.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_rebuilds: None,
            rebuild_scope: RebuildDomain::Global,
            reconcile_period: Duration::from_secs(10),
            cache_period: Duration::from_secs(30),
            faulted_grace_period: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            request_retries: 3,
            retry_interval: Duration::from_millis(200),
            cluster_id: uuid::Uuid::new_v4().to_string(),
            io_timeout: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    /// Defaults with overrides from the process environment.  This is what a
    /// core agent binary builds its [`VolumeController`] from.
    ///
    /// [`VolumeController`]: crate::controller::VolumeController
    pub fn from_env() -> Result<Self, VolumeError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides, looking each variable up through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, VolumeError> {
        if let Some(v) = lookup("CORE_MAX_REBUILDS") {
            self.max_rebuilds = if v.trim().is_empty() {
                None
            } else {
                Some(parse("CORE_MAX_REBUILDS", &v)?)
            };
        }
        if let Some(v) = lookup("CORE_REBUILD_SCOPE") {
            self.rebuild_scope = v.trim().parse()?;
        }
        let durations = [
            ("CORE_RECONCILE_PERIOD", &mut self.reconcile_period),
            ("CORE_CACHE_PERIOD", &mut self.cache_period),
            ("CORE_FAULTED_GRACE_PERIOD", &mut self.faulted_grace_period),
            ("CORE_REQUEST_TIMEOUT", &mut self.request_timeout),
            ("CORE_IO_TIMEOUT", &mut self.io_timeout),
        ];
        for (key, field) in durations {
            if let Some(v) = lookup(key) {
                *field = humantime::parse_duration(v.trim())
                    .map_err(|e| VolumeError::InvalidArgument(format!("{key}='{v}': {e}")))?;
            }
        }
        if let Some(v) = lookup("CORE_REQUEST_RETRIES") {
            self.request_retries = parse("CORE_REQUEST_RETRIES", &v)?;
        }
        if let Some(v) = lookup("CORE_CLUSTER_ID") {
            self.cluster_id = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> Result<(), VolumeError> {
        if self.reconcile_period.is_zero() || self.cache_period.is_zero() {
            return Err(VolumeError::InvalidArgument(
                "reconcile and cache periods must be non-zero".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(VolumeError::InvalidArgument(
                "request timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Retry policy for engine calls.
    pub fn retry(&self) -> Retry {
        Retry::new(self.retry_interval, self.request_retries)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, VolumeError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| VolumeError::InvalidArgument(format!("{key}='{value}': {e}")))
}

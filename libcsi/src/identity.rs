//! Plugin identity.
//!
//! The descriptor every node of the cluster reports is fixed: one plugin
//! name, the crate version, and the two plugin capabilities the volume
//! service relies on.  Only readiness varies per host, so it is the one
//! method an implementor must provide.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Name the orchestrator registers this driver under.
pub const PLUGIN_NAME: &str = "io.openebs.csi-mayastor";

/// Descriptor returned by `GetPluginInfo`.
pub fn plugin_info() -> PluginInfo {
    PluginInfo {
        name: PLUGIN_NAME.to_owned(),
        vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        manifest: HashMap::new(),
    }
}

/// Capabilities returned by `GetPluginCapabilities`.
pub fn plugin_capabilities() -> Vec<PluginCapability> {
    vec![
        PluginCapability::ControllerService,
        PluginCapability::VolumeAccessibilityConstraints,
    ]
}

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(plugin_info())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(plugin_capabilities())
    }

    /// `true` once the host can attach volumes.  A plugin that is still
    /// loading its device drivers answers `false`, not an error.
    async fn probe(&self) -> Result<bool, CsiError>;
}

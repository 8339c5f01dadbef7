//! # Network Info
//!
//! Snapshot of the host interface as reported by `ip -j addr show <interface>`,
//! persisted to the network-info file at boot. The snapshot is the only source
//! for the base addresses every device alias is derived from:
//!
//! - IPv4: family `inet`, prefix `/24`, scope `global`, label equal to the
//!   interface name, not secondary
//! - IPv6: family `inet6`, prefix `/64`, scope `link`, not temporary
//!
//! It also lists aliases left behind by a previous run (labelled
//! `<interface>:<n>` IPv4 entries and link-scope `/128` IPv6 entries) so they
//! can be removed before recovery.

use super::types::BaseAddresses;
use crate::error_handling::types::NetworkError;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::process::Command;

/// Interfaces tried, in order, when none is configured.
pub const INTERFACE_PRIORITY: [&str; 2] = ["eth0", "wlan0"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub family: String,
    pub local: String,
    pub prefixlen: u8,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default)]
    pub temporary: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AddrInfo {
    fn scope_is(&self, scope: &str) -> bool {
        self.scope.as_deref() == Some(scope)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub ifname: Option<String>,
    #[serde(default)]
    pub operstate: Option<String>,
    #[serde(default)]
    pub addr_info: Vec<AddrInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NetworkInfo {
    /// Queries iproute2 for the interface's current state.
    pub fn capture(interface: &str) -> Result<Self, NetworkError> {
        let output = Command::new("ip")
            .args(["-j", "addr", "show", interface])
            .output()
            .map_err(|e| {
                error!("Failed to run ip addr show {}: {}", interface, e);
                NetworkError::NetworkInfo(e.to_string())
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("ip addr show {} failed: {}", interface, stderr);
            return Err(NetworkError::InterfaceUnavailable(stderr));
        }
        Self::from_ip_json(&String::from_utf8_lossy(&output.stdout))
    }

    /// Parses the array printed by `ip -j addr show`, keeping its first entry.
    pub fn from_ip_json(json: &str) -> Result<Self, NetworkError> {
        let mut entries: Vec<NetworkInfo> = serde_json::from_str(json).map_err(|e| {
            error!("Unexpected ip -j output: {}", e);
            NetworkError::NetworkInfo(e.to_string())
        })?;
        if entries.is_empty() {
            return Err(NetworkError::InterfaceUnavailable("no such interface".into()));
        }
        Ok(entries.swap_remove(0))
    }

    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let content = fs::read_to_string(path).map_err(|e| {
            error!("Failed to read network info {}: {}", path.display(), e);
            NetworkError::NetworkInfo(e.to_string())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            error!("Corrupt network info {}: {}", path.display(), e);
            NetworkError::NetworkInfo(e.to_string())
        })
    }

    pub fn store(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create {}: {}", parent.display(), e);
                NetworkError::NetworkInfo(e.to_string())
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NetworkError::NetworkInfo(e.to_string()))?;
        fs::write(path, json).map_err(|e| {
            error!("Failed to write network info {}: {}", path.display(), e);
            NetworkError::NetworkInfo(e.to_string())
        })?;
        debug!("Network info stored in {}", path.display());
        Ok(())
    }

    /// `DOWN` and `DORMANT` interfaces cannot carry device traffic.
    pub fn ensure_operational(&self) -> Result<(), NetworkError> {
        match self.operstate.as_deref() {
            Some(state @ ("DOWN" | "DORMANT")) => {
                let name = self.ifname.clone().unwrap_or_default();
                error!("Interface {} is {}", name, state);
                Err(NetworkError::InterfaceUnavailable(format!("{} is {}", name, state)))
            }
            _ => Ok(()),
        }
    }

    pub fn base_addresses(&self, interface: &str) -> Result<BaseAddresses, NetworkError> {
        let ipv4 = self
            .addr_info
            .iter()
            .filter(|a| {
                a.family == "inet"
                    && a.prefixlen == 24
                    && a.scope_is("global")
                    && a.label.as_deref() == Some(interface)
                    && !a.secondary
            })
            .find_map(|a| a.local.parse::<Ipv4Addr>().ok())
            .ok_or_else(|| {
                error!("No primary /24 IPv4 address on {}", interface);
                NetworkError::NetworkInfo(format!("no primary IPv4 on {}", interface))
            })?;
        let ipv6 = self
            .addr_info
            .iter()
            .filter(|a| {
                a.family == "inet6" && a.prefixlen == 64 && a.scope_is("link") && !a.temporary
            })
            .find_map(|a| a.local.parse::<Ipv6Addr>().ok())
            .ok_or_else(|| {
                error!("No link-local /64 IPv6 address on {}", interface);
                NetworkError::NetworkInfo(format!("no link-local IPv6 on {}", interface))
            })?;
        info!("Base addresses on {}: {} / {}", interface, ipv4, ipv6);
        Ok(BaseAddresses { ipv4, ipv6 })
    }

    /// Device aliases present on the interface, excluding the base addresses.
    pub fn stale_aliases(&self, interface: &str, base: &BaseAddresses) -> Vec<IpAddr> {
        let alias_prefix = format!("{}:", interface);
        self.addr_info
            .iter()
            .filter(|a| match a.family.as_str() {
                "inet" => a
                    .label
                    .as_deref()
                    .is_some_and(|l| l.starts_with(&alias_prefix)),
                "inet6" => a.prefixlen == 128 && a.scope_is("link"),
                _ => false,
            })
            .filter_map(|a| a.local.parse::<IpAddr>().ok())
            .filter(|addr| !base.contains(addr))
            .collect()
    }
}

/// Picks the configured interface, or the first one of [`INTERFACE_PRIORITY`]
/// that is up under `sys_class_net` (normally `/sys/class/net`).
pub fn select_interface(
    configured: Option<&str>,
    sys_class_net: &Path,
) -> Result<String, NetworkError> {
    if let Some(name) = configured {
        return Ok(name.to_string());
    }
    for candidate in INTERFACE_PRIORITY {
        let operstate = sys_class_net.join(candidate).join("operstate");
        match fs::read_to_string(&operstate) {
            Ok(state) if state.trim().eq_ignore_ascii_case("up") => {
                info!("Using network interface {}", candidate);
                return Ok(candidate.to_string());
            }
            Ok(state) => debug!("Interface {} is {}", candidate, state.trim()),
            Err(_) => debug!("Interface {} not present", candidate),
        }
    }
    warn!("None of {:?} is up", INTERFACE_PRIORITY);
    Err(NetworkError::InterfaceUnavailable(
        "no usable network interface".into(),
    ))
}

//! Core types used by the process management subsystem.

use crate::configuration::types::DeviceTypeConfig;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Capability bitmask passed to every device (BLE + on-network discovery).
pub const DEVICE_CAPABILITIES: u8 = 6;

/// Everything the device binary needs on its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub discriminator: u16,
    pub passcode: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Key-value store file, inside the session's storage directory.
    pub kvs_path: PathBuf,
    pub rpc_port: u16,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

/// A fully resolved command line for one device process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl DeviceCommand {
    pub fn for_device(device_type: &DeviceTypeConfig, params: &LaunchParams) -> Self {
        let mut args = device_type.args.clone();
        args.extend([
            "--wifi".to_string(),
            "--discriminator".to_string(),
            params.discriminator.to_string(),
            "--passcode".to_string(),
            params.passcode.to_string(),
            "--vendor-id".to_string(),
            params.vendor_id.to_string(),
            "--product-id".to_string(),
            params.product_id.to_string(),
            "--capabilities".to_string(),
            DEVICE_CAPABILITIES.to_string(),
            "--KVS".to_string(),
            params.kvs_path.display().to_string(),
            "--RPC-server-port".to_string(),
            params.rpc_port.to_string(),
            "--IPv4-Addr".to_string(),
            params.ipv4.to_string(),
            "--IPv6-Addr".to_string(),
            params.ipv6.to_string(),
        ]);
        Self {
            program: device_type.binary.clone(),
            args,
        }
    }

    /// Printable form for logs.
    pub fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Pairing codes produced by the onboarding payload generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingCodes {
    pub qr_code: String,
    pub manual_code: String,
}

/// Inputs of the onboarding payload generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadParams {
    pub passcode: u32,
    pub discriminator: u16,
    pub vendor_id: u16,
    pub product_id: u16,
}

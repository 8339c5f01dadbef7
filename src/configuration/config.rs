use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::{debug, error, info};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line surface of the emulator.
///
/// Only the configuration file is mandatory; the other flags override the
/// matching entries of the file so a single host setting can be changed
/// without editing it.
#[derive(Parser, Debug, Clone)]
#[command(name = "matter-emu")]
#[command(version)]
#[command(about = "Runs emulated smart-home devices side by side for commissioning tests")]
pub struct CommandLine {
    /// Path to the TOML configuration file
    pub config_file: PathBuf,

    /// Network interface used for the device address aliases.
    ///
    /// # Command Line
    /// Use `--interface <NAME>` or the `MATTER_EMU_INTERFACE` variable
    #[arg(long, env = "MATTER_EMU_INTERFACE")]
    pub interface: Option<String>,

    /// Root directory for per-device storage and bookkeeping files.
    ///
    /// # Command Line
    /// Use `--data-dir <PATH>` or the `MATTER_EMU_DATA_DIR` variable
    #[arg(long, env = "MATTER_EMU_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

impl CommandLine {
    /// Parses the process arguments, exiting with clap's usage message on error.
    pub fn from_args() -> Self {
        CommandLine::parse()
    }
}

/// Application configuration structure that defines all runtime parameters.
///
/// Loaded from a TOML file; every field has a default so a file only needs to
/// list what differs from it, plus at least one `[[device_types]]` entry.
///
/// # Fields Overview
///
/// - `data_dir`: per-device storage lives under `<data_dir>/devices/<targetId>`
/// - `log_dir`: per-session device logs, one directory per day
/// - `interface`: host interface receiving the address aliases; auto-detected when unset
/// - `network_info_file`, `device_list_file`: bookkeeping files, relative to `data_dir`
///   unless absolute
/// - `max_devices`: upper bound of live sessions
/// - `min_storage_files`: storage directories holding fewer files are incomplete
/// - `rpc_base_port`: RPC ports are handed out from `rpc_base_port + 1` upwards
/// - `constraints`: identity limits checked before any session starts
/// - `device_types`: registry of supported device applications
/// - `dac_tool`, `payload_tool`: external tools, both optional
/// - `devices`: devices started after boot recovery
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub keep_log_days: usize,
    pub save_device_logs: bool,
    pub interface: Option<String>,
    pub network_info_file: PathBuf,
    pub device_list_file: PathBuf,
    pub max_devices: usize,
    pub min_storage_files: usize,
    pub rpc_base_port: u16,
    pub reachability_timeout_secs: u64,
    pub onboarding_retry_secs: u64,
    pub rpc_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Upper bound of IPv6 candidates probed for one allocation.
    pub ipv6_probe_budget: u32,
    pub use_sudo: bool,
    pub constraints: IdentityConstraints,
    pub device_types: Vec<DeviceTypeConfig>,
    pub dac_tool: Option<ToolConfig>,
    pub payload_tool: Option<ToolConfig>,
    pub devices: Vec<DeviceRequest>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            keep_log_days: 2,
            save_device_logs: true,
            interface: None,
            network_info_file: PathBuf::from("network_info.json"),
            device_list_file: PathBuf::from("device_list"),
            max_devices: 15,
            min_storage_files: 4,
            rpc_base_port: 33000,
            reachability_timeout_secs: 60,
            onboarding_retry_secs: 20,
            rpc_timeout_secs: 10,
            stop_grace_secs: 5,
            ipv6_probe_budget: 512,
            use_sudo: false,
            constraints: IdentityConstraints::default(),
            device_types: Vec::new(),
            dac_tool: None,
            payload_tool: None,
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            error!("Failed to read configuration {}: {}", path.display(), e);
            ConfigError::IoError(e)
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            "Configuration loaded: {} device type(s), {} boot device(s)",
            config.device_types.len(),
            config.devices.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| {
            error!("Failed to parse configuration: {}", e);
            ConfigError::TomlError(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the command-line overrides on top of the file values.
    pub fn apply_overrides(&mut self, cli: &CommandLine) {
        if let Some(interface) = &cli.interface {
            info!("Interface overridden from command line: {}", interface);
            self.interface = Some(interface.clone());
        }
        if let Some(dir) = &cli.data_dir {
            info!("Data directory overridden from command line: {}", dir.display());
            self.data_dir = dir.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_types.is_empty() {
            error!("Configuration lists no device type");
            return Err(ConfigError::DeviceTypesEmpty);
        }
        if self.max_devices == 0 {
            return Err(ConfigError::NotInRange("max_devices must be at least 1".into()));
        }
        if self.rpc_base_port == u16::MAX {
            return Err(ConfigError::NotInRange(
                "rpc_base_port leaves no port to allocate".into(),
            ));
        }
        if self.ipv6_probe_budget == 0 {
            return Err(ConfigError::NotInRange("ipv6_probe_budget must be at least 1".into()));
        }

        let c = &self.constraints;
        c.serial_number
            .check("serial_number")
            .and_then(|_| c.vendor_id.check("vendor_id"))
            .and_then(|_| c.product_id.check("product_id"))
            .and_then(|_| c.discriminator.check("discriminator"))
            .and_then(|_| c.pin_code.check("pin_code"))
            .map_err(|e| {
                error!("Invalid identity constraint: {}", e);
                ConfigError::NotInRange(e)
            })?;
        if c.serial_number.max() > i64::MAX as u64 {
            return Err(ConfigError::NotInRange(
                "serial_number cannot exceed 9223372036854775807".into(),
            ));
        }

        let mut codes: Vec<&str> = self.device_types.iter().map(|t| t.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        if codes.len() != self.device_types.len() {
            return Err(ConfigError::Invalid("duplicate device type code".into()));
        }
        Ok(())
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("devices")
    }

    pub fn network_info_path(&self) -> PathBuf {
        self.data_dir.join(&self.network_info_file)
    }

    pub fn device_list_path(&self) -> PathBuf {
        self.data_dir.join(&self.device_list_file)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    pub fn onboarding_retry(&self) -> Duration {
        Duration::from_secs(self.onboarding_retry_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

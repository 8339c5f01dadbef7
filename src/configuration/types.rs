use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;

/// Inclusive `[min, max]` bound plus the value proposed to the operator by default.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ParameterConstraint<T> {
    pub range: [T; 2],
    pub default_value: T,
}

impl<T: PartialOrd + Copy + Display> ParameterConstraint<T> {
    pub fn new(min: T, max: T, default_value: T) -> Self {
        Self {
            range: [min, max],
            default_value,
        }
    }

    pub fn min(&self) -> T {
        self.range[0]
    }

    pub fn max(&self) -> T {
        self.range[1]
    }

    pub fn contains(&self, value: T) -> bool {
        value >= self.range[0] && value <= self.range[1]
    }

    /// Returns a description of the problem when the constraint itself is malformed.
    pub fn check(&self, name: &str) -> Result<(), String> {
        if self.range[0] > self.range[1] {
            return Err(format!(
                "{}: range [{}, {}] is inverted",
                name, self.range[0], self.range[1]
            ));
        }
        if !self.contains(self.default_value) {
            return Err(format!(
                "{}: default {} outside [{}, {}]",
                name, self.default_value, self.range[0], self.range[1]
            ));
        }
        Ok(())
    }
}

/// Limits applied to every device identity before a session is created.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConstraints {
    pub serial_number: ParameterConstraint<u64>,
    pub vendor_id: ParameterConstraint<u16>,
    pub product_id: ParameterConstraint<u16>,
    pub discriminator: ParameterConstraint<u16>,
    pub pin_code: ParameterConstraint<u32>,
}

impl Default for IdentityConstraints {
    fn default() -> Self {
        Self {
            serial_number: ParameterConstraint::new(1, i64::MAX as u64, 1),
            vendor_id: ParameterConstraint::new(0, u16::MAX, 0xFFF1),
            product_id: ParameterConstraint::new(0x8000, 0x801F, 0x8014),
            discriminator: ParameterConstraint::new(0, 4095, 3840),
            pin_code: ParameterConstraint::new(1, 99_999_998, 20_202_021),
        }
    }
}

/// One entry of the device-type registry.
///
/// `code` is the stable identifier (e.g. `0x0100` for an on/off light) used by
/// requests and log file names; `binary` is the device application started for it.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct DeviceTypeConfig {
    pub code: String,
    pub name: String,
    pub binary: PathBuf,
    /// Arguments placed before the generated device flags.
    #[serde(default)]
    pub args: Vec<String>,
}

/// An external command-line tool (DAC generation, onboarding payload).
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A device to start once boot recovery is done. Missing identity fields take
/// the constraint defaults.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub device_type: String,
    pub serial_number: Option<u64>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub discriminator: Option<u16>,
    pub pin_code: Option<u32>,
}

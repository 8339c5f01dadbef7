use crate::configuration::types::{DeviceRequest, IdentityConstraints};
use crate::error_handling::types::ValidationError;
use crate::network::types::SessionResources;
use crate::process_management::types::PayloadParams;
use crate::storage::types::{FactoryRecord, StoredSession};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pin codes rejected as trivially guessable.
pub const INSECURE_PIN_CODES: [u32; 12] = [
    0, 11111111, 22222222, 33333333, 44444444, 55555555, 66666666, 77777777, 88888888, 99999999,
    12345678, 87654321,
];

/// What the operator asks for when starting a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Code of the device type registry entry, e.g. `0x0100`.
    pub device_type: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: u64,
    pub discriminator: u16,
    pub pin_code: u32,
}

impl DeviceIdentity {
    /// `hex(vendor) + hex(product) + "-" + hex(serial)`, lowercase, no prefix.
    pub fn target_id(&self) -> String {
        format!(
            "{:x}{:x}-{:x}",
            self.vendor_id, self.product_id, self.serial_number
        )
    }

    pub fn validate(&self, constraints: &IdentityConstraints) -> Result<(), ValidationError> {
        if !constraints.serial_number.contains(self.serial_number)
            || self.serial_number > i64::MAX as u64
        {
            return Err(ValidationError::SerialNumberOutOfRange(self.serial_number));
        }
        let vendor = constraints.vendor_id.default_value;
        if self.vendor_id != vendor {
            return Err(ValidationError::VendorIdMismatch {
                expected: vendor,
                got: self.vendor_id,
            });
        }
        if !constraints.product_id.contains(self.product_id) {
            return Err(ValidationError::ProductIdOutOfRange(self.product_id));
        }
        if !constraints.discriminator.contains(self.discriminator) {
            return Err(ValidationError::DiscriminatorOutOfRange(self.discriminator));
        }
        if !constraints.pin_code.contains(self.pin_code) {
            return Err(ValidationError::PinCodeOutOfRange(self.pin_code));
        }
        if INSECURE_PIN_CODES.contains(&self.pin_code) {
            return Err(ValidationError::InsecurePinCode(self.pin_code));
        }
        Ok(())
    }

    /// Fills the fields a request leaves out with the constraint defaults.
    pub fn from_request(request: &DeviceRequest, constraints: &IdentityConstraints) -> Self {
        Self {
            device_type: request.device_type.clone(),
            vendor_id: request
                .vendor_id
                .unwrap_or(constraints.vendor_id.default_value),
            product_id: request
                .product_id
                .unwrap_or(constraints.product_id.default_value),
            serial_number: request
                .serial_number
                .unwrap_or(constraints.serial_number.default_value),
            discriminator: request
                .discriminator
                .unwrap_or(constraints.discriminator.default_value),
            pin_code: request
                .pin_code
                .unwrap_or(constraints.pin_code.default_value),
        }
    }

    pub fn payload_params(&self) -> PayloadParams {
        PayloadParams {
            passcode: self.pin_code,
            discriminator: self.discriminator,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }
}

/// Where a session stands regarding restarts of the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    /// Never confirmed commissioned; storage is dropped on stop.
    NotCommissioned,
    /// Commissioned during this run and persisted for the next one.
    Commissioned,
    /// Resumed from storage at boot.
    Recovered,
}

/// One emulated device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: DeviceIdentity,
    pub resources: SessionResources,
    /// Epoch seconds; orders recovery at boot.
    pub created_at: i64,
    pub recovery: RecoveryStatus,
    pub unique_id: Option<String>,
}

impl Session {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            resources: SessionResources::default(),
            created_at: Utc::now().timestamp(),
            recovery: RecoveryStatus::NotCommissioned,
            unique_id: None,
        }
    }

    /// Rebuilds a session from a reconciled storage directory.
    pub fn from_stored(stored: &StoredSession, default_vendor_id: u16) -> Self {
        let record = &stored.record;
        Self {
            identity: DeviceIdentity {
                device_type: record.device_type.clone(),
                vendor_id: record.vendor_id.unwrap_or(default_vendor_id),
                product_id: record.product_id,
                serial_number: record.serial_number,
                discriminator: record.discriminator,
                pin_code: record.pin_code,
            },
            resources: record.resources(),
            created_at: record.create_time,
            recovery: RecoveryStatus::Recovered,
            unique_id: record.unique_id.clone(),
        }
    }

    pub fn target_id(&self) -> String {
        self.identity.target_id()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery == RecoveryStatus::Recovered
    }

    pub fn to_record(&self) -> FactoryRecord {
        FactoryRecord {
            product_id: self.identity.product_id,
            serial_number: self.identity.serial_number,
            discriminator: self.identity.discriminator,
            pin_code: self.identity.pin_code,
            device_type: self.identity.device_type.clone(),
            create_time: self.created_at,
            ipv4: self.resources.ipv4,
            ipv6: self.resources.ipv6,
            rpc_port: self.resources.rpc_port,
            interface_index: self.resources.interface_index,
            is_recover: self.recovery != RecoveryStatus::NotCommissioned,
            vendor_id: Some(self.identity.vendor_id),
            unique_id: self.unique_id.clone(),
            extra: BTreeMap::new(),
        }
    }
}

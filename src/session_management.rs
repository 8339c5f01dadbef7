//! Session management core module.
//!
//! This module provides the types and submodules that run emulated device
//! sessions: identity and validation, the per-session lifecycle state
//! machine, the single in-flight commissioning gate and the orchestrator
//! tying network, storage and process management together.

use crate::process_management::types::OnboardingCodes;
use serde::{Deserialize, Serialize};

/// Submodule for the state of a live session inside the orchestrator.
pub mod active_session;
/// Submodule for the one-commissioning-at-a-time gate.
pub mod commissioning_gate;
/// Submodule for the log-driven state machine.
pub mod lifecycle;
/// Submodule for the device control channel.
pub mod rpc;
/// Submodule for session identity and persisted data.
pub mod session;
/// Submodule for the orchestrator.
pub mod session_manager;
#[cfg(test)]
mod tests;

pub use session::{DeviceIdentity, RecoveryStatus, Session};
pub use session_manager::{ExternalTools, SessionManager, SessionSettings};

/// State of one session as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    DeviceStarting,
    DeviceStarted,
    Connecting,
    Connected,
    DeviceUnsupported,
    CommissioningFailed,
    DacGenerating,
    DacGenerateFailed,
    DacGenerated,
    IpGenerating,
    IpGenerated,
    IpGenerateFailed,
    DeviceDuplicate,
    BluetoothCommissioningFailed,
    BindIpFailed,
    WaitingForRunningDevice,
    RecoverFailed,
}

impl SessionState {
    /// Numeric status code used by operator front-ends.
    pub fn code(&self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::DeviceStarting => 1,
            SessionState::DeviceStarted => 2,
            SessionState::Connecting => 3,
            SessionState::Connected => 4,
            SessionState::DeviceUnsupported => 5,
            SessionState::CommissioningFailed => 6,
            SessionState::DacGenerating => 7,
            SessionState::DacGenerateFailed => 8,
            SessionState::DacGenerated => 9,
            SessionState::IpGenerating => 10,
            SessionState::IpGenerated => 11,
            SessionState::IpGenerateFailed => 12,
            SessionState::DeviceDuplicate => 13,
            SessionState::BluetoothCommissioningFailed => 14,
            SessionState::BindIpFailed => 15,
            SessionState::WaitingForRunningDevice => 16,
            SessionState::RecoverFailed => 18,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionState::DeviceUnsupported
                | SessionState::CommissioningFailed
                | SessionState::DacGenerateFailed
                | SessionState::IpGenerateFailed
                | SessionState::DeviceDuplicate
                | SessionState::BluetoothCommissioningFailed
                | SessionState::BindIpFailed
                | SessionState::WaitingForRunningDevice
                | SessionState::RecoverFailed
        )
    }
}

/// Notification published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub target_id: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// The lifecycle of the session running under `target_id` moved.
    StateChanged(SessionState),
    /// A start request for `target_id` was refused before admission. The
    /// state names the reason; a session already running under the same id
    /// is unaffected.
    Rejected(SessionState),
    OnboardingCode(OnboardingCodes),
    /// The session was torn down and forgotten.
    Stopped,
}

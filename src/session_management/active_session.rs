use crate::network::types::AllocatedAddresses;
use crate::process_management::device_process::DeviceProcess;
use crate::process_management::types::OnboardingCodes;
use crate::session_management::lifecycle::Lifecycle;
use crate::session_management::session::{RecoveryStatus, Session};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A session the orchestrator is running, with everything it holds.
pub struct ActiveSession {
    /// The session metadata and resources.
    pub session: Session,
    pub lifecycle: Lifecycle,
    /// Identifies this run; background tasks of an older run see a different
    /// id and leave the session alone.
    pub run_id: Uuid,
    /// Whether this session holds the commissioning gate.
    pub holds_gate: bool,
    /// Addresses bound on the interface, not yet released.
    pub bound: Option<AllocatedAddresses>,
    /// RPC port reserved by this run.
    pub rpc_port: Option<u16>,
    pub process: Option<DeviceProcess>,
    pub onboarding_codes: Option<OnboardingCodes>,
    pub onboarding_retry: Option<JoinHandle<()>>,
    /// Record and device-list write started when the device connected.
    pub persisting: Option<JoinHandle<()>>,
    /// Set when the commissioner removed the device; storage is dropped on stop.
    pub decommissioned: bool,
}

impl ActiveSession {
    pub fn new(session: Session, holds_gate: bool) -> Self {
        let recovering = session.is_recovering();
        Self {
            session,
            lifecycle: Lifecycle::new(recovering),
            run_id: Uuid::new_v4(),
            holds_gate,
            bound: None,
            rpc_port: None,
            process: None,
            onboarding_codes: None,
            onboarding_retry: None,
            persisting: None,
            decommissioned: false,
        }
    }

    pub fn is_run(&self, run_id: Uuid) -> bool {
        self.run_id == run_id
    }

    pub fn cancel_onboarding_retry(&mut self) {
        if let Some(timer) = self.onboarding_retry.take() {
            timer.abort();
        }
    }

    /// Storage survives a stop only for commissioned devices.
    pub fn keeps_storage(&self) -> bool {
        !self.decommissioned
            && (self.lifecycle.is_connected()
                || self.session.recovery != RecoveryStatus::NotCommissioned)
    }
}

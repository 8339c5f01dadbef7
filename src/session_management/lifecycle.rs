//! Per-session lifecycle state machine.
//!
//! The machine does no I/O. Orchestrator steps and device log lines go in,
//! a list of [`Effect`]s comes out; the orchestrator performs them (events,
//! timers, the commissioning gate, persistence of the recovered set).

use crate::session_management::SessionState;

const TRANSPORT_DISCONNECTED: &str = "Bluez notify CHIPoBluez connection disconnected";
const BIND_FAILURE: &str = "VerifyOrDie failure";
const DEVICE_STARTED: &str = "CHIP:SVR: SetupQRCode:";
const RENDEZVOUS_COMPLETED: &str = "Device completed Rendezvous process";
const COMMISSIONING_COMPLETE: &str = "GeneralCommissioning: Received CommissioningComplete";
const COMMISSIONING_FAILED: &str = "Commissioning failed";

/// Device log markers, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMarker {
    TransportDisconnected,
    BindFailure,
    DeviceStarted,
    RendezvousCompleted,
    CommissioningComplete,
    CommissioningFailed,
}

impl LogMarker {
    pub fn classify(line: &str) -> Option<Self> {
        if line.contains(TRANSPORT_DISCONNECTED) {
            Some(LogMarker::TransportDisconnected)
        } else if line.contains(BIND_FAILURE) {
            Some(LogMarker::BindFailure)
        } else if line.contains(DEVICE_STARTED) {
            Some(LogMarker::DeviceStarted)
        } else if line.contains(RENDEZVOUS_COMPLETED) {
            Some(LogMarker::RendezvousCompleted)
        } else if line.contains(COMMISSIONING_COMPLETE) {
            Some(LogMarker::CommissioningComplete)
        } else if line.contains(COMMISSIONING_FAILED) {
            Some(LogMarker::CommissioningFailed)
        } else {
            None
        }
    }
}

/// Steps the orchestrator performs itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupEvent {
    IpGenerationStarted,
    IpGenerated,
    IpGenerationFailed,
    RecoverFailed,
    DacGenerationStarted,
    DacGenerated,
    DacGenerationFailed,
    DeviceStarting,
    DeviceUnsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Transition(SessionState),
    EmitOnboardingCode,
    ScheduleOnboardingRetry,
    CancelOnboardingRetry,
    /// The session no longer blocks other commissioning attempts.
    ReleaseGate,
    /// Reached once per run. `newly_commissioned` is false for recovered sessions.
    Connected { newly_commissioned: bool },
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: SessionState,
    recovering: bool,
    device_started: bool,
    connected: bool,
    ip_bind_failed: bool,
}

impl Lifecycle {
    pub fn new(recovering: bool) -> Self {
        Self {
            state: SessionState::Disconnected,
            recovering,
            device_started: false,
            connected: false,
            ip_bind_failed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Sticky: set by the first bind failure marker, cleared only by [`reset`](Self::reset).
    pub fn ip_bind_failed(&self) -> bool {
        self.ip_bind_failed
    }

    fn transition(&mut self, state: SessionState, effects: &mut Vec<Effect>) {
        self.state = state;
        effects.push(Effect::Transition(state));
    }

    pub fn on_setup(&mut self, event: SetupEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            SetupEvent::IpGenerationStarted => {
                self.transition(SessionState::IpGenerating, &mut effects)
            }
            SetupEvent::IpGenerated => self.transition(SessionState::IpGenerated, &mut effects),
            SetupEvent::IpGenerationFailed => {
                self.transition(SessionState::IpGenerateFailed, &mut effects);
                effects.push(Effect::ReleaseGate);
            }
            SetupEvent::RecoverFailed => {
                self.transition(SessionState::RecoverFailed, &mut effects);
                effects.push(Effect::ReleaseGate);
            }
            SetupEvent::DacGenerationStarted => {
                self.transition(SessionState::DacGenerating, &mut effects)
            }
            SetupEvent::DacGenerated => self.transition(SessionState::DacGenerated, &mut effects),
            SetupEvent::DacGenerationFailed => {
                self.transition(SessionState::DacGenerateFailed, &mut effects);
                effects.push(Effect::ReleaseGate);
            }
            SetupEvent::DeviceStarting => {
                self.transition(SessionState::DeviceStarting, &mut effects);
                if !self.recovering && !self.device_started {
                    effects.push(Effect::ScheduleOnboardingRetry);
                }
            }
            SetupEvent::DeviceUnsupported => {
                self.transition(SessionState::DeviceUnsupported, &mut effects);
                effects.push(Effect::ReleaseGate);
            }
        }
        effects
    }

    pub fn on_log_line(&mut self, line: &str) -> Vec<Effect> {
        let Some(marker) = LogMarker::classify(line) else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        match marker {
            LogMarker::TransportDisconnected => {
                self.transition(SessionState::BluetoothCommissioningFailed, &mut effects);
                effects.push(Effect::CancelOnboardingRetry);
                effects.push(Effect::ReleaseGate);
            }
            LogMarker::BindFailure => {
                self.ip_bind_failed = true;
                self.transition(SessionState::BindIpFailed, &mut effects);
                effects.push(Effect::CancelOnboardingRetry);
                effects.push(Effect::ReleaseGate);
            }
            LogMarker::DeviceStarted => {
                if self.device_started {
                    return effects;
                }
                self.device_started = true;
                self.transition(SessionState::DeviceStarted, &mut effects);
                effects.push(Effect::CancelOnboardingRetry);
                if self.recovering {
                    // A recovered device is already commissioned.
                    self.connect(&mut effects);
                } else {
                    effects.push(Effect::EmitOnboardingCode);
                }
            }
            LogMarker::RendezvousCompleted => {
                if !self.connected {
                    self.transition(SessionState::Connecting, &mut effects);
                }
            }
            LogMarker::CommissioningComplete => {
                if !self.connected {
                    effects.push(Effect::CancelOnboardingRetry);
                    self.connect(&mut effects);
                }
            }
            LogMarker::CommissioningFailed => {
                if !self.connected {
                    self.transition(SessionState::CommissioningFailed, &mut effects);
                    effects.push(Effect::CancelOnboardingRetry);
                    effects.push(Effect::ReleaseGate);
                }
            }
        }
        effects
    }

    fn connect(&mut self, effects: &mut Vec<Effect>) {
        self.connected = true;
        self.transition(SessionState::Connected, effects);
        effects.push(Effect::ReleaseGate);
        effects.push(Effect::Connected {
            newly_commissioned: !self.recovering,
        });
    }

    /// The onboarding retry timer fired. Emits the code once if the device has
    /// not announced itself yet.
    pub fn on_retry_elapsed(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.device_started
            || self.recovering
            || self.state != SessionState::DeviceStarting
        {
            return effects;
        }
        self.device_started = true;
        self.transition(SessionState::DeviceStarted, &mut effects);
        effects.push(Effect::EmitOnboardingCode);
        effects
    }

    /// Back to `Disconnected` with every flag cleared.
    pub fn reset(&mut self) -> Vec<Effect> {
        self.device_started = false;
        self.connected = false;
        self.ip_bind_failed = false;
        let mut effects = vec![Effect::CancelOnboardingRetry];
        self.transition(SessionState::Disconnected, &mut effects);
        effects
    }
}

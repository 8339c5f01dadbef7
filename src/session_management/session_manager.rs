use crate::configuration::config::Config;
use crate::configuration::types::{DeviceRequest, DeviceTypeConfig, IdentityConstraints};
use crate::error_handling::types::{NetworkError, SessionError};
use crate::network::address_allocator::AddressAllocator;
use crate::network::resource_registry::ResourceRegistry;
use crate::network::types::{AllocatedAddresses, AllocationRequest, Resource};
use crate::process_management::device_log::DeviceLogRecorder;
use crate::process_management::device_process::{DeviceProcess, LogLines};
use crate::process_management::external_tools::{DacGenerator, PayloadGenerator};
use crate::process_management::types::{DeviceCommand, LaunchParams, OnboardingCodes};
use crate::session_management::active_session::ActiveSession;
use crate::session_management::commissioning_gate::CommissioningGate;
use crate::session_management::lifecycle::{Effect, SetupEvent};
use crate::session_management::rpc::{call_with_timeout, DeviceState, RpcEndpoint};
use crate::session_management::session::{DeviceIdentity, RecoveryStatus, Session};
use crate::session_management::{SessionEvent, SessionEventKind, SessionState};
use crate::storage::device_list::DeviceListFile;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{FactoryRecord, StoredSession};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const RPC_HOST: &str = "localhost";

/// Tunables of the orchestrator.
///
/// # Fields Overview
///
/// - `constraints`: identity limits checked before a fresh start
/// - `device_types`: supported device applications, by code
/// - `max_devices`: upper bound of live sessions
/// - `rpc_base_port`: RPC ports are handed out above it
/// - `onboarding_retry`: delay before the onboarding code is emitted anyway
/// - `stop_grace`: how long a device may take to exit after SIGTERM
/// - `rpc_timeout`: bound of one device RPC call
/// - `device_log_dir`: where device output is saved, `None` to not save it
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub constraints: IdentityConstraints,
    pub device_types: Vec<DeviceTypeConfig>,
    pub max_devices: usize,
    pub rpc_base_port: u16,
    pub onboarding_retry: Duration,
    pub stop_grace: Duration,
    pub rpc_timeout: Duration,
    pub device_log_dir: Option<PathBuf>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            constraints: config.constraints.clone(),
            device_types: config.device_types.clone(),
            max_devices: config.max_devices,
            rpc_base_port: config.rpc_base_port,
            onboarding_retry: config.onboarding_retry(),
            stop_grace: config.stop_grace(),
            rpc_timeout: config.rpc_timeout(),
            device_log_dir: config.save_device_logs.then(|| config.log_dir.clone()),
        }
    }
}

/// External tools run while a fresh session starts.
#[derive(Clone)]
pub struct ExternalTools {
    pub dac: Arc<dyn DacGenerator>,
    /// Without a payload generator no onboarding code is emitted.
    pub payload: Option<Arc<dyn PayloadGenerator>>,
}

/// Where a session to admit comes from.
enum SessionSource {
    Fresh(DeviceIdentity),
    Stored(StoredSession),
}

enum SetupOutcome {
    Running(LogLines, String),
    Failed,
    Superseded,
}

struct Inner {
    settings: SessionSettings,
    device_types: HashMap<String, DeviceTypeConfig>,
    registry: Arc<ResourceRegistry>,
    allocator: Arc<AddressAllocator>,
    storage: Arc<dyn Storage>,
    device_list: Arc<DeviceListFile>,
    tools: ExternalTools,
    gate: CommissioningGate,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    events: broadcast::Sender<SessionEvent>,
}

/// The orchestrator of device sessions.
///
/// On start it admits the session (duplicate check, device limit,
/// commissioning gate), then a background task generates the DAC, allocates
/// addresses, reserves an RPC port, persists the record, spawns the device
/// and feeds its output to the session's lifecycle. On stop it
/// reverses all of it. State changes are published on a broadcast channel,
/// see [`subscribe`](Self::subscribe).
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        registry: Arc<ResourceRegistry>,
        allocator: Arc<AddressAllocator>,
        storage: Arc<dyn Storage>,
        device_list: Arc<DeviceListFile>,
        tools: ExternalTools,
    ) -> Self {
        let device_types = settings
            .device_types
            .iter()
            .map(|t| (t.code.clone(), t.clone()))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                device_types,
                registry,
                allocator,
                storage,
                device_list,
                tools,
                gate: CommissioningGate::new(),
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn session_state(&self, target_id: &str) -> Option<SessionState> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(target_id).map(|a| a.lifecycle.state())
    }

    pub async fn session(&self, target_id: &str) -> Option<Session> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(target_id).map(|a| a.session.clone())
    }

    pub async fn live_sessions(&self) -> Vec<String> {
        let sessions = self.inner.sessions.lock().await;
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Starts a device described by a configuration entry.
    pub async fn start_device(&self, request: &DeviceRequest) -> Result<String, SessionError> {
        let identity = DeviceIdentity::from_request(request, &self.inner.settings.constraints);
        self.start_session(identity).await
    }

    /// Validates the identity and admits a new session. Setup continues in the
    /// background; follow it with [`subscribe`](Self::subscribe).
    ///
    /// A target whose committed record is still on disk is resumed with its
    /// persisted resources instead of being commissioned again.
    pub async fn start_session(&self, identity: DeviceIdentity) -> Result<String, SessionError> {
        let target_id = identity.target_id();
        if let Err(e) = identity.validate(&self.inner.settings.constraints) {
            warn!("Rejected {}: {}", target_id, e);
            return Err(SessionError::Validation(e));
        }
        self.launch(SessionSource::Fresh(identity)).await
    }

    /// Boot recovery: reconciles storage and resumes every committed session
    /// in creation order. A session that cannot be resumed is logged and
    /// skipped.
    pub async fn recover_sessions(&self) -> Result<Vec<String>, SessionError> {
        let stored = self.inner.storage.reconcile_on_boot()?;
        info!("{} session(s) to recover", stored.len());

        // Keep fresh allocations away from every recoverable resource first.
        for s in &stored {
            self.inner.registry.record_recovered(&s.record.resources());
        }

        let mut recovered = Vec::with_capacity(stored.len());
        for s in stored {
            let target_id = s.target_id.clone();
            match self.launch(SessionSource::Stored(s)).await {
                Ok(id) => recovered.push(id),
                Err(e) => warn!("Could not recover {}: {}", target_id, e),
            }
        }
        Ok(recovered)
    }

    /// Tears a session down. Stopping an unknown or already stopped session
    /// does nothing.
    pub async fn stop_session(&self, target_id: &str) {
        self.stop_run(target_id, None).await;
    }

    pub async fn stop_all(&self) {
        for target_id in self.live_sessions().await {
            self.stop_session(&target_id).await;
        }
    }

    pub async fn rpc_endpoint(&self, target_id: &str) -> Option<RpcEndpoint> {
        let sessions = self.inner.sessions.lock().await;
        let port = sessions.get(target_id)?.rpc_port?;
        Some(RpcEndpoint {
            host: RPC_HOST.to_string(),
            port,
        })
    }

    /// Asks the device for its state through `query` and applies the answer.
    /// The call is bounded by the configured RPC timeout.
    pub async fn refresh_device_state<F, Fut>(
        &self,
        target_id: &str,
        query: F,
    ) -> Result<bool, SessionError>
    where
        F: FnOnce(RpcEndpoint) -> Fut,
        Fut: Future<Output = Result<DeviceState, SessionError>>,
    {
        let endpoint = self
            .rpc_endpoint(target_id)
            .await
            .ok_or_else(|| SessionError::NotFound(target_id.to_string()))?;
        let state = call_with_timeout(self.inner.settings.rpc_timeout, query(endpoint)).await??;
        self.apply_device_state(target_id, state).await
    }

    /// Handles a device state report. A connected device that left its last
    /// fabric was removed by its commissioner: it is forgotten and stopped.
    /// Returns whether the session was removed.
    pub async fn apply_device_state(
        &self,
        target_id: &str,
        state: DeviceState,
    ) -> Result<bool, SessionError> {
        {
            let mut sessions = self.inner.sessions.lock().await;
            let active = sessions
                .get_mut(target_id)
                .ok_or_else(|| SessionError::NotFound(target_id.to_string()))?;
            if !active.lifecycle.is_connected() || state.fabric_count > 0 {
                return Ok(false);
            }
            info!("Device {} left its last fabric, removing it", target_id);
            self.inner
                .registry
                .forget_recovered(&active.session.resources);
            active.session.recovery = RecoveryStatus::NotCommissioned;
            active.decommissioned = true;
        }
        self.stop_session(target_id).await;
        Ok(true)
    }

    fn emit(&self, target_id: &str, kind: SessionEventKind) {
        // No subscriber is not an error.
        let _ = self.inner.events.send(SessionEvent {
            target_id: target_id.to_string(),
            kind,
        });
    }

    async fn launch(&self, source: SessionSource) -> Result<String, SessionError> {
        let (target_id, run_id) = self.admit(source).await?;
        let manager = self.clone();
        let id = target_id.clone();
        tokio::spawn(async move { manager.run(id, run_id).await });
        Ok(target_id)
    }

    /// Registers the session, or refuses it before any resource is touched.
    async fn admit(&self, source: SessionSource) -> Result<(String, Uuid), SessionError> {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock().await;

        let target_id = match &source {
            SessionSource::Fresh(identity) => identity.target_id(),
            SessionSource::Stored(stored) => stored.target_id.clone(),
        };
        if sessions.contains_key(&target_id) {
            warn!("Device {} is already running", target_id);
            self.emit(
                &target_id,
                SessionEventKind::Rejected(SessionState::DeviceDuplicate),
            );
            return Err(SessionError::DuplicateIdentity(target_id));
        }
        if sessions.len() >= inner.settings.max_devices {
            warn!(
                "Refusing {}: {} device(s) already running",
                target_id, inner.settings.max_devices
            );
            return Err(SessionError::SessionLimitReached);
        }

        let session = match source {
            SessionSource::Stored(stored) => {
                Session::from_stored(&stored, inner.settings.constraints.vendor_id.default_value)
            }
            SessionSource::Fresh(identity) => match inner.storage.read_record(&target_id) {
                Ok(Some(record)) if record.is_recover => {
                    info!("Resuming commissioned device {}", target_id);
                    let stored = StoredSession {
                        target_id: target_id.clone(),
                        record,
                    };
                    inner.registry.record_recovered(&stored.record.resources());
                    Session::from_stored(&stored, identity.vendor_id)
                }
                Ok(_) => Session::new(identity),
                Err(e) => {
                    warn!("Could not read stored record of {}: {}", target_id, e);
                    Session::new(identity)
                }
            },
        };

        let device_type = &session.identity.device_type;
        if !inner.device_types.contains_key(device_type) {
            warn!("Device type {} of {} is not supported", device_type, target_id);
            self.emit(
                &target_id,
                SessionEventKind::Rejected(SessionState::DeviceUnsupported),
            );
            return Err(SessionError::UnsupportedDeviceType(device_type.clone()));
        }

        let recovering = session.is_recovering();
        if !recovering {
            if let Err(holder) = inner.gate.try_acquire(&target_id) {
                info!(
                    "{} must wait, {} is still being commissioned",
                    target_id, holder
                );
                self.emit(
                    &target_id,
                    SessionEventKind::Rejected(SessionState::WaitingForRunningDevice),
                );
                return Err(SessionError::WaitingForRunningDevice(holder));
            }
            let initial = inner
                .storage
                .create(&target_id)
                .and_then(|_| inner.storage.write_record(&target_id, &session.to_record()));
            if let Err(e) = initial {
                error!("Failed to create storage of {}: {}", target_id, e);
                inner.gate.release(&target_id);
                return Err(SessionError::Storage(e));
            }
        }

        let active = ActiveSession::new(session, !recovering);
        let run_id = active.run_id;
        sessions.insert(target_id.clone(), active);
        info!(
            "Session {} admitted ({})",
            target_id,
            if recovering { "recovery" } else { "fresh" }
        );
        Ok((target_id, run_id))
    }

    async fn run(self, target_id: String, run_id: Uuid) {
        match self.setup(&target_id, run_id).await {
            SetupOutcome::Running(lines, device_code) => {
                self.follow_log(&target_id, run_id, lines, &device_code)
                    .await
            }
            SetupOutcome::Failed => debug!("Setup of {} failed, waiting for stop", target_id),
            SetupOutcome::Superseded => debug!("Session {} was stopped during setup", target_id),
        }
    }

    /// Feeds an orchestrator step to the lifecycle. `None` if the run is over.
    async fn setup_step(&self, target_id: &str, run_id: Uuid, event: SetupEvent) -> Option<Session> {
        let mut sessions = self.inner.sessions.lock().await;
        let active = current(&mut sessions, target_id, run_id)?;
        let effects = active.lifecycle.on_setup(event);
        self.apply_effects(target_id, active, effects);
        Some(active.session.clone())
    }

    /// Moves the session to a failure state and gives back what it holds. The
    /// session stays listed until stopped.
    async fn fail_setup(&self, target_id: &str, run_id: Uuid, event: SetupEvent) -> SetupOutcome {
        let addresses = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(active) = current(&mut sessions, target_id, run_id) else {
                return SetupOutcome::Superseded;
            };
            let effects = active.lifecycle.on_setup(event);
            self.apply_effects(target_id, active, effects);
            self.take_resources(active)
        };
        if let Some(addresses) = addresses {
            self.release_addresses(addresses).await;
        }
        SetupOutcome::Failed
    }

    async fn setup(&self, target_id: &str, run_id: Uuid) -> SetupOutcome {
        let Some(session) = self.current_session(target_id, run_id).await else {
            return SetupOutcome::Superseded;
        };
        let recovering = session.is_recovering();

        // Credentials first: a failing tool must not cost an address probe.
        if !recovering {
            if let Err(e) = self.generate_dac(target_id).await {
                error!("DAC generation for {} failed: {}", target_id, e);
                return self
                    .fail_setup(target_id, run_id, SetupEvent::DacGenerationFailed)
                    .await;
            }
        }

        if self
            .setup_step(target_id, run_id, SetupEvent::IpGenerationStarted)
            .await
            .is_none()
        {
            return SetupOutcome::Superseded;
        }

        let request = if recovering {
            match session.resources.addresses() {
                Some(known) => AllocationRequest::Recovery(known),
                None => {
                    error!("Stored record of {} holds no addresses", target_id);
                    return self
                        .fail_setup(target_id, run_id, SetupEvent::RecoverFailed)
                        .await;
                }
            }
        } else {
            AllocationRequest::Fresh
        };

        let allocator = self.inner.allocator.clone();
        let addresses =
            match tokio::task::spawn_blocking(move || allocator.allocate(&request)).await {
                Ok(Ok(a)) => a,
                Ok(Err(e)) => {
                    error!("Address allocation for {} failed: {}", target_id, e);
                    let event = if recovering || matches!(e, NetworkError::RecoveryConflict(_)) {
                        SetupEvent::RecoverFailed
                    } else {
                        SetupEvent::IpGenerationFailed
                    };
                    return self.fail_setup(target_id, run_id, event).await;
                }
                Err(e) => {
                    error!("Address allocation task for {} failed: {}", target_id, e);
                    return self
                        .fail_setup(target_id, run_id, SetupEvent::IpGenerationFailed)
                        .await;
                }
            };

        let adopted = {
            let mut sessions = self.inner.sessions.lock().await;
            match current(&mut sessions, target_id, run_id) {
                Some(active) => {
                    active.bound = Some(addresses);
                    active.session.resources.ipv4 = Some(addresses.ipv4);
                    active.session.resources.ipv6 = Some(addresses.ipv6);
                    active.session.resources.interface_index = Some(addresses.interface_index);
                    let effects = active.lifecycle.on_setup(SetupEvent::IpGenerated);
                    self.apply_effects(target_id, active, effects);
                    true
                }
                None => false,
            }
        };
        if !adopted {
            self.release_addresses(addresses).await;
            return SetupOutcome::Superseded;
        }

        if !recovering {
            // The credentials already exist; report the step in lifecycle order.
            for event in [SetupEvent::DacGenerationStarted, SetupEvent::DacGenerated] {
                if self.setup_step(target_id, run_id, event).await.is_none() {
                    return SetupOutcome::Superseded;
                }
            }
        }

        let codes = if recovering {
            None
        } else {
            self.onboarding_codes(&session.identity).await
        };

        self.spawn_device(target_id, run_id, addresses, codes).await
    }

    async fn current_session(&self, target_id: &str, run_id: Uuid) -> Option<Session> {
        let mut sessions = self.inner.sessions.lock().await;
        current(&mut sessions, target_id, run_id).map(|a| a.session.clone())
    }

    async fn generate_dac(&self, target_id: &str) -> Result<(), SessionError> {
        let dac = self.inner.tools.dac.clone();
        let id = target_id.to_string();
        tokio::task::spawn_blocking(move || dac.generate(&id))
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))??;
        Ok(())
    }

    /// Writes the record on the blocking pool.
    async fn persist(&self, target_id: &str, record: FactoryRecord) -> Result<(), SessionError> {
        let storage = self.inner.storage.clone();
        let id = target_id.to_string();
        tokio::task::spawn_blocking(move || storage.write_record(&id, &record))
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))??;
        Ok(())
    }

    async fn onboarding_codes(&self, identity: &DeviceIdentity) -> Option<OnboardingCodes> {
        let generator = self.inner.tools.payload.clone()?;
        let params = identity.payload_params();
        match tokio::task::spawn_blocking(move || generator.generate(&params)).await {
            Ok(Ok(codes)) => Some(codes),
            Ok(Err(e)) => {
                warn!("No onboarding codes for {}: {}", identity.target_id(), e);
                None
            }
            Err(e) => {
                warn!("Payload generation task failed: {}", e);
                None
            }
        }
    }

    /// Reserves the RPC port, persists the record and starts the device.
    async fn spawn_device(
        &self,
        target_id: &str,
        run_id: Uuid,
        addresses: AllocatedAddresses,
        codes: Option<OnboardingCodes>,
    ) -> SetupOutcome {
        let inner = &self.inner;
        let reserved = {
            let mut sessions = inner.sessions.lock().await;
            let Some(active) = current(&mut sessions, target_id, run_id) else {
                return SetupOutcome::Superseded;
            };
            let port = match (active.session.is_recovering(), active.session.resources.rpc_port) {
                (true, Some(port)) => {
                    inner.registry.reserve(Resource::RpcPort(port));
                    Ok(port)
                }
                _ => inner.registry.claim_rpc_port(inner.settings.rpc_base_port),
            };
            port.map(|port| {
                active.rpc_port = Some(port);
                active.session.resources.rpc_port = Some(port);
                active.session.to_record()
            })
        };
        let record = match reserved {
            Ok(record) => record,
            Err(e) => {
                error!("No RPC port for {}: {}", target_id, e);
                return self
                    .fail_setup(target_id, run_id, SetupEvent::IpGenerationFailed)
                    .await;
            }
        };
        if let Err(e) = self.persist(target_id, record).await {
            error!("Failed to persist resources of {}: {}", target_id, e);
            return self
                .fail_setup(target_id, run_id, SetupEvent::IpGenerationFailed)
                .await;
        }

        let mut sessions = inner.sessions.lock().await;
        let Some(active) = current(&mut sessions, target_id, run_id) else {
            return SetupOutcome::Superseded;
        };
        active.onboarding_codes = codes;

        let identity = active.session.identity.clone();
        let Some(device_type) = inner.device_types.get(&identity.device_type) else {
            drop(sessions);
            return self
                .fail_setup(target_id, run_id, SetupEvent::DeviceUnsupported)
                .await;
        };
        let params = LaunchParams {
            discriminator: identity.discriminator,
            passcode: identity.pin_code,
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            kvs_path: inner
                .storage
                .session_dir(target_id)
                .join(format!("chip_kvs_{}", target_id)),
            rpc_port: active.rpc_port.unwrap_or(inner.settings.rpc_base_port),
            ipv4: addresses.ipv4,
            ipv6: addresses.ipv6,
        };

        let effects = active.lifecycle.on_setup(SetupEvent::DeviceStarting);
        self.apply_effects(target_id, active, effects);

        let mut process = DeviceProcess::new(
            DeviceCommand::for_device(device_type, &params),
            inner.settings.stop_grace,
        );
        match process.execute().and_then(|_| process.log_lines()) {
            Ok(lines) => {
                active.process = Some(process);
                SetupOutcome::Running(lines, device_type.code.clone())
            }
            Err(e) => {
                error!("Device {} did not start: {}", target_id, e);
                drop(sessions);
                self.fail_setup(target_id, run_id, SetupEvent::DeviceUnsupported)
                    .await
            }
        }
    }

    async fn follow_log(&self, target_id: &str, run_id: Uuid, mut lines: LogLines, device_code: &str) {
        let mut recorder = match &self.inner.settings.device_log_dir {
            Some(dir) => match DeviceLogRecorder::create(dir, device_code, target_id).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!("Not saving device log of {}: {}", target_id, e);
                    None
                }
            },
            None => None,
        };

        while let Some(line) = lines.next_line().await {
            debug!("[{}] {}", target_id, line);
            if let Some(recorder) = recorder.as_mut() {
                recorder.record(&line).await;
            }
            let mut sessions = self.inner.sessions.lock().await;
            let Some(active) = current(&mut sessions, target_id, run_id) else {
                break;
            };
            let effects = active.lifecycle.on_log_line(&line);
            if !effects.is_empty() {
                self.apply_effects(target_id, active, effects);
            }
        }
        if let Some(recorder) = recorder.as_mut() {
            recorder.flush().await;
        }

        info!("Device output of {} closed", target_id);
        self.stop_run(target_id, Some(run_id)).await;
    }

    async fn on_retry_elapsed(&self, target_id: &str, run_id: Uuid) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(active) = current(&mut sessions, target_id, run_id) {
            active.onboarding_retry = None;
            let effects = active.lifecycle.on_retry_elapsed();
            self.apply_effects(target_id, active, effects);
        }
    }

    fn apply_effects(&self, target_id: &str, active: &mut ActiveSession, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Transition(state) => {
                    info!("{}: {:?}", target_id, state);
                    self.emit(target_id, SessionEventKind::StateChanged(state));
                }
                Effect::EmitOnboardingCode => match &active.onboarding_codes {
                    Some(codes) => {
                        info!(
                            "{} onboarding codes: {} / {}",
                            target_id, codes.qr_code, codes.manual_code
                        );
                        self.emit(target_id, SessionEventKind::OnboardingCode(codes.clone()));
                    }
                    None => debug!("No onboarding codes to show for {}", target_id),
                },
                Effect::ScheduleOnboardingRetry => {
                    active.cancel_onboarding_retry();
                    let manager = self.clone();
                    let id = target_id.to_string();
                    let run_id = active.run_id;
                    let delay = self.inner.settings.onboarding_retry;
                    active.onboarding_retry = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        manager.on_retry_elapsed(&id, run_id).await;
                    }));
                }
                Effect::CancelOnboardingRetry => active.cancel_onboarding_retry(),
                Effect::ReleaseGate => {
                    if active.holds_gate {
                        self.inner.gate.release(target_id);
                        active.holds_gate = false;
                    }
                }
                Effect::Connected { newly_commissioned } => {
                    self.on_connected(target_id, active, newly_commissioned)
                }
            }
        }
    }

    /// Lists the device as connected and, once commissioned, marks its record
    /// for recovery. The files are written off the sessions lock; a stop
    /// waits for the write before touching them.
    fn on_connected(&self, target_id: &str, active: &mut ActiveSession, newly_commissioned: bool) {
        let record = if newly_commissioned {
            if self.inner.registry.record_recovered(&active.session.resources) {
                debug!("Resources of {} kept for recovery", target_id);
            }
            active.session.recovery = RecoveryStatus::Commissioned;
            Some(active.session.to_record())
        } else {
            None
        };

        let storage = self.inner.storage.clone();
        let device_list = self.inner.device_list.clone();
        let id = target_id.to_string();
        active.persisting = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = device_list.add(&id) {
                warn!("Failed to list {} as connected: {}", id, e);
            }
            // Keys the session does not carry, like unique-id, stay as on disk.
            if let Some(record) = record {
                match storage.write_record(&id, &record) {
                    Ok(()) => info!("{} commissioned, it will be recovered on restart", id),
                    Err(e) => error!("Failed to persist commissioning of {}: {}", id, e),
                }
            }
        }));
    }

    /// Releases the RPC port and hands back the addresses still bound. The
    /// caller unbinds them off the lock.
    fn take_resources(&self, active: &mut ActiveSession) -> Option<AllocatedAddresses> {
        if let Some(port) = active.rpc_port.take() {
            self.inner.registry.release(Resource::RpcPort(port));
        }
        active.bound.take()
    }

    async fn release_addresses(&self, addresses: AllocatedAddresses) {
        let allocator = self.inner.allocator.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || allocator.release(&addresses)).await {
            warn!("Failed to release {} / {}: {}", addresses.ipv4, addresses.ipv6, e);
        }
    }

    /// Stops the session if it is still on run `run_id` (any run if `None`).
    async fn stop_run(&self, target_id: &str, run_id: Option<Uuid>) {
        let removed = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get(target_id) {
                Some(active) if run_id.map_or(true, |id| active.is_run(id)) => {
                    sessions.remove(target_id)
                }
                _ => None,
            }
        };
        let Some(mut active) = removed else {
            debug!("No live session {} to stop", target_id);
            return;
        };
        info!("Stopping session {}", target_id);

        active.cancel_onboarding_retry();
        if active.holds_gate {
            self.inner.gate.release(target_id);
            active.holds_gate = false;
        }
        if let Some(mut process) = active.process.take() {
            process.stop().await;
        }

        if active.lifecycle.ip_bind_failed() {
            warn!(
                "{} reported a bind failure, its aliases may already be gone",
                target_id
            );
        }
        if let Some(addresses) = self.take_resources(&mut active) {
            self.release_addresses(addresses).await;
        }

        if let Some(write) = active.persisting.take() {
            if let Err(e) = write.await {
                warn!("Pending write of {} failed: {}", target_id, e);
            }
        }
        if active.keeps_storage() {
            info!("Keeping storage of commissioned device {}", target_id);
        } else {
            self.inner.storage.remove(target_id);
        }
        if let Err(e) = self.inner.device_list.remove(target_id) {
            warn!("Failed to unlist {}: {}", target_id, e);
        }

        let effects = active.lifecycle.reset();
        self.apply_effects(target_id, &mut active, effects);
        self.emit(target_id, SessionEventKind::Stopped);
    }
}

fn current<'a>(
    sessions: &'a mut HashMap<String, ActiveSession>,
    target_id: &str,
    run_id: Uuid,
) -> Option<&'a mut ActiveSession> {
    sessions.get_mut(target_id).filter(|a| a.is_run(run_id))
}

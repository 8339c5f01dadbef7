use crate::configuration::config::Config;
use crate::configuration::types::DeviceRequest;
use crate::error_handling::types::{ControllerError, NetworkError, SessionError};
use crate::network::address_allocator::{AddressAllocator, AllocatorSettings};
use crate::network::interface_binder::{InterfaceBinder, IpCommandBinder};
use crate::network::network_info::{select_interface, NetworkInfo};
use crate::network::reachability::PingProbe;
use crate::network::resource_registry::ResourceRegistry;
use crate::network::types::BaseAddresses;
use crate::process_management::device_log::prune_log_days;
use crate::process_management::external_tools::{
    CommandDacGenerator, CommandPayloadGenerator, DacGenerator, PayloadGenerator, SkipDacGenerator,
};
use crate::session_management::session_manager::{ExternalTools, SessionManager, SessionSettings};
use crate::session_management::{SessionEvent, SessionEventKind, SessionState};
use crate::storage::device_list::DeviceListFile;
use crate::storage::file_storage::FileStorage;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const SYS_CLASS_NET: &str = "/sys/class/net";
const REACHABILITY_POLL: Duration = Duration::from_millis(500);

/// Host network state found at boot.
struct HostNetwork {
    interface: String,
    base: BaseAddresses,
    binder: Arc<IpCommandBinder>,
}

pub struct Controller {
    config: Config,
    /// Configured devices refused while another device was being commissioned.
    pending: VecDeque<DeviceRequest>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate()?;
        let pending = config.devices.iter().cloned().collect();
        Ok(Self { config, pending })
    }

    /// Boots, runs until Ctrl-C, then stops every session.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let network = self.prepare_network().await?;

        let device_list = Arc::new(DeviceListFile::new(self.config.device_list_path())?);
        device_list.clear()?;

        if self.config.save_device_logs {
            let removed = prune_log_days(&self.config.log_dir, self.config.keep_log_days);
            if removed > 0 {
                info!("Removed {} old device log day(s)", removed);
            }
        }

        let manager = self.build_manager(network, device_list.clone())?;
        let mut events = manager.subscribe();

        match manager.recover_sessions().await {
            Ok(recovered) => info!("Recovering {} device(s)", recovered.len()),
            Err(e) => error!("Boot recovery failed: {}", e),
        }
        self.start_pending(&manager).await;

        info!("Emulator running, press Ctrl-C to stop");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        let frees_gate = Self::log_event(&event);
                        if frees_gate {
                            self.start_pending(&manager).await;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} session event(s)", missed),
                    Err(RecvError::Closed) => break,
                },
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                    info!("Shutting down");
                    break;
                }
            }
        }

        manager.stop_all().await;
        device_list.clear()?;
        info!("All devices stopped");
        Ok(())
    }

    /// Chooses the interface, snapshots it, finds the base addresses and
    /// drops aliases left behind by a previous run.
    async fn prepare_network(&self) -> Result<HostNetwork, ControllerError> {
        let configured = self.config.interface.clone();
        let info_path = self.config.network_info_path();
        let use_sudo = self.config.use_sudo;

        let network = tokio::task::spawn_blocking(move || -> Result<HostNetwork, NetworkError> {
            let interface = select_interface(configured.as_deref(), Path::new(SYS_CLASS_NET))?;
            let info = NetworkInfo::capture(&interface)?;
            info.store(&info_path)?;
            info.ensure_operational()?;
            let base = info.base_addresses(&interface)?;
            info!(
                "Base addresses on {}: {} / {}",
                interface, base.ipv4, base.ipv6
            );

            let binder = Arc::new(IpCommandBinder::new(&interface, use_sudo));
            for alias in info.stale_aliases(&interface, &base) {
                match binder.unbind(alias) {
                    Ok(()) => info!("Removed stale alias {}", alias),
                    Err(e) => warn!("Failed to remove stale alias {}: {}", alias, e),
                }
            }
            Ok(HostNetwork {
                interface,
                base,
                binder,
            })
        })
        .await
        .map_err(|e| ControllerError::Session(SessionError::TaskFailed(e.to_string())))??;
        Ok(network)
    }

    fn build_manager(
        &self,
        network: HostNetwork,
        device_list: Arc<DeviceListFile>,
    ) -> Result<SessionManager, ControllerError> {
        let config = &self.config;
        let registry = Arc::new(ResourceRegistry::new());
        let probe = Arc::new(PingProbe::new(&network.interface)?);
        let allocator = Arc::new(AddressAllocator::new(
            network.base,
            registry.clone(),
            probe,
            network.binder,
            AllocatorSettings {
                reachability_timeout: config.reachability_timeout(),
                poll_interval: REACHABILITY_POLL,
                ipv6_probe_budget: config.ipv6_probe_budget,
            },
        ));
        let storage = Arc::new(FileStorage::new(
            config.storage_dir(),
            config.min_storage_files,
        )?);

        let dac: Arc<dyn DacGenerator> = match &config.dac_tool {
            Some(tool) => Arc::new(CommandDacGenerator::new(tool.clone())),
            None => {
                warn!("No DAC tool configured, devices keep their test credentials");
                Arc::new(SkipDacGenerator)
            }
        };
        let payload: Option<Arc<dyn PayloadGenerator>> = match &config.payload_tool {
            Some(tool) => Some(Arc::new(
                CommandPayloadGenerator::new(tool.clone()).map_err(SessionError::from)?,
            )),
            None => {
                warn!("No payload tool configured, onboarding codes will not be shown");
                None
            }
        };

        Ok(SessionManager::new(
            SessionSettings::from_config(config),
            registry,
            allocator,
            storage,
            device_list,
            ExternalTools { dac, payload },
        ))
    }

    /// Starts queued configured devices until one has to wait for the
    /// commissioning gate.
    async fn start_pending(&mut self, manager: &SessionManager) {
        while let Some(request) = self.pending.pop_front() {
            match manager.start_device(&request).await {
                Ok(target_id) => info!("Started configured device {}", target_id),
                Err(SessionError::WaitingForRunningDevice(holder)) => {
                    debug!("Configured devices wait for {}", holder);
                    self.pending.push_front(request);
                    return;
                }
                Err(e) => error!(
                    "Could not start configured device {}: {}",
                    request.device_type, e
                ),
            }
        }
    }

    /// Logs one event. Returns whether it may have freed the commissioning gate.
    fn log_event(event: &SessionEvent) -> bool {
        match &event.kind {
            SessionEventKind::StateChanged(state) => {
                if state.is_failure() {
                    warn!("[{}] {:?}", event.target_id, state);
                } else {
                    info!("[{}] {:?}", event.target_id, state);
                }
                *state == SessionState::Connected || state.is_failure()
            }
            SessionEventKind::Rejected(reason) => {
                warn!("[{}] start refused: {:?}", event.target_id, reason);
                false
            }
            SessionEventKind::OnboardingCode(codes) => {
                info!(
                    "[{}] QR code: {}  manual code: {}",
                    event.target_id, codes.qr_code, codes.manual_code
                );
                false
            }
            SessionEventKind::Stopped => {
                info!("[{}] stopped", event.target_id);
                true
            }
        }
    }
}

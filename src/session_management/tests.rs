use crate::configuration::types::{DeviceTypeConfig, IdentityConstraints};
use crate::error_handling::types::{ProcessError, SessionError, ValidationError};
use crate::network::address_allocator::tests::{base, FakeNetwork};
use crate::network::address_allocator::{AddressAllocator, AllocatorSettings};
use crate::network::resource_registry::ResourceRegistry;
use crate::network::types::Resource;
use crate::process_management::external_tools::{DacGenerator, PayloadGenerator};
use crate::process_management::types::{OnboardingCodes, PayloadParams};
use crate::session_management::rpc::DeviceState;
use crate::session_management::session::tests::identity;
use crate::session_management::{
    ExternalTools, SessionEvent, SessionEventKind, SessionManager, SessionSettings, SessionState,
};
use crate::storage::device_list::DeviceListFile;
use crate::storage::file_storage::FileStorage;
use crate::storage::storage_trait::Storage;
use crate::storage::types::tests::record;
use serial_test::serial;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

const COMMISSIONED: &str = "\
echo '[1700000000.100000][7:7] CHIP:SVR: SetupQRCode: [MT:Y.K9042C00KA0648G00]'
sleep 0.2
echo '[1700000001.100000][7:7] CHIP:SVR: Device completed Rendezvous process'
echo '[1700000002.100000][7:7] CHIP:ZCL: GeneralCommissioning: Received CommissioningComplete'
echo '[1700000002.200000][7:7] CHIP:ZCL: GeneralCommissioning: Received CommissioningComplete'
exec sleep 30";
const IDLE: &str = "exec sleep 30";
const EXITS: &str = "echo 'CHIP:DL: booting'";

struct FakeDac {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl DacGenerator for FakeDac {
    fn generate(&self, _target_id: &str) -> Result<(), ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ProcessError::ToolFailed("openssl: error".into()))
        } else {
            Ok(())
        }
    }
}

struct FakePayload;

impl PayloadGenerator for FakePayload {
    fn generate(&self, _params: &PayloadParams) -> Result<OnboardingCodes, ProcessError> {
        Ok(codes())
    }
}

fn codes() -> OnboardingCodes {
    OnboardingCodes {
        qr_code: "MT:Y.K9042C00KA0648G00".into(),
        manual_code: "3497-011-2332".into(),
    }
}

struct Options {
    script: &'static str,
    dac_fails: bool,
    max_devices: usize,
    onboarding_retry: Duration,
    reachability_timeout: Duration,
    aliases_silent: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            script: IDLE,
            dac_fails: false,
            max_devices: 4,
            onboarding_retry: Duration::from_secs(30),
            reachability_timeout: Duration::from_secs(2),
            aliases_silent: false,
        }
    }
}

struct Harness {
    dir: TempDir,
    manager: SessionManager,
    registry: Arc<ResourceRegistry>,
    net: Arc<FakeNetwork>,
    storage: Arc<FileStorage>,
    device_list: Arc<DeviceListFile>,
    dac_calls: Arc<AtomicUsize>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn new(options: Options) -> Self {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ResourceRegistry::new());
        let net = Arc::new(FakeNetwork {
            aliases_silent: options.aliases_silent,
            ..Default::default()
        });
        let allocator = Arc::new(AddressAllocator::new(
            base(),
            registry.clone(),
            net.clone(),
            net.clone(),
            AllocatorSettings {
                reachability_timeout: options.reachability_timeout,
                poll_interval: Duration::from_millis(5),
                ipv6_probe_budget: 64,
            },
        ));
        let storage = Arc::new(FileStorage::new(dir.path().join("devices"), 1).unwrap());
        let device_list = Arc::new(DeviceListFile::new(dir.path().join("device_list")).unwrap());
        let dac_calls = Arc::new(AtomicUsize::new(0));

        let settings = SessionSettings {
            constraints: IdentityConstraints::default(),
            device_types: vec![DeviceTypeConfig {
                code: "0x0100".into(),
                name: "On/Off Light".into(),
                binary: PathBuf::from("/bin/sh"),
                args: vec!["-c".into(), options.script.into(), "device".into()],
            }],
            max_devices: options.max_devices,
            rpc_base_port: 33000,
            onboarding_retry: options.onboarding_retry,
            stop_grace: Duration::from_secs(2),
            rpc_timeout: Duration::from_millis(200),
            device_log_dir: Some(dir.path().join("logs")),
        };
        let manager = SessionManager::new(
            settings,
            registry.clone(),
            allocator,
            storage.clone(),
            device_list.clone(),
            ExternalTools {
                dac: Arc::new(FakeDac {
                    calls: dac_calls.clone(),
                    fail: options.dac_fails,
                }),
                payload: Some(Arc::new(FakePayload)),
            },
        );
        let events = manager.subscribe();
        Self {
            dir,
            manager,
            registry,
            net,
            storage,
            device_list,
            dac_calls,
            events,
        }
    }

    /// Collects events until `kind` is seen for `target_id`, included.
    async fn wait_for(&mut self, target_id: &str, kind: SessionEventKind) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(10), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                let done = event.target_id == target_id && event.kind == kind;
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {:?} for {}, saw {:?}", kind, target_id, seen));
        seen
    }

    async fn wait_for_state(&mut self, target_id: &str, state: SessionState) -> Vec<SessionEvent> {
        self.wait_for(target_id, SessionEventKind::StateChanged(state))
            .await
    }

    fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Writes a committed record as a previous run would have left it.
    fn store_committed(&self, serial_number: u64, last_octet: u8) -> String {
        let mut stored = record();
        stored.serial_number = serial_number;
        stored.ipv4 = Some(format!("192.168.1.{}", last_octet).parse().unwrap());
        stored.ipv6 = Some(format!("fe80::{}", last_octet).parse().unwrap());
        stored.interface_index = Some(u32::from(last_octet));
        stored.rpc_port = Some(33000 + u16::from(last_octet));
        let target_id = identity(serial_number).target_id();
        self.storage.write_record(&target_id, &stored).unwrap();
        target_id
    }
}

fn states(events: &[SessionEvent], target_id: &str) -> Vec<SessionState> {
    events
        .iter()
        .filter(|e| e.target_id == target_id)
        .filter_map(|e| match e.kind {
            SessionEventKind::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn count(events: &[SessionEvent], target_id: &str, kind: &SessionEventKind) -> usize {
    events
        .iter()
        .filter(|e| e.target_id == target_id && &e.kind == kind)
        .count()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never met: {}", what);
}

#[tokio::test]
#[serial]
async fn test_commissioning_reaches_connected_once() {
    let mut h = Harness::new(Options {
        script: COMMISSIONED,
        ..Default::default()
    });
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    assert_eq!(target, "fff18014-7e5");

    let mut seen = h.wait_for_state(&target, SessionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    seen.extend(h.drain());

    assert_eq!(
        states(&seen, &target),
        vec![
            SessionState::IpGenerating,
            SessionState::IpGenerated,
            SessionState::DacGenerating,
            SessionState::DacGenerated,
            SessionState::DeviceStarting,
            SessionState::DeviceStarted,
            SessionState::Connecting,
            SessionState::Connected,
        ]
    );
    assert_eq!(
        count(&seen, &target, &SessionEventKind::OnboardingCode(codes())),
        1
    );
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 1);

    // Two addresses, one interface slot, one RPC port.
    assert_eq!(h.registry.allocated_count(), 4);
    assert_eq!(h.registry.recovered_count(), 4);
    assert_eq!(h.net.bound_count(), 2);
    let (device_list, storage) = (h.device_list.clone(), h.storage.clone());
    eventually("commissioning persisted", || {
        device_list.contains(&target)
            && matches!(storage.read_record(&target), Ok(Some(r)) if r.is_recover)
    })
    .await;

    let stored = h.storage.read_record(&target).unwrap().unwrap();
    assert!(stored.is_recover);
    assert_eq!(stored.rpc_port, Some(33001));
    assert_eq!(stored.interface_index, Some(1));
    assert_eq!(
        h.manager.rpc_endpoint(&target).await.unwrap().to_string(),
        "localhost:33001"
    );

    h.manager.stop_session(&target).await;
    assert_eq!(h.registry.allocated_count(), 0);
    assert_eq!(h.net.bound_count(), 0);
    assert!(h.storage.exists(&target), "commissioned storage must be kept");
    assert!(!h.device_list.contains(&target));
    assert_eq!(h.manager.session_state(&target).await, None);
    h.wait_for(&target, SessionEventKind::Stopped).await;

    // Second stop is a no-op.
    h.manager.stop_session(&target).await;
    assert_eq!(h.registry.allocated_count(), 0);
    assert!(h.storage.exists(&target));

    // Device output was saved under today's log directory.
    let day_dirs: Vec<_> = std::fs::read_dir(h.dir.path().join("logs"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(day_dirs.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_duplicate_start_acquires_nothing() {
    let mut h = Harness::new(Options::default());
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    h.wait_for_state(&target, SessionState::DeviceStarting).await;
    let allocated = h.registry.allocated_count();
    let bound = h.net.bound_count();
    assert_eq!(allocated, 4);

    let err = h.manager.start_session(identity(2021)).await.unwrap_err();
    assert!(matches!(err, SessionError::DuplicateIdentity(ref id) if id == &target));
    let seen = h
        .wait_for(
            &target,
            SessionEventKind::Rejected(SessionState::DeviceDuplicate),
        )
        .await;
    // The running device keeps its state, for the manager and for subscribers.
    assert!(states(&seen, &target).is_empty());
    assert_eq!(
        h.manager.session_state(&target).await,
        Some(SessionState::DeviceStarting)
    );
    assert_eq!(h.registry.allocated_count(), allocated);
    assert_eq!(h.net.bound_count(), bound);
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.live_sessions().await, vec![target.clone()]);

    h.manager.stop_all().await;
    assert!(!h.storage.exists(&target), "uncommissioned storage must go");
    assert_eq!(h.registry.allocated_count(), 0);
}

#[tokio::test]
async fn test_insecure_pin_rejected_before_allocation() {
    let h = Harness::new(Options::default());
    let mut id = identity(2021);
    id.pin_code = 11111111;
    let err = h.manager.start_session(id.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Validation(ValidationError::InsecurePinCode(11111111))
    ));
    assert_eq!(h.registry.allocated_count(), 0);
    assert!(!h.storage.session_dir(&id.target_id()).exists());
    assert!(h.manager.live_sessions().await.is_empty());
}

#[tokio::test]
async fn test_unsupported_device_type() {
    let mut h = Harness::new(Options::default());
    let mut id = identity(2021);
    id.device_type = "0x9999".into();
    let err = h.manager.start_session(id.clone()).await.unwrap_err();
    assert!(matches!(err, SessionError::UnsupportedDeviceType(ref code) if code == "0x9999"));
    h.wait_for(
        &id.target_id(),
        SessionEventKind::Rejected(SessionState::DeviceUnsupported),
    )
    .await;
    assert!(!h.storage.session_dir(&id.target_id()).exists());
    assert_eq!(h.registry.allocated_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_single_commissioning_in_flight() {
    let mut h = Harness::new(Options::default());
    let first = h.manager.start_session(identity(1)).await.unwrap();
    h.wait_for_state(&first, SessionState::DeviceStarting).await;

    let second = identity(2);
    let err = h.manager.start_session(second.clone()).await.unwrap_err();
    assert!(matches!(err, SessionError::WaitingForRunningDevice(ref holder) if holder == &first));
    h.wait_for(
        &second.target_id(),
        SessionEventKind::Rejected(SessionState::WaitingForRunningDevice),
    )
    .await;
    assert!(!h.storage.session_dir(&second.target_id()).exists());

    h.manager.stop_session(&first).await;
    let second_id = h.manager.start_session(second).await.unwrap();
    h.wait_for_state(&second_id, SessionState::DeviceStarting)
        .await;
    h.manager.stop_all().await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_sessions_hold_distinct_resources() {
    let mut h = Harness::new(Options {
        script: COMMISSIONED,
        ..Default::default()
    });
    let first = h.manager.start_session(identity(1)).await.unwrap();
    h.wait_for_state(&first, SessionState::Connected).await;
    let second = h.manager.start_session(identity(2)).await.unwrap();
    h.wait_for_state(&second, SessionState::Connected).await;

    let a = h.manager.session(&first).await.unwrap().resources;
    let b = h.manager.session(&second).await.unwrap().resources;
    assert!(a.is_complete() && b.is_complete());
    assert_ne!(a.ipv4, b.ipv4);
    assert_ne!(a.ipv6, b.ipv6);
    assert_ne!(a.interface_index, b.interface_index);
    assert_ne!(a.rpc_port, b.rpc_port);
    assert_eq!(h.device_list.entries().len(), 2);

    h.manager.stop_all().await;
    assert_eq!(h.registry.allocated_count(), 0);
    assert!(h.device_list.entries().is_empty());
}

#[tokio::test]
#[serial]
async fn test_session_limit() {
    let mut h = Harness::new(Options {
        max_devices: 1,
        ..Default::default()
    });
    let first = h.manager.start_session(identity(1)).await.unwrap();
    h.wait_for_state(&first, SessionState::DeviceStarting).await;
    let err = h.manager.start_session(identity(2)).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionLimitReached));
    h.manager.stop_all().await;
}

#[tokio::test]
#[serial]
async fn test_dac_failure_touches_no_address() {
    let mut h = Harness::new(Options {
        dac_fails: true,
        ..Default::default()
    });
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    let seen = h
        .wait_for_state(&target, SessionState::DacGenerateFailed)
        .await;
    assert_eq!(states(&seen, &target), vec![SessionState::DacGenerateFailed]);
    assert_eq!(h.net.bind_calls(), 0);
    assert_eq!(h.registry.allocated_count(), 0);
    assert_eq!(
        h.manager.session_state(&target).await,
        Some(SessionState::DacGenerateFailed)
    );

    // The failed attempt no longer blocks new ones.
    let other = h.manager.start_session(identity(2022)).await.unwrap();
    h.wait_for_state(&other, SessionState::DacGenerateFailed)
        .await;
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.net.bind_calls(), 0);

    h.manager.stop_all().await;
    assert!(!h.storage.exists(&target));
    assert!(h.manager.live_sessions().await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_device_exit_stops_session() {
    let mut h = Harness::new(Options {
        script: EXITS,
        ..Default::default()
    });
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    let seen = h.wait_for(&target, SessionEventKind::Stopped).await;
    assert_eq!(
        states(&seen, &target).last(),
        Some(&SessionState::Disconnected)
    );
    assert!(h.manager.live_sessions().await.is_empty());
    assert!(!h.storage.session_dir(&target).exists());
    assert_eq!(h.registry.allocated_count(), 0);
    assert_eq!(h.net.bound_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_stop_during_allocation_leaks_nothing() {
    let mut h = Harness::new(Options {
        aliases_silent: true,
        reachability_timeout: Duration::from_millis(300),
        ..Default::default()
    });
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    h.wait_for_state(&target, SessionState::IpGenerating).await;
    h.manager.stop_session(&target).await;
    h.wait_for(&target, SessionEventKind::Stopped).await;

    let registry = h.registry.clone();
    let net = h.net.clone();
    eventually("allocation rolled back", || {
        registry.allocated_count() == 0 && net.bound_count() == 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.registry.allocated_count(), 0);
    assert!(!h.storage.session_dir(&target).exists());
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial]
async fn test_onboarding_retry_emits_code_once() {
    let mut h = Harness::new(Options {
        onboarding_retry: Duration::from_millis(100),
        ..Default::default()
    });
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    let mut seen = h
        .wait_for(&target, SessionEventKind::OnboardingCode(codes()))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    seen.extend(h.drain());
    assert_eq!(
        count(&seen, &target, &SessionEventKind::OnboardingCode(codes())),
        1
    );
    assert_eq!(
        h.manager.session_state(&target).await,
        Some(SessionState::DeviceStarted)
    );
    h.manager.stop_all().await;
}

#[tokio::test]
#[serial]
async fn test_boot_recovery_skips_dac_and_codes() {
    let mut h = Harness::new(Options {
        script: COMMISSIONED,
        ..Default::default()
    });
    let target = h.store_committed(7, 50);

    let mut uncommitted = record();
    uncommitted.serial_number = 8;
    uncommitted.is_recover = false;
    let abandoned = identity(8).target_id();
    h.storage.write_record(&abandoned, &uncommitted).unwrap();

    let recovered = h.manager.recover_sessions().await.unwrap();
    assert_eq!(recovered, vec![target.clone()]);
    assert!(!h.storage.session_dir(&abandoned).exists());

    let mut seen = h.wait_for_state(&target, SessionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    seen.extend(h.drain());
    assert_eq!(
        states(&seen, &target),
        vec![
            SessionState::IpGenerating,
            SessionState::IpGenerated,
            SessionState::DeviceStarting,
            SessionState::DeviceStarted,
            SessionState::Connected,
        ]
    );
    assert_eq!(
        count(&seen, &target, &SessionEventKind::OnboardingCode(codes())),
        0
    );
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 0);
    assert!(h.net.is_bound("192.168.1.50"));
    assert!(h.net.is_bound("fe80::50"));
    assert!(h.registry.is_recovered(&Resource::RpcPort(33050)));
    assert_eq!(
        h.manager.rpc_endpoint(&target).await.unwrap().port,
        33050
    );
    assert!(h.device_list.contains(&target));

    h.manager.stop_session(&target).await;
    assert!(h.storage.exists(&target));
}

#[tokio::test]
#[serial]
async fn test_recovery_taken_over_address_fails() {
    let mut h = Harness::new(Options::default());
    let target = h.store_committed(7, 50);
    h.net
        .external
        .lock()
        .unwrap()
        .insert("192.168.1.50".parse().unwrap());

    h.manager.recover_sessions().await.unwrap();
    h.wait_for_state(&target, SessionState::RecoverFailed).await;
    assert!(!h.net.is_bound("fe80::50"));

    h.manager.stop_session(&target).await;
    assert!(h.storage.exists(&target), "recovered storage is kept");
}

#[tokio::test]
#[serial]
async fn test_recovery_bypasses_commissioning_gate() {
    let mut h = Harness::new(Options::default());
    let recovered_target = h.store_committed(7, 50);

    let fresh = h.manager.start_session(identity(1)).await.unwrap();
    h.wait_for_state(&fresh, SessionState::DeviceStarting).await;

    let recovered = h.manager.recover_sessions().await.unwrap();
    assert_eq!(recovered, vec![recovered_target.clone()]);
    h.wait_for_state(&recovered_target, SessionState::DeviceStarting)
        .await;

    // Fresh allocations never landed on the recovered addresses.
    let fresh_resources = h.manager.session(&fresh).await.unwrap().resources;
    assert_ne!(fresh_resources.ipv4, Some("192.168.1.50".parse().unwrap()));
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 1);

    // Restarting a committed target resumes it instead of commissioning again.
    h.manager.stop_session(&recovered_target).await;
    let resumed = h.manager.start_session(identity(7)).await.unwrap();
    assert_eq!(resumed, recovered_target);
    h.wait_for_state(&resumed, SessionState::DeviceStarting).await;
    assert_eq!(h.dac_calls.load(Ordering::SeqCst), 1);

    h.manager.stop_all().await;
}

#[tokio::test]
#[serial]
async fn test_commissioner_removal_forgets_device() {
    let mut h = Harness::new(Options {
        script: COMMISSIONED,
        ..Default::default()
    });
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    h.wait_for_state(&target, SessionState::Connected).await;

    let still_paired = h
        .manager
        .apply_device_state(&target, DeviceState { fabric_count: 1 })
        .await
        .unwrap();
    assert!(!still_paired);

    let removed = h
        .manager
        .refresh_device_state(&target, |endpoint| async move {
            assert_eq!(endpoint.port, 33001);
            Ok(DeviceState { fabric_count: 0 })
        })
        .await
        .unwrap();
    assert!(removed);
    assert!(!h.storage.session_dir(&target).exists());
    assert_eq!(h.registry.recovered_count(), 0);
    assert_eq!(h.registry.allocated_count(), 0);

    let err = h
        .manager
        .apply_device_state(&target, DeviceState { fabric_count: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn test_device_rpc_timeout_is_fatal_for_the_call() {
    let mut h = Harness::new(Options::default());
    let target = h.manager.start_session(identity(2021)).await.unwrap();
    h.wait_for_state(&target, SessionState::DeviceStarting).await;

    let err = h
        .manager
        .refresh_device_state(&target, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DeviceState { fabric_count: 0 })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::RpcTimeout));
    assert!(h.manager.session_state(&target).await.is_some());
    h.manager.stop_all().await;
}

use std::fmt;
use std::net::IpAddr;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    DeviceTypesEmpty,
    NotInRange(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::DeviceTypesEmpty => write!(f, "No device type configured"),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Identity fields rejected before a session touches any resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    SerialNumberOutOfRange(u64),
    VendorIdMismatch { expected: u16, got: u16 },
    ProductIdOutOfRange(u16),
    DiscriminatorOutOfRange(u16),
    PinCodeOutOfRange(u32),
    InsecurePinCode(u32),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::SerialNumberOutOfRange(v) => {
                write!(f, "Serial number {} is out of range", v)
            }
            ValidationError::VendorIdMismatch { expected, got } => {
                write!(f, "Vendor id {} does not match the configured {}", got, expected)
            }
            ValidationError::ProductIdOutOfRange(v) => write!(f, "Product id {} is out of range", v),
            ValidationError::DiscriminatorOutOfRange(v) => {
                write!(f, "Discriminator {} is out of range", v)
            }
            ValidationError::PinCodeOutOfRange(v) => write!(f, "Pin code {:08} is out of range", v),
            ValidationError::InsecurePinCode(v) => write!(f, "Pin code {:08} is not allowed", v),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum NetworkError {
    AddressSpaceExhausted(&'static str),
    InterfaceSlotsExhausted,
    PortSpaceExhausted,
    RecoveryConflict(IpAddr),
    BindFailed(String),
    ReachabilityTimeout,
    InterfaceUnavailable(String),
    NetworkInfo(String),
    CommandFailed(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::AddressSpaceExhausted(family) => {
                write!(f, "No free {} address left on the subnet", family)
            }
            NetworkError::InterfaceSlotsExhausted => write!(f, "No free interface alias slot"),
            NetworkError::PortSpaceExhausted => write!(f, "No free RPC port"),
            NetworkError::RecoveryConflict(addr) => {
                write!(f, "Persisted address {} is already answering on the network", addr)
            }
            NetworkError::BindFailed(e) => write!(f, "Cannot create IP: {}", e),
            NetworkError::ReachabilityTimeout => {
                write!(f, "Cannot create IP: addresses never became reachable")
            }
            NetworkError::InterfaceUnavailable(e) => write!(f, "Network interface unavailable: {}", e),
            NetworkError::NetworkInfo(e) => write!(f, "Network info error: {}", e),
            NetworkError::CommandFailed(e) => write!(f, "Network command failed: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {}

#[derive(Debug)]
pub enum StorageError {
    WriteFailed,
    ReadFailed,
    NotFound(String),
    IncompleteRecord(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
            StorageError::NotFound(id) => write!(f, "No storage for {}", id),
            StorageError::IncompleteRecord(id) => write!(f, "Incomplete factory record for {}", id),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum ProcessError {
    SpawnFailed(String),
    AlreadyStarted,
    LogStreamTaken,
    ToolFailed(String),
    IoError(std::io::Error),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::SpawnFailed(e) => write!(f, "Device process spawn failed: {}", e),
            ProcessError::AlreadyStarted => write!(f, "Device process already started"),
            ProcessError::LogStreamTaken => write!(f, "Device log stream already taken"),
            ProcessError::ToolFailed(e) => write!(f, "External tool failed: {}", e),
            ProcessError::IoError(e) => write!(f, "Process IO error: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::IoError(err)
    }
}

#[derive(Debug)]
pub enum SessionError {
    Validation(ValidationError),
    DuplicateIdentity(String),
    WaitingForRunningDevice(String),
    UnsupportedDeviceType(String),
    SessionLimitReached,
    NotFound(String),
    RpcTimeout,
    Network(NetworkError),
    Storage(StorageError),
    Process(ProcessError),
    TaskFailed(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Validation(e) => write!(f, "Invalid identity: {}", e),
            SessionError::DuplicateIdentity(id) => write!(f, "Device {} is already running", id),
            SessionError::WaitingForRunningDevice(id) => {
                write!(f, "Device {} is still being commissioned", id)
            }
            SessionError::UnsupportedDeviceType(code) => {
                write!(f, "Device type {} is not supported", code)
            }
            SessionError::SessionLimitReached => write!(f, "Session limit reached"),
            SessionError::NotFound(id) => write!(f, "Session {} not found", id),
            SessionError::RpcTimeout => write!(f, "Device RPC call timed out"),
            SessionError::Network(e) => write!(f, "Network error: {}", e),
            SessionError::Storage(e) => write!(f, "Storage error: {}", e),
            SessionError::Process(e) => write!(f, "Process error: {}", e),
            SessionError::TaskFailed(e) => write!(f, "Background task failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ValidationError> for SessionError {
    fn from(err: ValidationError) -> Self {
        SessionError::Validation(err)
    }
}

impl From<NetworkError> for SessionError {
    fn from(err: NetworkError) -> Self {
        SessionError::Network(err)
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(err)
    }
}

impl From<ProcessError> for SessionError {
    fn from(err: ProcessError) -> Self {
        SessionError::Process(err)
    }
}

#[derive(Debug)]
pub enum ControllerError {
    Config(ConfigError),
    Network(NetworkError),
    Storage(StorageError),
    Session(SessionError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Config(e) => write!(f, "Configuration error: {}", e),
            ControllerError::Network(e) => write!(f, "Network error: {}", e),
            ControllerError::Storage(e) => write!(f, "Storage error: {}", e),
            ControllerError::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::Config(err)
    }
}

impl From<NetworkError> for ControllerError {
    fn from(err: NetworkError) -> Self {
        ControllerError::Network(err)
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::Storage(err)
    }
}

impl From<SessionError> for ControllerError {
    fn from(err: SessionError) -> Self {
        ControllerError::Session(err)
    }
}

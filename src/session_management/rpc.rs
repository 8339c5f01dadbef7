//! Control channel of a running device.
//!
//! The RPC client itself lives outside this crate. The orchestrator only
//! needs a session's endpoint, a bound on how long a call may take, and the
//! device state the call reports back.

use crate::error_handling::types::SessionError;
use log::error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Where a device's RPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for RpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a device reports about its commissioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    /// Number of fabrics the device is commissioned into.
    pub fabric_count: usize,
}

/// Runs one RPC call. A call that outlives `limit` is reported as
/// [`SessionError::RpcTimeout`] and not retried.
pub async fn call_with_timeout<F, T>(limit: Duration, call: F) -> Result<T, SessionError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, call).await.map_err(|_| {
        error!("Device RPC call timed out after {:?}", limit);
        SessionError::RpcTimeout
    })
}

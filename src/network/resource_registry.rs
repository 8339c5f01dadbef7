//! Process-wide bookkeeping of allocated addresses, interface slots and RPC ports.
//!
//! The registry keeps two sets per resource kind:
//! - *allocated*: resources held by live sessions,
//! - *recovered*: resources of sessions that reached the commissioned state and
//!   must be re-admitted after a restart, whether or not the session is running.
//!
//! Allocation candidates are rejected when present in either set. All access goes
//! through one mutex so concurrent session tasks observe a consistent view.

use super::types::{Resource, SessionResources};
use crate::error_handling::types::NetworkError;
use log::{debug, error};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct ResourceSet {
    ipv4: HashSet<Ipv4Addr>,
    ipv6: HashSet<Ipv6Addr>,
    interface_indices: HashSet<u32>,
    rpc_ports: HashSet<u16>,
}

impl ResourceSet {
    fn insert(&mut self, resource: Resource) -> bool {
        match resource {
            Resource::Ipv4(a) => self.ipv4.insert(a),
            Resource::Ipv6(a) => self.ipv6.insert(a),
            Resource::InterfaceIndex(i) => self.interface_indices.insert(i),
            Resource::RpcPort(p) => self.rpc_ports.insert(p),
        }
    }

    fn remove(&mut self, resource: &Resource) -> bool {
        match resource {
            Resource::Ipv4(a) => self.ipv4.remove(a),
            Resource::Ipv6(a) => self.ipv6.remove(a),
            Resource::InterfaceIndex(i) => self.interface_indices.remove(i),
            Resource::RpcPort(p) => self.rpc_ports.remove(p),
        }
    }

    fn contains(&self, resource: &Resource) -> bool {
        match resource {
            Resource::Ipv4(a) => self.ipv4.contains(a),
            Resource::Ipv6(a) => self.ipv6.contains(a),
            Resource::InterfaceIndex(i) => self.interface_indices.contains(i),
            Resource::RpcPort(p) => self.rpc_ports.contains(p),
        }
    }

    fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len() + self.interface_indices.len() + self.rpc_ports.len()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    allocated: ResourceSet,
    recovered: ResourceSet,
}

impl RegistryState {
    fn is_claimed(&self, resource: &Resource) -> bool {
        self.allocated.contains(resource) || self.recovered.contains(resource)
    }
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    state: Mutex<RegistryState>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // The sets stay consistent even if a holder panicked mid-operation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks a resource as allocated. Returns `false` if it already was.
    pub fn reserve(&self, resource: Resource) -> bool {
        let added = self.state().allocated.insert(resource);
        debug!("Reserved {} (new: {})", resource, added);
        added
    }

    /// Returns a resource to the pool. Returns `false` if it was not allocated.
    pub fn release(&self, resource: Resource) -> bool {
        let removed = self.state().allocated.remove(&resource);
        debug!("Released {} (was held: {})", resource, removed);
        removed
    }

    /// Whether a live session currently holds the resource.
    pub fn contains(&self, resource: &Resource) -> bool {
        self.state().allocated.contains(resource)
    }

    /// Whether the resource is held by a live session or reserved for a recoverable one.
    pub fn is_claimed(&self, resource: &Resource) -> bool {
        self.state().is_claimed(resource)
    }

    /// Atomically reserves the resource if nobody claims it yet.
    pub fn try_claim(&self, resource: Resource) -> bool {
        let mut state = self.state();
        if state.is_claimed(&resource) {
            return false;
        }
        state.allocated.insert(resource)
    }

    /// Records a commissioned session's resources so a restart re-admits them.
    /// Returns `true` if at least one resource was not recorded yet.
    pub fn record_recovered(&self, resources: &SessionResources) -> bool {
        let mut state = self.state();
        let mut added = false;
        for r in resources.resources() {
            added |= state.recovered.insert(r);
        }
        added
    }

    pub fn forget_recovered(&self, resources: &SessionResources) {
        let mut state = self.state();
        for r in resources.resources() {
            state.recovered.remove(&r);
        }
    }

    pub fn is_recovered(&self, resource: &Resource) -> bool {
        self.state().recovered.contains(resource)
    }

    pub fn allocated_count(&self) -> usize {
        self.state().allocated.len()
    }

    pub fn recovered_count(&self) -> usize {
        self.state().recovered.len()
    }

    /// Claims the first free RPC port above `base_port`.
    pub fn claim_rpc_port(&self, base_port: u16) -> Result<u16, NetworkError> {
        let first = base_port.checked_add(1).ok_or(NetworkError::PortSpaceExhausted)?;
        let mut state = self.state();
        for port in first..=u16::MAX {
            let resource = Resource::RpcPort(port);
            if !state.is_claimed(&resource) {
                state.allocated.insert(resource);
                debug!("Claimed rpc port {}", port);
                return Ok(port);
            }
        }
        error!("No RPC port left above {}", base_port);
        Err(NetworkError::PortSpaceExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample() -> SessionResources {
        SessionResources {
            ipv4: Some(Ipv4Addr::new(192, 168, 1, 11)),
            ipv6: Some("fe80::11".parse().unwrap()),
            interface_index: Some(1),
            rpc_port: Some(33001),
        }
    }

    #[test]
    fn test_reserve_is_idempotent() {
        let registry = ResourceRegistry::new();
        let port = Resource::RpcPort(33001);
        assert!(registry.reserve(port));
        assert!(!registry.reserve(port));
        assert_eq!(registry.allocated_count(), 1);
    }

    #[test]
    fn test_release_then_reserve_keeps_single_copy() {
        let registry = ResourceRegistry::new();
        let addr = Resource::Ipv4(Ipv4Addr::new(10, 0, 0, 2));
        registry.reserve(addr);
        assert!(registry.release(addr));
        assert!(!registry.release(addr));
        assert!(registry.reserve(addr));
        assert!(registry.contains(&addr));
        assert_eq!(registry.allocated_count(), 1);
    }

    #[test]
    fn test_recovered_resources_are_claimed_but_not_allocated() {
        let registry = ResourceRegistry::new();
        let res = sample();
        assert!(registry.record_recovered(&res));
        assert!(!registry.record_recovered(&res));

        let ip = Resource::Ipv4(Ipv4Addr::new(192, 168, 1, 11));
        assert!(!registry.contains(&ip));
        assert!(registry.is_claimed(&ip));
        assert!(!registry.try_claim(ip));

        registry.forget_recovered(&res);
        assert_eq!(registry.recovered_count(), 0);
        assert!(registry.try_claim(ip));
    }

    #[test]
    fn test_claim_rpc_port_probes_upwards() {
        let registry = ResourceRegistry::new();
        assert_eq!(registry.claim_rpc_port(33000).unwrap(), 33001);
        registry.record_recovered(&SessionResources {
            rpc_port: Some(33002),
            ..Default::default()
        });
        assert_eq!(registry.claim_rpc_port(33000).unwrap(), 33003);
        registry.release(Resource::RpcPort(33001));
        assert_eq!(registry.claim_rpc_port(33000).unwrap(), 33001);
    }

    #[test]
    fn test_claim_rpc_port_exhaustion() {
        let registry = ResourceRegistry::new();
        assert_eq!(registry.claim_rpc_port(65534).unwrap(), 65535);
        assert!(matches!(
            registry.claim_rpc_port(65534),
            Err(NetworkError::PortSpaceExhausted)
        ));
        assert!(matches!(
            registry.claim_rpc_port(u16::MAX),
            Err(NetworkError::PortSpaceExhausted)
        ));
    }

    #[test]
    fn test_concurrent_claims_are_unique() {
        let registry = Arc::new(ResourceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..16)
                        .map(|_| registry.claim_rpc_port(40000).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ports: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = ports.len();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), total);
    }
}

//! Address allocation for device sessions.
//!
//! Candidates are derived from the base addresses by adding a counter to the
//! host part. A candidate is skipped when the [`ResourceRegistry`] already
//! claims it or when it answers the [`ReachabilityProbe`]. Accepted addresses
//! are bound to the interface as aliases, then the allocator waits until both
//! answer before handing them out.
//!
//! Every search is bounded: the IPv4 search by the /24 host space, the IPv6
//! search by a configured probe budget, interface slots by `u16::MAX`.
//! Allocation runs blocking I/O (ping, ip); callers run it off the async runtime.

use super::interface_binder::InterfaceBinder;
use super::reachability::ReachabilityProbe;
use super::resource_registry::ResourceRegistry;
use super::types::{AllocatedAddresses, AllocationRequest, BaseAddresses, Resource};
use crate::error_handling::types::NetworkError;
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_INTERFACE_INDEX: u32 = u16::MAX as u32;

#[derive(Debug, Clone)]
pub struct AllocatorSettings {
    pub reachability_timeout: Duration,
    pub poll_interval: Duration,
    pub ipv6_probe_budget: u32,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            reachability_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            ipv6_probe_budget: 512,
        }
    }
}

pub struct AddressAllocator {
    base: BaseAddresses,
    registry: Arc<ResourceRegistry>,
    probe: Arc<dyn ReachabilityProbe>,
    binder: Arc<dyn InterfaceBinder>,
    settings: AllocatorSettings,
}

/// `base + counter` inside the base's /24, wrapping past the broadcast address.
/// Network, broadcast and base addresses are never candidates.
pub fn ipv4_candidate(base: Ipv4Addr, counter: u32) -> Option<Ipv4Addr> {
    let octets = base.octets();
    let host = (u32::from(octets[3]) + counter) % 256;
    if host == 0 || host == 255 || host == u32::from(octets[3]) {
        return None;
    }
    Some(Ipv4Addr::new(octets[0], octets[1], octets[2], host as u8))
}

/// `base + counter` on the last group, wrapping past `ffff`.
pub fn ipv6_candidate(base: Ipv6Addr, counter: u32) -> Option<Ipv6Addr> {
    let mut segments = base.segments();
    let last = (u32::from(segments[7]) + counter) % 0x1_0000;
    if last == 0 || last == 0xffff || last == u32::from(segments[7]) {
        return None;
    }
    segments[7] = last as u16;
    Some(Ipv6Addr::from(segments))
}

impl AddressAllocator {
    pub fn new(
        base: BaseAddresses,
        registry: Arc<ResourceRegistry>,
        probe: Arc<dyn ReachabilityProbe>,
        binder: Arc<dyn InterfaceBinder>,
        settings: AllocatorSettings,
    ) -> Self {
        Self {
            base,
            registry,
            probe,
            binder,
            settings,
        }
    }

    /// Produces bound, reachable addresses for one session.
    pub fn allocate(&self, request: &AllocationRequest) -> Result<AllocatedAddresses, NetworkError> {
        let addresses = match request {
            AllocationRequest::Fresh => self.claim_fresh()?,
            AllocationRequest::Recovery(known) => self.claim_recovered(known)?,
        };

        if let Err(e) = self.bind(&addresses) {
            self.release_claims(&addresses);
            return Err(e);
        }

        if let Err(e) = self.wait_until_reachable(&addresses) {
            self.release(&addresses);
            return Err(e);
        }

        info!(
            "Allocated {} / {} (slot {})",
            addresses.ipv4, addresses.ipv6, addresses.interface_index
        );
        Ok(addresses)
    }

    /// Unbinds the aliases and gives the addresses back to the registry.
    pub fn release(&self, addresses: &AllocatedAddresses) {
        for addr in [IpAddr::V4(addresses.ipv4), IpAddr::V6(addresses.ipv6)] {
            if let Err(e) = self.binder.unbind(addr) {
                warn!("Failed to remove alias {}: {}", addr, e);
            }
        }
        self.release_claims(addresses);
    }

    fn release_claims(&self, addresses: &AllocatedAddresses) {
        self.registry.release(Resource::Ipv4(addresses.ipv4));
        self.registry.release(Resource::Ipv6(addresses.ipv6));
        self.registry
            .release(Resource::InterfaceIndex(addresses.interface_index));
    }

    fn claim_fresh(&self) -> Result<AllocatedAddresses, NetworkError> {
        let ipv4 = self.next_ipv4()?;
        let ipv6 = match self.next_ipv6() {
            Ok(a) => a,
            Err(e) => {
                self.registry.release(Resource::Ipv4(ipv4));
                return Err(e);
            }
        };
        let interface_index = match self.next_interface_index() {
            Ok(i) => i,
            Err(e) => {
                self.registry.release(Resource::Ipv4(ipv4));
                self.registry.release(Resource::Ipv6(ipv6));
                return Err(e);
            }
        };
        Ok(AllocatedAddresses {
            ipv4,
            ipv6,
            interface_index,
        })
    }

    fn claim_recovered(&self, known: &AllocatedAddresses) -> Result<AllocatedAddresses, NetworkError> {
        for addr in [IpAddr::V4(known.ipv4), IpAddr::V6(known.ipv6)] {
            if self.probe.is_reachable(addr) {
                error!("Persisted address {} was taken over by another host", addr);
                return Err(NetworkError::RecoveryConflict(addr));
            }
        }
        self.registry.reserve(Resource::Ipv4(known.ipv4));
        self.registry.reserve(Resource::Ipv6(known.ipv6));
        self.registry
            .reserve(Resource::InterfaceIndex(known.interface_index));
        Ok(*known)
    }

    fn next_ipv4(&self) -> Result<Ipv4Addr, NetworkError> {
        for counter in 1..=255u32 {
            let Some(candidate) = ipv4_candidate(self.base.ipv4, counter) else {
                continue;
            };
            if self.accept(Resource::Ipv4(candidate), IpAddr::V4(candidate)) {
                return Ok(candidate);
            }
        }
        error!("IPv4 subnet of {} exhausted", self.base.ipv4);
        Err(NetworkError::AddressSpaceExhausted("IPv4"))
    }

    fn next_ipv6(&self) -> Result<Ipv6Addr, NetworkError> {
        let budget = self.settings.ipv6_probe_budget.min(0xffff);
        for counter in 1..=budget {
            let Some(candidate) = ipv6_candidate(self.base.ipv6, counter) else {
                continue;
            };
            if self.accept(Resource::Ipv6(candidate), IpAddr::V6(candidate)) {
                return Ok(candidate);
            }
        }
        error!("No IPv6 candidate left after {} probes", budget);
        Err(NetworkError::AddressSpaceExhausted("IPv6"))
    }

    /// Claims the candidate unless someone holds it or it answers on the network.
    fn accept(&self, resource: Resource, addr: IpAddr) -> bool {
        if !self.registry.try_claim(resource) {
            debug!("Candidate {} already claimed", addr);
            return false;
        }
        if self.probe.is_reachable(addr) {
            debug!("Candidate {} answers, skipping", addr);
            self.registry.release(resource);
            return false;
        }
        true
    }

    fn next_interface_index(&self) -> Result<u32, NetworkError> {
        (1..=MAX_INTERFACE_INDEX)
            .find(|i| self.registry.try_claim(Resource::InterfaceIndex(*i)))
            .ok_or_else(|| {
                error!("No interface alias slot left");
                NetworkError::InterfaceSlotsExhausted
            })
    }

    fn bind(&self, addresses: &AllocatedAddresses) -> Result<(), NetworkError> {
        self.binder
            .bind_ipv4(addresses.ipv4, addresses.interface_index)?;
        if let Err(e) = self.binder.bind_ipv6(addresses.ipv6) {
            if let Err(unbind) = self.binder.unbind(IpAddr::V4(addresses.ipv4)) {
                warn!("Failed to remove alias {}: {}", addresses.ipv4, unbind);
            }
            return Err(e);
        }
        Ok(())
    }

    fn wait_until_reachable(&self, addresses: &AllocatedAddresses) -> Result<(), NetworkError> {
        let deadline = Instant::now() + self.settings.reachability_timeout;
        loop {
            let v4 = self.probe.is_reachable(IpAddr::V4(addresses.ipv4));
            let v6 = self.probe.is_reachable(IpAddr::V6(addresses.ipv6));
            if v4 && v6 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!(
                    "{} / {} not reachable after {:?}",
                    addresses.ipv4, addresses.ipv6, self.settings.reachability_timeout
                );
                return Err(NetworkError::ReachabilityTimeout);
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }
}

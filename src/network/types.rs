use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A single finite resource handed out to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    InterfaceIndex(u32),
    RpcPort(u16),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Ipv4(a) => write!(f, "ipv4 {}", a),
            Resource::Ipv6(a) => write!(f, "ipv6 {}", a),
            Resource::InterfaceIndex(i) => write!(f, "interface slot {}", i),
            Resource::RpcPort(p) => write!(f, "rpc port {}", p),
        }
    }
}

/// Resources held by one session. Fields stay `None` until allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionResources {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub interface_index: Option<u32>,
    pub rpc_port: Option<u16>,
}

impl SessionResources {
    pub fn resources(&self) -> Vec<Resource> {
        let mut out = Vec::with_capacity(4);
        if let Some(a) = self.ipv4 {
            out.push(Resource::Ipv4(a));
        }
        if let Some(a) = self.ipv6 {
            out.push(Resource::Ipv6(a));
        }
        if let Some(i) = self.interface_index {
            out.push(Resource::InterfaceIndex(i));
        }
        if let Some(p) = self.rpc_port {
            out.push(Resource::RpcPort(p));
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.ipv4.is_some()
            && self.ipv6.is_some()
            && self.interface_index.is_some()
            && self.rpc_port.is_some()
    }

    pub fn addresses(&self) -> Option<AllocatedAddresses> {
        Some(AllocatedAddresses {
            ipv4: self.ipv4?,
            ipv6: self.ipv6?,
            interface_index: self.interface_index?,
        })
    }
}

/// The host's primary addresses on the chosen interface; aliases are derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseAddresses {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

impl BaseAddresses {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => *a == self.ipv4,
            IpAddr::V6(a) => *a == self.ipv6,
        }
    }
}

/// Addresses bound for one session by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedAddresses {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub interface_index: u32,
}

/// How the allocator should obtain a session's addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRequest {
    /// Pick new addresses next to the base ones.
    Fresh,
    /// Re-bind addresses persisted by a previous run.
    Recovery(AllocatedAddresses),
}

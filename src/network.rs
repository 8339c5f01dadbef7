//! Network resources handed out to device sessions.
//!
//! - `resource_registry`: process-wide sets of allocated addresses, slots and ports
//! - `address_allocator`: picks, binds and verifies per-session address aliases
//! - `reachability`: ICMP probe used to detect addresses already in use
//! - `interface_binder`: adds and removes aliases on the host interface
//! - `network_info`: host interface snapshot and base address discovery
//! - `types`: shared resource types

pub mod address_allocator;
pub mod interface_binder;
pub mod network_info;
pub mod reachability;
pub mod resource_registry;
pub mod types;

pub use address_allocator::{AddressAllocator, AllocatorSettings};
pub use interface_binder::{InterfaceBinder, IpCommandBinder};
pub use network_info::NetworkInfo;
pub use reachability::{PingProbe, ReachabilityProbe};
pub use resource_registry::ResourceRegistry;
pub use types::{AllocatedAddresses, AllocationRequest, BaseAddresses, Resource, SessionResources};

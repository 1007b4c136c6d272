//! Domain model shared by every orchestrator component

pub mod context;
pub mod infra;
pub mod network;
pub mod nic;
pub mod offering;

pub use context::{DeployDestination, DeploymentPlan, ReservationContext};
pub use infra::{
    Account, Domain, IpAddress, IpState, IsolationMethod, PhysicalNetwork, RedundantRole,
    ResourceType, Router, RouterState, Zone, ZoneNetworkType,
};
pub use network::{
    AclType, BroadcastDomainType, BroadcastUri, GuestType, Network, NetworkState, Owner,
    TrafficType,
};
pub use nic::{
    ExtraDhcpOption, Nic, NicProfile, NicState, ReservationStrategy, VirtualMachine, VmProfile,
    VmState, VmType,
};
pub use offering::{NetworkOffering, Provider, Service};

pub type NetworkId = u64;
pub type NicId = u64;
pub type VmId = u64;
pub type OfferingId = u64;
pub type ZoneId = u64;
pub type PodId = u64;
pub type ClusterId = u64;
pub type HostId = u64;
pub type PhysicalNetworkId = u64;
pub type IpAddressId = u64;
pub type AccountId = u64;
pub type DomainId = u64;
pub type UserId = u64;
pub type RouterId = u64;

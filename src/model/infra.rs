//! Zones, physical networks, public addresses, accounts and routers

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::network::TrafficType;
use super::{AccountId, DomainId, IpAddressId, NetworkId, PhysicalNetworkId, RouterId, ZoneId};

/// Zone networking model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZoneNetworkType {
    Basic,
    #[default]
    Advanced,
}

/// An availability zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    #[serde(rename = "networkType", default)]
    pub network_type: ZoneNetworkType,
    /// Zone-wide network domain suffix for generated guest domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns1: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns2: Option<Ipv4Addr>,
}

impl Zone {
    pub fn is_basic(&self) -> bool {
        self.network_type == ZoneNetworkType::Basic
    }
}

/// Isolation technology a physical network supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationMethod {
    Vlan,
    Vxlan,
    Gre,
    Stt,
    Vns,
}

/// A physical network inside a zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalNetwork {
    pub id: PhysicalNetworkId,
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    pub name: String,
    #[serde(rename = "isolationMethods", default)]
    pub isolation_methods: Vec<IsolationMethod>,
    #[serde(rename = "trafficTypes", default)]
    pub traffic_types: Vec<TrafficType>,
    /// Inclusive VNET range handed out to guest networks
    #[serde(rename = "vnetRange", skip_serializing_if = "Option::is_none")]
    pub vnet_range: Option<(u32, u32)>,
    /// Host-side label per traffic type, verified on host connect
    #[serde(rename = "trafficLabel", skip_serializing_if = "Option::is_none")]
    pub traffic_label: Option<String>,
}

impl PhysicalNetwork {
    /// VXLAN wins when the physical network only offers VXLAN isolation
    pub fn prefers_vxlan(&self) -> bool {
        self.isolation_methods.contains(&IsolationMethod::Vxlan)
            && !self.isolation_methods.contains(&IsolationMethod::Vlan)
    }

    pub fn carries(&self, traffic: TrafficType) -> bool {
        self.traffic_types.is_empty() || self.traffic_types.contains(&traffic)
    }
}

/// Public address state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IpState {
    #[default]
    Free,
    Allocating,
    Allocated,
    Releasing,
}

/// A public IP address from a zone range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: IpAddressId,
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    pub address: Ipv4Addr,
    #[serde(default)]
    pub state: IpState,
    #[serde(rename = "networkId", skip_serializing_if = "Option::is_none")]
    pub network_id: Option<NetworkId>,
    #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(rename = "sourceNat", default)]
    pub source_nat: bool,
    /// Range dedicated to one network; released when that network is destroyed
    #[serde(rename = "dedicatedNetworkId", skip_serializing_if = "Option::is_none")]
    pub dedicated_network_id: Option<NetworkId>,
}

impl IpAddress {
    pub fn new(id: IpAddressId, zone_id: ZoneId, address: Ipv4Addr) -> Self {
        Self {
            id,
            zone_id,
            address,
            state: IpState::Free,
            network_id: None,
            account_id: None,
            source_nat: false,
            dedicated_network_id: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == IpState::Free
    }

    /// Return the address to the free pool
    pub fn release(&mut self) {
        self.state = IpState::Free;
        self.network_id = None;
        self.account_id = None;
        self.source_nat = false;
    }
}

/// A tenant domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    #[serde(rename = "networkDomain", skip_serializing_if = "Option::is_none")]
    pub network_domain: Option<String>,
}

/// A tenant account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    #[serde(rename = "domainId")]
    pub domain_id: DomainId,
    #[serde(rename = "networkDomain", skip_serializing_if = "Option::is_none")]
    pub network_domain: Option<String>,
}

/// Resource counted against account limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Network,
    PublicIp,
}

/// Router lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

/// VRRP role of a router in a redundant pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedundantRole {
    Primary,
    Backup,
    Fault,
    Unknown,
}

/// A virtual router serving one or more networks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    pub name: String,
    pub state: RouterState,
    #[serde(rename = "redundantRole")]
    pub redundant_role: RedundantRole,
    #[serde(rename = "isRedundant")]
    pub is_redundant: bool,
}

impl Router {
    /// Already stopped or broken; safe to destroy first
    pub fn is_expendable(&self) -> bool {
        matches!(
            self.state,
            RouterState::Stopped | RouterState::Error | RouterState::Unknown
        )
    }
}

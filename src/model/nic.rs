//! NICs and the VM-side profiles they are allocated for

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::network::{BroadcastUri, Network, TrafficType};
use super::{AccountId, DomainId, HostId, NetworkId, NicId, VmId};

/// When a NIC's address is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReservationStrategy {
    /// Address reserved when the VM boots
    #[default]
    Start,
    /// Address reserved when the NIC is created
    Create,
    /// Pre-reserved address not tied to a live VM
    PlaceHolder,
}

/// NIC lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NicState {
    #[default]
    Allocated,
    Reserving,
    Reserved,
    Releasing,
    Deallocating,
}

/// A persisted network interface owned by one (VM, network) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub id: NicId,
    /// `None` only for placeholder NICs
    #[serde(rename = "vmId")]
    pub vm_id: Option<VmId>,
    #[serde(rename = "networkId")]
    pub network_id: NetworkId,
    #[serde(rename = "deviceId")]
    pub device_id: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(rename = "ip6Gateway", skip_serializing_if = "Option::is_none")]
    pub ip6_gateway: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(rename = "broadcastUri", skip_serializing_if = "Option::is_none")]
    pub broadcast_uri: Option<BroadcastUri>,
    #[serde(rename = "isolationUri", skip_serializing_if = "Option::is_none")]
    pub isolation_uri: Option<BroadcastUri>,

    #[serde(rename = "reservationStrategy")]
    pub reservation_strategy: ReservationStrategy,
    #[serde(rename = "reservationId", skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,

    #[serde(rename = "defaultNic")]
    pub default_nic: bool,
    pub state: NicState,

    pub created: DateTime<Utc>,
}

impl Nic {
    /// Build an `Allocated` NIC from the profile a guru returned
    pub fn from_profile(profile: &NicProfile, vm_id: Option<VmId>, network_id: NetworkId, device_id: u32) -> Self {
        Self {
            id: 0,
            vm_id,
            network_id,
            device_id,
            ipv4: profile.ipv4,
            netmask: profile.netmask,
            gateway: profile.gateway,
            ipv6: profile.ipv6.clone(),
            ip6_gateway: profile.ip6_gateway.clone(),
            mac: profile.mac.clone(),
            broadcast_uri: profile.broadcast_uri.clone(),
            isolation_uri: profile.isolation_uri.clone(),
            reservation_strategy: profile.strategy,
            reservation_id: profile.reservation_id.clone(),
            default_nic: profile.default_nic,
            state: NicState::Allocated,
            created: Utc::now(),
        }
    }

    /// Copy the reserved addressing of a profile onto this NIC
    pub fn apply_reservation(&mut self, profile: &NicProfile) {
        self.ipv4 = profile.ipv4;
        self.netmask = profile.netmask;
        self.gateway = profile.gateway;
        self.ipv6 = profile.ipv6.clone();
        self.ip6_gateway = profile.ip6_gateway.clone();
        self.mac = profile.mac.clone();
        self.broadcast_uri = profile.broadcast_uri.clone();
        self.isolation_uri = profile.isolation_uri.clone();
        self.reservation_id = profile.reservation_id.clone();
    }

    /// Addressing cleared by a guru on release
    pub fn apply_release(&mut self, profile: &NicProfile) {
        self.ipv4 = profile.ipv4;
        self.netmask = profile.netmask;
        self.gateway = profile.gateway;
        self.broadcast_uri = profile.broadcast_uri.clone();
        self.isolation_uri = profile.isolation_uri.clone();
        self.reservation_id = None;
    }

    pub fn is_placeholder(&self) -> bool {
        self.reservation_strategy == ReservationStrategy::PlaceHolder
    }
}

/// An extra DHCP option pushed to a NIC's DHCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraDhcpOption {
    pub code: u8,
    pub value: String,
}

/// Transient view of a NIC handed to gurus and elements
///
/// Also doubles as the caller's requested profile during allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NicProfile {
    pub id: Option<NicId>,
    #[serde(rename = "networkId")]
    pub network_id: NetworkId,
    #[serde(rename = "vmId")]
    pub vm_id: Option<VmId>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<u32>,

    pub ipv4: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub ipv6: Option<String>,
    #[serde(rename = "ip6Gateway")]
    pub ip6_gateway: Option<String>,
    pub mac: Option<String>,
    #[serde(rename = "broadcastUri")]
    pub broadcast_uri: Option<BroadcastUri>,
    #[serde(rename = "isolationUri")]
    pub isolation_uri: Option<BroadcastUri>,

    pub dns1: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
    #[serde(rename = "networkDomain")]
    pub network_domain: Option<String>,

    pub strategy: ReservationStrategy,
    #[serde(rename = "reservationId")]
    pub reservation_id: Option<String>,
    #[serde(rename = "defaultNic")]
    pub default_nic: bool,
    #[serde(rename = "trafficType")]
    pub traffic_type: Option<TrafficType>,

    /// Requested address, honoured under the IP row lock
    #[serde(rename = "requestedIpv4")]
    pub requested_ipv4: Option<Ipv4Addr>,
    #[serde(rename = "requestedMac")]
    pub requested_mac: Option<String>,
    /// Position of this NIC among the VM's NICs; unordered profiles sort last
    #[serde(rename = "orderIndex")]
    pub order_index: Option<u32>,
}

impl NicProfile {
    /// A requested profile marking the default NIC
    pub fn default_nic() -> Self {
        Self {
            default_nic: true,
            ..Self::default()
        }
    }

    pub fn with_requested_ip(mut self, ip: Ipv4Addr) -> Self {
        self.requested_ipv4 = Some(ip);
        self
    }

    pub fn with_order_index(mut self, index: u32) -> Self {
        self.order_index = Some(index);
        self
    }

    /// Profile view of a persisted NIC
    pub fn from_nic(nic: &Nic, network: &Network) -> Self {
        Self {
            id: Some(nic.id),
            network_id: network.id,
            vm_id: nic.vm_id,
            device_id: Some(nic.device_id),
            ipv4: nic.ipv4,
            netmask: nic.netmask,
            gateway: nic.gateway,
            ipv6: nic.ipv6.clone(),
            ip6_gateway: nic.ip6_gateway.clone(),
            mac: nic.mac.clone(),
            broadcast_uri: nic.broadcast_uri.clone(),
            isolation_uri: nic.isolation_uri.clone(),
            dns1: None,
            dns2: None,
            network_domain: network.network_domain.clone(),
            strategy: nic.reservation_strategy,
            reservation_id: nic.reservation_id.clone(),
            default_nic: nic.default_nic,
            traffic_type: Some(network.traffic_type),
            requested_ipv4: None,
            requested_mac: None,
            order_index: None,
        }
    }
}

/// Kind of virtual machine a NIC belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VmType {
    #[default]
    User,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
}

impl VmType {
    pub fn is_system(&self) -> bool {
        !matches!(self, VmType::User)
    }
}

/// VM power/lifecycle state as far as the network core cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VmState {
    #[default]
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Expunging,
}

/// A virtual machine referencing networks through NICs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: VmId,
    pub name: String,
    #[serde(rename = "vmType", default)]
    pub vm_type: VmType,
    #[serde(default)]
    pub state: VmState,
    #[serde(rename = "hostId", skip_serializing_if = "Option::is_none")]
    pub host_id: Option<HostId>,
    #[serde(rename = "accountId")]
    pub account_id: AccountId,
    #[serde(rename = "domainId")]
    pub domain_id: DomainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<DateTime<Utc>>,
}

impl VirtualMachine {
    pub fn new(id: VmId, name: impl Into<String>, vm_type: VmType, account_id: AccountId) -> Self {
        Self {
            id,
            name: name.into(),
            vm_type,
            state: VmState::Starting,
            host_id: None,
            account_id,
            domain_id: 1,
            removed: None,
        }
    }

    /// Still counts as a user of its networks
    pub fn is_live(&self) -> bool {
        self.removed.is_none() && self.state != VmState::Expunging
    }
}

/// A VM plus the template facts NIC allocation needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmProfile {
    pub vm: VirtualMachine,
    /// Interface count declared by the VM template
    #[serde(rename = "templateNicCount", default)]
    pub template_nic_count: u32,
}

impl VmProfile {
    pub fn new(vm: VirtualMachine) -> Self {
        Self {
            vm,
            template_nic_count: 0,
        }
    }

    pub fn with_template_nic_count(mut self, count: u32) -> Self {
        self.template_nic_count = count;
        self
    }

    pub fn id(&self) -> VmId {
        self.vm.id
    }

    pub fn vm_type(&self) -> VmType {
        self.vm.vm_type
    }
}

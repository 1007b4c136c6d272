//! Network entity - the authoritative record for one virtual network
//!
//! A network is created `Allocated` by the designer, moves through the
//! lifecycle in [`crate::state`] and is removed only once every NIC and
//! address reservation referencing it is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::offering::{NetworkOffering, Provider, Service};
use super::{AccountId, DomainId, NetworkId, OfferingId, PhysicalNetworkId, ZoneId};

/// Guest network flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestType {
    Isolated,
    Shared,
    L2,
}

/// Kind of traffic a network carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficType {
    Guest,
    Public,
    Management,
    Control,
    Storage,
}

/// Who may use a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AclType {
    #[default]
    Account,
    Domain,
}

/// Lifecycle state of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NetworkState {
    /// Designed, not activated
    #[default]
    Allocated,
    /// Activation in progress
    Implementing,
    /// Active
    Implemented,
    /// Deactivating or deactivated
    Shutdown,
    /// Shared network whose services are re-applied without a strict transition
    Setup,
    /// Being removed
    Destroy,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkState::Allocated => "Allocated",
            NetworkState::Implementing => "Implementing",
            NetworkState::Implemented => "Implemented",
            NetworkState::Shutdown => "Shutdown",
            NetworkState::Setup => "Setup",
            NetworkState::Destroy => "Destroy",
        };
        f.write_str(s)
    }
}

/// Technology used to isolate a broadcast domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BroadcastDomainType {
    Native,
    Vlan,
    Vxlan,
    Pvlan,
    Lswitch,
    #[default]
    UnDecided,
}

/// Broadcast-domain descriptor: an isolation technology plus its tag
///
/// Serialized as a URI: `vlan://100`, `vxlan://5001`, `pvlan://100-i200`,
/// `lswitch://<opaque>` or `vlan://untagged`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BroadcastUri {
    Native,
    Vlan(u32),
    Vxlan(u32),
    Pvlan { primary: u32, isolated: u32 },
    Lswitch(String),
}

/// Error parsing a broadcast URI
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid broadcast URI: {0}")]
pub struct BroadcastUriError(pub String);

fn broadcast_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<scheme>vlan|vxlan|pvlan|lswitch)://(?P<value>.+)$")
            .expect("broadcast URI pattern is valid")
    })
}

fn pvlan_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<primary>\d+)-i(?P<isolated>\d+)$").expect("pvlan pattern is valid")
    })
}

/// Highest VLAN id usable on an 802.1Q trunk
pub const MAX_VLAN_ID: u32 = 4094;

/// Highest VXLAN network identifier
pub const MAX_VXLAN_VNI: u32 = 16_777_215;

impl BroadcastUri {
    pub fn domain_type(&self) -> BroadcastDomainType {
        match self {
            BroadcastUri::Native => BroadcastDomainType::Native,
            BroadcastUri::Vlan(_) => BroadcastDomainType::Vlan,
            BroadcastUri::Vxlan(_) => BroadcastDomainType::Vxlan,
            BroadcastUri::Pvlan { .. } => BroadcastDomainType::Pvlan,
            BroadcastUri::Lswitch(_) => BroadcastDomainType::Lswitch,
        }
    }

    /// The tag that must be unique within a physical network, if any
    pub fn primary_tag(&self) -> Option<u32> {
        match self {
            BroadcastUri::Vlan(tag) | BroadcastUri::Vxlan(tag) => Some(*tag),
            BroadcastUri::Pvlan { primary, .. } => Some(*primary),
            BroadcastUri::Native | BroadcastUri::Lswitch(_) => None,
        }
    }

    /// Whether two descriptors would collide on the same physical network
    pub fn overlaps(&self, other: &BroadcastUri) -> bool {
        match (self, other) {
            (BroadcastUri::Lswitch(a), BroadcastUri::Lswitch(b)) => a == b,
            (BroadcastUri::Pvlan { primary: p1, isolated: i1 }, BroadcastUri::Pvlan { primary: p2, isolated: i2 }) => {
                p1 == p2 && i1 == i2
            }
            (BroadcastUri::Vxlan(a), BroadcastUri::Vxlan(b)) => a == b,
            (BroadcastUri::Vxlan(_), _) | (_, BroadcastUri::Vxlan(_)) => false,
            _ => match (self.primary_tag(), other.primary_tag()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for BroadcastUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastUri::Native => write!(f, "vlan://untagged"),
            BroadcastUri::Vlan(tag) => write!(f, "vlan://{}", tag),
            BroadcastUri::Vxlan(vni) => write!(f, "vxlan://{}", vni),
            BroadcastUri::Pvlan { primary, isolated } => {
                write!(f, "pvlan://{}-i{}", primary, isolated)
            }
            BroadcastUri::Lswitch(id) => write!(f, "lswitch://{}", id),
        }
    }
}

impl FromStr for BroadcastUri {
    type Err = BroadcastUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = broadcast_uri_regex()
            .captures(s.trim())
            .ok_or_else(|| BroadcastUriError(s.to_string()))?;
        let value = &caps["value"];
        let parse_tag = |v: &str, max: u32| -> Result<u32, BroadcastUriError> {
            v.parse::<u32>()
                .ok()
                .filter(|t| *t >= 1 && *t <= max)
                .ok_or_else(|| BroadcastUriError(s.to_string()))
        };

        match &caps["scheme"] {
            "vlan" if value.eq_ignore_ascii_case("untagged") => Ok(BroadcastUri::Native),
            "vlan" => Ok(BroadcastUri::Vlan(parse_tag(value, MAX_VLAN_ID)?)),
            "vxlan" => Ok(BroadcastUri::Vxlan(parse_tag(value, MAX_VXLAN_VNI)?)),
            "pvlan" => {
                let pv = pvlan_regex()
                    .captures(value)
                    .ok_or_else(|| BroadcastUriError(s.to_string()))?;
                Ok(BroadcastUri::Pvlan {
                    primary: parse_tag(&pv["primary"], MAX_VLAN_ID)?,
                    isolated: parse_tag(&pv["isolated"], MAX_VLAN_ID)?,
                })
            }
            "lswitch" => Ok(BroadcastUri::Lswitch(value.to_string())),
            _ => Err(BroadcastUriError(s.to_string())),
        }
    }
}

impl Serialize for BroadcastUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BroadcastUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Account and domain owning a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(rename = "accountId")]
    pub account_id: AccountId,
    #[serde(rename = "domainId")]
    pub domain_id: DomainId,
}

/// A persisted virtual network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    #[serde(rename = "displayText", default)]
    pub display_text: String,

    /// Id shared by every network spawned from one logical request
    #[serde(rename = "relatedId")]
    pub related_id: NetworkId,

    #[serde(rename = "offeringId")]
    pub offering_id: OfferingId,
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    #[serde(rename = "physicalNetworkId", skip_serializing_if = "Option::is_none")]
    pub physical_network_id: Option<PhysicalNetworkId>,

    #[serde(rename = "guestType")]
    pub guest_type: GuestType,
    #[serde(rename = "trafficType")]
    pub traffic_type: TrafficType,
    #[serde(rename = "aclType", default)]
    pub acl_type: AclType,

    #[serde(rename = "broadcastType", default)]
    pub broadcast_type: BroadcastDomainType,
    #[serde(rename = "broadcastUri", skip_serializing_if = "Option::is_none")]
    pub broadcast_uri: Option<BroadcastUri>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Ipv4Net>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(rename = "ip6Cidr", skip_serializing_if = "Option::is_none")]
    pub ip6_cidr: Option<String>,
    #[serde(rename = "ip6Gateway", skip_serializing_if = "Option::is_none")]
    pub ip6_gateway: Option<String>,
    #[serde(rename = "networkDomain", skip_serializing_if = "Option::is_none")]
    pub network_domain: Option<String>,

    pub owner: Owner,

    /// Correlates the pending multi-step operation touching this network
    #[serde(rename = "reservationId", skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,

    /// Name of the guru owning the implement/release lifecycle
    #[serde(rename = "guruName")]
    pub guru_name: String,

    /// Resolved provider per service
    #[serde(rename = "serviceProviders", default)]
    pub service_providers: BTreeMap<Service, Provider>,

    /// Shared network this network piggybacks on, excluding it from GC
    #[serde(rename = "associatedNetworkId", skip_serializing_if = "Option::is_none")]
    pub associated_network_id: Option<NetworkId>,

    #[serde(rename = "restartRequired", default)]
    pub restart_required: bool,
    #[serde(rename = "checkForGc", default)]
    pub check_for_gc: bool,
    #[serde(rename = "activeNicCount", default)]
    pub active_nic_count: u32,

    #[serde(default)]
    pub redundant: bool,

    pub state: NetworkState,

    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<DateTime<Utc>>,
}

impl Network {
    /// Start a draft for the given offering; ids and providers are filled in by the designer
    pub fn draft(offering: &NetworkOffering, zone_id: ZoneId, owner: Owner) -> Self {
        Self {
            id: 0,
            name: String::new(),
            display_text: String::new(),
            related_id: 0,
            offering_id: offering.id,
            zone_id,
            physical_network_id: None,
            guest_type: offering.guest_type,
            traffic_type: offering.traffic_type,
            acl_type: AclType::Account,
            broadcast_type: BroadcastDomainType::UnDecided,
            broadcast_uri: None,
            cidr: None,
            gateway: None,
            ip6_cidr: None,
            ip6_gateway: None,
            network_domain: None,
            owner,
            reservation_id: None,
            guru_name: String::new(),
            service_providers: BTreeMap::new(),
            associated_network_id: None,
            restart_required: false,
            check_for_gc: false,
            active_nic_count: 0,
            redundant: offering.redundant_router,
            state: NetworkState::Allocated,
            created: Utc::now(),
            removed: None,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.traffic_type == TrafficType::Guest
    }

    pub fn provides(&self, service: Service) -> bool {
        self.service_providers.contains_key(&service)
    }

    pub fn provider_for(&self, service: Service) -> Option<&Provider> {
        self.service_providers.get(&service)
    }

    /// Distinct providers bound to this network
    pub fn providers(&self) -> BTreeSet<Provider> {
        self.service_providers.values().cloned().collect()
    }

    /// Whether `provider` serves `service` on this network
    pub fn is_provider_for(&self, service: Service, provider: &Provider) -> bool {
        self.service_providers.get(&service) == Some(provider)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ntwk[{}|{:?}|{}]", self.id, self.traffic_type, self.name)
    }
}

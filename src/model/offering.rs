//! Network offerings - immutable templates networks are designed from
//!
//! An offering fixes the guest type, traffic type and, for every network
//! service it enables, the ordered list of providers allowed to serve it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::network::{GuestType, TrafficType};
use super::OfferingId;

/// A network capability a network may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    Dhcp,
    Dns,
    Firewall,
    Lb,
    StaticNat,
    SourceNat,
    PortForwarding,
    Vpn,
    UserData,
    NetworkAcl,
    Gateway,
}

impl Service {
    /// All services in canonical order
    pub const ALL: [Service; 11] = [
        Service::Dhcp,
        Service::Dns,
        Service::Firewall,
        Service::Lb,
        Service::StaticNat,
        Service::SourceNat,
        Service::PortForwarding,
        Service::Vpn,
        Service::UserData,
        Service::NetworkAcl,
        Service::Gateway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Dhcp => "Dhcp",
            Service::Dns => "Dns",
            Service::Firewall => "Firewall",
            Service::Lb => "Lb",
            Service::StaticNat => "StaticNat",
            Service::SourceNat => "SourceNat",
            Service::PortForwarding => "PortForwarding",
            Service::Vpn => "Vpn",
            Service::UserData => "UserData",
            Service::NetworkAcl => "NetworkACL",
            Service::Gateway => "Gateway",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named implementor of one or more services
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provider(pub String);

impl Provider {
    /// Name of the built-in virtual router provider
    pub const VIRTUAL_ROUTER: &'static str = "VirtualRouter";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn virtual_router() -> Self {
        Self::new(Self::VIRTUAL_ROUTER)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_virtual_router(&self) -> bool {
        self.0 == Self::VIRTUAL_ROUTER
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable network template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOffering {
    pub id: OfferingId,
    pub name: String,

    #[serde(rename = "guestType")]
    pub guest_type: GuestType,

    #[serde(rename = "trafficType", default = "default_traffic_type")]
    pub traffic_type: TrafficType,

    /// Service -> providers allowed to serve it, in preference order
    #[serde(default)]
    pub services: BTreeMap<Service, Vec<Provider>>,

    /// Persistent networks are implemented eagerly and never garbage collected
    #[serde(default)]
    pub persistent: bool,

    /// The caller supplies the VLAN instead of the VNET pool
    #[serde(rename = "specifyVlan", default)]
    pub specify_vlan: bool,

    #[serde(rename = "redundantRouter", default)]
    pub redundant_router: bool,

    /// Source NAT is served from a zone-wide shared IP
    #[serde(rename = "sharedSourceNat", default)]
    pub shared_source_nat: bool,

    /// Default egress policy re-applied when firewall rules are revoked
    #[serde(rename = "egressDefaultAllow", default = "default_true")]
    pub egress_default_allow: bool,

    /// Allows two networks of this offering to share a broadcast domain
    #[serde(rename = "allowVlanReuse", default)]
    pub allow_vlan_reuse: bool,
}

fn default_traffic_type() -> TrafficType {
    TrafficType::Guest
}

fn default_true() -> bool {
    true
}

impl NetworkOffering {
    pub fn new(id: OfferingId, name: impl Into<String>, guest_type: GuestType) -> Self {
        Self {
            id,
            name: name.into(),
            guest_type,
            traffic_type: TrafficType::Guest,
            services: BTreeMap::new(),
            persistent: false,
            specify_vlan: false,
            redundant_router: false,
            shared_source_nat: false,
            egress_default_allow: true,
            allow_vlan_reuse: false,
        }
    }

    /// Builder: enable a service served by the given providers
    pub fn with_service(mut self, service: Service, providers: &[&str]) -> Self {
        self.services
            .insert(service, providers.iter().map(|p| Provider::new(*p)).collect());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_specify_vlan(mut self, specify_vlan: bool) -> Self {
        self.specify_vlan = specify_vlan;
        self
    }

    pub fn with_traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    pub fn has_service(&self, service: Service) -> bool {
        self.services.contains_key(&service)
    }

    /// Every provider named anywhere in this offering
    pub fn providers(&self) -> BTreeSet<Provider> {
        self.services.values().flatten().cloned().collect()
    }

    /// Offerings that carry services only a dedicated appliance can apply
    pub fn has_router_services(&self) -> bool {
        [
            Service::SourceNat,
            Service::StaticNat,
            Service::Firewall,
            Service::PortForwarding,
            Service::Lb,
        ]
        .iter()
        .any(|s| self.has_service(*s))
    }
}

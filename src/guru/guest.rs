//! Guest network guru for Isolated and L2 networks in Advanced zones
//!
//! VNETs come from the physical network's range at implement time and go
//! back at shutdown. Addresses are handed out from the network CIDR, lowest
//! free host first, never the gateway.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::model::{
    BroadcastDomainType, BroadcastUri, DeployDestination, DeploymentPlan, GuestType,
    IsolationMethod, Network, NetworkOffering, NicProfile, Owner, PhysicalNetwork,
    ReservationContext, ReservationStrategy, TrafficType, VmProfile,
};
use crate::registry::{Adapter, Design, GuruError, NetworkGuru};
use crate::repository::{NicRepository, ZoneRepository};

pub const GUEST_NETWORK_GURU: &str = "GuestNetworkGuru";

/// Default guest CIDR when the request does not carry one
pub const DEFAULT_GUEST_CIDR: &str = "10.1.1.0/24";

pub struct GuestNetworkGuru {
    zones: Arc<dyn ZoneRepository>,
    nics: Arc<dyn NicRepository>,
    default_cidr: Ipv4Net,
}

impl GuestNetworkGuru {
    pub fn new(zones: Arc<dyn ZoneRepository>, nics: Arc<dyn NicRepository>) -> Self {
        Self {
            zones,
            nics,
            default_cidr: Ipv4Net::new(Ipv4Addr::new(10, 1, 1, 0), 24)
                .expect("24 is a valid IPv4 prefix length"),
        }
    }

    pub fn with_default_cidr(mut self, cidr: Ipv4Net) -> Self {
        self.default_cidr = cidr;
        self
    }

    /// Physical network carrying guest traffic with a VLAN-like isolation method
    async fn guest_physical_network(
        &self,
        plan: &DeploymentPlan,
    ) -> Result<Option<PhysicalNetwork>, GuruError> {
        if let Some(id) = plan.physical_network_id {
            return Ok(self.zones.find_physical_network(id).await?);
        }
        let candidates = self.zones.list_physical_networks(plan.zone_id).await?;
        Ok(candidates.into_iter().find(|p| {
            p.carries(TrafficType::Guest)
                && (p.isolation_methods.is_empty()
                    || p.isolation_methods.contains(&IsolationMethod::Vlan)
                    || p.isolation_methods.contains(&IsolationMethod::Vxlan))
        }))
    }

    /// Lowest host address in the CIDR that is neither the gateway nor taken
    async fn next_free_address(
        &self,
        network: &Network,
        cidr: Ipv4Net,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, GuruError> {
        let taken: HashSet<Ipv4Addr> = self
            .nics
            .list_by_network(network.id)
            .await?
            .into_iter()
            .filter_map(|n| n.ipv4)
            .collect();
        let usable = |ip: &Ipv4Addr| Some(*ip) != network.gateway && !taken.contains(ip);

        if let Some(ip) = requested {
            if !cidr.contains(&ip) || !usable(&ip) {
                return Err(GuruError::InsufficientAddressCapacity(format!(
                    "requested address {} is not available on {}",
                    ip, network
                )));
            }
            return Ok(ip);
        }

        cidr.hosts().find(usable).ok_or_else(|| {
            GuruError::InsufficientAddressCapacity(format!(
                "no free address left in {} on {}",
                cidr, network
            ))
        })
    }

    async fn fill_addressing(
        &self,
        profile: &mut NicProfile,
        network: &Network,
        ctx_reservation: Option<&str>,
    ) -> Result<(), GuruError> {
        if let Some(cidr) = network.cidr {
            if profile.ipv4.is_none() {
                let ip = self
                    .next_free_address(network, cidr, profile.requested_ipv4)
                    .await?;
                profile.ipv4 = Some(ip);
            }
            profile.netmask = Some(cidr.netmask());
            profile.gateway = network.gateway;
        }
        if profile.mac.is_none() {
            profile.mac = Some(match profile.requested_mac.clone() {
                Some(mac) => mac,
                None => self.zones.next_mac(network.zone_id).await?,
            });
        }
        profile.broadcast_uri = network.broadcast_uri.clone();
        profile.isolation_uri = network.broadcast_uri.clone();
        profile.network_domain = network.network_domain.clone();
        if let Some(reservation) = ctx_reservation {
            profile.reservation_id = Some(reservation.to_string());
        }
        Ok(())
    }
}

impl Adapter for GuestNetworkGuru {
    fn name(&self) -> &str {
        GUEST_NETWORK_GURU
    }
}

#[async_trait]
impl NetworkGuru for GuestNetworkGuru {
    async fn design(
        &self,
        offering: &NetworkOffering,
        plan: &DeploymentPlan,
        predefined: Option<&Network>,
        owner: &Owner,
    ) -> Result<Design, GuruError> {
        if offering.traffic_type != TrafficType::Guest || offering.guest_type == GuestType::Shared {
            return Ok(Design::Skip);
        }
        match self.zones.find_zone(plan.zone_id).await? {
            Some(zone) if !zone.is_basic() => {}
            _ => return Ok(Design::Skip),
        }
        let Some(physical_network) = self.guest_physical_network(plan).await? else {
            debug!("No guest physical network in zone {}", plan.zone_id);
            return Ok(Design::Skip);
        };

        let mut draft = Network::draft(offering, plan.zone_id, *owner);
        draft.physical_network_id = Some(physical_network.id);
        draft.broadcast_type = if physical_network.prefers_vxlan() {
            BroadcastDomainType::Vxlan
        } else {
            BroadcastDomainType::Vlan
        };

        if offering.guest_type == GuestType::Isolated {
            draft.cidr = Some(self.default_cidr);
            draft.gateway = self.default_cidr.hosts().next();
        }

        if let Some(predefined) = predefined {
            if predefined.cidr.is_some() {
                draft.cidr = predefined.cidr;
                draft.gateway = predefined
                    .gateway
                    .or_else(|| predefined.cidr.and_then(|c| c.hosts().next()));
            }
            if offering.specify_vlan {
                draft.broadcast_uri = predefined.broadcast_uri.clone();
                if let Some(uri) = &draft.broadcast_uri {
                    draft.broadcast_type = uri.domain_type();
                }
            }
            if predefined.network_domain.is_some() {
                draft.network_domain = predefined.network_domain.clone();
            }
        }

        Ok(Design::Draft(draft))
    }

    async fn implement(
        &self,
        network: &Network,
        _offering: &NetworkOffering,
        _dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<Network, GuruError> {
        let mut implemented = network.clone();
        if implemented.broadcast_uri.is_some() {
            return Ok(implemented);
        }

        let physical_network_id = network.physical_network_id.ok_or_else(|| {
            GuruError::Unsupported(format!("{} has no physical network", network))
        })?;
        let physical_network = self
            .zones
            .find_physical_network(physical_network_id)
            .await?
            .ok_or_else(|| {
                GuruError::Failed(format!("physical network {} vanished", physical_network_id))
            })?;

        let vnet = self
            .zones
            .allocate_vnet(
                physical_network_id,
                network.owner.account_id,
                &ctx.reservation_id,
            )
            .await?
            .ok_or_else(|| {
                GuruError::InsufficientVirtualNetworkCapacity(format!(
                    "no VNET left on physical network {} for {}",
                    physical_network_id, network
                ))
            })?;

        let uri = if physical_network.prefers_vxlan() {
            BroadcastUri::Vxlan(vnet)
        } else {
            BroadcastUri::Vlan(vnet)
        };
        info!("Allocated {} to {}", uri, network);
        implemented.broadcast_type = uri.domain_type();
        implemented.broadcast_uri = Some(uri);
        Ok(implemented)
    }

    async fn allocate(
        &self,
        network: &Network,
        requested: &NicProfile,
        _vm: &VmProfile,
    ) -> Result<NicProfile, GuruError> {
        let mut profile = NicProfile {
            network_id: network.id,
            default_nic: requested.default_nic,
            strategy: requested.strategy,
            requested_ipv4: requested.requested_ipv4,
            requested_mac: requested.requested_mac.clone(),
            traffic_type: Some(network.traffic_type),
            order_index: requested.order_index,
            ..NicProfile::default()
        };

        // Create-time and placeholder NICs are bound now, Start NICs at boot
        if profile.strategy != ReservationStrategy::Start {
            self.fill_addressing(&mut profile, network, None).await?;
        } else if let (Some(ip), Some(cidr)) = (requested.requested_ipv4, network.cidr) {
            if !cidr.contains(&ip) {
                return Err(GuruError::InsufficientAddressCapacity(format!(
                    "requested address {} is outside {} of {}",
                    ip, cidr, network
                )));
            }
        }
        Ok(profile)
    }

    async fn reserve(
        &self,
        profile: &mut NicProfile,
        network: &Network,
        _vm: &VmProfile,
        _dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<(), GuruError> {
        self.fill_addressing(profile, network, Some(&ctx.reservation_id))
            .await
    }

    async fn release(
        &self,
        profile: &mut NicProfile,
        _vm: &VmProfile,
        reservation_id: &str,
    ) -> Result<bool, GuruError> {
        match profile.reservation_id.as_deref() {
            Some(current) if current != reservation_id => Ok(false),
            _ => {
                profile.ipv4 = None;
                profile.netmask = None;
                profile.gateway = None;
                profile.broadcast_uri = None;
                profile.isolation_uri = None;
                profile.reservation_id = None;
                Ok(true)
            }
        }
    }

    async fn deallocate(
        &self,
        network: &Network,
        profile: &NicProfile,
        _vm: &VmProfile,
    ) -> Result<(), GuruError> {
        debug!(
            "Deallocated {:?} on {}",
            profile.ipv4.map(|ip| ip.to_string()),
            network
        );
        Ok(())
    }

    async fn shutdown(
        &self,
        network: &mut Network,
        offering: &NetworkOffering,
    ) -> Result<(), GuruError> {
        if !offering.specify_vlan {
            if let (Some(physical_network_id), Some(tag)) = (
                network.physical_network_id,
                network.broadcast_uri.as_ref().and_then(|u| u.primary_tag()),
            ) {
                self.zones.release_vnet(physical_network_id, tag).await?;
                info!("Released VNET {} of {}", tag, network);
            }
            network.broadcast_uri = None;
        }
        Ok(())
    }

    async fn trash(
        &self,
        _network: &Network,
        _offering: &NetworkOffering,
    ) -> Result<bool, GuruError> {
        Ok(true)
    }
}

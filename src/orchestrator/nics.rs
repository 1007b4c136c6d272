//! NIC allocation, reservation and release
//!
//! A NIC is created `Allocated`, reserved when its VM boots (`Start`) or at
//! creation (`Create`), and released in mirror order. The owning network's
//! active-NIC counter moves in the same commit as the NIC row, and address
//! picks run under the network's row lock.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use super::NetworkOrchestrator;
use crate::error::{OrchestratorError, Result};
use crate::events::{publish_or_log, EventType, UsageEvent};
use crate::model::{
    DeployDestination, ExtraDhcpOption, Network, NetworkId, Nic, NicId, NicProfile, NicState,
    ReservationContext, ReservationStrategy, Service, VirtualMachine, VmId, VmProfile, VmType,
};
use crate::registry::{Adapter, NetworkElement};

/// Networks a VM is being attached to, each with the profiles requested on it
///
/// An empty profile list asks for one NIC with default settings.
pub type NetworkNicRequests = [(Network, Vec<NicProfile>)];

/// Whether NICs of `vm` on `network` count towards the active-NIC counter
fn counts_as_active(vm_type: VmType, network: &Network) -> bool {
    match vm_type {
        VmType::User => true,
        VmType::DomainRouter => network.is_guest(),
        _ => false,
    }
}

fn lowest_free_device_id(used: &BTreeSet<u32>) -> u32 {
    (0..).find(|id| !used.contains(id)).unwrap_or(0)
}

impl NetworkOrchestrator {
    // =========================================================================
    // Allocation
    // =========================================================================

    /// Create the NICs of `vm` on the given networks
    ///
    /// Device ids are unique per VM and below the computed slot count; at
    /// most one NIC is default. Any failure removes the NICs created so far.
    pub async fn allocate(
        &self,
        vm: &VmProfile,
        networks: &NetworkNicRequests,
        extra_dhcp_options: &HashMap<NetworkId, Vec<ExtraDhcpOption>>,
    ) -> Result<Vec<Nic>> {
        let existing: Vec<Nic> = self
            .repos
            .nics
            .list_by_vm(vm.id())
            .await?
            .into_iter()
            .filter(|n| !n.is_placeholder())
            .collect();

        let requested: usize = networks.iter().map(|(_, p)| p.len().max(1)).sum();
        let slots = (existing.len() + requested).max(vm.template_nic_count as usize);
        if slots > self.config.max_nics_per_vm as usize {
            return Err(OrchestratorError::InvalidParameter(format!(
                "vm {} needs {} nics, more than the allowed {}",
                vm.id(),
                slots,
                self.config.max_nics_per_vm
            )));
        }

        let mut pending: Vec<(&Network, NicProfile)> = networks
            .iter()
            .flat_map(|(network, profiles)| {
                let profiles = if profiles.is_empty() {
                    vec![NicProfile::default()]
                } else {
                    profiles.clone()
                };
                profiles.into_iter().map(move |p| (network, p))
            })
            .collect();
        pending.sort_by_key(|(_, p)| (p.order_index.is_none(), p.order_index));

        // A VM with a single interface always gets it as default
        if existing.is_empty() && slots == 1 {
            if let Some((_, first)) = pending.first_mut() {
                first.default_nic = true;
            }
        }

        let mut used: BTreeSet<u32> = existing.iter().map(|n| n.device_id).collect();
        let mut default_seen = existing.iter().any(|n| n.default_nic);
        let mut created: Vec<Nic> = Vec::new();

        let outcome = async {
            for (network, requested) in &pending {
                let nic = self
                    .allocate_one(
                        vm,
                        network,
                        requested,
                        slots,
                        &mut used,
                        &mut default_seen,
                        extra_dhcp_options.get(&network.id),
                    )
                    .await?;
                created.push(nic);
            }

            // Template asks for more interfaces than were requested
            let shortfall = slots.saturating_sub(existing.len() + created.len());
            if shortfall > 0 {
                let (last, _) = pending.last().ok_or_else(|| {
                    OrchestratorError::Internal(format!(
                        "vm {} needs {} more nics but no network was resolved",
                        vm.id(),
                        shortfall
                    ))
                })?;
                let last: &Network = last;
                for _ in 0..shortfall {
                    let nic = self
                        .allocate_one(
                            vm,
                            last,
                            &NicProfile::default(),
                            slots,
                            &mut used,
                            &mut default_seen,
                            extra_dhcp_options.get(&last.id),
                        )
                        .await?;
                    created.push(nic);
                }
            }
            Ok::<(), OrchestratorError>(())
        }
        .await;

        if let Err(e) = outcome {
            warn!(
                "Allocation of nics for vm {} failed, removing {} created nics: {}",
                vm.id(),
                created.len(),
                e
            );
            for nic in &created {
                self.undo_allocation(vm, networks, nic).await;
            }
            return Err(e);
        }

        info!("Allocated {} nics for vm {}", created.len(), vm.id());
        Ok(created)
    }

    /// Give a NIC created by a failed `allocate` back to its guru and drop its row
    async fn undo_allocation(&self, vm: &VmProfile, networks: &NetworkNicRequests, nic: &Nic) {
        if let Some((network, _)) = networks.iter().find(|(n, _)| n.id == nic.network_id) {
            match self.guru_for(network) {
                Ok(guru) => {
                    let profile = NicProfile::from_nic(nic, network);
                    if let Err(e) = guru.deallocate(network, &profile, vm).await {
                        warn!("Guru {} failed to deallocate nic {}: {}", guru.name(), nic.id, e);
                    }
                }
                Err(e) => warn!("Unable to deallocate nic {}: {}", nic.id, e),
            }
        }
        if let Err(e) = self.repos.nics.remove_extra_dhcp_options(nic.id).await {
            warn!("Failed to remove dhcp options of nic {} after failed allocation: {}", nic.id, e);
        }
        if let Err(e) = self.repos.nics.remove(nic.id).await {
            warn!("Failed to remove nic {} after failed allocation: {}", nic.id, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn allocate_one(
        &self,
        vm: &VmProfile,
        network: &Network,
        requested: &NicProfile,
        slots: usize,
        used: &mut BTreeSet<u32>,
        default_seen: &mut bool,
        extra_dhcp_options: Option<&Vec<ExtraDhcpOption>>,
    ) -> Result<Nic> {
        let device_id = requested
            .device_id
            .unwrap_or_else(|| lowest_free_device_id(used));
        if device_id as usize >= slots || used.contains(&device_id) {
            return Err(OrchestratorError::Internal(format!(
                "device id {} for vm {} on network {} is taken or outside {} slots",
                device_id,
                vm.id(),
                network.id,
                slots
            )));
        }
        if requested.default_nic {
            if *default_seen {
                return Err(OrchestratorError::Internal(format!(
                    "vm {} would get a second default nic on network {}",
                    vm.id(),
                    network.id
                )));
            }
            *default_seen = true;
        }

        let guru = self.guru_for(network)?;
        // Create-time addresses are picked and persisted under the network lock
        let _lock = self.lock_network(network.id).await?;
        let mut profile = guru
            .allocate(network, requested, vm)
            .await
            .map_err(|e| Self::guru_error(network, guru.as_ref(), e))?;
        profile.device_id = Some(device_id);
        profile.default_nic = requested.default_nic;
        profile.vm_id = Some(vm.id());

        let nic = self
            .repos
            .nics
            .persist(Nic::from_profile(&profile, Some(vm.id()), network.id, device_id))
            .await?;
        used.insert(device_id);

        if let Some(options) = extra_dhcp_options {
            self.repos
                .nics
                .save_extra_dhcp_options(nic.id, options)
                .await?;
        }

        publish_or_log(
            self.events.as_ref(),
            UsageEvent::new(
                EventType::NicCreate,
                vm.vm.account_id,
                network.zone_id,
                nic.id,
                vm.vm.name.clone(),
            )
            .with_detail(format!("network {} device {}", network.id, device_id)),
        );
        debug!(
            "Allocated nic {} (device {}) for vm {} on {}",
            nic.id,
            device_id,
            vm.id(),
            network
        );
        Ok(nic)
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    /// Implement every network of `vm` and reserve each of its NICs
    pub async fn prepare(
        &self,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<Vec<NicProfile>> {
        let nics = self.repos.nics.list_by_vm(vm.id()).await?;
        let mut profiles = Vec::with_capacity(nics.len());
        for nic in nics {
            self.implement_network(nic.network_id, dest, ctx).await?;
            profiles.push(self.prepare_nic(vm, dest, ctx, nic.id).await?);
        }
        Ok(profiles)
    }

    /// Reserve one NIC and let the network's elements configure it
    pub async fn prepare_nic(
        &self,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
        nic_id: NicId,
    ) -> Result<NicProfile> {
        let network_id = self.find_nic(nic_id).await?.network_id;

        // Address pick and persist are one step under the network lock
        let lock = self.lock_network(network_id).await?;
        let mut nic = self.find_nic(nic_id).await?;
        let network = self.network(network_id).await?;
        let guru = self.guru_for(&network)?;
        let delta = if counts_as_active(vm.vm_type(), &network) { 1 } else { 0 };
        let profile = match nic.reservation_strategy {
            ReservationStrategy::Start if nic.state == NicState::Reserved => {
                let mut profile = NicProfile::from_nic(&nic, &network);
                guru.update_nic_profile(&mut profile, &network)
                    .await
                    .map_err(|e| Self::guru_error(&network, guru.as_ref(), e))?;
                profile
            }
            ReservationStrategy::Start => {
                if nic.state != NicState::Allocated && nic.state != NicState::Reserving {
                    return Err(OrchestratorError::InvalidNicState {
                        nic_id,
                        state: format!("{:?}", nic.state),
                        operation: "reserved",
                    });
                }
                nic.state = NicState::Reserving;
                self.repos.nics.update(&nic).await?;

                let mut profile = NicProfile::from_nic(&nic, &network);
                if let Err(e) = guru.reserve(&mut profile, &network, vm, dest, ctx).await {
                    nic.state = NicState::Allocated;
                    self.repos.nics.update(&nic).await?;
                    return Err(Self::guru_error(&network, guru.as_ref(), e));
                }
                nic.apply_reservation(&profile);
                nic.state = NicState::Reserved;
                self.repos.nics.update_with_count(&nic, delta).await?;
                debug!("Reserved {:?} for nic {} on {}", nic.ipv4, nic.id, network);
                profile
            }
            ReservationStrategy::Create | ReservationStrategy::PlaceHolder => {
                let mut profile = NicProfile::from_nic(&nic, &network);
                guru.update_nic_profile(&mut profile, &network)
                    .await
                    .map_err(|e| Self::guru_error(&network, guru.as_ref(), e))?;
                if nic.state != NicState::Reserved {
                    nic.state = NicState::Reserved;
                    self.repos.nics.update_with_count(&nic, delta).await?;
                }
                profile
            }
        };
        drop(lock);

        self.prepare_elements(&network, &profile, vm, dest, ctx).await?;
        Ok(profile)
    }

    /// Elements bound to the network configure DHCP, DNS and user data for the NIC
    async fn prepare_elements(
        &self,
        network: &Network,
        profile: &NicProfile,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<()> {
        let nic_id = profile.id.unwrap_or_default();
        let refused = |element: &dyn NetworkElement, what: &str| {
            OrchestratorError::InsufficientAddressCapacity {
                network_id: network.id,
                reason: format!("{} refused {} for nic {}", element.name(), what, nic_id),
            }
        };

        for element in self.elements.for_network(network) {
            let provider = element.provider();
            let prepared = element
                .prepare(network, profile, vm, dest, ctx)
                .await
                .map_err(|source| Self::element_error(network, element.as_ref(), source))?;
            if !prepared {
                return Err(refused(element.as_ref(), "prepare"));
            }

            if network.is_provider_for(Service::Dhcp, &provider) {
                if let Some(dhcp) = element.as_dhcp() {
                    let added = dhcp
                        .add_dhcp_entry(network, profile, vm, dest, ctx)
                        .await
                        .map_err(|source| Self::element_error(network, element.as_ref(), source))?;
                    if !added {
                        return Err(refused(element.as_ref(), "a dhcp entry"));
                    }
                }
            }
            if network.is_provider_for(Service::Dns, &provider) {
                if let Some(dns) = element.as_dns() {
                    let added = dns
                        .add_dns_entry(network, profile, vm, dest)
                        .await
                        .map_err(|source| Self::element_error(network, element.as_ref(), source))?;
                    if !added {
                        return Err(refused(element.as_ref(), "a dns entry"));
                    }
                }
            }
            if network.is_provider_for(Service::UserData, &provider) {
                if let Some(user_data) = element.as_user_data() {
                    let added = user_data
                        .add_password_and_user_data(network, profile, vm, dest, ctx)
                        .await
                        .map_err(|source| Self::element_error(network, element.as_ref(), source))?;
                    if !added {
                        return Err(refused(element.as_ref(), "user data"));
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Release and removal
    // =========================================================================

    /// Give back the boot-time address of a `Start` NIC; other NICs are left alone
    pub async fn release_nic(
        &self,
        vm: &VmProfile,
        nic_id: NicId,
        ctx: &ReservationContext,
    ) -> Result<()> {
        let mut nic = self.find_nic(nic_id).await?;
        if nic.reservation_strategy != ReservationStrategy::Start
            || !matches!(nic.state, NicState::Reserved | NicState::Reserving)
        {
            debug!(
                "Nothing to release for nic {} ({:?}, {:?})",
                nic.id, nic.reservation_strategy, nic.state
            );
            return Ok(());
        }

        let network = self.network(nic.network_id).await?;
        let guru = self.guru_for(&network)?;
        let original = nic.state;

        nic.state = NicState::Releasing;
        self.repos.nics.update(&nic).await?;

        let mut profile = NicProfile::from_nic(&nic, &network);
        let reservation_id = nic.reservation_id.clone().unwrap_or_default();
        let released = match guru.release(&mut profile, vm, &reservation_id).await {
            Ok(released) => released,
            Err(e) => {
                nic.state = original;
                self.repos.nics.update(&nic).await?;
                return Err(Self::guru_error(&network, guru.as_ref(), e));
            }
        };

        if released {
            nic.apply_release(&profile);
            nic.state = NicState::Allocated;
            let delta = if original == NicState::Reserved && counts_as_active(vm.vm_type(), &network)
            {
                -1
            } else {
                0
            };
            self.repos.nics.update_with_count(&nic, delta).await?;
        } else {
            warn!("Guru {} kept the reservation of nic {}", guru.name(), nic.id);
            nic.state = original;
            self.repos.nics.update(&nic).await?;
        }

        if original == NicState::Reserved {
            for element in self.elements.for_network(&network) {
                match element.release(&network, &profile, vm, ctx).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Element {} did not release nic {}", element.name(), nic.id),
                    Err(e) => warn!("Element {} failed to release nic {}: {}", element.name(), nic.id, e),
                }
            }
        }
        Ok(())
    }

    /// Release, deallocate and delete one NIC
    pub async fn remove_nic(
        &self,
        vm: &VmProfile,
        nic_id: NicId,
        ctx: &ReservationContext,
    ) -> Result<()> {
        let mut nic = self.find_nic(nic_id).await?;
        let Some(network) = self.repos.networks.find(nic.network_id).await? else {
            self.delete_nic_row(&nic, vm, None).await?;
            return Ok(());
        };
        let guru = self.guru_for(&network)?;
        let was_reserved = nic.state == NicState::Reserved;
        let mut profile = NicProfile::from_nic(&nic, &network);

        match nic.reservation_strategy {
            ReservationStrategy::Create => {
                for element in self.elements.for_network(&network) {
                    if let Err(e) = element.release(&network, &profile, vm, ctx).await {
                        warn!("Element {} failed to release nic {}: {}", element.name(), nic.id, e);
                    }
                }
            }
            ReservationStrategy::Start if matches!(nic.state, NicState::Reserved | NicState::Reserving) => {
                let reservation_id = nic.reservation_id.clone().unwrap_or_default();
                if let Err(e) = guru.release(&mut profile, vm, &reservation_id).await {
                    warn!("Guru {} failed to release nic {}: {}", guru.name(), nic.id, e);
                }
            }
            _ => {}
        }

        if vm.vm_type() == VmType::User {
            self.cleanup_subnet_if_last(&network, &nic, vm, was_reserved).await;
        }

        guru.deallocate(&network, &profile, vm)
            .await
            .map_err(|e| Self::guru_error(&network, guru.as_ref(), e))?;

        let delta = if was_reserved && counts_as_active(vm.vm_type(), &network) { -1 } else { 0 };
        nic.state = NicState::Deallocating;
        self.repos.nics.update_with_count(&nic, delta).await?;

        self.delete_nic_row(&nic, vm, Some(&network)).await
    }

    /// Drop the VM's DHCP entry and, for the subnet's last NIC, the subnet support
    async fn cleanup_subnet_if_last(
        &self,
        network: &Network,
        nic: &Nic,
        vm: &VmProfile,
        was_reserved: bool,
    ) {
        let profile = NicProfile::from_nic(nic, network);
        let last_on_subnet = match nic.gateway {
            Some(gateway) => match self.repos.nics.count_by_subnet(network.id, gateway).await {
                Ok(count) => count <= 1,
                Err(e) => {
                    warn!("Unable to count nics on subnet {} of {}: {}", gateway, network, e);
                    false
                }
            },
            None => false,
        };

        for element in self.elements.for_network(network) {
            let provider = element.provider();
            if network.is_provider_for(Service::Dhcp, &provider) {
                if let Some(dhcp) = element.as_dhcp() {
                    if was_reserved {
                        if let Err(e) = dhcp.remove_dhcp_entry(network, &profile, vm).await {
                            warn!("Failed to remove dhcp entry of nic {}: {}", nic.id, e);
                        }
                    }
                    if last_on_subnet {
                        if let Err(e) = dhcp.remove_dhcp_support_for_subnet(network).await {
                            warn!("Failed to remove dhcp support for subnet of {}: {}", network, e);
                        }
                    }
                }
            }
            if last_on_subnet && network.is_provider_for(Service::Dns, &provider) {
                if let Some(dns) = element.as_dns() {
                    if let Err(e) = dns.remove_dns_support_for_subnet(network).await {
                        warn!("Failed to remove dns support for subnet of {}: {}", network, e);
                    }
                }
            }
        }
    }

    async fn delete_nic_row(&self, nic: &Nic, vm: &VmProfile, network: Option<&Network>) -> Result<()> {
        self.repos.nics.remove_extra_dhcp_options(nic.id).await?;
        self.repos.nics.remove(nic.id).await?;
        publish_or_log(
            self.events.as_ref(),
            UsageEvent::new(
                EventType::NicDelete,
                vm.vm.account_id,
                network.map(|n| n.zone_id).unwrap_or_default(),
                nic.id,
                vm.vm.name.clone(),
            ),
        );
        debug!("Removed nic {} of vm {}", nic.id, vm.id());
        Ok(())
    }

    /// Remove every NIC of an expunged VM; returns how many were removed
    pub async fn cleanup_nics(&self, vm: &VmProfile, ctx: &ReservationContext) -> Result<usize> {
        let nics = self.repos.nics.list_by_vm(vm.id()).await?;
        let count = nics.len();
        for nic in nics {
            self.remove_nic(vm, nic.id, ctx).await?;
        }
        info!("Cleaned up {} nics of vm {}", count, vm.id());
        Ok(count)
    }

    // =========================================================================
    // Placeholders and lookups
    // =========================================================================

    /// Reserve an address on `network_id` for an appliance that is not a live VM
    pub async fn create_placeholder_nic(
        &self,
        network_id: NetworkId,
        requested_ip: Option<Ipv4Addr>,
    ) -> Result<Nic> {
        let network = self.network(network_id).await?;
        let guru = self.guru_for(&network)?;

        // Held until the placeholder row carries the address
        let _lock = self.lock_network(network_id).await?;
        if let Some(ip) = requested_ip {
            let taken = self
                .repos
                .nics
                .list_by_network(network_id)
                .await?
                .iter()
                .any(|n| n.ipv4 == Some(ip));
            if taken {
                return Err(OrchestratorError::InsufficientAddressCapacity {
                    network_id,
                    reason: format!("{} is already in use", ip),
                });
            }
        }

        let appliance = VmProfile::new(VirtualMachine::new(
            0,
            format!("placeholder-{}", network_id),
            VmType::DomainRouter,
            network.owner.account_id,
        ));
        let requested = NicProfile {
            strategy: ReservationStrategy::PlaceHolder,
            requested_ipv4: requested_ip,
            ..NicProfile::default()
        };
        let mut profile = guru
            .allocate(&network, &requested, &appliance)
            .await
            .map_err(|e| Self::guru_error(&network, guru.as_ref(), e))?;
        if profile.ipv4.is_none() {
            profile.ipv4 = requested_ip;
        }
        profile.strategy = ReservationStrategy::PlaceHolder;

        let mut nic = Nic::from_profile(&profile, None, network_id, 0);
        nic.state = NicState::Reserved;
        let nic = self.repos.nics.persist(nic).await?;
        info!("Created placeholder nic {} with {:?} on {}", nic.id, nic.ipv4, network);
        Ok(nic)
    }

    /// Addresses held on `network_id` for appliances rather than VMs
    pub async fn placeholder_nics(&self, network_id: NetworkId) -> Result<Vec<Nic>> {
        Ok(self.repos.nics.list_placeholders(network_id).await?)
    }

    /// The default NIC of a VM, if it has one
    pub async fn default_nic(&self, vm_id: VmId) -> Result<Option<Nic>> {
        Ok(self
            .repos
            .nics
            .list_by_vm(vm_id)
            .await?
            .into_iter()
            .find(|n| n.default_nic))
    }

    pub(crate) async fn find_nic(&self, nic_id: NicId) -> Result<Nic> {
        self.repos
            .nics
            .find(nic_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Nic", nic_id))
    }
}

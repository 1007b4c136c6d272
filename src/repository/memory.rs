//! In-memory implementation of every repository contract
//!
//! Backs the daemon and all tests. Compound writes (a NIC update plus its
//! network's active-NIC counter) are serialized by one commit mutex so they
//! behave like a single transaction.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{
    AccountRepository, IpAddressRepository, NetworkRepository, NicRepository, OfferingRepository,
    RepoResult, RepositoryError, VmRepository, ZoneRepository,
};
use crate::lock::{LockTable, RowLocker};
use crate::model::{
    Account, AccountId, Domain, DomainId, ExtraDhcpOption, IpAddress, IpAddressId, IpState,
    Network, NetworkId, NetworkOffering, Nic, NicId, OfferingId, PhysicalNetwork,
    PhysicalNetworkId, ResourceType, VirtualMachine, VmId, Zone, ZoneId,
};

/// Process-local store for networks, NICs, addresses and inventory
pub struct InMemoryStore {
    networks: DashMap<NetworkId, Network>,
    network_seq: AtomicU64,
    nics: DashMap<NicId, Nic>,
    nic_seq: AtomicU64,
    dhcp_options: DashMap<NicId, Vec<ExtraDhcpOption>>,
    ips: DashMap<IpAddressId, IpAddress>,
    offerings: DashMap<OfferingId, NetworkOffering>,
    zones: DashMap<ZoneId, Zone>,
    physical_networks: DashMap<PhysicalNetworkId, PhysicalNetwork>,
    /// Taken VNETs per physical network: vnet -> (account, reservation id)
    vnets: DashMap<PhysicalNetworkId, BTreeMap<u32, (AccountId, String)>>,
    mac_seq: DashMap<ZoneId, u64>,
    vms: DashMap<VmId, VirtualMachine>,
    accounts: DashMap<AccountId, Account>,
    domains: DashMap<DomainId, Domain>,
    resource_counts: DashMap<(AccountId, ResourceType), i64>,
    commit: Mutex<()>,
    locks: Arc<LockTable>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            networks: DashMap::new(),
            network_seq: AtomicU64::new(200),
            nics: DashMap::new(),
            nic_seq: AtomicU64::new(0),
            dhcp_options: DashMap::new(),
            ips: DashMap::new(),
            offerings: DashMap::new(),
            zones: DashMap::new(),
            physical_networks: DashMap::new(),
            vnets: DashMap::new(),
            mac_seq: DashMap::new(),
            vms: DashMap::new(),
            accounts: DashMap::new(),
            domains: DashMap::new(),
            resource_counts: DashMap::new(),
            commit: Mutex::new(()),
            locks: Arc::new(LockTable::new()),
        }
    }

    /// Lock table shared with [`super::Repositories`]
    pub fn locks(&self) -> Arc<dyn RowLocker> {
        self.locks.clone()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn insert_network(&self, network: Network) {
        self.network_seq.fetch_max(network.id, Ordering::SeqCst);
        self.networks.insert(network.id, network);
    }

    pub fn insert_offering(&self, offering: NetworkOffering) {
        self.offerings.insert(offering.id, offering);
    }

    pub fn insert_zone(&self, zone: Zone) {
        self.zones.insert(zone.id, zone);
    }

    pub fn insert_physical_network(&self, physical_network: PhysicalNetwork) {
        self.physical_networks
            .insert(physical_network.id, physical_network);
    }

    pub fn insert_ip(&self, ip: IpAddress) {
        self.ips.insert(ip.id, ip);
    }

    pub fn insert_vm(&self, vm: VirtualMachine) {
        self.vms.insert(vm.id, vm);
    }

    pub fn insert_account(&self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    pub fn insert_domain(&self, domain: Domain) {
        self.domains.insert(domain.id, domain);
    }

    /// Snapshot of a network regardless of its removed flag
    pub fn network_snapshot(&self, id: NetworkId) -> Option<Network> {
        self.networks.get(&id).map(|r| r.clone())
    }

    fn commit_lock(&self) -> RepoResult<std::sync::MutexGuard<'_, ()>> {
        self.commit
            .lock()
            .map_err(|e| RepositoryError::Backend(format!("commit lock poisoned: {}", e)))
    }

    fn apply_count_delta(&self, id: NetworkId, delta: i32) -> RepoResult<()> {
        let mut network = self
            .networks
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound { entity: "Network", id })?;
        let updated = i64::from(network.active_nic_count) + i64::from(delta);
        network.active_nic_count = u32::try_from(updated.max(0)).unwrap_or(u32::MAX);
        Ok(())
    }
}

#[async_trait]
impl NetworkRepository for InMemoryStore {
    async fn next_id(&self) -> RepoResult<NetworkId> {
        Ok(self.network_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn find(&self, id: NetworkId) -> RepoResult<Option<Network>> {
        Ok(self
            .networks
            .get(&id)
            .filter(|n| n.removed.is_none())
            .map(|n| n.clone()))
    }

    async fn persist(&self, network: &Network) -> RepoResult<()> {
        if self.networks.contains_key(&network.id) {
            return Err(RepositoryError::Conflict(format!(
                "network {} already exists",
                network.id
            )));
        }
        self.insert_network(network.clone());
        Ok(())
    }

    async fn update(&self, network: &Network) -> RepoResult<()> {
        let _tx = self.commit_lock()?;
        let mut stored = self.networks.get_mut(&network.id).ok_or(RepositoryError::NotFound {
            entity: "Network",
            id: network.id,
        })?;
        // The counter is owned by NIC persistence, never by whole-row updates
        let active = stored.active_nic_count;
        *stored = network.clone();
        stored.active_nic_count = active;
        Ok(())
    }

    async fn remove(&self, id: NetworkId) -> RepoResult<bool> {
        match self.networks.get_mut(&id) {
            Some(mut network) if network.removed.is_none() => {
                network.removed = Some(Utc::now());
                network.check_for_gc = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_zone(&self, zone_id: ZoneId) -> RepoResult<Vec<Network>> {
        Ok(self
            .networks
            .iter()
            .filter(|n| n.zone_id == zone_id && n.removed.is_none())
            .map(|n| n.clone())
            .collect())
    }

    async fn list_by_owner_and_offering(
        &self,
        account_id: AccountId,
        offering_id: OfferingId,
        zone_id: ZoneId,
    ) -> RepoResult<Vec<Network>> {
        let mut found: Vec<Network> = self
            .networks
            .iter()
            .filter(|n| {
                n.removed.is_none()
                    && n.owner.account_id == account_id
                    && n.offering_id == offering_id
                    && n.zone_id == zone_id
            })
            .map(|n| n.clone())
            .collect();
        found.sort_by_key(|n| n.id);
        Ok(found)
    }

    async fn list_gc_candidates(&self) -> RepoResult<Vec<NetworkId>> {
        let mut ids: Vec<NetworkId> = self
            .networks
            .iter()
            .filter(|n| {
                n.removed.is_none()
                    && n.check_for_gc
                    && n.active_nic_count == 0
                    && n.associated_network_id.is_none()
            })
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn change_active_nic_count(&self, id: NetworkId, delta: i32) -> RepoResult<()> {
        let _tx = self.commit_lock()?;
        self.apply_count_delta(id, delta)
    }

    async fn clear_check_for_gc(&self, id: NetworkId) -> RepoResult<()> {
        if let Some(mut network) = self.networks.get_mut(&id) {
            network.check_for_gc = false;
        }
        Ok(())
    }
}

#[async_trait]
impl NicRepository for InMemoryStore {
    async fn persist(&self, mut nic: Nic) -> RepoResult<Nic> {
        nic.id = self.nic_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.nics.insert(nic.id, nic.clone());
        Ok(nic)
    }

    async fn find(&self, id: NicId) -> RepoResult<Option<Nic>> {
        Ok(self.nics.get(&id).map(|n| n.clone()))
    }

    async fn update(&self, nic: &Nic) -> RepoResult<()> {
        let mut stored = self
            .nics
            .get_mut(&nic.id)
            .ok_or(RepositoryError::NotFound { entity: "Nic", id: nic.id })?;
        *stored = nic.clone();
        Ok(())
    }

    async fn update_with_count(&self, nic: &Nic, delta: i32) -> RepoResult<()> {
        let _tx = self.commit_lock()?;
        if !self.nics.contains_key(&nic.id) {
            return Err(RepositoryError::NotFound { entity: "Nic", id: nic.id });
        }
        if delta != 0 {
            self.apply_count_delta(nic.network_id, delta)?;
        }
        self.nics.insert(nic.id, nic.clone());
        Ok(())
    }

    async fn remove(&self, id: NicId) -> RepoResult<bool> {
        self.dhcp_options.remove(&id);
        Ok(self.nics.remove(&id).is_some())
    }

    async fn list_by_vm(&self, vm_id: VmId) -> RepoResult<Vec<Nic>> {
        let mut nics: Vec<Nic> = self
            .nics
            .iter()
            .filter(|n| n.vm_id == Some(vm_id))
            .map(|n| n.clone())
            .collect();
        nics.sort_by_key(|n| n.device_id);
        Ok(nics)
    }

    async fn list_by_network(&self, network_id: NetworkId) -> RepoResult<Vec<Nic>> {
        let mut nics: Vec<Nic> = self
            .nics
            .iter()
            .filter(|n| n.network_id == network_id)
            .map(|n| n.clone())
            .collect();
        nics.sort_by_key(|n| n.id);
        Ok(nics)
    }

    async fn list_placeholders(&self, network_id: NetworkId) -> RepoResult<Vec<Nic>> {
        let mut nics: Vec<Nic> = self
            .nics
            .iter()
            .filter(|n| n.network_id == network_id && n.is_placeholder())
            .map(|n| n.clone())
            .collect();
        nics.sort_by_key(|n| n.id);
        Ok(nics)
    }

    async fn count_by_subnet(&self, network_id: NetworkId, gateway: Ipv4Addr) -> RepoResult<usize> {
        Ok(self
            .nics
            .iter()
            .filter(|n| n.network_id == network_id && n.gateway == Some(gateway))
            .count())
    }

    async fn save_extra_dhcp_options(
        &self,
        nic_id: NicId,
        options: &[ExtraDhcpOption],
    ) -> RepoResult<()> {
        self.dhcp_options.insert(nic_id, options.to_vec());
        Ok(())
    }

    async fn list_extra_dhcp_options(&self, nic_id: NicId) -> RepoResult<Vec<ExtraDhcpOption>> {
        Ok(self
            .dhcp_options
            .get(&nic_id)
            .map(|o| o.clone())
            .unwrap_or_default())
    }

    async fn remove_extra_dhcp_options(&self, nic_id: NicId) -> RepoResult<()> {
        self.dhcp_options.remove(&nic_id);
        Ok(())
    }
}

#[async_trait]
impl IpAddressRepository for InMemoryStore {
    async fn find(&self, id: IpAddressId) -> RepoResult<Option<IpAddress>> {
        Ok(self.ips.get(&id).map(|i| i.clone()))
    }

    async fn find_by_address(&self, zone_id: ZoneId, address: Ipv4Addr) -> RepoResult<Option<IpAddress>> {
        Ok(self
            .ips
            .iter()
            .find(|i| i.zone_id == zone_id && i.address == address)
            .map(|i| i.clone()))
    }

    async fn update(&self, ip: &IpAddress) -> RepoResult<()> {
        let mut stored = self
            .ips
            .get_mut(&ip.id)
            .ok_or(RepositoryError::NotFound { entity: "IpAddress", id: ip.id })?;
        *stored = ip.clone();
        Ok(())
    }

    async fn list_free(&self, zone_id: ZoneId) -> RepoResult<Vec<IpAddress>> {
        let mut free: Vec<IpAddress> = self
            .ips
            .iter()
            .filter(|i| i.zone_id == zone_id && i.state == IpState::Free)
            .map(|i| i.clone())
            .collect();
        free.sort_by_key(|i| i.id);
        Ok(free)
    }

    async fn list_by_network(&self, network_id: NetworkId) -> RepoResult<Vec<IpAddress>> {
        let mut ips: Vec<IpAddress> = self
            .ips
            .iter()
            .filter(|i| i.network_id == Some(network_id))
            .map(|i| i.clone())
            .collect();
        ips.sort_by_key(|i| i.id);
        Ok(ips)
    }

    async fn find_source_nat(&self, network_id: NetworkId) -> RepoResult<Option<IpAddress>> {
        Ok(self
            .ips
            .iter()
            .find(|i| i.network_id == Some(network_id) && i.source_nat)
            .map(|i| i.clone()))
    }

    async fn release_dedicated_ranges(&self, network_id: NetworkId) -> RepoResult<usize> {
        let mut released = 0;
        for mut ip in self.ips.iter_mut() {
            if ip.dedicated_network_id == Some(network_id) {
                ip.dedicated_network_id = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl OfferingRepository for InMemoryStore {
    async fn find(&self, id: OfferingId) -> RepoResult<Option<NetworkOffering>> {
        Ok(self.offerings.get(&id).map(|o| o.clone()))
    }
}

#[async_trait]
impl ZoneRepository for InMemoryStore {
    async fn find_zone(&self, id: ZoneId) -> RepoResult<Option<Zone>> {
        Ok(self.zones.get(&id).map(|z| z.clone()))
    }

    async fn find_physical_network(&self, id: PhysicalNetworkId) -> RepoResult<Option<PhysicalNetwork>> {
        Ok(self.physical_networks.get(&id).map(|p| p.clone()))
    }

    async fn list_physical_networks(&self, zone_id: ZoneId) -> RepoResult<Vec<PhysicalNetwork>> {
        let mut found: Vec<PhysicalNetwork> = self
            .physical_networks
            .iter()
            .filter(|p| p.zone_id == zone_id)
            .map(|p| p.clone())
            .collect();
        found.sort_by_key(|p| p.id);
        Ok(found)
    }

    async fn allocate_vnet(
        &self,
        physical_network_id: PhysicalNetworkId,
        account_id: AccountId,
        reservation_id: &str,
    ) -> RepoResult<Option<u32>> {
        let range = self
            .physical_networks
            .get(&physical_network_id)
            .ok_or(RepositoryError::NotFound {
                entity: "PhysicalNetwork",
                id: physical_network_id,
            })?
            .vnet_range;
        let Some((start, end)) = range else {
            return Ok(None);
        };

        let mut taken = self.vnets.entry(physical_network_id).or_default();
        // A retry of the same reservation gets the same VNET back
        if let Some((vnet, _)) = taken.iter().find(|(_, (_, r))| r == reservation_id) {
            return Ok(Some(*vnet));
        }
        let free = (start..=end).find(|v| !taken.contains_key(v));
        if let Some(vnet) = free {
            taken.insert(vnet, (account_id, reservation_id.to_string()));
        }
        Ok(free)
    }

    async fn release_vnet(&self, physical_network_id: PhysicalNetworkId, vnet: u32) -> RepoResult<()> {
        if let Some(mut taken) = self.vnets.get_mut(&physical_network_id) {
            taken.remove(&vnet);
        }
        Ok(())
    }

    async fn is_vnet_allocated(&self, physical_network_id: PhysicalNetworkId, vnet: u32) -> RepoResult<bool> {
        Ok(self
            .vnets
            .get(&physical_network_id)
            .map(|t| t.contains_key(&vnet))
            .unwrap_or(false))
    }

    async fn next_mac(&self, zone_id: ZoneId) -> RepoResult<String> {
        let mut seq = self.mac_seq.entry(zone_id).or_insert(0);
        *seq += 1;
        let n = *seq;
        Ok(format!(
            "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
            zone_id & 0xff,
            (n >> 16) & 0xff,
            (n >> 8) & 0xff,
            n & 0xff
        ))
    }
}

#[async_trait]
impl VmRepository for InMemoryStore {
    async fn find(&self, id: VmId) -> RepoResult<Option<VirtualMachine>> {
        Ok(self.vms.get(&id).map(|v| v.clone()))
    }

    async fn list_by_network(&self, network_id: NetworkId) -> RepoResult<Vec<VirtualMachine>> {
        let mut vm_ids: Vec<VmId> = self
            .nics
            .iter()
            .filter(|n| n.network_id == network_id)
            .filter_map(|n| n.vm_id)
            .collect();
        vm_ids.sort_unstable();
        vm_ids.dedup();

        Ok(vm_ids
            .into_iter()
            .filter_map(|id| self.vms.get(&id).map(|v| v.clone()))
            .filter(|vm| vm.removed.is_none())
            .collect())
    }
}

#[async_trait]
impl AccountRepository for InMemoryStore {
    async fn find_account(&self, id: AccountId) -> RepoResult<Option<Account>> {
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    async fn find_domain(&self, id: DomainId) -> RepoResult<Option<Domain>> {
        Ok(self.domains.get(&id).map(|d| d.clone()))
    }

    async fn adjust_resource_count(
        &self,
        account_id: AccountId,
        resource: ResourceType,
        delta: i64,
    ) -> RepoResult<()> {
        *self.resource_counts.entry((account_id, resource)).or_insert(0) += delta;
        Ok(())
    }

    async fn resource_count(&self, account_id: AccountId, resource: ResourceType) -> RepoResult<i64> {
        Ok(self
            .resource_counts
            .get(&(account_id, resource))
            .map(|c| *c)
            .unwrap_or(0))
    }
}

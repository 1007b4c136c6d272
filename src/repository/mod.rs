//! Repository contracts the orchestrator is written against
//!
//! Each entity family gets its own async trait. [`Repositories`] bundles one
//! implementation of each plus the row-lock primitive; [`memory`] provides
//! an in-process implementation of all of them.

pub mod memory;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::lock::RowLocker;
use crate::model::{
    Account, AccountId, Domain, DomainId, ExtraDhcpOption, IpAddress, IpAddressId, Network,
    NetworkId, NetworkOffering, Nic, NicId, OfferingId, PhysicalNetwork, PhysicalNetworkId,
    ResourceType, VirtualMachine, VmId, Zone, ZoneId,
};

pub use memory::InMemoryStore;

/// Errors surfaced by a repository backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait NetworkRepository: Send + Sync {
    /// Next id from a monotonically increasing sequence
    async fn next_id(&self) -> RepoResult<NetworkId>;

    /// Non-removed network by id
    async fn find(&self, id: NetworkId) -> RepoResult<Option<Network>>;

    /// Insert a network whose id was taken from [`NetworkRepository::next_id`]
    async fn persist(&self, network: &Network) -> RepoResult<()>;

    async fn update(&self, network: &Network) -> RepoResult<()>;

    /// Soft-delete; returns whether a row was removed
    async fn remove(&self, id: NetworkId) -> RepoResult<bool>;

    async fn list_by_zone(&self, zone_id: ZoneId) -> RepoResult<Vec<Network>>;

    async fn list_by_owner_and_offering(
        &self,
        account_id: AccountId,
        offering_id: OfferingId,
        zone_id: ZoneId,
    ) -> RepoResult<Vec<Network>>;

    /// Networks flagged for GC with no active NICs and no shared association
    async fn list_gc_candidates(&self) -> RepoResult<Vec<NetworkId>>;

    async fn change_active_nic_count(&self, id: NetworkId, delta: i32) -> RepoResult<()>;

    async fn clear_check_for_gc(&self, id: NetworkId) -> RepoResult<()>;
}

#[async_trait]
pub trait NicRepository: Send + Sync {
    /// Insert and assign an id
    async fn persist(&self, nic: Nic) -> RepoResult<Nic>;

    async fn find(&self, id: NicId) -> RepoResult<Option<Nic>>;

    async fn update(&self, nic: &Nic) -> RepoResult<()>;

    /// Update the NIC and adjust its network's active-NIC counter atomically
    async fn update_with_count(&self, nic: &Nic, delta: i32) -> RepoResult<()>;

    async fn remove(&self, id: NicId) -> RepoResult<bool>;

    async fn list_by_vm(&self, vm_id: VmId) -> RepoResult<Vec<Nic>>;

    async fn list_by_network(&self, network_id: NetworkId) -> RepoResult<Vec<Nic>>;

    /// Placeholder NICs on `network_id`, not owned by any VM
    async fn list_placeholders(&self, network_id: NetworkId) -> RepoResult<Vec<Nic>>;

    /// NICs on `network_id` sharing `gateway`, i.e. the same subnet
    async fn count_by_subnet(&self, network_id: NetworkId, gateway: Ipv4Addr)
        -> RepoResult<usize>;

    async fn save_extra_dhcp_options(
        &self,
        nic_id: NicId,
        options: &[ExtraDhcpOption],
    ) -> RepoResult<()>;

    async fn list_extra_dhcp_options(&self, nic_id: NicId) -> RepoResult<Vec<ExtraDhcpOption>>;

    async fn remove_extra_dhcp_options(&self, nic_id: NicId) -> RepoResult<()>;
}

#[async_trait]
pub trait IpAddressRepository: Send + Sync {
    async fn find(&self, id: IpAddressId) -> RepoResult<Option<IpAddress>>;

    async fn find_by_address(&self, zone_id: ZoneId, address: Ipv4Addr)
        -> RepoResult<Option<IpAddress>>;

    async fn update(&self, ip: &IpAddress) -> RepoResult<()>;

    /// Free addresses in a zone, lowest id first
    async fn list_free(&self, zone_id: ZoneId) -> RepoResult<Vec<IpAddress>>;

    async fn list_by_network(&self, network_id: NetworkId) -> RepoResult<Vec<IpAddress>>;

    async fn find_source_nat(&self, network_id: NetworkId) -> RepoResult<Option<IpAddress>>;

    /// Drop every range dedication to `network_id`; returns how many addresses were affected
    async fn release_dedicated_ranges(&self, network_id: NetworkId) -> RepoResult<usize>;
}

#[async_trait]
pub trait OfferingRepository: Send + Sync {
    async fn find(&self, id: OfferingId) -> RepoResult<Option<NetworkOffering>>;
}

#[async_trait]
pub trait ZoneRepository: Send + Sync {
    async fn find_zone(&self, id: ZoneId) -> RepoResult<Option<Zone>>;

    async fn find_physical_network(
        &self,
        id: PhysicalNetworkId,
    ) -> RepoResult<Option<PhysicalNetwork>>;

    async fn list_physical_networks(&self, zone_id: ZoneId) -> RepoResult<Vec<PhysicalNetwork>>;

    /// Take a free VNET from the physical network's range
    async fn allocate_vnet(
        &self,
        physical_network_id: PhysicalNetworkId,
        account_id: AccountId,
        reservation_id: &str,
    ) -> RepoResult<Option<u32>>;

    async fn release_vnet(&self, physical_network_id: PhysicalNetworkId, vnet: u32)
        -> RepoResult<()>;

    async fn is_vnet_allocated(
        &self,
        physical_network_id: PhysicalNetworkId,
        vnet: u32,
    ) -> RepoResult<bool>;

    /// Next MAC address from the zone sequence
    async fn next_mac(&self, zone_id: ZoneId) -> RepoResult<String>;
}

#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn find(&self, id: VmId) -> RepoResult<Option<VirtualMachine>>;

    /// Non-removed VMs with a NIC on `network_id`
    async fn list_by_network(&self, network_id: NetworkId) -> RepoResult<Vec<VirtualMachine>>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_account(&self, id: AccountId) -> RepoResult<Option<Account>>;

    async fn find_domain(&self, id: DomainId) -> RepoResult<Option<Domain>>;

    async fn adjust_resource_count(
        &self,
        account_id: AccountId,
        resource: ResourceType,
        delta: i64,
    ) -> RepoResult<()>;

    async fn resource_count(&self, account_id: AccountId, resource: ResourceType)
        -> RepoResult<i64>;
}

/// One implementation of every repository contract plus the row locks
#[derive(Clone)]
pub struct Repositories {
    pub networks: Arc<dyn NetworkRepository>,
    pub nics: Arc<dyn NicRepository>,
    pub ips: Arc<dyn IpAddressRepository>,
    pub offerings: Arc<dyn OfferingRepository>,
    pub zones: Arc<dyn ZoneRepository>,
    pub vms: Arc<dyn VmRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub locks: Arc<dyn RowLocker>,
}

impl Repositories {
    /// Every contract served by one in-memory store
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            networks: store.clone(),
            nics: store.clone(),
            ips: store.clone(),
            offerings: store.clone(),
            zones: store.clone(),
            vms: store.clone(),
            accounts: store.clone(),
            locks: store.locks(),
        }
    }
}

//! Shared fixtures for the integration tests
//!
//! The orchestrator runs against the in-memory store and the built-in guest
//! guru; the virtual router is a counting element with optional slowness.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use netorch::config::OrchestratorConfig;
use netorch::guru::GuestNetworkGuru;
use netorch::model::{
    Account, DeployDestination, DeploymentPlan, Domain, GuestType, IpAddress, IsolationMethod,
    Network, NetworkOffering, NicProfile, OfferingId, Owner, PhysicalNetwork, Provider,
    ReservationContext, Service, TrafficType, VirtualMachine, VmProfile, VmState, VmType, Zone,
    ZoneNetworkType,
};
use netorch::registry::{Adapter, ElementError, ElementRegistry, GuruRegistry, NetworkElement};
use netorch::repository::{InMemoryStore, Repositories};
use netorch::{NetworkOrchestrator, NetworkRequest};

pub const ZONE: u64 = 1;
pub const ACCOUNT: u64 = 2;
pub const ISOLATED: OfferingId = 10;
pub const SPECIFY_VLAN: OfferingId = 11;

/// Virtual router stand-in counting every call
#[derive(Default)]
pub struct CountingRouterElement {
    pub implement_calls: AtomicUsize,
    pub prepare_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
    pub refuse_implement: AtomicBool,
    pub implement_delay: Option<Duration>,
}

impl CountingRouterElement {
    pub fn slow(delay: Duration) -> Self {
        Self {
            implement_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn implements(&self) -> usize {
        self.implement_calls.load(Ordering::SeqCst)
    }
}

impl Adapter for CountingRouterElement {
    fn name(&self) -> &str {
        "VirtualRouterElement"
    }
}

#[async_trait]
impl NetworkElement for CountingRouterElement {
    fn provider(&self) -> Provider {
        Provider::virtual_router()
    }

    async fn implement(
        &self,
        _network: &Network,
        _offering: &NetworkOffering,
        _dest: &DeployDestination,
        _ctx: &ReservationContext,
    ) -> Result<bool, ElementError> {
        self.implement_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.implement_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(!self.refuse_implement.load(Ordering::SeqCst))
    }

    async fn prepare(
        &self,
        _network: &Network,
        _nic: &NicProfile,
        _vm: &VmProfile,
        _dest: &DeployDestination,
        _ctx: &ReservationContext,
    ) -> Result<bool, ElementError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release(
        &self,
        _network: &Network,
        _nic: &NicProfile,
        _vm: &VmProfile,
        _ctx: &ReservationContext,
    ) -> Result<bool, ElementError> {
        Ok(true)
    }

    async fn shutdown(
        &self,
        _network: &Network,
        _ctx: &ReservationContext,
        _cleanup: bool,
    ) -> Result<bool, ElementError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn destroy(
        &self,
        _network: &Network,
        _ctx: &ReservationContext,
    ) -> Result<bool, ElementError> {
        Ok(true)
    }
}

pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub element: Arc<CountingRouterElement>,
    pub orchestrator: Arc<NetworkOrchestrator>,
}

pub fn seed(store: &InMemoryStore) {
    store.insert_zone(Zone {
        id: ZONE,
        name: "zone-1".to_string(),
        network_type: ZoneNetworkType::Advanced,
        domain: Some("z1.example".to_string()),
        dns1: None,
        dns2: None,
    });
    store.insert_physical_network(PhysicalNetwork {
        id: 1,
        zone_id: ZONE,
        name: "guest".to_string(),
        isolation_methods: vec![IsolationMethod::Vlan],
        traffic_types: vec![TrafficType::Guest],
        vnet_range: Some((100, 109)),
        traffic_label: Some("cloudbr1".to_string()),
    });
    store.insert_offering(
        NetworkOffering::new(ISOLATED, "isolated-vr", GuestType::Isolated)
            .with_service(Service::Dhcp, &["VirtualRouter"])
            .with_service(Service::Dns, &["VirtualRouter"])
            .with_service(Service::SourceNat, &["VirtualRouter"]),
    );
    store.insert_offering(
        NetworkOffering::new(SPECIFY_VLAN, "isolated-own-vlan", GuestType::Isolated)
            .with_service(Service::Dhcp, &["VirtualRouter"])
            .with_specify_vlan(true),
    );
    store.insert_domain(Domain {
        id: 1,
        name: "ROOT".to_string(),
        network_domain: None,
    });
    store.insert_account(Account {
        id: ACCOUNT,
        name: "alice".to_string(),
        domain_id: 1,
        network_domain: None,
    });
    for n in 0..4u8 {
        store.insert_ip(IpAddress::new(
            u64::from(n) + 1,
            ZONE,
            Ipv4Addr::new(203, 0, 113, 10 + n),
        ));
    }
}

pub fn fixture_with(config: OrchestratorConfig, element: CountingRouterElement) -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    seed(&store);
    let repos = Repositories::in_memory(store.clone());

    let element = Arc::new(element);
    let gurus = GuruRegistry::new().with(Arc::new(GuestNetworkGuru::new(
        repos.zones.clone(),
        repos.nics.clone(),
    )));
    let elements = ElementRegistry::new().with(element.clone());
    let orchestrator = Arc::new(NetworkOrchestrator::new(repos, gurus, elements, config));

    Fixture {
        store,
        element,
        orchestrator,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(OrchestratorConfig::default(), CountingRouterElement::default())
}

pub fn owner() -> Owner {
    Owner {
        account_id: ACCOUNT,
        domain_id: 1,
    }
}

pub fn request(offering_id: OfferingId, name: &str) -> NetworkRequest {
    NetworkRequest::new(owner(), offering_id, DeploymentPlan::zone(ZONE), name)
}

pub fn running_vm(id: u64) -> VmProfile {
    let mut vm = VirtualMachine::new(id, format!("vm-{}", id), VmType::User, ACCOUNT);
    vm.state = VmState::Running;
    VmProfile::new(vm)
}

pub fn dest() -> DeployDestination {
    DeployDestination::zone(ZONE)
}

impl Fixture {
    pub async fn network(&self, name: &str) -> Network {
        let mut networks = self
            .orchestrator
            .setup_network(request(ISOLATED, name))
            .await
            .unwrap();
        networks.remove(0)
    }
}

//! Network lifecycle orchestrator
//!
//! Ties the repository, the guru and element registries, the rules and
//! router backends and the agent gateway together:
//! - designing networks from offerings ([`designer`])
//! - NIC allocation, reservation and release ([`nics`])
//! - implement / shutdown / destroy / restart ([`lifecycle`])
//! - public address claims ([`addresses`])
//! - host network verification ([`hosts`])

pub mod addresses;
pub mod designer;
pub mod hosts;
pub mod lifecycle;
pub mod nics;

use std::sync::Arc;

use tracing::warn;

pub use designer::NetworkRequest;

use crate::agent::{AgentGateway, DisconnectedAgentGateway, TimedAgentGateway};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventPublisher, TracingEventPublisher};
use crate::lock::{LockKey, RowLockGuard};
use crate::model::{Network, NetworkId, NetworkOffering, OfferingId, Zone, ZoneId};
use crate::registry::{
    Adapter, ElementError, ElementRegistry, GuruError, GuruRegistry, NetworkElement, NetworkGuru,
};
use crate::repository::Repositories;
use crate::rules::{NoRouters, NoopRulesManager, RouterService, RulesManager};
use crate::state::{AuditStateListener, NetworkStateListener, NetworkStateMachine};

/// Control-plane engine for guest network lifecycles
pub struct NetworkOrchestrator {
    repos: Repositories,
    gurus: GuruRegistry,
    elements: ElementRegistry,
    rules: Arc<dyn RulesManager>,
    routers: Arc<dyn RouterService>,
    agent: TimedAgentGateway,
    events: Arc<dyn EventPublisher>,
    state_machine: NetworkStateMachine,
    config: OrchestratorConfig,
}

impl NetworkOrchestrator {
    pub fn new(
        repos: Repositories,
        gurus: GuruRegistry,
        elements: ElementRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let events: Arc<dyn EventPublisher> = Arc::new(TracingEventPublisher);
        let agent = TimedAgentGateway::new(Arc::new(DisconnectedAgentGateway), config.agent_timeout());
        Self {
            repos,
            gurus,
            elements,
            rules: Arc::new(NoopRulesManager),
            routers: Arc::new(NoRouters),
            agent,
            state_machine: NetworkStateMachine::new()
                .with_listener(Arc::new(AuditStateListener::new(events.clone()))),
            events,
            config,
        }
    }

    pub fn with_rules(mut self, rules: Arc<dyn RulesManager>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_routers(mut self, routers: Arc<dyn RouterService>) -> Self {
        self.routers = routers;
        self
    }

    /// Agent transport; every send is bounded by `agent_timeout_secs`
    pub fn with_agent(mut self, agent: Arc<dyn AgentGateway>) -> Self {
        self.agent = TimedAgentGateway::new(agent, self.config.agent_timeout());
        self
    }

    /// Event sink; the audit listener is re-wired to publish through it
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.state_machine = NetworkStateMachine::new()
            .with_listener(Arc::new(AuditStateListener::new(events.clone())));
        self.events = events;
        self
    }

    /// Extra post-transition listener
    pub fn with_state_listener(mut self, listener: Arc<dyn NetworkStateListener>) -> Self {
        self.state_machine = self.state_machine.with_listener(listener);
        self
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn gurus(&self) -> &GuruRegistry {
        &self.gurus
    }

    pub fn elements(&self) -> &ElementRegistry {
        &self.elements
    }

    // =========================================================================
    // Lookups shared by the submodules
    // =========================================================================

    pub async fn network(&self, id: NetworkId) -> Result<Network> {
        self.repos
            .networks
            .find(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Network", id))
    }

    pub(crate) async fn offering(&self, id: OfferingId) -> Result<NetworkOffering> {
        self.repos
            .offerings
            .find(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("NetworkOffering", id))
    }

    pub(crate) async fn zone(&self, id: ZoneId) -> Result<Zone> {
        self.repos
            .zones
            .find_zone(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Zone", id))
    }

    /// The guru recorded on the network at design time
    pub(crate) fn guru_for(&self, network: &Network) -> Result<Arc<dyn NetworkGuru>> {
        self.gurus.get_by_name(&network.guru_name).ok_or_else(|| {
            OrchestratorError::Unsupported(format!(
                "no guru named {:?} is registered for {}",
                network.guru_name, network
            ))
        })
    }

    pub(crate) fn guru_error(
        network: &Network,
        guru: &dyn NetworkGuru,
        source: GuruError,
    ) -> OrchestratorError {
        OrchestratorError::Guru {
            network_id: network.id,
            guru: guru.name().to_string(),
            source,
        }
    }

    pub(crate) fn element_error(
        network: &Network,
        element: &dyn NetworkElement,
        source: ElementError,
    ) -> OrchestratorError {
        OrchestratorError::Element {
            network_id: network.id,
            element: element.name().to_string(),
            source,
        }
    }

    /// Per-network row lock with the configured bounded wait
    pub(crate) async fn lock_network(&self, id: NetworkId) -> Result<RowLockGuard> {
        let key = LockKey::Network(id);
        let timeout = self.config.lock_timeout();
        match RowLockGuard::acquire(self.repos.locks.clone(), key.clone(), timeout).await? {
            Some(guard) => Ok(guard),
            None => {
                warn!("Timed out after {:?} waiting for lock on network {}", timeout, id);
                Err(OrchestratorError::LockTimeout { key, timeout })
            }
        }
    }
}

// ============================================================================
// Shared fixtures for the orchestrator tests
// ============================================================================

#[cfg(test)]
pub(crate) mod testkit {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::*;
    use crate::events::CollectingEventPublisher;
    use crate::model::{
        Account, Domain, GuestType, IpAddress, NetworkOffering, PhysicalNetwork, Provider,
        Service, TrafficType, VirtualMachine, VmProfile, VmState, VmType, ZoneNetworkType,
    };
    use crate::registry::mock::{MockElement, MockGuru};
    use crate::repository::InMemoryStore;
    use crate::rules::mock::RecordingRulesManager;

    pub const ZONE: ZoneId = 1;
    pub const ISOLATED_OFFERING: OfferingId = 10;
    pub const SHARED_OFFERING: OfferingId = 11;
    pub const PERSISTENT_OFFERING: OfferingId = 12;
    pub const ACCOUNT: u64 = 2;
    pub const DOMAIN: u64 = 1;

    pub struct Harness {
        pub store: Arc<InMemoryStore>,
        pub guru: Arc<MockGuru>,
        pub element: Arc<MockElement>,
        pub rules: Arc<RecordingRulesManager>,
        pub events: Arc<CollectingEventPublisher>,
        pub orchestrator: NetworkOrchestrator,
    }

    pub fn isolated_offering() -> NetworkOffering {
        NetworkOffering::new(ISOLATED_OFFERING, "isolated-vr", GuestType::Isolated)
            .with_service(Service::Dhcp, &["VirtualRouter"])
            .with_service(Service::Dns, &["VirtualRouter"])
            .with_service(Service::SourceNat, &["VirtualRouter"])
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
            isolation_methods: vec![],
            traffic_types: vec![TrafficType::Guest],
            vnet_range: Some((100, 199)),
            traffic_label: Some("cloudbr1".to_string()),
        });
        store.insert_offering(isolated_offering());
        store.insert_offering(
            NetworkOffering::new(SHARED_OFFERING, "shared-vr", GuestType::Shared)
                .with_service(Service::Dhcp, &["VirtualRouter"])
                .with_service(Service::StaticNat, &["VirtualRouter"]),
        );
        store.insert_offering(
            NetworkOffering::new(PERSISTENT_OFFERING, "persistent", GuestType::Isolated)
                .with_service(Service::Dhcp, &["VirtualRouter"])
                .with_persistent(true),
        );
        store.insert_domain(Domain {
            id: DOMAIN,
            name: "ROOT".to_string(),
            network_domain: None,
        });
        store.insert_account(Account {
            id: ACCOUNT,
            name: "alice".to_string(),
            domain_id: DOMAIN,
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

    pub fn harness_with(config: OrchestratorConfig, guru: MockGuru) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        seed(&store);

        let guru = Arc::new(guru);
        let element = Arc::new(MockElement::new("VirtualRouterElement", Provider::VIRTUAL_ROUTER));
        let rules = Arc::new(RecordingRulesManager::default());
        let events = Arc::new(CollectingEventPublisher::new());

        let gurus = GuruRegistry::new().with(guru.clone());
        let elements = ElementRegistry::new().with(element.clone());
        let orchestrator =
            NetworkOrchestrator::new(Repositories::in_memory(store.clone()), gurus, elements, config)
                .with_rules(rules.clone())
                .with_events(events.clone());

        Harness {
            store,
            guru,
            element,
            rules,
            events,
            orchestrator,
        }
    }

    pub fn harness() -> Harness {
        harness_with(OrchestratorConfig::default(), MockGuru::new("MockGuru"))
    }

    pub fn owner() -> crate::model::Owner {
        crate::model::Owner {
            account_id: ACCOUNT,
            domain_id: DOMAIN,
        }
    }

    pub fn user_vm(id: u64) -> VmProfile {
        let mut vm = VirtualMachine::new(id, format!("vm-{}", id), VmType::User, ACCOUNT);
        vm.state = VmState::Running;
        VmProfile::new(vm)
    }

    impl Harness {
        /// Design one network of `offering_id` and return it
        pub async fn network(&self, offering_id: OfferingId) -> Network {
            let request = NetworkRequest::new(
                owner(),
                offering_id,
                crate::model::DeploymentPlan::zone(ZONE),
                "net",
            );
            let mut networks = self.orchestrator.setup_network(request).await.unwrap();
            networks.remove(0)
        }
    }
}

//! Network design: offering + deployment plan -> persisted networks

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::NetworkOrchestrator;
use crate::error::{OrchestratorError, Result};
use crate::events::{publish_or_log, EventType, UsageEvent};
use crate::lock::{LockKey, RowLockGuard};
use crate::model::{
    AclType, BroadcastUri, DeploymentPlan, GuestType, Network, NetworkId, NetworkOffering,
    NetworkState, OfferingId, Owner, Provider, ResourceType, Service, TrafficType,
};
use crate::registry::{Adapter, Design};

/// Parameters of one `setup_network` request
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub owner: Owner,
    pub offering_id: OfferingId,
    pub plan: DeploymentPlan,
    pub name: String,
    pub display_text: String,
    /// Caller-supplied CIDR, gateway, VLAN or network domain
    pub predefined: Option<Network>,
    pub network_domain: Option<String>,
    pub acl_type: AclType,
    /// Skip the broadcast-domain overlap check; refused for Isolated networks
    pub bypass_vlan_overlap_check: bool,
    /// Shared network whose VLAN was not explicitly specified
    pub shared_without_specify_vlan: bool,
    pub associated_network_id: Option<NetworkId>,
}

impl NetworkRequest {
    pub fn new(
        owner: Owner,
        offering_id: OfferingId,
        plan: DeploymentPlan,
        name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            owner,
            offering_id,
            plan,
            display_text: name.clone(),
            name,
            predefined: None,
            network_domain: None,
            acl_type: AclType::Account,
            bypass_vlan_overlap_check: false,
            shared_without_specify_vlan: false,
            associated_network_id: None,
        }
    }

    pub fn with_predefined(mut self, predefined: Network) -> Self {
        self.predefined = Some(predefined);
        self
    }

    pub fn with_vlan(mut self, uri: BroadcastUri, offering: &NetworkOffering) -> Self {
        let mut predefined = self
            .predefined
            .take()
            .unwrap_or_else(|| Network::draft(offering, self.plan.zone_id, self.owner));
        predefined.broadcast_type = uri.domain_type();
        predefined.broadcast_uri = Some(uri);
        self.predefined = Some(predefined);
        self
    }

    pub fn with_network_domain(mut self, domain: impl Into<String>) -> Self {
        self.network_domain = Some(domain.into());
        self
    }

    pub fn with_acl_type(mut self, acl_type: AclType) -> Self {
        self.acl_type = acl_type;
        self
    }

    pub fn bypass_vlan_overlap_check(mut self, bypass: bool) -> Self {
        self.bypass_vlan_overlap_check = bypass;
        self
    }

    pub fn shared_without_specify_vlan(mut self, shared: bool) -> Self {
        self.shared_without_specify_vlan = shared;
        self
    }

    pub fn with_associated_network(mut self, id: NetworkId) -> Self {
        self.associated_network_id = Some(id);
        self
    }
}

impl NetworkOrchestrator {
    /// Design and persist the networks for `request`
    ///
    /// Serialized per owning account. Every registered guru is asked in turn;
    /// networks it reuses are returned as-is, drafts are persisted in state
    /// `Allocated` and share one related id. Drafts are written only once all
    /// of them passed their checks, and a failed write removes the earlier ones.
    pub async fn setup_network(&self, request: NetworkRequest) -> Result<Vec<Network>> {
        let offering = self.offering(request.offering_id).await?;

        if request.bypass_vlan_overlap_check && offering.guest_type == GuestType::Isolated {
            return Err(OrchestratorError::InvalidParameter(format!(
                "VLAN overlap check cannot be bypassed for Isolated offering {}",
                offering.id
            )));
        }

        let key = LockKey::Account(request.owner.account_id);
        let timeout = self.config.lock_timeout();
        let _owner_lock = RowLockGuard::acquire(self.repos.locks.clone(), key.clone(), timeout)
            .await?
            .ok_or_else(|| {
                warn!(
                    "Timed out waiting to set up networks for account {}",
                    request.owner.account_id
                );
                OrchestratorError::LockTimeout { key, timeout }
            })?;

        // System traffic networks are one per owner and offering
        if request.predefined.is_none() && offering.traffic_type != TrafficType::Guest {
            let existing = self
                .repos
                .networks
                .list_by_owner_and_offering(
                    request.owner.account_id,
                    offering.id,
                    request.plan.zone_id,
                )
                .await?;
            if !existing.is_empty() {
                debug!(
                    "Found {} existing networks for offering {}",
                    existing.len(),
                    offering.id
                );
                return Ok(existing);
            }
        }

        let providers = self.resolve_providers(&offering)?;

        // Every draft is designed and checked before any row is written
        let mut networks = Vec::new();
        let mut drafts: Vec<Network> = Vec::new();
        let mut related_id: Option<NetworkId> = None;
        for guru in self.gurus.iter() {
            let design = guru
                .design(
                    &offering,
                    &request.plan,
                    request.predefined.as_ref(),
                    &request.owner,
                )
                .await
                .map_err(|source| OrchestratorError::Guru {
                    network_id: 0,
                    guru: guru.name().to_string(),
                    source,
                })?;

            let mut network = match design {
                Design::Skip => continue,
                Design::Reuse(existing) => {
                    debug!("Guru {} reuses {}", guru.name(), existing);
                    networks.push(existing);
                    continue;
                }
                Design::Draft(draft) => draft,
            };

            network.id = self.repos.networks.next_id().await?;
            network.related_id = *related_id.get_or_insert(network.id);
            network.name = request.name.clone();
            network.display_text = request.display_text.clone();
            network.guru_name = guru.name().to_string();
            network.owner = request.owner;
            network.acl_type = request.acl_type;
            network.associated_network_id = request.associated_network_id;
            network.service_providers = providers.clone();
            network.redundant = offering.redundant_router;
            network.state = NetworkState::Allocated;

            if network.broadcast_uri.is_some() {
                self.check_vlan_overlap(&network, &offering, &request, &drafts)
                    .await?;
            }
            if network.is_guest() {
                network.network_domain = self.resolve_network_domain(&request, &network).await?;
            }
            drafts.push(network);
        }

        for (done, network) in drafts.iter().enumerate() {
            if let Err(e) = self.persist_draft(network).await {
                warn!("Failed to persist {}, undoing {} earlier drafts: {}", network, done, e);
                self.undo_drafts(&drafts[..done]).await;
                return Err(e);
            }
        }
        for network in drafts {
            publish_or_log(
                self.events.as_ref(),
                UsageEvent::for_network(EventType::NetworkCreate, &network),
            );
            info!(
                "Designed {} with guru {} in zone {}",
                network, network.guru_name, network.zone_id
            );
            networks.push(network);
        }

        if networks.is_empty() {
            return Err(OrchestratorError::Unsupported(format!(
                "no registered guru can design offering {} in zone {}",
                offering.id, request.plan.zone_id
            )));
        }
        Ok(networks)
    }

    /// Write one draft and count it against its owner; a half-written draft is removed
    async fn persist_draft(&self, network: &Network) -> Result<()> {
        self.repos.networks.persist(network).await?;
        if network.is_guest() && network.acl_type == AclType::Account {
            if let Err(e) = self
                .repos
                .accounts
                .adjust_resource_count(network.owner.account_id, ResourceType::Network, 1)
                .await
            {
                if let Err(undo) = self.repos.networks.remove(network.id).await {
                    warn!("Failed to remove {} after a failed count update: {}", network, undo);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Remove drafts persisted by a `setup_network` call that failed later
    async fn undo_drafts(&self, drafts: &[Network]) {
        for network in drafts {
            if let Err(e) = self.repos.networks.remove(network.id).await {
                warn!("Failed to remove {} during setup rollback: {}", network, e);
                continue;
            }
            if network.is_guest() && network.acl_type == AclType::Account {
                if let Err(e) = self
                    .repos
                    .accounts
                    .adjust_resource_count(network.owner.account_id, ResourceType::Network, -1)
                    .await
                {
                    warn!("Failed to uncount {} during setup rollback: {}", network, e);
                }
            }
        }
    }

    /// Service -> provider map; the first listed provider with a registered element wins
    pub fn resolve_providers(
        &self,
        offering: &NetworkOffering,
    ) -> Result<BTreeMap<Service, Provider>> {
        let mut resolved = BTreeMap::new();
        for (service, providers) in &offering.services {
            let provider = providers
                .iter()
                .find(|p| self.elements.get_by_provider(p).is_some())
                .ok_or_else(|| OrchestratorError::MissingProvider {
                    service: *service,
                    providers: providers.clone(),
                })?;
            resolved.insert(*service, provider.clone());
        }
        Ok(resolved)
    }

    /// Reject a broadcast URI already used in the same zone and physical network
    ///
    /// `staged` holds drafts of the same request that are not persisted yet.
    async fn check_vlan_overlap(
        &self,
        network: &Network,
        offering: &NetworkOffering,
        request: &NetworkRequest,
        staged: &[Network],
    ) -> Result<()> {
        let Some(uri) = &network.broadcast_uri else {
            return Ok(());
        };
        if offering.allow_vlan_reuse
            || request.shared_without_specify_vlan
            || request.bypass_vlan_overlap_check
        {
            debug!("Skipping overlap check of {} for {}", uri, network);
            return Ok(());
        }

        let overlap = |uri: &BroadcastUri| OrchestratorError::VlanOverlap {
            uri: uri.to_string(),
            zone_id: network.zone_id,
        };

        let zone_networks = self.repos.networks.list_by_zone(network.zone_id).await?;
        let clash = zone_networks.iter().chain(staged).any(|other| {
            other.id != network.id
                && (other.physical_network_id.is_none()
                    || network.physical_network_id.is_none()
                    || other.physical_network_id == network.physical_network_id)
                && other
                    .broadcast_uri
                    .as_ref()
                    .map(|o| o.overlaps(uri))
                    .unwrap_or(false)
        });
        if clash {
            return Err(overlap(uri));
        }

        // A tag handed out by the dynamic VNET pool is taken as well
        if let (Some(physical_network_id), BroadcastUri::Vlan(tag)) =
            (network.physical_network_id, uri)
        {
            if self
                .repos
                .zones
                .is_vnet_allocated(physical_network_id, *tag)
                .await?
            {
                return Err(overlap(uri));
            }
        }
        Ok(())
    }

    /// Explicit value, else domain's, else account's, else generated from the account id
    async fn resolve_network_domain(
        &self,
        request: &NetworkRequest,
        network: &Network,
    ) -> Result<Option<String>> {
        let explicit = request.network_domain.clone().or_else(|| {
            request
                .predefined
                .as_ref()
                .and_then(|p| p.network_domain.clone())
        });
        if explicit.is_some() {
            return Ok(explicit);
        }

        if let Some(domain) = self.repos.accounts.find_domain(network.owner.domain_id).await? {
            if domain.network_domain.is_some() {
                return Ok(domain.network_domain);
            }
        }
        if let Some(account) = self
            .repos
            .accounts
            .find_account(network.owner.account_id)
            .await?
        {
            if account.network_domain.is_some() {
                return Ok(account.network_domain);
            }
        }

        let suffix = self
            .repos
            .zones
            .find_zone(network.zone_id)
            .await?
            .and_then(|z| z.domain)
            .unwrap_or_else(|| self.config.guest_domain_suffix.clone());
        Ok(Some(generated_network_domain(network.owner.account_id, &suffix)))
    }
}

/// `cs<hex account id>.<suffix>`
pub fn generated_network_domain(account_id: u64, suffix: &str) -> String {
    format!("cs{:x}.{}", account_id, suffix)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{Domain, GuestType};
    use crate::orchestrator::testkit::*;
    use crate::registry::mock::MockGuru;
    use crate::repository::{AccountRepository, NetworkRepository};

    #[test]
    fn test_generated_domain() {
        assert_eq!(generated_network_domain(255, "cloud.internal"), "csff.cloud.internal");
    }

    #[tokio::test]
    async fn test_setup_persists_allocated_network() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;

        assert_eq!(network.state, NetworkState::Allocated);
        assert_eq!(network.guru_name, "MockGuru");
        assert_eq!(network.related_id, network.id);
        assert_eq!(
            network.provider_for(Service::Dhcp),
            Some(&Provider::virtual_router())
        );
        assert_eq!(network.network_domain.as_deref(), Some("cs2.z1.example"));

        let stored = NetworkRepository::find(h.store.as_ref(), network.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "net");
        assert_eq!(h.events.count(EventType::NetworkCreate), 1);
        assert_eq!(
            h.store
                .resource_count(ACCOUNT, ResourceType::Network)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_related_id_shared_across_gurus() {
        let h = harness();
        let orchestrator = NetworkOrchestrator::new(
            h.orchestrator.repos().clone(),
            h.orchestrator
                .gurus()
                .clone()
                .with(Arc::new(MockGuru::new("SecondGuru"))),
            h.orchestrator.elements().clone(),
            h.orchestrator.config().clone(),
        );

        let networks = orchestrator
            .setup_network(NetworkRequest::new(
                owner(),
                ISOLATED_OFFERING,
                DeploymentPlan::zone(ZONE),
                "pair",
            ))
            .await
            .unwrap();

        assert_eq!(networks.len(), 2);
        assert!(networks[1].id > networks[0].id);
        assert_eq!(networks[1].related_id, networks[0].id);
        assert_eq!(networks[1].guru_name, "SecondGuru");
    }

    #[tokio::test]
    async fn test_failed_second_draft_persists_nothing() {
        let h = harness();
        let orchestrator = NetworkOrchestrator::new(
            h.orchestrator.repos().clone(),
            h.orchestrator
                .gurus()
                .clone()
                .with(Arc::new(MockGuru::new("SecondGuru"))),
            h.orchestrator.elements().clone(),
            h.orchestrator.config().clone(),
        );
        let request = NetworkRequest::new(owner(), ISOLATED_OFFERING, DeploymentPlan::zone(ZONE), "pair")
            .with_vlan(BroadcastUri::Vlan(300), &isolated_offering());

        // Both gurus copy vlan://300, so the second draft overlaps the first
        let err = orchestrator.setup_network(request).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::VlanOverlap { .. }));
        assert!(h.store.list_by_zone(ZONE).await.unwrap().is_empty());
        assert_eq!(
            h.store
                .resource_count(ACCOUNT, ResourceType::Network)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_missing_provider_names_service() {
        let h = harness();
        h.store.insert_offering(
            NetworkOffering::new(50, "vr-only", GuestType::Isolated)
                .with_service(Service::Dhcp, &["VR"])
                .with_service(Service::Dns, &["VR"])
                .with_service(Service::UserData, &["VR"]),
        );

        let err = h
            .orchestrator
            .setup_network(NetworkRequest::new(owner(), 50, DeploymentPlan::zone(ZONE), "x"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        match err {
            OrchestratorError::MissingProvider { service, .. } => assert_eq!(service, Service::Dhcp),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h.store.list_by_zone(ZONE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vlan_overlap_rejected_unless_shared_without_vlan() {
        let h = harness();
        let offering = isolated_offering();
        let first = NetworkRequest::new(owner(), ISOLATED_OFFERING, DeploymentPlan::zone(ZONE), "a")
            .with_vlan(BroadcastUri::Vlan(100), &offering);
        h.orchestrator.setup_network(first).await.unwrap();

        let second = NetworkRequest::new(owner(), ISOLATED_OFFERING, DeploymentPlan::zone(ZONE), "b")
            .with_vlan(BroadcastUri::Vlan(100), &offering);
        let err = h.orchestrator.setup_network(second.clone()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::VlanOverlap { .. }));

        let networks = h
            .orchestrator
            .setup_network(second.shared_without_specify_vlan(true))
            .await
            .unwrap();
        assert_eq!(networks[0].broadcast_uri, Some(BroadcastUri::Vlan(100)));
    }

    #[tokio::test]
    async fn test_bypass_forbidden_for_isolated() {
        let h = harness();
        let request =
            NetworkRequest::new(owner(), ISOLATED_OFFERING, DeploymentPlan::zone(ZONE), "a")
                .bypass_vlan_overlap_check(true);
        let err = h.orchestrator.setup_network(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_network_domain_priority() {
        let h = harness();
        let explicit = h
            .orchestrator
            .setup_network(
                NetworkRequest::new(owner(), ISOLATED_OFFERING, DeploymentPlan::zone(ZONE), "a")
                    .with_network_domain("corp.example"),
            )
            .await
            .unwrap();
        assert_eq!(explicit[0].network_domain.as_deref(), Some("corp.example"));

        h.store.insert_domain(Domain {
            id: DOMAIN,
            name: "ROOT".to_string(),
            network_domain: Some("root.example".to_string()),
        });
        let from_domain = h.network(ISOLATED_OFFERING).await;
        assert_eq!(from_domain.network_domain.as_deref(), Some("root.example"));
    }

    #[tokio::test]
    async fn test_owner_lock_released_after_setup() {
        let h = harness();
        h.network(ISOLATED_OFFERING).await;
        assert_eq!(
            h.store.locks().held_count(&LockKey::Account(ACCOUNT)),
            0
        );
    }
}

//! Implement, shutdown, destroy and restart of networks
//!
//! Every operation here runs under the per-network row lock. Implement-time
//! failures roll back whatever was brought up; shutdown and destroy fold
//! individual provider failures into a boolean result instead.

use tracing::{debug, info, warn};

use super::NetworkOrchestrator;
use crate::error::{OrchestratorError, Result};
use crate::events::{publish_or_log, EventType, UsageEvent};
use crate::model::{
    AclType, DeployDestination, GuestType, Network, NetworkId, NetworkOffering, NetworkState,
    Provider, RedundantRole, ReservationContext, ResourceType, RouterState, Service, VmType, Zone,
};
use crate::registry::Adapter;
use crate::rules::RuleKind;
use crate::state::NetworkEvent;

// ============================================================================
// State predicates (pure)
// ============================================================================

/// Nothing to do for `implement_network`
pub fn is_network_implemented(network: &Network, offering: &NetworkOffering, zone: &Zone) -> bool {
    match network.state {
        NetworkState::Implemented => true,
        NetworkState::Setup => !offering.persistent || zone.is_basic(),
        _ => false,
    }
}

/// Shared guest network in an advanced zone carrying appliance-only services
///
/// Several accounts may drive such a network at once, so its state is
/// written directly instead of going through the state machine. Concurrent
/// implement and shutdown from two owners are only serialized by the row lock.
pub fn is_shared_network_with_services(
    network: &Network,
    offering: &NetworkOffering,
    zone: &Zone,
) -> bool {
    network.guest_type == GuestType::Shared && !zone.is_basic() && offering.has_router_services()
}

/// Rolling restart needs the built-in virtual router to be the only provider
pub fn supports_rolling_restart(network: &Network) -> bool {
    let providers = network.providers();
    !providers.is_empty() && providers.iter().all(Provider::is_virtual_router)
}

impl NetworkOrchestrator {
    // =========================================================================
    // Implement
    // =========================================================================

    /// Bring a network up: guru implement, elements, rules
    ///
    /// Idempotent; an implemented network is returned untouched.
    pub async fn implement_network(
        &self,
        id: NetworkId,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<Network> {
        let network = self.network(id).await?;
        let offering = self.offering(network.offering_id).await?;
        let zone = self.zone(network.zone_id).await?;
        if is_network_implemented(&network, &offering, &zone) {
            debug!("{} is already implemented", network);
            return Ok(network);
        }

        let _lock = self.lock_network(id).await?;

        // Another caller may have finished while we waited
        let mut network = self.network(id).await?;
        if is_network_implemented(&network, &offering, &zone) {
            debug!("{} was implemented while waiting for its lock", network);
            return Ok(network);
        }

        let shared = is_shared_network_with_services(&network, &offering, &zone);
        if shared {
            network.state = NetworkState::Implementing;
            self.repos.networks.update(&network).await?;
        } else {
            self.state_machine
                .transit(
                    self.repos.networks.as_ref(),
                    &mut network,
                    NetworkEvent::ImplementNetwork,
                )
                .await?;
        }
        info!("Implementing {} in zone {}", network, network.zone_id);
        let had_source_nat = self.repos.ips.find_source_nat(id).await?.is_some();

        match self.implement_in_place(&mut network, &offering, dest, ctx).await {
            Ok(()) => {
                network.restart_required = false;
                network.check_for_gc = !offering.persistent;
                if shared {
                    network.state = NetworkState::Setup;
                    self.repos.networks.update(&network).await?;
                } else {
                    self.state_machine
                        .transit(
                            self.repos.networks.as_ref(),
                            &mut network,
                            NetworkEvent::OperationSucceeded,
                        )
                        .await?;
                }
                info!("Implemented {} as {:?}", network, network.broadcast_uri);
                Ok(network)
            }
            Err(e) => {
                warn!("Failed to implement {}: {}", network, e);
                self.rollback_implement(&mut network, &offering, ctx, shared, had_source_nat)
                    .await;
                Err(e)
            }
        }
    }

    async fn implement_in_place(
        &self,
        network: &mut Network,
        offering: &NetworkOffering,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<()> {
        let guru = self.guru_for(network)?;
        let implemented = guru
            .implement(network, offering, dest, ctx)
            .await
            .map_err(|e| Self::guru_error(network, guru.as_ref(), e))?;

        let state = network.state;
        *network = implemented;
        network.state = state;
        network.reservation_id = Some(ctx.reservation_id.clone());
        self.repos.networks.update(network).await?;

        self.implement_elements_and_resources(network, offering, dest, ctx)
            .await
    }

    /// Best-effort teardown after a failed implement
    ///
    /// Rules and elements go down through the shutdown fold; a source NAT
    /// address claimed by this attempt goes back to the pool.
    async fn rollback_implement(
        &self,
        network: &mut Network,
        offering: &NetworkOffering,
        ctx: &ReservationContext,
        shared: bool,
        had_source_nat: bool,
    ) {
        if !self
            .shutdown_network_elements_and_resources(network, offering, ctx, true)
            .await
        {
            warn!("Rollback of {} left some rules or elements up", network);
        }
        if !had_source_nat {
            if let Err(e) = self.release_source_nat_ip(network).await {
                warn!("Unable to release source NAT of {} during rollback: {}", network, e);
            }
        }
        match self.guru_for(network) {
            Ok(guru) => {
                if let Err(e) = guru.shutdown(network, offering).await {
                    warn!("Guru {} failed to shut down {} during rollback: {}", guru.name(), network, e);
                }
            }
            Err(e) => warn!("Unable to roll back {}: {}", network, e),
        }

        let restored = if shared {
            network.state = NetworkState::Shutdown;
            self.repos.networks.update(network).await.map_err(OrchestratorError::from)
        } else {
            self.state_machine
                .transit(
                    self.repos.networks.as_ref(),
                    network,
                    NetworkEvent::OperationFailed,
                )
                .await
                .map(|_| ())
                .map_err(OrchestratorError::from)
        };
        if let Err(e) = restored {
            warn!("Unable to record failed implement of {}: {}", network, e);
        }
    }

    /// Source NAT, elements (with aggregated batching) and rules, in that order
    pub(crate) async fn implement_elements_and_resources(
        &self,
        network: &Network,
        offering: &NetworkOffering,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<()> {
        if network.provides(Service::SourceNat)
            && !offering.shared_source_nat
            && self.repos.ips.find_source_nat(network.id).await?.is_none()
        {
            self.assign_source_nat_ip(network).await?;
        }

        let elements = self.elements.for_network(network);
        let unavailable = |reason: String| OrchestratorError::ResourceUnavailable {
            network_id: network.id,
            operation: "implement",
            reason,
        };

        let outcome = async {
            for element in &elements {
                if let Some(aggregated) = element.as_aggregated() {
                    let prepared = aggregated
                        .prepare_aggregated(network, dest)
                        .await
                        .map_err(|e| Self::element_error(network, element.as_ref(), e))?;
                    if !prepared {
                        return Err(unavailable(format!(
                            "{} could not start an aggregated batch",
                            element.name()
                        )));
                    }
                }
            }

            for element in &elements {
                debug!("Asking {} to implement {}", element.name(), network);
                let implemented = element
                    .implement(network, offering, dest, ctx)
                    .await
                    .map_err(|e| Self::element_error(network, element.as_ref(), e))?;
                if !implemented {
                    return Err(unavailable(format!("{} returned false", element.name())));
                }
            }

            self.reapply_rules(network, offering).await?;

            for element in &elements {
                if let Some(aggregated) = element.as_aggregated() {
                    let completed = aggregated
                        .complete_aggregated(network, dest)
                        .await
                        .map_err(|e| Self::element_error(network, element.as_ref(), e))?;
                    if !completed {
                        return Err(unavailable(format!(
                            "{} could not complete its aggregated batch",
                            element.name()
                        )));
                    }
                }
            }
            Ok::<(), OrchestratorError>(())
        }
        .await;

        for element in &elements {
            if let Some(aggregated) = element.as_aggregated() {
                if let Err(e) = aggregated.cleanup_aggregated(network, dest).await {
                    warn!("Aggregated cleanup of {} failed on {}: {}", element.name(), network, e);
                }
            }
        }
        outcome
    }

    /// Default egress, then every rule family in apply order
    async fn reapply_rules(&self, network: &Network, offering: &NetworkOffering) -> Result<()> {
        let failed = |reason: String| OrchestratorError::ResourceUnavailable {
            network_id: network.id,
            operation: "implement",
            reason,
        };

        if network.is_guest() && network.provides(Service::Firewall) {
            match self
                .rules
                .apply_default_egress(network, offering.egress_default_allow)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Err(failed("default egress policy was not applied".to_string())),
                Err(e) => return Err(failed(e.to_string())),
            }
        }

        for kind in RuleKind::APPLY_ORDER {
            match self.rules.apply(network, kind).await {
                Ok(true) => {}
                Ok(false) => return Err(failed(format!("{} rules were not applied", kind))),
                Err(e) => return Err(failed(e.to_string())),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Tear a network down to `Allocated`; `false` means some step failed
    pub async fn shutdown_network(
        &self,
        id: NetworkId,
        ctx: &ReservationContext,
        cleanup: bool,
    ) -> Result<bool> {
        let _lock = self.lock_network(id).await?;
        self.shutdown_network_locked(id, ctx, cleanup).await
    }

    /// Shut a network down only while it is still idle and flagged for GC
    ///
    /// The idle check and the shutdown run under one hold of the network
    /// lock, so a NIC reserved meanwhile keeps the network up. `Ok(None)`
    /// means the network is gone or in use again.
    pub async fn shutdown_idle_network(
        &self,
        id: NetworkId,
        ctx: &ReservationContext,
    ) -> Result<Option<bool>> {
        let _lock = self.lock_network(id).await?;
        match self.repos.networks.find(id).await? {
            Some(network) if network.active_nic_count == 0 && network.check_for_gc => {}
            Some(network) => {
                debug!("{} is in use again, leaving it up", network);
                return Ok(None);
            }
            None => {
                debug!("Network {} is gone, nothing to collect", id);
                return Ok(None);
            }
        }
        self.shutdown_network_locked(id, ctx, false).await.map(Some)
    }

    /// Shutdown body; the caller holds the network lock
    async fn shutdown_network_locked(
        &self,
        id: NetworkId,
        ctx: &ReservationContext,
        cleanup: bool,
    ) -> Result<bool> {
        let Some(mut network) = self.repos.networks.find(id).await? else {
            debug!("Network {} is gone, nothing to shut down", id);
            return Ok(true);
        };
        match network.state {
            NetworkState::Allocated => {
                debug!("{} is not implemented, nothing to shut down", network);
                return Ok(true);
            }
            NetworkState::Implemented | NetworkState::Setup | NetworkState::Shutdown => {}
            other => {
                debug!("{} is {}, skipping shutdown", network, other);
                return Ok(false);
            }
        }

        let offering = self.offering(network.offering_id).await?;
        let zone = self.zone(network.zone_id).await?;
        let shared = is_shared_network_with_services(&network, &offering, &zone);

        match network.state {
            NetworkState::Implemented if !shared => {
                self.state_machine
                    .transit(
                        self.repos.networks.as_ref(),
                        &mut network,
                        NetworkEvent::DestroyNetwork,
                    )
                    .await?;
            }
            NetworkState::Shutdown => {}
            _ => {
                network.state = NetworkState::Shutdown;
                self.repos.networks.update(&network).await?;
            }
        }
        info!("Shutting down {}", network);

        let mut success = self
            .shutdown_network_elements_and_resources(&network, &offering, ctx, cleanup)
            .await;

        let guru = self.guru_for(&network)?;
        if let Err(e) = guru.shutdown(&mut network, &offering).await {
            warn!("Guru {} failed to shut down {}: {}", guru.name(), network, e);
            success = false;
        }

        let (event, state) = if success {
            network.check_for_gc = false;
            network.restart_required = false;
            (NetworkEvent::OperationSucceeded, NetworkState::Allocated)
        } else {
            network.restart_required = true;
            (NetworkEvent::OperationFailed, NetworkState::Shutdown)
        };
        if shared {
            network.state = state;
            self.repos.networks.update(&network).await?;
        } else {
            self.state_machine
                .transit(self.repos.networks.as_ref(), &mut network, event)
                .await?;
        }

        if success {
            info!("Shut down {}", network);
        } else {
            warn!("Shutdown of {} was incomplete; restart required", network);
        }
        Ok(success)
    }

    /// Revoke rules and shut every element down; failures are folded, never raised
    pub(crate) async fn shutdown_network_elements_and_resources(
        &self,
        network: &Network,
        offering: &NetworkOffering,
        ctx: &ReservationContext,
        cleanup: bool,
    ) -> bool {
        let mut success = true;

        for kind in RuleKind::REVOKE_ORDER {
            match self.rules.revoke(network, kind, ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("{} rules of {} were not revoked", kind, network);
                    success = false;
                }
                Err(e) => {
                    warn!("Failed to revoke {} rules of {}: {}", kind, network, e);
                    success = false;
                }
            }
            if kind == RuleKind::EgressFirewall
                && network.is_guest()
                && network.provides(Service::Firewall)
            {
                if let Err(e) = self
                    .rules
                    .apply_default_egress(network, offering.egress_default_allow)
                    .await
                {
                    warn!("Failed to re-add default egress of {}: {}", network, e);
                    success = false;
                }
            }
        }

        for element in self.elements.for_network(network) {
            debug!("Sending shutdown to {} for {}", element.name(), network);
            match element.shutdown(network, ctx, cleanup).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Element {} did not shut down {}", element.name(), network);
                    success = false;
                }
                Err(e) => {
                    warn!("Element {} failed to shut down {}: {}", element.name(), network, e);
                    success = false;
                }
            }
        }
        success
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Shut down if needed, then trash and remove the network
    ///
    /// Refuses while live user VMs (or, in basic zones, system VMs) still
    /// reference it. Returns `false` when a provider step failed.
    pub async fn destroy_network(&self, id: NetworkId, ctx: &ReservationContext) -> Result<bool> {
        // One hold covers the attachment check, shutdown and trash
        let _lock = self.lock_network(id).await?;
        let Some(network) = self.repos.networks.find(id).await? else {
            debug!("Network {} is already removed", id);
            return Ok(true);
        };
        let zone = self.zone(network.zone_id).await?;

        let vms = self.repos.vms.list_by_network(id).await?;
        if let Some(vm) = vms.iter().find(|vm| vm.vm_type == VmType::User && vm.is_live()) {
            return Err(OrchestratorError::ResourceInUse {
                network_id: id,
                reason: format!("user vm {} is still attached", vm.id),
            });
        }
        if zone.is_basic() {
            if let Some(vm) = vms.iter().find(|vm| vm.vm_type.is_system() && vm.is_live()) {
                return Err(OrchestratorError::ResourceInUse {
                    network_id: id,
                    reason: format!("system vm {} is still attached", vm.id),
                });
            }
        }

        if matches!(
            network.state,
            NetworkState::Implemented | NetworkState::Setup | NetworkState::Shutdown
        ) && !self.shutdown_network_locked(id, ctx, true).await?
        {
            warn!("Unable to destroy {}: shutdown failed", network);
            return Ok(false);
        }

        let mut network = self.network(id).await?;
        let offering = self.offering(network.offering_id).await?;
        let guru = self.guru_for(&network)?;

        let mut success = true;
        for element in self.elements.for_network(&network) {
            match element.destroy(&network, ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Element {} did not destroy {}", element.name(), network);
                    success = false;
                }
                Err(e) => {
                    warn!("Element {} failed to destroy {}: {}", element.name(), network, e);
                    success = false;
                }
            }
        }
        if !success {
            warn!("Unable to destroy {}: element destroy failed", network);
            return Ok(false);
        }

        match guru.trash(&network, &offering).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Guru {} refused to trash {}", guru.name(), network);
                return Ok(false);
            }
            Err(e) => {
                warn!("Guru {} failed to trash {}: {}", guru.name(), network, e);
                return Ok(false);
            }
        }

        self.state_machine
            .transit(
                self.repos.networks.as_ref(),
                &mut network,
                NetworkEvent::DestroyNetwork,
            )
            .await?;

        match self.release_network_resources(&network).await {
            Ok(()) => {
                publish_or_log(
                    self.events.as_ref(),
                    UsageEvent::for_network(EventType::NetworkDelete, &network),
                );
                info!("Destroyed {}", network);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to release resources of {}: {}", network, e);
                if let Err(e) = self
                    .state_machine
                    .transit(
                        self.repos.networks.as_ref(),
                        &mut network,
                        NetworkEvent::OperationFailed,
                    )
                    .await
                {
                    warn!("Unable to record failed destroy of {}: {}", network, e);
                }
                Ok(false)
            }
        }
    }

    /// Addresses, counters, leftover NIC rows and finally the network row
    async fn release_network_resources(&self, network: &Network) -> Result<()> {
        let dedicated = self.repos.ips.release_dedicated_ranges(network.id).await?;
        if dedicated > 0 {
            debug!("Released {} dedicated addresses of {}", dedicated, network);
        }

        for mut ip in self.repos.ips.list_by_network(network.id).await? {
            let account_id = ip.account_id;
            ip.release();
            self.repos.ips.update(&ip).await?;
            if let Some(account_id) = account_id {
                self.repos
                    .accounts
                    .adjust_resource_count(account_id, ResourceType::PublicIp, -1)
                    .await?;
            }
            publish_or_log(
                self.events.as_ref(),
                UsageEvent::new(
                    EventType::IpRelease,
                    account_id.unwrap_or(network.owner.account_id),
                    network.zone_id,
                    ip.id,
                    ip.address.to_string(),
                ),
            );
        }

        if network.is_guest() && network.acl_type == AclType::Account {
            self.repos
                .accounts
                .adjust_resource_count(network.owner.account_id, ResourceType::Network, -1)
                .await?;
        }

        for nic in self.repos.nics.list_by_network(network.id).await? {
            self.repos.nics.remove_extra_dhcp_options(nic.id).await?;
            self.repos.nics.remove(nic.id).await?;
        }

        self.repos.networks.remove(network.id).await?;
        Ok(())
    }

    // =========================================================================
    // Restart
    // =========================================================================

    /// Re-apply a network's services
    ///
    /// Without `cleanup` the elements are re-implemented in place. With it,
    /// a virtual-router-only network is rolled router by router when rolling
    /// restarts are enabled; anything else is shut down and implemented again.
    pub async fn restart_network(
        &self,
        id: NetworkId,
        ctx: &ReservationContext,
        cleanup: bool,
    ) -> Result<bool> {
        let network = self.network(id).await?;
        if !matches!(network.state, NetworkState::Implemented | NetworkState::Setup) {
            return Err(OrchestratorError::InvalidParameter(format!(
                "network {} is {} and cannot be restarted",
                id, network.state
            )));
        }
        let offering = self.offering(network.offering_id).await?;
        let dest = DeployDestination::zone(network.zone_id);
        info!("Restarting {} (cleanup: {})", network, cleanup);

        let restarted = if cleanup {
            if self.config.rolling_restart && supports_rolling_restart(&network) {
                self.rolling_restart(id, ctx).await?;
                true
            } else if self.shutdown_network(id, ctx, true).await? {
                self.implement_network(id, &dest, ctx).await?;
                true
            } else {
                warn!("Restart of {} stopped: shutdown failed", network);
                false
            }
        } else {
            let _lock = self.lock_network(id).await?;
            let mut network = self.network(id).await?;
            if self
                .shutdown_network_elements_and_resources(&network, &offering, ctx, false)
                .await
            {
                self.implement_elements_and_resources(&network, &offering, &dest, ctx)
                    .await?;
                network.restart_required = false;
                self.repos.networks.update(&network).await?;
                true
            } else {
                warn!("Restart of {} stopped: element shutdown failed", network);
                false
            }
        };

        if restarted {
            publish_or_log(
                self.events.as_ref(),
                UsageEvent::for_network(EventType::NetworkRestart, &network)
                    .with_detail(format!("cleanup={}", cleanup)),
            );
        }
        Ok(restarted)
    }

    /// Replace the network's virtual routers while keeping one serving
    ///
    /// Broken routers go first, then the backup of a redundant pair. A new
    /// router is deployed before the remaining old ones are destroyed.
    pub async fn rolling_restart(&self, id: NetworkId, ctx: &ReservationContext) -> Result<()> {
        let _lock = self.lock_network(id).await?;
        let mut network = self.network(id).await?;
        if !supports_rolling_restart(&network) {
            return Err(OrchestratorError::Unsupported(format!(
                "rolling restart of network {} needs VirtualRouter as sole provider, found {:?}",
                id,
                network.providers()
            )));
        }
        let offering = self.offering(network.offering_id).await?;
        let dest = DeployDestination::zone(network.zone_id);
        let unavailable = |reason: String| OrchestratorError::ResourceUnavailable {
            network_id: id,
            operation: "restart",
            reason,
        };

        let routers = self
            .routers
            .list_routers(id)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let (expendable, mut remaining): (Vec<_>, Vec<_>) =
            routers.into_iter().partition(|r| r.is_expendable());
        for router in &expendable {
            info!("Destroying expendable router {} of {}", router.name, network);
            self.routers
                .destroy_router(router.id, ctx)
                .await
                .map_err(|e| unavailable(e.to_string()))?;
        }

        if remaining.len() >= 2 {
            let (backups, primaries): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|r| r.redundant_role != RedundantRole::Primary);
            for router in &backups {
                info!("Destroying backup router {} of {}", router.name, network);
                self.routers
                    .destroy_router(router.id, ctx)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
            }
            remaining = primaries;
        }

        // Deploys the replacement next to the router still serving
        self.implement_elements_and_resources(&network, &offering, &dest, ctx)
            .await?;

        for router in &remaining {
            if router.is_redundant {
                debug!(
                    "Waiting {:?} for VRRP hand-over before destroying {}",
                    self.config.vrrp_handover_delay(),
                    router.name
                );
                tokio::time::sleep(self.config.vrrp_handover_delay()).await;
            }
            info!("Destroying old router {} of {}", router.name, network);
            self.routers
                .destroy_router(router.id, ctx)
                .await
                .map_err(|e| unavailable(e.to_string()))?;
        }

        self.implement_elements_and_resources(&network, &offering, &dest, ctx)
            .await?;

        let routers = self
            .routers
            .list_routers(id)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if let Some(router) = routers.iter().find(|r| r.state != RouterState::Running) {
            return Err(unavailable(format!(
                "router {} is {:?} after restart",
                router.name, router.state
            )));
        }

        network.restart_required = false;
        self.repos.networks.update(&network).await?;
        info!("Rolling restart of {} complete", network);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::lock::LockKey;
    use crate::model::{VirtualMachine, VmState};
    use crate::registry::mock::MockGuru;
    use crate::repository::{AccountRepository, IpAddressRepository, NetworkRepository};
    use crate::rules::mock::{MockRouterService, RecordingRulesManager};
    use crate::orchestrator::testkit::*;

    fn dest() -> DeployDestination {
        DeployDestination::zone(ZONE)
    }

    fn ctx() -> ReservationContext {
        ReservationContext::system()
    }

    #[tokio::test]
    async fn test_implement_runs_guru_elements_and_rules() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;

        let implemented = h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        assert_eq!(implemented.state, NetworkState::Implemented);
        assert_eq!(implemented.broadcast_uri.map(|u| u.to_string()), Some("vlan://100".to_string()));
        assert!(implemented.check_for_gc);
        assert!(!implemented.restart_required);
        assert_eq!(h.guru.implement_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.element.implement_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.rules.applied(), RuleKind::APPLY_ORDER.to_vec());

        let source_nat = h.store.find_source_nat(network.id).await.unwrap().unwrap();
        assert!(source_nat.source_nat);
        assert_eq!(h.store.locks().held_count(&LockKey::Network(network.id)), 0);
    }

    #[tokio::test]
    async fn test_implement_is_idempotent() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let first = h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        assert_eq!(first.broadcast_uri, second.broadcast_uri);
        assert_eq!(second.state, NetworkState::Implemented);
        assert_eq!(h.guru.implement_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.element.implement_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_implement_rolls_back() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        h.element.fail_implement.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.to_string().contains(&network.id.to_string()));
        let stored = h.store.network_snapshot(network.id).unwrap();
        assert_eq!(stored.state, NetworkState::Allocated);
        assert_eq!(h.element.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.guru.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.locks().held_count(&LockKey::Network(network.id)), 0);

        // The source NAT claimed by the attempt is free again
        assert!(h.store.find_source_nat(network.id).await.unwrap().is_none());
        assert_eq!(
            h.store.resource_count(ACCOUNT, ResourceType::PublicIp).await.unwrap(),
            0
        );
        assert_eq!(h.events.count(EventType::IpAssign), 1);
        assert_eq!(h.events.count(EventType::IpRelease), 1);
        assert_eq!(h.store.list_free(ZONE).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_rules_roll_back_rules_and_source_nat() {
        let mut h = harness();
        let rules = Arc::new(RecordingRulesManager {
            fail_apply: Some(RuleKind::StaticNat),
            ..Default::default()
        });
        h.orchestrator = h.orchestrator.with_rules(rules.clone());
        let network = h.network(ISOLATED_OFFERING).await;

        let err = h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::ResourceUnavailable { .. }));
        assert_eq!(rules.revoked(), RuleKind::REVOKE_ORDER.to_vec());
        assert!(h.store.find_source_nat(network.id).await.unwrap().is_none());
        assert_eq!(
            h.store.network_snapshot(network.id).unwrap().state,
            NetworkState::Allocated
        );
    }

    #[tokio::test]
    async fn test_rollback_keeps_source_nat_from_earlier_implement() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();
        h.orchestrator
            .shutdown_network(network.id, &ctx(), true)
            .await
            .unwrap();
        let kept = h.store.find_source_nat(network.id).await.unwrap().unwrap();
        h.element.fail_implement.store(true, Ordering::SeqCst);

        assert!(h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .is_err());
        let after = h.store.find_source_nat(network.id).await.unwrap().unwrap();
        assert_eq!(after.id, kept.id);
    }

    #[tokio::test]
    async fn test_aggregated_cleanup_runs_on_failure() {
        let store = Arc::new(crate::repository::InMemoryStore::new());
        seed(&store);
        let element = Arc::new(
            crate::registry::mock::MockElement::new("Vr", Provider::VIRTUAL_ROUTER).aggregated(),
        );
        element.fail_implement.store(true, Ordering::SeqCst);
        let orchestrator = NetworkOrchestrator::new(
            crate::repository::Repositories::in_memory(store.clone()),
            crate::registry::GuruRegistry::new().with(Arc::new(MockGuru::new("MockGuru"))),
            crate::registry::ElementRegistry::new().with(element.clone()),
            crate::config::OrchestratorConfig::default(),
        );
        let network = orchestrator
            .setup_network(super::super::NetworkRequest::new(
                owner(),
                ISOLATED_OFFERING,
                crate::model::DeploymentPlan::zone(ZONE),
                "agg",
            ))
            .await
            .unwrap()
            .remove(0);

        assert!(orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .is_err());
        assert_eq!(element.aggregated_prepare_calls.load(Ordering::SeqCst), 1);
        assert_eq!(element.aggregated_complete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(element.aggregated_cleanup_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_network_with_services_uses_setup() {
        let h = harness();
        let network = h.network(SHARED_OFFERING).await;

        let implemented = h
            .orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();
        assert_eq!(implemented.state, NetworkState::Setup);

        // Setup on a non-persistent offering counts as implemented
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();
        assert_eq!(h.guru.implement_calls.load(Ordering::SeqCst), 1);

        assert!(h
            .orchestrator
            .shutdown_network(network.id, &ctx(), true)
            .await
            .unwrap());
        assert_eq!(
            h.store.network_snapshot(network.id).unwrap().state,
            NetworkState::Allocated
        );
    }

    #[tokio::test]
    async fn test_shutdown_returns_to_allocated() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        let ok = h
            .orchestrator
            .shutdown_network(network.id, &ctx(), true)
            .await
            .unwrap();

        assert!(ok);
        let stored = h.store.network_snapshot(network.id).unwrap();
        assert_eq!(stored.state, NetworkState::Allocated);
        assert!(!stored.check_for_gc);
        assert_eq!(stored.broadcast_uri, None);
        assert_eq!(h.rules.revoked(), RuleKind::REVOKE_ORDER.to_vec());
        assert_eq!(h.element.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.locks().held_count(&LockKey::Network(network.id)), 0);
    }

    #[tokio::test]
    async fn test_shutdown_folds_failures() {
        let mut h = harness();
        let rules = Arc::new(RecordingRulesManager {
            fail_revoke: Some(RuleKind::StaticNat),
            ..Default::default()
        });
        h.orchestrator = h.orchestrator.with_rules(rules.clone());
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        let ok = h
            .orchestrator
            .shutdown_network(network.id, &ctx(), true)
            .await
            .unwrap();

        assert!(!ok);
        // Later revokes and the element shutdown still ran
        assert_eq!(rules.revoked().len(), 8);
        assert_eq!(h.element.shutdown_calls.load(Ordering::SeqCst), 1);
        let stored = h.store.network_snapshot(network.id).unwrap();
        assert_eq!(stored.state, NetworkState::Shutdown);
        assert!(stored.restart_required);
        assert_eq!(h.store.locks().held_count(&LockKey::Network(network.id)), 0);
    }

    #[tokio::test]
    async fn test_idle_shutdown_leaves_busy_network_up() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let vm = user_vm(3);
        h.orchestrator
            .allocate(&vm, &[(network.clone(), vec![])], &HashMap::new())
            .await
            .unwrap();
        h.orchestrator.prepare(&vm, &dest(), &ctx()).await.unwrap();

        let outcome = h
            .orchestrator
            .shutdown_idle_network(network.id, &ctx())
            .await
            .unwrap();

        assert_eq!(outcome, None);
        assert_eq!(
            h.store.network_snapshot(network.id).unwrap().state,
            NetworkState::Implemented
        );
        assert_eq!(h.element.shutdown_calls.load(Ordering::SeqCst), 0);
        assert!(h.rules.revoked().is_empty());
    }

    #[tokio::test]
    async fn test_idle_shutdown_of_free_network() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .shutdown_idle_network(network.id, &ctx())
            .await
            .unwrap();

        assert_eq!(outcome, Some(true));
        assert_eq!(
            h.store.network_snapshot(network.id).unwrap().state,
            NetworkState::Allocated
        );
        assert_eq!(h.store.locks().held_count(&LockKey::Network(network.id)), 0);
    }

    #[tokio::test]
    async fn test_shutdown_of_allocated_network_is_noop() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        assert!(h
            .orchestrator
            .shutdown_network(network.id, &ctx(), true)
            .await
            .unwrap());
        assert_eq!(h.element.shutdown_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_refuses_with_live_user_vm() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let vm = user_vm(7);
        h.store.insert_vm(vm.vm.clone());
        h.orchestrator
            .allocate(&vm, &[(network.clone(), vec![])], &HashMap::new())
            .await
            .unwrap();

        let err = h
            .orchestrator
            .destroy_network(network.id, &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_destroy_checks_attachments_under_network_lock() {
        let mut config = crate::config::OrchestratorConfig::default();
        config.lock_timeout_secs = 1;
        let h = harness_with(config, MockGuru::new("MockGuru"));
        let network = h.network(ISOLATED_OFFERING).await;
        let vm = user_vm(7);
        h.store.insert_vm(vm.vm.clone());
        h.orchestrator
            .allocate(&vm, &[(network.clone(), vec![])], &HashMap::new())
            .await
            .unwrap();

        let key = LockKey::Network(network.id);
        let locks = h.store.locks();
        assert!(locks
            .acquire_row_lock(&key, std::time::Duration::from_millis(10))
            .await
            .unwrap());

        // The attachment check waits for the lock instead of racing it
        let err = h
            .orchestrator
            .destroy_network(network.id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LockTimeout { .. }));

        locks.release_row_lock(&key);
        let err = h
            .orchestrator
            .destroy_network(network.id, &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(locks.held_count(&key), 0);
        assert_eq!(h.guru.trash_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_ignores_expunging_vm() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let mut vm = VirtualMachine::new(8, "gone", VmType::User, ACCOUNT);
        vm.state = VmState::Expunging;
        h.store.insert_vm(vm.clone());
        h.orchestrator
            .allocate(
                &crate::model::VmProfile::new(vm),
                &[(network.clone(), vec![])],
                &HashMap::new(),
            )
            .await
            .unwrap();

        assert!(h.orchestrator.destroy_network(network.id, &ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_implemented_network() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        let destroyed = h
            .orchestrator
            .destroy_network(network.id, &ctx())
            .await
            .unwrap();

        assert!(destroyed);
        assert!(NetworkRepository::find(h.store.as_ref(), network.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.element.destroy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.guru.trash_calls.load(Ordering::SeqCst), 1);
        assert!(IpAddressRepository::list_by_network(h.store.as_ref(), network.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            h.store
                .resource_count(ACCOUNT, ResourceType::Network)
                .await
                .unwrap(),
            0
        );
        assert_eq!(h.events.count(EventType::NetworkDelete), 1);

        // Destroying again is a no-op
        assert!(h.orchestrator.destroy_network(network.id, &ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_without_cleanup_reapplies_in_place() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        assert!(h
            .orchestrator
            .restart_network(network.id, &ctx(), false)
            .await
            .unwrap());
        assert_eq!(h.element.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.element.implement_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.guru.implement_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.events.count(EventType::NetworkRestart), 1);
    }

    #[tokio::test]
    async fn test_restart_of_allocated_network_rejected() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let err = h
            .orchestrator
            .restart_network(network.id, &ctx(), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_rolling_restart_keeps_primary_until_replacement() {
        let mut config = crate::config::OrchestratorConfig::default();
        config.vrrp_handover_delay_ms = 1;
        let mut h = harness_with(config, MockGuru::new("MockGuru"));
        let routers = Arc::new(MockRouterService::with_routers(vec![
            MockRouterService::router(1, RouterState::Running, RedundantRole::Primary, true),
            MockRouterService::router(2, RouterState::Running, RedundantRole::Backup, true),
            MockRouterService::router(3, RouterState::Stopped, RedundantRole::Unknown, true),
        ]));
        h.orchestrator = h.orchestrator.with_routers(routers.clone());
        let network = h.network(ISOLATED_OFFERING).await;
        h.orchestrator
            .implement_network(network.id, &dest(), &ctx())
            .await
            .unwrap();

        assert!(h
            .orchestrator
            .restart_network(network.id, &ctx(), true)
            .await
            .unwrap());
        assert_eq!(routers.destroyed(), vec![3, 2, 1]);
        // Initial implement plus the two rolling re-implements
        assert_eq!(h.element.implement_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.guru.shutdown_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rolling_restart_unsupported_for_other_providers() {
        let h = harness();
        let mut network = h.network(ISOLATED_OFFERING).await;
        network
            .service_providers
            .insert(Service::Lb, Provider::new("Netscaler"));
        h.store.insert_network(network.clone());

        let err = h
            .orchestrator
            .rolling_restart(network.id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Unsupported(_)));
    }

    #[test]
    fn test_implemented_predicate() {
        let offering = isolated_offering();
        let zone = Zone {
            id: ZONE,
            name: "z".to_string(),
            network_type: crate::model::ZoneNetworkType::Advanced,
            domain: None,
            dns1: None,
            dns2: None,
        };
        let mut network = Network::draft(&offering, ZONE, owner());
        assert!(!is_network_implemented(&network, &offering, &zone));
        network.state = NetworkState::Implemented;
        assert!(is_network_implemented(&network, &offering, &zone));
        network.state = NetworkState::Setup;
        assert!(is_network_implemented(&network, &offering, &zone));
        let persistent = offering.with_persistent(true);
        assert!(!is_network_implemented(&network, &persistent, &zone));
    }
}

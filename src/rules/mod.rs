//! Rule application and virtual router contracts
//!
//! Firewall/NAT/LB/VPN/ACL rules and the routers carrying them live outside
//! this crate. The orchestrator only decides when and in which order they
//! are re-applied or revoked.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Network, NetworkId, ReservationContext, Router, RouterId};

/// Families of rules attached to a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    EgressFirewall,
    IngressFirewall,
    StaticNat,
    PortForwarding,
    PublicLb,
    InternalLb,
    Vpn,
    NetworkAcl,
}

impl RuleKind {
    /// Re-apply order at implement time; egress must be live before ingress
    pub const APPLY_ORDER: [RuleKind; 8] = [
        RuleKind::EgressFirewall,
        RuleKind::IngressFirewall,
        RuleKind::StaticNat,
        RuleKind::PortForwarding,
        RuleKind::PublicLb,
        RuleKind::InternalLb,
        RuleKind::Vpn,
        RuleKind::NetworkAcl,
    ];

    /// Revoke order at shutdown time
    pub const REVOKE_ORDER: [RuleKind; 8] = [
        RuleKind::EgressFirewall,
        RuleKind::StaticNat,
        RuleKind::IngressFirewall,
        RuleKind::PublicLb,
        RuleKind::InternalLb,
        RuleKind::PortForwarding,
        RuleKind::NetworkAcl,
        RuleKind::Vpn,
    ];
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("Failed to apply {kind} rules on network {network_id}: {reason}")]
    Apply {
        network_id: NetworkId,
        kind: RuleKind,
        reason: String,
    },

    #[error("Failed to revoke {kind} rules on network {network_id}: {reason}")]
    Revoke {
        network_id: NetworkId,
        kind: RuleKind,
        reason: String,
    },
}

#[async_trait]
pub trait RulesManager: Send + Sync {
    /// Push every rule of `kind` to the network's providers
    async fn apply(&self, network: &Network, kind: RuleKind) -> Result<bool, RulesError>;

    /// Remove every rule of `kind`
    async fn revoke(
        &self,
        network: &Network,
        kind: RuleKind,
        ctx: &ReservationContext,
    ) -> Result<bool, RulesError>;

    /// Install the offering's default egress policy
    async fn apply_default_egress(
        &self,
        network: &Network,
        allow: bool,
    ) -> Result<bool, RulesError>;
}

/// Used when no rules backend is wired in
pub struct NoopRulesManager;

#[async_trait]
impl RulesManager for NoopRulesManager {
    async fn apply(&self, _network: &Network, _kind: RuleKind) -> Result<bool, RulesError> {
        Ok(true)
    }

    async fn revoke(
        &self,
        _network: &Network,
        _kind: RuleKind,
        _ctx: &ReservationContext,
    ) -> Result<bool, RulesError> {
        Ok(true)
    }

    async fn apply_default_egress(
        &self,
        _network: &Network,
        _allow: bool,
    ) -> Result<bool, RulesError> {
        Ok(true)
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Router {0} not found")]
    NotFound(RouterId),

    #[error("Router operation failed: {0}")]
    Failed(String),
}

/// Virtual routers serving a network
#[async_trait]
pub trait RouterService: Send + Sync {
    async fn list_routers(&self, network_id: NetworkId) -> Result<Vec<Router>, RouterError>;

    async fn destroy_router(
        &self,
        router_id: RouterId,
        ctx: &ReservationContext,
    ) -> Result<bool, RouterError>;
}

/// Deployment without virtual routers
pub struct NoRouters;

#[async_trait]
impl RouterService for NoRouters {
    async fn list_routers(&self, _network_id: NetworkId) -> Result<Vec<Router>, RouterError> {
        Ok(Vec::new())
    }

    async fn destroy_router(
        &self,
        router_id: RouterId,
        _ctx: &ReservationContext,
    ) -> Result<bool, RouterError> {
        Err(RouterError::NotFound(router_id))
    }
}

// ============================================================================
// Mock implementations for testing (no I/O)
// ============================================================================


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_orders_cover_every_kind_once() {
        let apply: HashSet<_> = RuleKind::APPLY_ORDER.iter().collect();
        let revoke: HashSet<_> = RuleKind::REVOKE_ORDER.iter().collect();
        assert_eq!(apply.len(), 8);
        assert_eq!(apply, revoke);
        assert_eq!(RuleKind::APPLY_ORDER[0], RuleKind::EgressFirewall);
        assert_eq!(RuleKind::APPLY_ORDER[1], RuleKind::IngressFirewall);
    }

    #[tokio::test]
    async fn test_no_routers() {
        let routers = NoRouters;
        assert!(routers.list_routers(1).await.unwrap().is_empty());
        assert!(routers
            .destroy_router(5, &ReservationContext::system())
            .await
            .is_err());
    }
}

//! Network element (service provider) contract and optional capabilities

use async_trait::async_trait;
use thiserror::Error;

use super::Adapter;
use crate::model::{
    DeployDestination, Network, NetworkOffering, NicProfile, Provider, ReservationContext,
    VmProfile,
};

#[derive(Error, Debug)]
pub enum ElementError {
    #[error("{0}")]
    Failed(String),

    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("Concurrent operation: {0}")]
    Concurrent(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// A provider's implementation of one or more network services
///
/// Every operation answers `Ok(false)` for "did not apply/failed softly";
/// callers fold those into an aggregate result.
#[async_trait]
pub trait NetworkElement: Adapter {
    fn provider(&self) -> Provider;

    async fn implement(
        &self,
        network: &Network,
        offering: &NetworkOffering,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<bool, ElementError>;

    async fn prepare(
        &self,
        network: &Network,
        nic: &NicProfile,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<bool, ElementError>;

    async fn release(
        &self,
        network: &Network,
        nic: &NicProfile,
        vm: &VmProfile,
        ctx: &ReservationContext,
    ) -> Result<bool, ElementError>;

    async fn shutdown(
        &self,
        network: &Network,
        ctx: &ReservationContext,
        cleanup: bool,
    ) -> Result<bool, ElementError>;

    async fn destroy(
        &self,
        network: &Network,
        ctx: &ReservationContext,
    ) -> Result<bool, ElementError>;

    fn as_aggregated(&self) -> Option<&dyn AggregatedCommandExecutor> {
        None
    }

    fn as_dhcp(&self) -> Option<&dyn DhcpServiceProvider> {
        None
    }

    fn as_dns(&self) -> Option<&dyn DnsServiceProvider> {
        None
    }

    fn as_user_data(&self) -> Option<&dyn UserDataServiceProvider> {
        None
    }
}

/// Batches per-host commands across one implement pass
///
/// `prepare_aggregated` runs before the element loop; on success
/// `complete_aggregated` runs after it. `cleanup_aggregated` always runs.
#[async_trait]
pub trait AggregatedCommandExecutor: Send + Sync {
    async fn prepare_aggregated(
        &self,
        network: &Network,
        dest: &DeployDestination,
    ) -> Result<bool, ElementError>;

    async fn complete_aggregated(
        &self,
        network: &Network,
        dest: &DeployDestination,
    ) -> Result<bool, ElementError>;

    async fn cleanup_aggregated(
        &self,
        network: &Network,
        dest: &DeployDestination,
    ) -> Result<bool, ElementError>;
}

#[async_trait]
pub trait DhcpServiceProvider: Send + Sync {
    async fn add_dhcp_entry(
        &self,
        network: &Network,
        nic: &NicProfile,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<bool, ElementError>;

    async fn remove_dhcp_entry(
        &self,
        network: &Network,
        nic: &NicProfile,
        vm: &VmProfile,
    ) -> Result<bool, ElementError>;

    /// Drop DHCP alias configuration for the NIC's subnet
    async fn remove_dhcp_support_for_subnet(&self, network: &Network)
        -> Result<bool, ElementError>;
}

#[async_trait]
pub trait DnsServiceProvider: Send + Sync {
    async fn add_dns_entry(
        &self,
        network: &Network,
        nic: &NicProfile,
        vm: &VmProfile,
        dest: &DeployDestination,
    ) -> Result<bool, ElementError>;

    async fn remove_dns_support_for_subnet(&self, network: &Network)
        -> Result<bool, ElementError>;
}

#[async_trait]
pub trait UserDataServiceProvider: Send + Sync {
    async fn add_password_and_user_data(
        &self,
        network: &Network,
        nic: &NicProfile,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<bool, ElementError>;
}

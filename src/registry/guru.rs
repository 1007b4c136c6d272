//! Network guru contract

use async_trait::async_trait;
use thiserror::Error;

use super::Adapter;
use crate::model::{
    DeployDestination, DeploymentPlan, Network, NetworkOffering, NicProfile, Owner,
    ReservationContext, VmProfile,
};
use crate::repository::RepositoryError;

/// Outcome of asking a guru to design an offering
#[derive(Debug, Clone)]
pub enum Design {
    /// The guru does not handle this offering
    Skip,
    /// An existing network already satisfies the request
    Reuse(Network),
    /// A new network to persist
    Draft(Network),
}

#[derive(Error, Debug)]
pub enum GuruError {
    #[error("Insufficient address capacity: {0}")]
    InsufficientAddressCapacity(String),

    #[error("Insufficient virtual network capacity: {0}")]
    InsufficientVirtualNetworkCapacity(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Driver for one network technology
///
/// At most one guru owns a network; it is found again through the
/// network's stored `guru_name`.
#[async_trait]
pub trait NetworkGuru: Adapter {
    async fn design(
        &self,
        offering: &NetworkOffering,
        plan: &DeploymentPlan,
        predefined: Option<&Network>,
        owner: &Owner,
    ) -> Result<Design, GuruError>;

    /// Return the implemented network (broadcast URI, CIDR, gateway filled in)
    async fn implement(
        &self,
        network: &Network,
        offering: &NetworkOffering,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<Network, GuruError>;

    /// Turn a requested profile into the profile of a NIC to persist
    async fn allocate(
        &self,
        network: &Network,
        requested: &NicProfile,
        vm: &VmProfile,
    ) -> Result<NicProfile, GuruError>;

    /// Bind a concrete address to a `Start` NIC at boot
    async fn reserve(
        &self,
        profile: &mut NicProfile,
        network: &Network,
        vm: &VmProfile,
        dest: &DeployDestination,
        ctx: &ReservationContext,
    ) -> Result<(), GuruError>;

    /// Undo [`NetworkGuru::reserve`]; `Ok(false)` if the reservation is not ours
    async fn release(
        &self,
        profile: &mut NicProfile,
        vm: &VmProfile,
        reservation_id: &str,
    ) -> Result<bool, GuruError>;

    /// Give back everything `allocate` took
    async fn deallocate(
        &self,
        network: &Network,
        profile: &NicProfile,
        vm: &VmProfile,
    ) -> Result<(), GuruError>;

    /// Refresh a profile from an already-reserved NIC
    async fn update_nic_profile(
        &self,
        profile: &mut NicProfile,
        network: &Network,
    ) -> Result<(), GuruError> {
        profile.network_domain = network.network_domain.clone();
        Ok(())
    }

    async fn shutdown(
        &self,
        network: &mut Network,
        offering: &NetworkOffering,
    ) -> Result<(), GuruError>;

    /// Final cleanup before the network row is removed
    async fn trash(&self, network: &Network, offering: &NetworkOffering)
        -> Result<bool, GuruError>;
}

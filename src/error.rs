//! Orchestrator error taxonomy
//!
//! Every failure maps onto an [`ErrorKind`] so callers can decide between
//! surfacing, retrying and giving up without matching on variants.

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentError;
use crate::lock::LockKey;
use crate::model::{HostId, NetworkId, NicId, Provider, Service};
use crate::registry::{ElementError, GuruError};
use crate::repository::RepositoryError;
use crate::state::{NoTransitionError, StateError};

/// Coarse error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No address, VLAN or other capacity left
    Capacity,
    /// Lock timeout or conflicting transition; the caller may retry
    Concurrency,
    /// Missing provider, unsupported combination or invalid request
    Configuration,
    /// A guru, element or host agent failed
    Provider,
    /// The operation's preconditions do not hold (e.g. VMs still attached)
    Precondition,
    NotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Insufficient address capacity on network {network_id}: {reason}")]
    InsufficientAddressCapacity { network_id: NetworkId, reason: String },

    #[error("Unable to acquire lock {key} within {timeout:?}")]
    LockTimeout { key: LockKey, timeout: Duration },

    #[error(transparent)]
    IllegalTransition(#[from] NoTransitionError),

    #[error("Unable to find a provider for service {service} (offering lists {providers:?})")]
    MissingProvider {
        service: Service,
        providers: Vec<Provider>,
    },

    #[error("Broadcast URI {uri} already in use in zone {zone_id}")]
    VlanOverlap { uri: String, zone_id: u64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Guru {guru} failed on network {network_id}: {source}")]
    Guru {
        network_id: NetworkId,
        guru: String,
        #[source]
        source: GuruError,
    },

    #[error("Element {element} failed on network {network_id}: {source}")]
    Element {
        network_id: NetworkId,
        element: String,
        #[source]
        source: ElementError,
    },

    #[error("Unable to {operation} network {network_id}: {reason}")]
    ResourceUnavailable {
        network_id: NetworkId,
        operation: &'static str,
        reason: String,
    },

    #[error("Network check failed on host {host_id}: {source}")]
    HostCheck {
        host_id: HostId,
        #[source]
        source: AgentError,
    },

    #[error("Network {network_id} is still in use: {reason}")]
    ResourceInUse { network_id: NetworkId, reason: String },

    #[error("Nic {nic_id} is in state {state} and cannot be {operation}")]
    InvalidNicState {
        nic_id: NicId,
        state: String,
        operation: &'static str,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Repository error: {0}")]
    Repository(RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: u64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientAddressCapacity { .. } => ErrorKind::Capacity,
            Self::LockTimeout { .. } | Self::IllegalTransition(_) => ErrorKind::Concurrency,
            Self::MissingProvider { .. }
            | Self::VlanOverlap { .. }
            | Self::InvalidParameter(_)
            | Self::Unsupported(_) => ErrorKind::Configuration,
            Self::Guru { source, .. } => match source {
                GuruError::InsufficientAddressCapacity(_)
                | GuruError::InsufficientVirtualNetworkCapacity(_) => ErrorKind::Capacity,
                GuruError::Unsupported(_) => ErrorKind::Configuration,
                _ => ErrorKind::Provider,
            },
            Self::Element { source, .. } => match source {
                ElementError::InsufficientCapacity(_) => ErrorKind::Capacity,
                ElementError::Concurrent(_) => ErrorKind::Concurrency,
                _ => ErrorKind::Provider,
            },
            Self::ResourceUnavailable { .. } | Self::HostCheck { .. } => ErrorKind::Provider,
            Self::ResourceInUse { .. } | Self::InvalidNicState { .. } => ErrorKind::Precondition,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Repository(RepositoryError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Repository(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only concurrency failures are worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}

impl From<RepositoryError> for OrchestratorError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Repository(other),
        }
    }
}

impl From<StateError> for OrchestratorError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NoTransition(e) => Self::IllegalTransition(e),
            StateError::Persist(_, e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkState;
    use crate::state::NetworkEvent;

    #[test]
    fn test_kinds() {
        let timeout = OrchestratorError::LockTimeout {
            key: LockKey::Network(42),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), ErrorKind::Concurrency);
        assert!(timeout.is_retryable());

        let missing = OrchestratorError::MissingProvider {
            service: Service::Dhcp,
            providers: vec![Provider::new("VR")],
        };
        assert_eq!(missing.kind(), ErrorKind::Configuration);
        assert!(!missing.is_retryable());
        assert!(missing.to_string().contains("Dhcp"));

        let capacity = OrchestratorError::Guru {
            network_id: 7,
            guru: "GuestNetworkGuru".to_string(),
            source: GuruError::InsufficientAddressCapacity("cidr exhausted".to_string()),
        };
        assert_eq!(capacity.kind(), ErrorKind::Capacity);
        assert!(capacity.to_string().contains("network 7"));
    }

    #[test]
    fn test_repository_not_found_maps_to_not_found() {
        let e: OrchestratorError = RepositoryError::NotFound {
            entity: "Network",
            id: 3,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::NotFound);

        let e: OrchestratorError = RepositoryError::Backend("down".to_string()).into();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_state_error_conversion() {
        let e: OrchestratorError = StateError::NoTransition(NoTransitionError {
            from: NetworkState::Setup,
            event: NetworkEvent::ImplementNetwork,
        })
        .into();
        assert!(matches!(e, OrchestratorError::IllegalTransition(_)));
        assert!(e.is_retryable());
    }
}

//! Per-operation correlation and placement context

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountId, ClusterId, HostId, PhysicalNetworkId, PodId, UserId, ZoneId};

/// Account id used for operations started by the orchestrator itself
pub const SYSTEM_ACCOUNT_ID: AccountId = 1;

/// User id used for operations started by the orchestrator itself
pub const SYSTEM_USER_ID: UserId = 1;

/// Correlates one logical operation so gurus and elements can spot retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationContext {
    #[serde(rename = "reservationId")]
    pub reservation_id: String,
    #[serde(rename = "callerAccountId")]
    pub caller_account_id: AccountId,
    #[serde(rename = "callerUserId")]
    pub caller_user_id: UserId,
}

impl ReservationContext {
    pub fn new(caller_account_id: AccountId, caller_user_id: UserId) -> Self {
        Self {
            reservation_id: Uuid::new_v4().to_string(),
            caller_account_id,
            caller_user_id,
        }
    }

    /// Context for background work such as garbage collection
    pub fn system() -> Self {
        Self::new(SYSTEM_ACCOUNT_ID, SYSTEM_USER_ID)
    }

    /// Same caller, reusing an existing reservation id
    pub fn with_reservation_id(mut self, reservation_id: impl Into<String>) -> Self {
        self.reservation_id = reservation_id.into();
        self
    }
}

/// Where a network or VM is being deployed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployDestination {
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    #[serde(rename = "podId", skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<PodId>,
    #[serde(rename = "clusterId", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<ClusterId>,
    #[serde(rename = "hostId", skip_serializing_if = "Option::is_none")]
    pub host_id: Option<HostId>,
}

impl DeployDestination {
    pub fn zone(zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            pod_id: None,
            cluster_id: None,
            host_id: None,
        }
    }

    pub fn with_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }
}

/// Placement hints used while designing networks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    #[serde(rename = "podId", skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<PodId>,
    #[serde(rename = "physicalNetworkId", skip_serializing_if = "Option::is_none")]
    pub physical_network_id: Option<PhysicalNetworkId>,
}

impl DeploymentPlan {
    pub fn zone(zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            pod_id: None,
            physical_network_id: None,
        }
    }

    pub fn with_physical_network(mut self, id: PhysicalNetworkId) -> Self {
        self.physical_network_id = Some(id);
        self
    }
}

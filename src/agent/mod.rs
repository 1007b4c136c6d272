//! Host agent gateway
//!
//! The transport to hypervisor agents lives elsewhere; the orchestrator
//! only needs "send a command to a host, get an answer or a timeout".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{HostId, PhysicalNetwork, PhysicalNetworkId};

/// Traffic labels of one physical network as a host should see them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalNetworkSetup {
    #[serde(rename = "physicalNetworkId")]
    pub physical_network_id: PhysicalNetworkId,
    pub name: String,
    #[serde(rename = "trafficLabel", skip_serializing_if = "Option::is_none")]
    pub traffic_label: Option<String>,
}

impl From<&PhysicalNetwork> for PhysicalNetworkSetup {
    fn from(physical_network: &PhysicalNetwork) -> Self {
        Self {
            physical_network_id: physical_network.id,
            name: physical_network.name.clone(),
            traffic_label: physical_network.traffic_label.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum AgentCommand {
    /// Verify the host is wired to every listed physical network
    CheckNetwork { networks: Vec<PhysicalNetworkSetup> },
}

impl AgentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::CheckNetwork { .. } => "CheckNetwork",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAnswer {
    pub result: bool,
    #[serde(default)]
    pub details: String,
}

impl AgentAnswer {
    pub fn ok() -> Self {
        Self {
            result: true,
            details: String::new(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: details.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("No answer from host {host_id} within {timeout:?}")]
    Timeout { host_id: HostId, timeout: Duration },

    #[error("Host {0} is unreachable: {1}")]
    Unreachable(HostId, String),

    #[error("Command rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn send(&self, host_id: HostId, command: AgentCommand)
        -> Result<AgentAnswer, AgentError>;
}

/// Bounds every send with a timeout
///
/// The command runs on its own task, so a timed-out command keeps going on
/// the host side; only the caller stops waiting.
#[derive(Clone)]
pub struct TimedAgentGateway {
    inner: Arc<dyn AgentGateway>,
    timeout: Duration,
}

impl TimedAgentGateway {
    pub fn new(inner: Arc<dyn AgentGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl AgentGateway for TimedAgentGateway {
    async fn send(
        &self,
        host_id: HostId,
        command: AgentCommand,
    ) -> Result<AgentAnswer, AgentError> {
        let inner = self.inner.clone();
        let name = command.name();
        debug!("Sending {} to host {}", name, host_id);

        let handle = tokio::spawn(async move { inner.send(host_id, command).await });
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => Err(AgentError::Unreachable(host_id, e.to_string())),
            Err(_) => {
                warn!(
                    "{} to host {} timed out after {:?}",
                    name, host_id, self.timeout
                );
                Err(AgentError::Timeout {
                    host_id,
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// Gateway used when no agent transport is configured
pub struct DisconnectedAgentGateway;

#[async_trait]
impl AgentGateway for DisconnectedAgentGateway {
    async fn send(
        &self,
        host_id: HostId,
        _command: AgentCommand,
    ) -> Result<AgentAnswer, AgentError> {
        Err(AgentError::Unreachable(
            host_id,
            "no agent transport configured".to_string(),
        ))
    }
}

// ============================================================================
// Mock implementations for testing (no I/O)
// ============================================================================

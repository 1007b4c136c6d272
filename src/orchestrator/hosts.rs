//! Host network verification on agent connect

use tracing::{info, warn};

use super::NetworkOrchestrator;
use crate::agent::{AgentCommand, AgentError, AgentGateway, PhysicalNetworkSetup};
use crate::error::{OrchestratorError, Result};
use crate::model::{HostId, ZoneId};

impl NetworkOrchestrator {
    /// Ask a freshly connected host to confirm it can reach every physical
    /// network of its zone
    pub async fn check_host_networks(&self, host_id: HostId, zone_id: ZoneId) -> Result<()> {
        let networks: Vec<PhysicalNetworkSetup> = self
            .repos
            .zones
            .list_physical_networks(zone_id)
            .await?
            .iter()
            .map(PhysicalNetworkSetup::from)
            .collect();
        let count = networks.len();

        let answer = self
            .agent
            .send(host_id, AgentCommand::CheckNetwork { networks })
            .await
            .map_err(|source| {
                warn!("Network check on host {} failed: {}", host_id, source);
                OrchestratorError::HostCheck { host_id, source }
            })?;

        if !answer.result {
            warn!("Host {} rejected network check: {}", host_id, answer.details);
            return Err(OrchestratorError::HostCheck {
                host_id,
                source: AgentError::Rejected(answer.details),
            });
        }

        info!("Host {} reaches all {} physical networks of zone {}", host_id, count, zone_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::agent::mock::MockAgentGateway;
    use crate::agent::AgentAnswer;
    use crate::config::OrchestratorConfig;
    use crate::error::{ErrorKind, OrchestratorError};
    use crate::orchestrator::testkit::*;
    use crate::registry::mock::MockGuru;
    use crate::agent::AgentError;

    #[tokio::test]
    async fn test_host_check_passes() {
        let mut h = harness();
        let agent = Arc::new(MockAgentGateway::new(AgentAnswer::ok()));
        h.orchestrator = h.orchestrator.with_agent(agent.clone());

        h.orchestrator.check_host_networks(5, ZONE).await.unwrap();
        assert_eq!(agent.call_count(), 1);
    }

    #[tokio::test]
    async fn test_host_check_rejected() {
        let mut h = harness();
        let agent = Arc::new(MockAgentGateway::new(AgentAnswer::failed("cloudbr1 missing")));
        h.orchestrator = h.orchestrator.with_agent(agent);

        let err = h.orchestrator.check_host_networks(5, ZONE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        match err {
            OrchestratorError::HostCheck { host_id, source } => {
                assert_eq!(host_id, 5);
                assert_eq!(source, AgentError::Rejected("cloudbr1 missing".to_string()));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_check_times_out() {
        let mut config = OrchestratorConfig::default();
        config.agent_timeout_secs = 1;
        let mut h = harness_with(config, MockGuru::new("MockGuru"));
        let agent = Arc::new(
            MockAgentGateway::new(AgentAnswer::ok()).with_delay(Duration::from_secs(10)),
        );
        h.orchestrator = h.orchestrator.with_agent(agent);

        let err = h.orchestrator.check_host_networks(5, ZONE).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::HostCheck {
                source: AgentError::Timeout { host_id: 5, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_host_check_without_transport() {
        let h = harness();
        let err = h.orchestrator.check_host_networks(5, ZONE).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::HostCheck {
                source: AgentError::Unreachable(5, _),
                ..
            }
        ));
    }
}

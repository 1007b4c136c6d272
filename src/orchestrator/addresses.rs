//! Public address claims under the IP row lock

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info};

use super::NetworkOrchestrator;
use crate::error::{OrchestratorError, Result};
use crate::events::{publish_or_log, EventType, UsageEvent};
use crate::lock::{LockKey, RowLockGuard};
use crate::model::{IpAddress, IpAddressId, IpState, Network, ResourceType};

/// Wait for a free-pool address that another caller is inspecting
const FREE_POOL_LOCK_WAIT: Duration = Duration::from_millis(50);

impl NetworkOrchestrator {
    /// Take the first free zone address as the network's source NAT IP
    ///
    /// Addresses locked by a concurrent claim are skipped rather than waited on.
    pub async fn assign_source_nat_ip(&self, network: &Network) -> Result<IpAddress> {
        let candidates = self.repos.ips.list_free(network.zone_id).await?;
        for candidate in candidates
            .iter()
            .filter(|ip| ip.dedicated_network_id.map_or(true, |d| d == network.id))
        {
            if let Some(ip) = self
                .claim_ip(candidate.id, network, true, FREE_POOL_LOCK_WAIT)
                .await?
            {
                info!("Assigned source NAT {} to {}", ip.address, network);
                return Ok(ip);
            }
            debug!("Address {} was taken concurrently, trying the next", candidate.address);
        }
        Err(OrchestratorError::InsufficientAddressCapacity {
            network_id: network.id,
            reason: format!("no free public address left in zone {}", network.zone_id),
        })
    }

    /// Claim one specific public address for `network`
    pub async fn claim_requested_ip(
        &self,
        network: &Network,
        address: Ipv4Addr,
    ) -> Result<IpAddress> {
        let ip = self
            .repos
            .ips
            .find_by_address(network.zone_id, address)
            .await?
            .ok_or_else(|| {
                OrchestratorError::InvalidParameter(format!(
                    "{} is not a public address of zone {}",
                    address, network.zone_id
                ))
            })?;

        let timeout = self.config.lock_timeout();
        match self.claim_ip(ip.id, network, false, timeout).await {
            Ok(Some(ip)) => Ok(ip),
            Ok(None) => Err(OrchestratorError::InsufficientAddressCapacity {
                network_id: network.id,
                reason: format!("{} is already allocated", address),
            }),
            Err(e) => Err(e),
        }
    }

    /// Return the network's source NAT address to the free pool
    ///
    /// `Ok(None)` when the network holds none.
    pub async fn release_source_nat_ip(&self, network: &Network) -> Result<Option<IpAddress>> {
        let Some(ip) = self.repos.ips.find_source_nat(network.id).await? else {
            return Ok(None);
        };
        let key = LockKey::IpAddress(ip.id);
        let timeout = self.config.lock_timeout();
        let Some(_guard) = RowLockGuard::acquire(self.repos.locks.clone(), key.clone(), timeout).await?
        else {
            return Err(OrchestratorError::LockTimeout { key, timeout });
        };

        let Some(mut ip) = self.repos.ips.find(ip.id).await? else {
            return Ok(None);
        };
        if ip.network_id != Some(network.id) || !ip.source_nat {
            return Ok(None);
        }
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
            )
            .with_detail(format!("network {}", network.id)),
        );
        info!("Released source NAT {} of {}", ip.address, network);
        Ok(Some(ip))
    }

    /// Lock, re-check and mark one address; `Ok(None)` when it is no longer free
    ///
    /// Lock timeouts surface as [`OrchestratorError::LockTimeout`] unless the
    /// caller is scanning the free pool, in which case they read as "taken".
    async fn claim_ip(
        &self,
        ip_id: IpAddressId,
        network: &Network,
        source_nat: bool,
        wait: Duration,
    ) -> Result<Option<IpAddress>> {
        let key = LockKey::IpAddress(ip_id);
        let Some(_guard) = RowLockGuard::acquire(self.repos.locks.clone(), key.clone(), wait).await?
        else {
            if source_nat {
                return Ok(None);
            }
            return Err(OrchestratorError::LockTimeout { key, timeout: wait });
        };

        let Some(mut ip) = self.repos.ips.find(ip_id).await? else {
            return Ok(None);
        };
        if !ip.is_free() {
            return Ok(None);
        }

        ip.state = IpState::Allocated;
        ip.network_id = Some(network.id);
        ip.account_id = Some(network.owner.account_id);
        ip.source_nat = source_nat;
        self.repos.ips.update(&ip).await?;
        self.repos
            .accounts
            .adjust_resource_count(network.owner.account_id, ResourceType::PublicIp, 1)
            .await?;

        publish_or_log(
            self.events.as_ref(),
            UsageEvent::new(
                EventType::IpAssign,
                network.owner.account_id,
                network.zone_id,
                ip.id,
                ip.address.to_string(),
            )
            .with_detail(format!("network {}", network.id)),
        );
        Ok(Some(ip))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::orchestrator::testkit::*;
    use crate::repository::AccountRepository;

    #[tokio::test]
    async fn test_source_nat_takes_lowest_free_address() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;

        let ip = h.orchestrator.assign_source_nat_ip(&network).await.unwrap();

        assert_eq!(ip.address, Ipv4Addr::new(203, 0, 113, 10));
        assert!(ip.source_nat);
        assert_eq!(ip.network_id, Some(network.id));
        assert_eq!(
            h.store
                .resource_count(ACCOUNT, ResourceType::PublicIp)
                .await
                .unwrap(),
            1
        );
        assert_eq!(h.events.count(EventType::IpAssign), 1);
    }

    #[tokio::test]
    async fn test_source_nat_skips_locked_address() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let locks = h.store.locks();
        let _held = RowLockGuard::acquire(locks, LockKey::IpAddress(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        let ip = h.orchestrator.assign_source_nat_ip(&network).await.unwrap();
        assert_eq!(ip.id, 2);
    }

    #[tokio::test]
    async fn test_source_nat_exhaustion() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        for _ in 0..4 {
            h.orchestrator.assign_source_nat_ip(&network).await.unwrap();
        }

        let err = h
            .orchestrator
            .assign_source_nat_ip(&network)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }

    #[tokio::test]
    async fn test_release_source_nat_returns_address_to_pool() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let claimed = h.orchestrator.assign_source_nat_ip(&network).await.unwrap();

        let released = h
            .orchestrator
            .release_source_nat_ip(&network)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(released.id, claimed.id);
        assert!(released.is_free());
        assert_eq!(
            h.store
                .resource_count(ACCOUNT, ResourceType::PublicIp)
                .await
                .unwrap(),
            0
        );
        assert_eq!(h.events.count(EventType::IpRelease), 1);
        assert!(h.orchestrator.release_source_nat_ip(&network).await.unwrap().is_none());
        assert_eq!(h.store.locks().held_count(&LockKey::IpAddress(claimed.id)), 0);

        let again = h.orchestrator.assign_source_nat_ip(&network).await.unwrap();
        assert_eq!(again.id, claimed.id);
    }

    #[tokio::test]
    async fn test_claim_requested_ip_once() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let address = Ipv4Addr::new(203, 0, 113, 12);

        let ip = h
            .orchestrator
            .claim_requested_ip(&network, address)
            .await
            .unwrap();
        assert_eq!(ip.id, 3);
        assert!(!ip.source_nat);

        let err = h
            .orchestrator
            .claim_requested_ip(&network, address)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(
            h.store.locks().held_count(&LockKey::IpAddress(3)),
            0
        );
    }

    #[tokio::test]
    async fn test_claim_unknown_address() {
        let h = harness();
        let network = h.network(ISOLATED_OFFERING).await;
        let err = h
            .orchestrator
            .claim_requested_ip(&network, Ipv4Addr::new(198, 51, 100, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_distinct_addresses() {
        let h = Arc::new(harness());
        let network = h.network(ISOLATED_OFFERING).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let h = h.clone();
            let network = network.clone();
            handles.push(tokio::spawn(async move {
                h.orchestrator.assign_source_nat_ip(&network).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}

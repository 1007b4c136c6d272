//! Usage and audit events
//!
//! Publishing is fire-and-forget: the core logs a failed publish and moves on.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{AccountId, Network, ZoneId};

/// Event categories emitted by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NetworkCreate,
    NetworkDelete,
    NetworkStateChanged,
    NetworkRestart,
    NicCreate,
    NicDelete,
    IpAssign,
    IpRelease,
}

/// A usage/audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "accountId")]
    pub account_id: AccountId,
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    #[serde(rename = "resourceId")]
    pub resource_id: u64,
    #[serde(rename = "resourceName")]
    pub resource_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        event_type: EventType,
        account_id: AccountId,
        zone_id: ZoneId,
        resource_id: u64,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            account_id,
            zone_id,
            resource_id,
            resource_name: resource_name.into(),
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Event about a network, attributed to its owner
    pub fn for_network(event_type: EventType, network: &Network) -> Self {
        Self::new(
            event_type,
            network.owner.account_id,
            network.zone_id,
            network.id,
            network.name.clone(),
        )
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event bus unavailable: {0}")]
    Unavailable(String),
}

/// Sink for usage/audit events
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: UsageEvent) -> Result<(), EventError>;
}

/// Publish and swallow failures after logging them
pub fn publish_or_log(publisher: &dyn EventPublisher, event: UsageEvent) {
    let event_type = event.event_type;
    let resource_id = event.resource_id;
    if let Err(e) = publisher.publish(event) {
        warn!(
            "Failed to publish {:?} event for resource {}: {}",
            event_type, resource_id, e
        );
    }
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: UsageEvent) -> Result<(), EventError> {
        info!(
            target: "netorch::events",
            "{:?} account={} zone={} resource={} ({}){}",
            event.event_type,
            event.account_id,
            event.zone_id,
            event.resource_id,
            event.resource_name,
            event.detail.map(|d| format!(": {}", d)).unwrap_or_default()
        );
        Ok(())
    }
}

/// Keeps events in memory, for inspection
#[derive(Debug, Default)]
pub struct CollectingEventPublisher {
    events: Mutex<Vec<UsageEvent>>,
}

impl CollectingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventPublisher for CollectingEventPublisher {
    fn publish(&self, event: UsageEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .map_err(|e| EventError::Unavailable(e.to_string()))?
            .push(event);
        Ok(())
    }
}

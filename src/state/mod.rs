//! Network lifecycle state machine
//!
//! `transition` is the pure table; [`NetworkStateMachine`] applies it to a
//! network, persists the new state and then notifies listeners.
//!
//! ```text
//! Allocated   --ImplementNetwork-->   Implementing
//! Implementing --OperationSucceeded--> Implemented
//! Implementing --OperationFailed-->   Allocated
//! Implemented --DestroyNetwork-->     Shutdown
//! Implemented --OperationFailed-->    Implemented
//! Shutdown    --OperationSucceeded--> Allocated
//! Shutdown    --OperationFailed-->    Shutdown
//! Allocated   --DestroyNetwork-->     Destroy
//! Setup       --DestroyNetwork-->     Destroy
//! Destroy     --OperationFailed-->    Allocated
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::events::{publish_or_log, EventPublisher, EventType, UsageEvent};
use crate::model::{Network, NetworkState};
use crate::repository::{NetworkRepository, RepositoryError};

/// Events driving the network lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkEvent {
    ImplementNetwork,
    OperationSucceeded,
    OperationFailed,
    DestroyNetwork,
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An event that has no transition from the current state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No transition from state {from} on event {event}")]
pub struct NoTransitionError {
    pub from: NetworkState,
    pub event: NetworkEvent,
}

/// A transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: NetworkState,
    pub event: NetworkEvent,
    pub to: NetworkState,
}

/// Pure transition table
pub fn transition(
    from: NetworkState,
    event: NetworkEvent,
) -> Result<NetworkState, NoTransitionError> {
    use NetworkEvent as E;
    use NetworkState as S;

    let to = match (from, event) {
        (S::Allocated, E::ImplementNetwork) => S::Implementing,
        (S::Implementing, E::OperationSucceeded) => S::Implemented,
        (S::Implementing, E::OperationFailed) => S::Allocated,
        (S::Implemented, E::DestroyNetwork) => S::Shutdown,
        (S::Implemented, E::OperationFailed) => S::Implemented,
        (S::Shutdown, E::OperationSucceeded) => S::Allocated,
        (S::Shutdown, E::OperationFailed) => S::Shutdown,
        (S::Allocated, E::DestroyNetwork) => S::Destroy,
        (S::Setup, E::DestroyNetwork) => S::Destroy,
        (S::Destroy, E::OperationFailed) => S::Allocated,
        _ => return Err(NoTransitionError { from, event }),
    };
    Ok(to)
}

/// Errors applying a transition
#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    NoTransition(#[from] NoTransitionError),

    #[error("Failed to persist state of network {0}: {1}")]
    Persist(u64, RepositoryError),
}

/// Callback run after a transition is durably persisted
pub trait NetworkStateListener: Send + Sync {
    fn post_state_transition(&self, transition: &StateTransition, network: &Network);
}

/// Applies transitions and fans them out to listeners
#[derive(Clone, Default)]
pub struct NetworkStateMachine {
    listeners: Vec<Arc<dyn NetworkStateListener>>,
}

impl NetworkStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a post-transition listener
    pub fn with_listener(mut self, listener: Arc<dyn NetworkStateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Move `network` along `event`, persist it, then notify listeners
    ///
    /// On a persistence failure the in-memory network keeps its old state.
    pub async fn transit(
        &self,
        networks: &dyn NetworkRepository,
        network: &mut Network,
        event: NetworkEvent,
    ) -> Result<StateTransition, StateError> {
        let from = network.state;
        let to = transition(from, event)?;

        network.state = to;
        if let Err(e) = networks.update(network).await {
            network.state = from;
            return Err(StateError::Persist(network.id, e));
        }

        let applied = StateTransition { from, event, to };
        debug!(
            "Network {} transitioned {} --{}--> {}",
            network.id, from, event, to
        );
        for listener in &self.listeners {
            listener.post_state_transition(&applied, network);
        }
        Ok(applied)
    }
}

/// Publishes every transition as an audit event
pub struct AuditStateListener {
    events: Arc<dyn EventPublisher>,
}

impl AuditStateListener {
    pub fn new(events: Arc<dyn EventPublisher>) -> Self {
        Self { events }
    }
}

impl NetworkStateListener for AuditStateListener {
    fn post_state_transition(&self, transition: &StateTransition, network: &Network) {
        let event = UsageEvent::for_network(EventType::NetworkStateChanged, network).with_detail(
            format!(
                "{} --{}--> {}",
                transition.from, transition.event, transition.to
            ),
        );
        publish_or_log(self.events.as_ref(), event);
    }
}

//! netorch - network lifecycle orchestrator
//!
//! Turns offering-based network requests into implemented multi-provider
//! guest networks, keeps VM NICs consistent with the network lifecycle and
//! reclaims idle networks in the background.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod gc;
pub mod guru;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod repository;
pub mod rules;
pub mod state;

pub use error::{ErrorKind, OrchestratorError, Result};
pub use orchestrator::{NetworkOrchestrator, NetworkRequest};

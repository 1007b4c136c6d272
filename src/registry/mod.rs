//! Pluggable network gurus and service elements
//!
//! Gurus own a network technology's design/implement/reserve lifecycle;
//! elements provide services (DHCP, DNS, firewall, ...) on behalf of a
//! named provider. Both are looked up by name in an [`AdapterRegistry`]
//! populated at process start, first match wins.

pub mod element;
pub mod guru;

use std::sync::Arc;

pub use element::{
    AggregatedCommandExecutor, DhcpServiceProvider, DnsServiceProvider, ElementError,
    NetworkElement, UserDataServiceProvider,
};
pub use guru::{Design, GuruError, NetworkGuru};

use crate::model::{Network, Provider};

/// Anything registered by name
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
}

/// Ordered list of adapters, dispatched first-match-by-name
pub struct AdapterRegistry<T: ?Sized> {
    adapters: Vec<Arc<T>>,
}

impl<T: ?Sized> Default for AdapterRegistry<T> {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }
}

impl<T: ?Sized> Clone for AdapterRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            adapters: self.adapters.clone(),
        }
    }
}

impl<T: Adapter + ?Sized> AdapterRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an adapter; registration order is dispatch order
    pub fn register(&mut self, adapter: Arc<T>) {
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: Arc<T>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<T>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.adapters.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

pub type GuruRegistry = AdapterRegistry<dyn NetworkGuru>;
pub type ElementRegistry = AdapterRegistry<dyn NetworkElement>;

impl AdapterRegistry<dyn NetworkElement> {
    /// First element registered for `provider`
    pub fn get_by_provider(&self, provider: &Provider) -> Option<Arc<dyn NetworkElement>> {
        self.adapters
            .iter()
            .find(|e| &e.provider() == provider)
            .cloned()
    }

    /// Elements serving any provider bound to `network`, in registration order
    pub fn for_network(&self, network: &Network) -> Vec<Arc<dyn NetworkElement>> {
        let providers = network.providers();
        self.adapters
            .iter()
            .filter(|e| providers.contains(&e.provider()))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Mock implementations for testing (no I/O)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mock::{MockElement, MockGuru};
    use super::*;
    use crate::model::{GuestType, NetworkOffering, Owner, Service};

    #[test]
    fn test_first_match_by_name() {
        let registry = GuruRegistry::new()
            .with(Arc::new(MockGuru::new("Guest").with_vlan(1)))
            .with(Arc::new(MockGuru::new("Guest").with_vlan(2)))
            .with(Arc::new(MockGuru::new("Public")));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["Guest", "Guest", "Public"]);
        assert!(registry.get_by_name("Public").is_some());
        assert!(registry.get_by_name("Missing").is_none());
    }

    #[test]
    fn test_elements_for_network_follow_registration_order() {
        let registry = ElementRegistry::new()
            .with(Arc::new(MockElement::new("dhcp-a", "VirtualRouter")))
            .with(Arc::new(MockElement::new("lb", "Netscaler")))
            .with(Arc::new(MockElement::new("dhcp-b", "VirtualRouter")));

        let offering = NetworkOffering::new(1, "iso", GuestType::Isolated);
        let mut network = Network::draft(&offering, 1, Owner { account_id: 2, domain_id: 1 });
        network
            .service_providers
            .insert(Service::Dhcp, Provider::virtual_router());

        let names: Vec<String> = registry
            .for_network(&network)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["dhcp-a", "dhcp-b"]);
        assert_eq!(
            registry
                .get_by_provider(&Provider::new("Netscaler"))
                .map(|e| e.name().to_string()),
            Some("lb".to_string())
        );
    }
}

//! Static inventory seeded into the in-memory store at daemon start

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{expand_path, read_document, ConfigError};
use crate::model::{
    Account, Domain, IpAddress, NetworkOffering, PhysicalNetwork, VirtualMachine, Zone, ZoneId,
};
use crate::repository::InMemoryStore;

/// Inclusive range of public addresses in a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    #[serde(rename = "zoneId")]
    pub zone_id: ZoneId,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpRange {
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub zones: Vec<Zone>,
    #[serde(rename = "physicalNetworks")]
    pub physical_networks: Vec<PhysicalNetwork>,
    pub offerings: Vec<NetworkOffering>,
    #[serde(rename = "ipRanges")]
    pub ip_ranges: Vec<IpRange>,
    pub domains: Vec<Domain>,
    pub accounts: Vec<Account>,
    pub vms: Vec<VirtualMachine>,
}

impl Inventory {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = expand_path(path)?;
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let inventory: Inventory = read_document(Path::new(&path))?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Cross-references between entries must resolve
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zone_exists = |id: ZoneId| self.zones.iter().any(|z| z.id == id);

        for physical_network in &self.physical_networks {
            if !zone_exists(physical_network.zone_id) {
                return Err(ConfigError::Invalid(format!(
                    "physical network {} references unknown zone {}",
                    physical_network.id, physical_network.zone_id
                )));
            }
            if let Some((start, end)) = physical_network.vnet_range {
                if start > end {
                    return Err(ConfigError::Invalid(format!(
                        "physical network {} has an empty vnet range {}-{}",
                        physical_network.id, start, end
                    )));
                }
            }
        }

        for range in &self.ip_ranges {
            if !zone_exists(range.zone_id) {
                return Err(ConfigError::Invalid(format!(
                    "ip range {}-{} references unknown zone {}",
                    range.start, range.end, range.zone_id
                )));
            }
            if range.start > range.end {
                return Err(ConfigError::Invalid(format!(
                    "ip range {}-{} is reversed",
                    range.start, range.end
                )));
            }
        }

        for account in &self.accounts {
            if !self.domains.iter().any(|d| d.id == account.domain_id) {
                return Err(ConfigError::Invalid(format!(
                    "account {} references unknown domain {}",
                    account.id, account.domain_id
                )));
            }
        }
        Ok(())
    }

    /// Load every entry into `store`; returns the number of public addresses
    pub fn seed(&self, store: &InMemoryStore) -> usize {
        for zone in &self.zones {
            store.insert_zone(zone.clone());
        }
        for physical_network in &self.physical_networks {
            store.insert_physical_network(physical_network.clone());
        }
        for offering in &self.offerings {
            store.insert_offering(offering.clone());
        }
        for domain in &self.domains {
            store.insert_domain(domain.clone());
        }
        for account in &self.accounts {
            store.insert_account(account.clone());
        }
        for vm in &self.vms {
            store.insert_vm(vm.clone());
        }

        let mut next_id = 1;
        for range in &self.ip_ranges {
            for address in range.addresses() {
                store.insert_ip(IpAddress::new(next_id, range.zone_id, address));
                next_id += 1;
            }
        }
        let addresses = (next_id - 1) as usize;

        info!(
            "Seeded {} zones, {} physical networks, {} offerings, {} public addresses",
            self.zones.len(),
            self.physical_networks.len(),
            self.offerings.len(),
            addresses
        );
        addresses
    }
}

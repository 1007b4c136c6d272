use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{Inventory, OrchestratorConfig};

#[derive(Parser, Debug)]
#[command(name = "netorch")]
#[command(about = "Network lifecycle orchestrator daemon")]
#[command(version)]
pub struct Args {
    /// Path to the orchestrator config (default: ~/.netorch/config.yaml)
    #[arg(short, long, value_name = "FILE", env = "NETORCH_CONFIG")]
    pub config: Option<String>,

    /// Zones, physical networks, offerings and address ranges to seed
    #[arg(short, long, value_name = "FILE", env = "NETORCH_INVENTORY")]
    pub inventory: Option<String>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Validate config and inventory, print a summary and exit
    #[arg(long)]
    pub dry_run: bool,
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Summary of what the daemon would run with
pub fn format_dry_run(config: &OrchestratorConfig, inventory: &Inventory) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "netorch v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));

    output.push_str("Orchestrator:\n");
    output.push_str(&format!("  GC interval:      {}s\n", config.gc_interval_secs));
    output.push_str(&format!("  GC free wait:     {}s\n", config.gc_wait_secs));
    output.push_str(&format!("  Lock timeout:     {}s\n", config.lock_timeout_secs));
    output.push_str(&format!(
        "  Rolling restart:  {}\n",
        if config.rolling_restart { "enabled" } else { "disabled" }
    ));
    output.push_str(&format!("  VRRP delay:       {}ms\n", config.vrrp_handover_delay_ms));
    output.push_str(&format!("  Guest suffix:     {}\n", config.guest_domain_suffix));
    output.push('\n');

    output.push_str(&format!("Zones ({}):\n", inventory.zones.len()));
    for zone in &inventory.zones {
        output.push_str(&format!(
            "  - {} [{:?}] domain: {}\n",
            zone.name,
            zone.network_type,
            zone.domain.as_deref().unwrap_or("-")
        ));
        for physical_network in inventory
            .physical_networks
            .iter()
            .filter(|p| p.zone_id == zone.id)
        {
            let vnets = match physical_network.vnet_range {
                Some((start, end)) => format!("{}-{}", start, end),
                None => "none".to_string(),
            };
            output.push_str(&format!(
                "      {} vnets: {}\n",
                physical_network.name, vnets
            ));
        }
        let addresses: usize = inventory
            .ip_ranges
            .iter()
            .filter(|r| r.zone_id == zone.id)
            .map(|r| r.addresses().count())
            .sum();
        output.push_str(&format!("      public addresses: {}\n", addresses));
    }
    output.push('\n');

    output.push_str(&format!("Offerings ({}):\n", inventory.offerings.len()));
    for offering in &inventory.offerings {
        let services: Vec<String> = offering
            .services
            .iter()
            .map(|(service, providers)| {
                let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
                format!("{}={}", service, names.join("|"))
            })
            .collect();
        output.push_str(&format!(
            "  - {} [{:?}{}] {}\n",
            offering.name,
            offering.guest_type,
            if offering.persistent { ", persistent" } else { "" },
            services.join(" ")
        ));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to start. Remove --dry-run to run the daemon.\n");

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_dry_run_basic() {
        let yaml = r#"
zones:
  - id: 1
    name: zone-1
    domain: z1.example
physicalNetworks:
  - id: 10
    zoneId: 1
    name: guest-phys
    vnetRange: [100, 199]
offerings:
  - id: 5
    name: isolated-vr
    guestType: Isolated
    services:
      Dhcp: [VirtualRouter]
ipRanges:
  - zoneId: 1
    start: 203.0.113.10
    end: 203.0.113.13
"#;
        let inventory: Inventory = serde_yaml::from_str(yaml).unwrap();
        let output = format_dry_run(&OrchestratorConfig::default(), &inventory);

        assert!(output.contains("Zones (1):"));
        assert!(output.contains("guest-phys vnets: 100-199"));
        assert!(output.contains("public addresses: 4"));
        assert!(output.contains("isolated-vr [Isolated] Dhcp=VirtualRouter"));
        assert!(output.contains("Validation: PASSED"));
    }

    #[test]
    fn test_clap_parsing() {
        let args = Args::parse_from(["netorch", "-vv", "--inventory", "inv.yaml", "--dry-run"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.inventory.as_deref(), Some("inv.yaml"));
        assert!(args.dry_run);
        assert!(args.env_file.is_none());
    }
}

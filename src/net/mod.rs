//! Network addressing resolution.
//!
//! Computes per-address netmask/gateway/routes for a guest from the external
//! range inventory, resolves configured load balancers, and falls back to
//! interactive manual entry when automatic resolution fails.

mod manual;
mod resolver;

pub use manual::{InquirePrompt, NetworkPrompt, StrictPrompt};

use crate::errors::{VmforgeError, VmforgeResult};
use crate::inventory::{Inventory, ServerRecord};
use std::net::Ipv4Addr;

/// Addressing for a single guest address. Every resolved address carries a
/// netmask; the gateway is set on at most one address per build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

/// A static route written into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Complete per-build network configuration, owned by the build config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Primary address first, additional addresses in their given order.
    pub addresses: Vec<AddressEntry>,
    pub routes: Vec<Route>,
    pub loadbalancers: Vec<Ipv4Addr>,
    pub vlan_tag: Option<u16>,
}

impl NetworkConfig {
    /// The guest's primary address entry.
    pub fn primary(&self) -> &AddressEntry {
        &self.addresses[0]
    }

    /// The single gateway assigned to this build, if any address carries one.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().find_map(|entry| entry.gateway)
    }
}

/// Resolve the full network configuration for a guest.
///
/// Load-balancer lookup failures are non-fatal but require operator
/// confirmation to proceed. Any `Network` error during automatic resolution
/// enters the interactive fallback; declining it aborts the build.
pub fn resolve_network(
    server: &ServerRecord,
    inventory: &dyn Inventory,
    prompt: &dyn NetworkPrompt,
) -> VmforgeResult<NetworkConfig> {
    let loadbalancers = resolve_loadbalancers(server, inventory, prompt)?;

    match resolver::configure_addresses(server.intern_ip, &server.additional_ips, inventory) {
        Ok((addresses, routes)) => Ok(NetworkConfig {
            addresses,
            routes,
            loadbalancers,
            vlan_tag: None,
        }),
        Err(VmforgeError::Network(reason)) => {
            tracing::warn!(
                host = %server.hostname,
                reason = %reason,
                "Could not configure network automatically; check the range inventory for this segment"
            );
            let (addresses, routes) =
                manual::manual_configuration(server.intern_ip, &server.additional_ips, prompt)?;
            Ok(NetworkConfig {
                addresses,
                routes,
                loadbalancers,
                vlan_tag: None,
            })
        }
        Err(other) => Err(other),
    }
}

fn resolve_loadbalancers(
    server: &ServerRecord,
    inventory: &dyn Inventory,
    prompt: &dyn NetworkPrompt,
) -> VmforgeResult<Vec<Ipv4Addr>> {
    let mut resolved = Vec::new();
    let mut failed = false;

    for lb_host in &server.loadbalancers {
        match inventory.find_server(lb_host, "loadbalancer") {
            Ok(lb) => resolved.push(lb.intern_ip),
            Err(err) => {
                tracing::warn!(loadbalancer = %lb_host, %err, "Could not configure load balancer");
                failed = true;
            }
        }
    }

    if failed && !prompt.confirm("Could not configure all load balancers. Continue?")? {
        return Err(VmforgeError::Aborted("aborting on request".into()));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::manual::tests::ScriptedPrompt;
    use super::*;
    use crate::inventory::{IpRange, JsonInventory, ServerState};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn vm_record(primary: Ipv4Addr, additional: Vec<Ipv4Addr>) -> ServerRecord {
        ServerRecord {
            hostname: "vm01.test".into(),
            intern_ip: primary,
            additional_ips: additional,
            servertype: "vm".into(),
            state: ServerState::Online,
            hypervisor: None,
            os: None,
            hypervisor_host: None,
            segment: None,
            loadbalancers: Vec::new(),
            disk_size_gib: None,
            memory_mib: None,
            num_cpu: None,
        }
    }

    fn lb_record(hostname: &str, ip: Ipv4Addr) -> ServerRecord {
        ServerRecord {
            hostname: hostname.into(),
            intern_ip: ip,
            additional_ips: Vec::new(),
            servertype: "loadbalancer".into(),
            state: ServerState::Online,
            hypervisor: None,
            os: None,
            hypervisor_host: None,
            segment: None,
            loadbalancers: Vec::new(),
            disk_size_gib: None,
            memory_mib: None,
            num_cpu: None,
        }
    }

    #[test]
    fn zero_ranges_enters_manual_fallback() {
        let primary = Ipv4Addr::new(192, 0, 2, 10);
        let inventory = JsonInventory::from_parts(Vec::new(), HashMap::new(), HashMap::new());
        let prompt = ScriptedPrompt::accepting(
            vec![(primary, Ipv4Addr::new(255, 255, 255, 0), None)],
            Vec::new(),
        );

        let config = resolve_network(&vm_record(primary, Vec::new()), &inventory, &prompt).unwrap();
        assert!(prompt.fallback_confirmed());
        assert_eq!(config.addresses.len(), 1);
        assert_eq!(config.addresses[0].netmask, Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn declining_manual_fallback_aborts_the_build() {
        let primary = Ipv4Addr::new(192, 0, 2, 10);
        let inventory = JsonInventory::from_parts(Vec::new(), HashMap::new(), HashMap::new());
        let prompt = ScriptedPrompt::declining();

        let err =
            resolve_network(&vm_record(primary, Vec::new()), &inventory, &prompt).unwrap_err();
        assert!(matches!(err, VmforgeError::Aborted(_)));
    }

    #[test]
    fn loadbalancer_failures_require_confirmation() {
        let primary = Ipv4Addr::new(192, 0, 2, 10);
        let lb_ip = Ipv4Addr::new(10, 1, 0, 5);
        let mut ranges = HashMap::new();
        ranges.insert(
            primary,
            vec![IpRange {
                range_id: 1,
                min: u32::from(Ipv4Addr::new(192, 0, 2, 0)),
                max: u32::from(Ipv4Addr::new(192, 0, 2, 255)),
                gateway: Some(Ipv4Addr::new(192, 0, 2, 1)),
                belongs_to: Some(7),
            }],
        );
        let inventory = JsonInventory::from_parts(
            vec![lb_record("lb01.test", lb_ip)],
            ranges,
            HashMap::new(),
        );

        let mut record = vm_record(primary, Vec::new());
        record.loadbalancers = vec!["lb01".into(), "missing-lb".into()];

        // Operator confirms continuing past the failed lookup; successful
        // lookups are kept regardless.
        let prompt = ScriptedPrompt::confirm_only(true);
        let config = resolve_network(&record, &inventory, &prompt).unwrap();
        assert_eq!(config.loadbalancers, vec![lb_ip]);

        // Declining aborts the whole build.
        let prompt = ScriptedPrompt::confirm_only(false);
        let err = resolve_network(&record, &inventory, &prompt).unwrap_err();
        assert!(matches!(err, VmforgeError::Aborted(_)));
    }
}

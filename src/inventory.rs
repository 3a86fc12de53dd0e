//! Inventory records and the lookup capability.
//!
//! The inventory/query service itself is an external collaborator. This
//! module defines the record snapshots the pipeline consumes, the
//! [`Inventory`] trait the orchestrator is handed, and a JSON snapshot
//! adapter that keeps the binary usable without a live service.

use crate::errors::{VmforgeError, VmforgeResult};
use crate::hypervisor::HypervisorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

/// Lifecycle state of an inventory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Online,
    /// Reserved for maintenance; refusing to touch it is a pre-flight check.
    OnlineReserved,
    Retired,
}

/// Guest operating-system family. Selects image extraction flags and SSH
/// host key types during preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Redhat,
}

impl OsFamily {
    /// SSH host key types to regenerate inside the guest tree.
    pub fn ssh_keytypes(&self) -> &'static [&'static str] {
        match self {
            OsFamily::Debian => &["rsa", "ecdsa", "ed25519"],
            OsFamily::Redhat => &["rsa", "ecdsa"],
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsFamily::Debian => write!(f, "debian"),
            OsFamily::Redhat => write!(f, "redhat"),
        }
    }
}

/// Immutable snapshot of an inventory server entity, fetched once per build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub hostname: String,
    pub intern_ip: Ipv4Addr,
    #[serde(default)]
    pub additional_ips: Vec<Ipv4Addr>,
    pub servertype: String,
    pub state: ServerState,
    #[serde(default)]
    pub hypervisor: Option<HypervisorKind>,
    #[serde(default)]
    pub os: Option<OsFamily>,
    /// Hypervisor the VM is assigned to (VM records only).
    #[serde(default)]
    pub hypervisor_host: Option<String>,
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub loadbalancers: Vec<String>,
    #[serde(default)]
    pub disk_size_gib: Option<u64>,
    #[serde(default)]
    pub memory_mib: Option<u64>,
    #[serde(default)]
    pub num_cpu: Option<u32>,
}

impl ServerRecord {
    /// Pre-flight refusal of servers in a reserved state.
    pub fn ensure_usable(&self) -> VmforgeResult<()> {
        if self.state == ServerState::OnlineReserved {
            return Err(VmforgeError::InvalidState(format!(
                "server \"{}\" is online_reserved",
                self.hostname
            )));
        }
        Ok(())
    }
}

pub type RangeId = u32;

/// An IP range from the external range inventory. Read-only, queried per
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub range_id: RangeId,
    /// Lower address-space bound.
    pub min: u32,
    /// Upper address-space bound.
    pub max: u32,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Parent range this allocation is nested under. `Some` also marks the
    /// queried address as directly allocated within this range.
    #[serde(default)]
    pub belongs_to: Option<RangeId>,
}

impl IpRange {
    /// Address-space span covered by this range.
    pub fn span(&self) -> u32 {
        self.max.saturating_sub(self.min)
    }
}

/// Per-host gateway pair from the external gateway lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySet {
    pub default: Ipv4Addr,
    pub internal: Ipv4Addr,
}

/// Lookup capability over the inventory/query service.
pub trait Inventory: Send + Sync {
    /// Resolve a hostname prefix to a single server of the given servertype.
    ///
    /// No match is a `Config` error, as is a prefix matching multiple
    /// servers of the requested servertype, or a unique match of the wrong
    /// servertype.
    fn find_server(&self, hostname_prefix: &str, servertype: &str) -> VmforgeResult<ServerRecord>;

    /// All ranges containing the given address.
    fn ranges_containing(&self, address: Ipv4Addr) -> VmforgeResult<Vec<IpRange>>;

    /// External per-host default/internal gateway lookup.
    fn gateway_for(&self, address: Ipv4Addr) -> VmforgeResult<GatewaySet>;
}

/// Inventory backed by a JSON snapshot file.
///
/// Production deployments implement [`Inventory`] against their own query
/// service; the snapshot adapter exists so the binary works end to end with
/// exported data.
#[derive(Debug, Default, Deserialize)]
pub struct JsonInventory {
    #[serde(default)]
    servers: Vec<ServerRecord>,
    /// Address → containing ranges.
    #[serde(default)]
    ranges: HashMap<Ipv4Addr, Vec<IpRange>>,
    /// Address → gateway pair.
    #[serde(default)]
    gateways: HashMap<Ipv4Addr, GatewaySet>,
}

impl JsonInventory {
    pub async fn load(path: &Path) -> VmforgeResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            VmforgeError::Config(format!("cannot read inventory snapshot {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            VmforgeError::Config(format!("malformed inventory snapshot {}: {e}", path.display()))
        })
    }

    #[cfg(test)]
    pub fn from_parts(
        servers: Vec<ServerRecord>,
        ranges: HashMap<Ipv4Addr, Vec<IpRange>>,
        gateways: HashMap<Ipv4Addr, GatewaySet>,
    ) -> Self {
        Self {
            servers,
            ranges,
            gateways,
        }
    }
}

impl Inventory for JsonInventory {
    fn find_server(&self, hostname_prefix: &str, servertype: &str) -> VmforgeResult<ServerRecord> {
        // Query by prefix only, then narrow by servertype, so mismatches get
        // a precise error instead of a generic not-found.
        let matches: Vec<&ServerRecord> = self
            .servers
            .iter()
            .filter(|s| s.hostname.starts_with(hostname_prefix))
            .collect();

        if matches.is_empty() {
            return Err(VmforgeError::Config(format!(
                "server with hostname \"{hostname_prefix}\" not found"
            )));
        }

        let mut selected = matches[0];
        for other in &matches[1..] {
            if other.servertype != servertype {
                continue;
            }
            if selected.servertype != servertype {
                selected = other;
                continue;
            }
            return Err(VmforgeError::Config(format!(
                "hostname \"{hostname_prefix}\" matches multiple servers \"{}\" and \"{}\"",
                selected.hostname, other.hostname
            )));
        }

        if selected.servertype != servertype {
            return Err(VmforgeError::Config(format!(
                "server \"{hostname_prefix}\" is not a \"{servertype}\""
            )));
        }

        Ok(selected.clone())
    }

    fn ranges_containing(&self, address: Ipv4Addr) -> VmforgeResult<Vec<IpRange>> {
        Ok(self.ranges.get(&address).cloned().unwrap_or_default())
    }

    fn gateway_for(&self, address: Ipv4Addr) -> VmforgeResult<GatewaySet> {
        self.gateways.get(&address).copied().ok_or_else(|| {
            VmforgeError::Network(format!("no gateway entry for address {address}"))
        })
    }
}

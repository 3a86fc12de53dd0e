//! Hypervisor control capability.
//!
//! Drivers are looked up by hypervisor kind instead of being hardcoded at
//! the call sites: every kind implements the same
//! exists/capacity/define/start contract against a [`RemoteHost`].

mod kvm;

pub use kvm::KvmDriver;

use crate::errors::{VmforgeError, VmforgeResult};
use crate::remote::RemoteHost;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported hypervisor kinds, keyed by the inventory's kind strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    Kvm,
}

impl HypervisorKind {
    /// Capability lookup: the driver implementing this kind's contract.
    pub fn driver(&self, host: RemoteHost) -> Box<dyn HypervisorDriver> {
        match self {
            HypervisorKind::Kvm => Box::new(KvmDriver::new(host)),
        }
    }

    /// Device name the guest sees its root disk under.
    pub fn guest_block_device(&self) -> &'static str {
        match self {
            HypervisorKind::Kvm => "vda",
        }
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HypervisorKind::Kvm => write!(f, "kvm"),
        }
    }
}

impl FromStr for HypervisorKind {
    type Err = VmforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kvm" => Ok(HypervisorKind::Kvm),
            other => Err(VmforgeError::Config(format!(
                "unknown hypervisor kind \"{other}\""
            ))),
        }
    }
}

/// Description of the domain to define on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    /// Block device on the hypervisor backing the guest disk.
    pub source_device: String,
    /// Device name presented to the guest.
    pub guest_block_device: String,
    pub vlan_tag: Option<u16>,
}

/// Uniform lifecycle contract every hypervisor kind implements.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Whether a VM of this name is already known to the hypervisor.
    async fn exists(&self, name: &str) -> VmforgeResult<bool>;

    /// CPUs not currently allocated to running guests.
    async fn free_cpu(&self) -> VmforgeResult<u32>;

    /// Memory not currently committed, in MiB.
    async fn free_memory_mib(&self) -> VmforgeResult<u64>;

    /// Define the VM from the assembled description without starting it.
    async fn define(&self, spec: &DomainSpec) -> VmforgeResult<()>;

    /// Start a previously defined VM.
    async fn start(&self, name: &str) -> VmforgeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_inventory_strings() {
        assert_eq!("kvm".parse::<HypervisorKind>().unwrap(), HypervisorKind::Kvm);
        assert!(matches!(
            "vmware".parse::<HypervisorKind>(),
            Err(VmforgeError::Config(_))
        ));
    }

    #[test]
    fn kind_round_trips_through_display() {
        let kind = HypervisorKind::Kvm;
        assert_eq!(kind.to_string().parse::<HypervisorKind>().unwrap(), kind);
    }
}

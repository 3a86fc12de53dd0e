//! The per-build context threaded through all pipeline stages.

use crate::errors::{VmforgeError, VmforgeResult};
use crate::hooks::HookRegistry;
use crate::hypervisor::{HypervisorDriver, HypervisorKind};
use crate::inventory::ServerRecord;
use crate::net::NetworkConfig;
use crate::remote::RemoteHost;
use crate::storage::MountedStorage;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Structured build configuration, populated stage by stage.
///
/// Fields that later stages depend on are optional and read through
/// accessors: a read before the populating stage ran is an internal error,
/// not a panic. Hooks receive the config mutably and may add keys to
/// `extras` for later stages (or later hooks) to read.
#[derive(Debug)]
pub struct BuildConfig {
    pub vm_hostname: String,
    pub image: Option<String>,
    pub run_config_management: bool,
    pub postboot_script: Option<PathBuf>,

    pub vm: Option<ServerRecord>,
    pub hypervisor: Option<ServerRecord>,
    pub network: Option<NetworkConfig>,

    pub disk_size_gib: Option<u64>,
    pub memory_mib: Option<u64>,
    pub num_cpu: Option<u32>,
    pub swap_size_mib: u64,
    pub dns_servers: Vec<Ipv4Addr>,
    pub mailname: Option<String>,

    /// Device name the guest sees its disk under, per hypervisor kind.
    pub vm_block_dev: Option<String>,
    /// Block device allocated on the hypervisor.
    pub device: Option<String>,
    /// Temporary path the guest tree is staged under.
    pub mount_path: Option<String>,

    /// Hook-injected key/value context.
    pub extras: BTreeMap<String, String>,
}

impl BuildConfig {
    pub fn new(vm_hostname: String) -> Self {
        Self {
            vm_hostname,
            image: None,
            run_config_management: true,
            postboot_script: None,
            vm: None,
            hypervisor: None,
            network: None,
            disk_size_gib: None,
            memory_mib: None,
            num_cpu: None,
            swap_size_mib: 1024,
            dns_servers: Vec::new(),
            mailname: None,
            vm_block_dev: None,
            device: None,
            mount_path: None,
            extras: BTreeMap::new(),
        }
    }

    fn require<'a, T>(field: &'a Option<T>, what: &str) -> VmforgeResult<&'a T> {
        field
            .as_ref()
            .ok_or_else(|| VmforgeError::Internal(format!("{what} not populated yet")))
    }

    pub fn vm(&self) -> VmforgeResult<&ServerRecord> {
        Self::require(&self.vm, "vm record")
    }

    pub fn hypervisor(&self) -> VmforgeResult<&ServerRecord> {
        Self::require(&self.hypervisor, "hypervisor record")
    }

    pub fn network(&self) -> VmforgeResult<&NetworkConfig> {
        Self::require(&self.network, "network config")
    }

    pub fn image(&self) -> VmforgeResult<&String> {
        Self::require(&self.image, "image identifier")
    }

    pub fn device(&self) -> VmforgeResult<&String> {
        Self::require(&self.device, "storage device")
    }

    pub fn mount_path(&self) -> VmforgeResult<&String> {
        Self::require(&self.mount_path, "mount path")
    }

    pub fn vm_block_dev(&self) -> VmforgeResult<&String> {
        Self::require(&self.vm_block_dev, "guest block device")
    }

    pub fn disk_size_gib(&self) -> VmforgeResult<u64> {
        Self::require(&self.disk_size_gib, "disk size").copied()
    }

    pub fn memory_mib(&self) -> VmforgeResult<u64> {
        Self::require(&self.memory_mib, "memory size").copied()
    }

    pub fn num_cpu(&self) -> VmforgeResult<u32> {
        Self::require(&self.num_cpu, "cpu count").copied()
    }

    /// Validate the assembled configuration before any remote action.
    /// Missing or contradictory fields are fatal.
    pub fn validate(&self) -> VmforgeResult<()> {
        let missing = |what: &str| VmforgeError::Config(format!("assembled config misses {what}"));

        let vm = self.vm.as_ref().ok_or_else(|| missing("the vm record"))?;
        let hypervisor = self
            .hypervisor
            .as_ref()
            .ok_or_else(|| missing("the hypervisor record"))?;
        self.network.as_ref().ok_or_else(|| missing("the network config"))?;
        self.image.as_ref().ok_or_else(|| missing("an image identifier"))?;

        if hypervisor.hypervisor.is_none() {
            return Err(VmforgeError::Config(format!(
                "hypervisor record \"{}\" carries no hypervisor kind",
                hypervisor.hostname
            )));
        }
        if vm.os.is_none() {
            return Err(VmforgeError::Config(format!(
                "vm record \"{}\" carries no os family",
                vm.hostname
            )));
        }

        match self.disk_size_gib {
            None | Some(0) => return Err(missing("a usable disk size")),
            Some(_) => {}
        }
        match self.memory_mib {
            None | Some(0) => return Err(missing("a usable memory size")),
            Some(_) => {}
        }
        match self.num_cpu {
            None | Some(0) => return Err(missing("a usable cpu count")),
            Some(_) => {}
        }

        Ok(())
    }
}

/// Shared pipeline state: the build config plus the capabilities the tasks
/// drive. Exclusively owned by one build invocation.
pub struct BuildState {
    pub config: BuildConfig,
    pub hooks: Arc<HookRegistry>,
    pub kind: HypervisorKind,
    pub hypervisor_host: RemoteHost,
    pub driver: Box<dyn HypervisorDriver>,
    /// Remote session against the booted guest, opened for the postboot
    /// phase only.
    pub guest_host: Option<RemoteHost>,
    /// Currently mounted guest volume; must never outlive the hypervisor
    /// phase.
    pub mounted: Option<MountedStorage>,
    /// Image cache path on the hypervisor once downloaded.
    pub image_path: Option<String>,
    pub image_base_url: String,
    pub boot_timeout: Duration,
    pub guest_probe_port: u16,
}

impl BuildState {
    pub fn guest_host(&self) -> VmforgeResult<&RemoteHost> {
        self.guest_host
            .as_ref()
            .ok_or_else(|| VmforgeError::Internal("guest session not opened yet".into()))
    }

    pub fn image_path(&self) -> VmforgeResult<&String> {
        self.image_path
            .as_ref()
            .ok_or_else(|| VmforgeError::Internal("image not downloaded yet".into()))
    }
}

pub type BuildCtx = Arc<Mutex<BuildState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{OsFamily, ServerState};
    use crate::net::NetworkConfig;

    fn record(hostname: &str, servertype: &str) -> ServerRecord {
        ServerRecord {
            hostname: hostname.into(),
            intern_ip: Ipv4Addr::new(10, 0, 0, 10),
            additional_ips: Vec::new(),
            servertype: servertype.into(),
            state: ServerState::Online,
            hypervisor: Some(HypervisorKind::Kvm),
            os: Some(OsFamily::Debian),
            hypervisor_host: None,
            segment: None,
            loadbalancers: Vec::new(),
            disk_size_gib: Some(10),
            memory_mib: Some(2048),
            num_cpu: Some(2),
        }
    }

    fn assembled() -> BuildConfig {
        let mut config = BuildConfig::new("vm01.test".into());
        config.vm = Some(record("vm01.test", "vm"));
        config.hypervisor = Some(record("hv01.test", "hypervisor"));
        config.network = Some(NetworkConfig {
            addresses: Vec::new(),
            routes: Vec::new(),
            loadbalancers: Vec::new(),
            vlan_tag: None,
        });
        config.image = Some("debian-base.tar.gz".into());
        config.disk_size_gib = Some(10);
        config.memory_mib = Some(2048);
        config.num_cpu = Some(2);
        config
    }

    #[test]
    fn assembled_config_validates() {
        assembled().validate().unwrap();
    }

    #[test]
    fn missing_image_fails_validation() {
        let mut config = assembled();
        config.image = None;
        assert!(matches!(
            config.validate().unwrap_err(),
            VmforgeError::Config(_)
        ));
    }

    #[test]
    fn zero_sizing_fails_validation() {
        let mut config = assembled();
        config.memory_mib = Some(0);
        assert!(matches!(
            config.validate().unwrap_err(),
            VmforgeError::Config(_)
        ));
    }

    #[test]
    fn hypervisor_without_kind_fails_validation() {
        let mut config = assembled();
        config.hypervisor.as_mut().unwrap().hypervisor = None;
        assert!(matches!(
            config.validate().unwrap_err(),
            VmforgeError::Config(_)
        ));
    }

    #[test]
    fn unpopulated_field_reads_are_internal_errors() {
        let config = BuildConfig::new("vm01.test".into());
        assert!(matches!(
            config.device().unwrap_err(),
            VmforgeError::Internal(_)
        ));
        assert!(matches!(config.vm().unwrap_err(), VmforgeError::Internal(_)));
    }
}

//! The build orchestrator.
//!
//! Sequences the end-to-end provisioning pipeline: context assembly, the
//! hypervisor phase (capacity checks through boot wait) and the guest-side
//! postboot phase, with hooks dispatched at the defined points. Stages are
//! strictly sequential; no stage is re-entrant or resumable.

mod context;
mod tasks;

pub use context::{BuildConfig, BuildCtx, BuildState};

use crate::errors::{VmforgeError, VmforgeResult};
use crate::hooks::HookRegistry;
use crate::inventory::{Inventory, ServerRecord};
use crate::net::{NetworkPrompt, resolve_network};
use crate::remote::{RemoteHost, RemoteTransport};
use crate::storage::cleanup_storage;
use crate::bootwait;
use crate::pipeline::{BoxedTask, Executor, Plan};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use tasks::{
    BootWaitTask, CapacityChecksTask, CommitVmTask, ConfigManagementTask, DeployImageTask,
    DetachStorageTask, HypervisorExtraTask, InstallPostbootTask, PopulateConfigTask,
    PostbootExecTask, PrepareGuestTask, ProvisionStorageTask, VmBootedTask,
};

const DEFAULT_IMAGE_BASE_URL: &str = "http://images.vmforge.local/base";
const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Caller-supplied knobs for one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub vm_hostname: String,
    /// Base image override; derived from the guest OS family when absent.
    pub image: Option<String>,
    pub run_config_management: bool,
    pub postboot_script: Option<PathBuf>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub image_base_url: String,
    pub boot_timeout: Duration,
    /// Guest port probed for boot verification.
    pub guest_probe_port: u16,
}

impl BuildOptions {
    pub fn new(vm_hostname: impl Into<String>) -> Self {
        Self {
            vm_hostname: vm_hostname.into(),
            image: None,
            run_config_management: true,
            postboot_script: None,
            dns_servers: Vec::new(),
            image_base_url: DEFAULT_IMAGE_BASE_URL.to_string(),
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            guest_probe_port: bootwait::GUEST_SSH_PORT,
        }
    }
}

/// Builds one virtual machine end to end.
pub struct Builder {
    inventory: Arc<dyn Inventory>,
    transport: Arc<dyn RemoteTransport>,
    hooks: Arc<HookRegistry>,
    prompt: Arc<dyn NetworkPrompt>,
    options: BuildOptions,
}

impl Builder {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        transport: Arc<dyn RemoteTransport>,
        hooks: Arc<HookRegistry>,
        prompt: Arc<dyn NetworkPrompt>,
        options: BuildOptions,
    ) -> Self {
        Self {
            inventory,
            transport,
            hooks,
            prompt,
            options,
        }
    }

    /// Run the whole pipeline. Returns the final build context on success.
    pub async fn build(self) -> VmforgeResult<BuildConfig> {
        let config = assemble_config(&self.options, self.inventory.as_ref(), self.prompt.as_ref())?;

        let hypervisor = config.hypervisor()?;
        let kind = hypervisor.hypervisor.ok_or_else(|| {
            VmforgeError::Config(format!(
                "hypervisor record \"{}\" carries no hypervisor kind",
                hypervisor.hostname
            ))
        })?;
        let hypervisor_host =
            RemoteHost::new(Arc::clone(&self.transport), hypervisor.hostname.clone());
        let guest_target = config.vm()?.intern_ip.to_string();
        let driver = kind.driver(hypervisor_host.clone());

        tracing::info!(
            vm = %config.vm_hostname,
            hypervisor = %hypervisor_host.target(),
            %kind,
            "Starting build"
        );

        let state = BuildState {
            config,
            hooks: Arc::clone(&self.hooks),
            kind,
            hypervisor_host: hypervisor_host.clone(),
            driver,
            guest_host: None,
            mounted: None,
            image_path: None,
            image_base_url: self.options.image_base_url.clone(),
            boot_timeout: self.options.boot_timeout,
            guest_probe_port: self.options.guest_probe_port,
        };
        let ctx: BuildCtx = Arc::new(Mutex::new(state));

        let hypervisor_plan = Plan::new(vec![
            Box::new(CapacityChecksTask) as BoxedTask<BuildCtx>,
            Box::new(PopulateConfigTask),
            Box::new(ProvisionStorageTask),
            Box::new(DeployImageTask),
            Box::new(PrepareGuestTask),
            Box::new(ConfigManagementTask),
            Box::new(InstallPostbootTask),
            Box::new(DetachStorageTask),
            Box::new(HypervisorExtraTask),
            Box::new(CommitVmTask),
            Box::new(BootWaitTask),
        ]);

        let phase_result = Executor::execute(hypervisor_plan, Arc::clone(&ctx)).await;

        // The device must never be left mounted: if any task failed after
        // the mount, tear it down before propagating the stage error.
        let leftover = ctx.lock().await.mounted.take();
        if let Some(mounted) = leftover {
            tracing::warn!(path = %mounted.path, "Stage failed with storage mounted, cleaning up");
            if let Err(cleanup_err) = cleanup_storage(&hypervisor_host, &mounted).await {
                tracing::warn!(%cleanup_err, "Cleanup after failed stage did not finish");
            }
        }
        phase_result?.log();

        // Guest phase: a separate remote session against the booted guest.
        {
            let mut state = ctx.lock().await;
            state.guest_host = Some(RemoteHost::new(Arc::clone(&self.transport), guest_target));
        }
        let guest_plan = Plan::new(vec![
            Box::new(VmBootedTask) as BoxedTask<BuildCtx>,
            Box::new(PostbootExecTask),
        ]);
        Executor::execute(guest_plan, Arc::clone(&ctx)).await?.log();

        let state = Arc::try_unwrap(ctx)
            .map_err(|_| VmforgeError::Internal("build context still shared after build".into()))?
            .into_inner();

        tracing::info!(vm = %state.config.vm_hostname, "Build finished");
        Ok(state.config)
    }
}

/// Stage 1: collect hostnames, fetch records, resolve network and VLAN,
/// import sizing, validate.
fn assemble_config(
    options: &BuildOptions,
    inventory: &dyn Inventory,
    prompt: &dyn NetworkPrompt,
) -> VmforgeResult<BuildConfig> {
    let mut config = BuildConfig::new(options.vm_hostname.clone());
    config.image = options.image.clone();
    config.run_config_management = options.run_config_management;
    config.postboot_script = options.postboot_script.clone();
    config.dns_servers = options.dns_servers.clone();

    let vm = inventory.find_server(&options.vm_hostname, "vm")?;
    vm.ensure_usable()?;

    let hypervisor_hostname = vm.hypervisor_host.clone().ok_or_else(|| {
        VmforgeError::Config(format!(
            "vm \"{}\" has no hypervisor assignment",
            vm.hostname
        ))
    })?;
    let hypervisor = inventory.find_server(&hypervisor_hostname, "hypervisor")?;
    hypervisor.ensure_usable()?;

    let mut network = resolve_network(&vm, inventory, prompt)?;
    network.vlan_tag = resolve_vlan(&vm, &hypervisor)?;

    config.disk_size_gib = vm.disk_size_gib;
    config.memory_mib = vm.memory_mib;
    config.num_cpu = vm.num_cpu;
    config.mailname = Some(vm.hostname.clone());
    if config.image.is_none() {
        config.image = vm.os.map(|os| format!("{os}-base.tar.gz"));
    }

    config.vm = Some(vm);
    config.hypervisor = Some(hypervisor);
    config.network = Some(network);

    config.validate()?;
    Ok(config)
}

/// VLAN/segment resolution: the VM and its destination hypervisor must sit
/// in the same segment; the numeric suffix of the segment name is the tag.
fn resolve_vlan(vm: &ServerRecord, hypervisor: &ServerRecord) -> VmforgeResult<Option<u16>> {
    match (&vm.segment, &hypervisor.segment) {
        (Some(vm_segment), Some(hv_segment)) if vm_segment != hv_segment => {
            Err(VmforgeError::Config(format!(
                "vm segment \"{vm_segment}\" is not served by hypervisor segment \"{hv_segment}\""
            )))
        }
        (Some(segment), _) => Ok(segment_tag(segment)),
        (None, _) => Ok(None),
    }
}

fn segment_tag(segment: &str) -> Option<u16> {
    let digits: String = segment
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{OsFamily, ServerState};
    use pretty_assertions::assert_eq;

    fn record(segment: Option<&str>) -> ServerRecord {
        ServerRecord {
            hostname: "host.test".into(),
            intern_ip: Ipv4Addr::new(10, 0, 0, 1),
            additional_ips: Vec::new(),
            servertype: "vm".into(),
            state: ServerState::Online,
            hypervisor: None,
            os: Some(OsFamily::Debian),
            hypervisor_host: None,
            segment: segment.map(String::from),
            loadbalancers: Vec::new(),
            disk_size_gib: None,
            memory_mib: None,
            num_cpu: None,
        }
    }

    #[test]
    fn matching_segments_yield_the_numeric_tag() {
        let tag = resolve_vlan(&record(Some("af23")), &record(Some("af23"))).unwrap();
        assert_eq!(tag, Some(23));
    }

    #[test]
    fn mismatched_segments_are_a_config_error() {
        let err = resolve_vlan(&record(Some("af23")), &record(Some("af42"))).unwrap_err();
        assert!(matches!(err, VmforgeError::Config(_)));
    }

    #[test]
    fn absent_segment_means_no_tag() {
        assert_eq!(resolve_vlan(&record(None), &record(Some("af23"))).unwrap(), None);
    }

    #[test]
    fn segment_without_digits_means_no_tag() {
        assert_eq!(resolve_vlan(&record(Some("core")), &record(Some("core"))).unwrap(), None);
    }
}

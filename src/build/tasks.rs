//! Pipeline tasks for the hypervisor and guest phases.

use super::context::BuildCtx;
use crate::bootwait::wait_for_guest;
use crate::errors::{VmforgeError, VmforgeResult};
use crate::guest::{
    GuestPrep, POSTBOOT_PATH, block_autostart, install_postboot_script, prepare_guest_tree,
    run_config_management, unblock_autostart,
};
use crate::hooks::{HookArgs, HookStage, HookValue};
use crate::hypervisor::DomainSpec;
use crate::image::{download_image, extract_image};
use crate::pipeline::BuildTask;
use crate::storage::{cleanup_storage, create_storage, mount_storage};
use async_trait::async_trait;
use std::sync::Arc;

fn os_of(config: &super::context::BuildConfig) -> VmforgeResult<crate::inventory::OsFamily> {
    config
        .vm()?
        .os
        .ok_or_else(|| VmforgeError::Internal("vm record carries no os family".into()))
}

/// Reject the build before any destructive action: same-name VM, CPU and
/// memory headroom.
pub struct CapacityChecksTask;

#[async_trait]
impl BuildTask<BuildCtx> for CapacityChecksTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let state = ctx.lock().await;
        let name = state.config.vm_hostname.clone();
        let vcpus = state.config.num_cpu()?;
        let memory = state.config.memory_mib()?;

        if state.driver.exists(&name).await? {
            return Err(VmforgeError::Hypervisor(format!(
                "vm \"{name}\" already exists on {}",
                state.hypervisor_host.target()
            )));
        }

        let free_cpu = state.driver.free_cpu().await?;
        if free_cpu < vcpus {
            return Err(VmforgeError::Hypervisor(format!(
                "insufficient free cpu on {}: need {vcpus}, have {free_cpu}",
                state.hypervisor_host.target()
            )));
        }

        let free_memory = state.driver.free_memory_mib().await?;
        if free_memory < memory {
            return Err(VmforgeError::Hypervisor(format!(
                "insufficient free memory on {}: need {memory} MiB, have {free_memory} MiB",
                state.hypervisor_host.target()
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "capacity_checks"
    }
}

/// Finish the generated configuration and let `populate_config` handlers
/// augment it.
pub struct PopulateConfigTask;

#[async_trait]
impl BuildTask<BuildCtx> for PopulateConfigTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let block_dev = state.kind.guest_block_device().to_string();
        state.config.vm_block_dev = Some(block_dev);

        let hooks = Arc::clone(&state.hooks);
        hooks.dispatch(HookStage::PopulateConfig, &mut state.config, &HookArgs::None)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "populate_config"
    }
}

/// Allocate the guest volume and mount it at a fresh temporary path.
pub struct ProvisionStorageTask;

#[async_trait]
impl BuildTask<BuildCtx> for ProvisionStorageTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let hooks = Arc::clone(&state.hooks);
        hooks.dispatch(HookStage::SetupHardware, &mut state.config, &HookArgs::None)?;

        let host = state.hypervisor_host.clone();
        let hostname = state.config.vm_hostname.clone();
        let disk_size_gib = state.config.disk_size_gib()?;

        let device = create_storage(&host, &hostname, disk_size_gib).await?;
        let mounted = mount_storage(&host, &device).await?;

        state.config.device = Some(device);
        state.config.mount_path = Some(mounted.path.clone());
        state.mounted = Some(mounted);
        Ok(())
    }

    fn name(&self) -> &str {
        "provision_storage"
    }
}

/// Download the base image (cache permitting) and extract it into the
/// mounted tree.
pub struct DeployImageTask;

#[async_trait]
impl BuildTask<BuildCtx> for DeployImageTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let host = state.hypervisor_host.clone();
        let base_url = state.image_base_url.clone();
        let image = state.config.image()?.clone();
        let mount_path = state.config.mount_path()?.clone();
        let os = os_of(&state.config)?;

        let cache_path = download_image(&host, &base_url, &image).await?;
        extract_image(&host, &cache_path, &mount_path, os).await?;
        state.image_path = Some(cache_path);
        Ok(())
    }

    fn name(&self) -> &str {
        "deploy_image"
    }
}

/// `prepare_vm` hook, guest tree preparation, `prepared_vm` hook.
pub struct PrepareGuestTask;

#[async_trait]
impl BuildTask<BuildCtx> for PrepareGuestTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let device = state.config.device()?.clone();
        let mount_path = state.config.mount_path()?.clone();
        let host = state.hypervisor_host.clone();
        let hooks = Arc::clone(&state.hooks);

        hooks.dispatch(
            HookStage::PrepareVm,
            &mut state.config,
            &HookArgs::Storage {
                device: device.as_str(),
                mount_path: mount_path.as_str(),
            },
        )?;

        let os = os_of(&state.config)?;
        let prep = GuestPrep {
            hostname: &state.config.vm_hostname,
            mailname: state.config.mailname.as_deref(),
            dns_servers: &state.config.dns_servers,
            network: state.config.network()?,
            swap_size_mib: state.config.swap_size_mib,
            guest_block_device: state.config.vm_block_dev()?,
            os,
        };
        prepare_guest_tree(&host, &mount_path, &prep).await?;

        hooks.dispatch(
            HookStage::PreparedVm,
            &mut state.config,
            &HookArgs::Storage {
                device: device.as_str(),
                mount_path: mount_path.as_str(),
            },
        )?;
        Ok(())
    }

    fn name(&self) -> &str {
        "prepare_guest"
    }
}

/// Optional configuration-management run inside the mounted tree. Autostart
/// stays blocked until the run succeeded, so an unconfigured guest is never
/// left able to boot.
pub struct ConfigManagementTask;

#[async_trait]
impl BuildTask<BuildCtx> for ConfigManagementTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let state = ctx.lock().await;
        if !state.config.run_config_management {
            tracing::debug!("Configuration management disabled for this build");
            return Ok(());
        }

        let host = state.hypervisor_host.clone();
        let mount_path = state.config.mount_path()?.clone();
        let hostname = state.config.vm_hostname.clone();
        let os = os_of(&state.config)?;

        block_autostart(&host, &mount_path, os).await?;
        run_config_management(&host, &mount_path, &hostname).await?;
        unblock_autostart(&host, &mount_path, os).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "config_management"
    }
}

/// Install the postboot script into the mounted tree for later execution.
pub struct InstallPostbootTask;

#[async_trait]
impl BuildTask<BuildCtx> for InstallPostbootTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let state = ctx.lock().await;
        let Some(script) = state.config.postboot_script.clone() else {
            return Ok(());
        };
        let mount_path = state.config.mount_path()?.clone();
        let host = state.hypervisor_host.clone();
        drop(state);

        let content = tokio::fs::read(&script).await.map_err(|e| {
            VmforgeError::Config(format!(
                "cannot read postboot script {}: {e}",
                script.display()
            ))
        })?;
        install_postboot_script(&host, &mount_path, &content).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "install_postboot"
    }
}

/// Unmount and remove the temporary path on the success path. The
/// orchestrator performs the same teardown when an earlier task failed.
pub struct DetachStorageTask;

#[async_trait]
impl BuildTask<BuildCtx> for DetachStorageTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let Some(mounted) = state.mounted.take() else {
            return Ok(());
        };
        state.config.mount_path = None;
        let host = state.hypervisor_host.clone();
        cleanup_storage(&host, &mounted).await
    }

    fn name(&self) -> &str {
        "detach_storage"
    }
}

/// Collect extra per-hypervisor key/value context and merge it into the
/// build config.
pub struct HypervisorExtraTask;

#[async_trait]
impl BuildTask<BuildCtx> for HypervisorExtraTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let hooks = Arc::clone(&state.hooks);
        let kind = state.kind;

        let values = hooks.dispatch(
            HookStage::HypervisorExtra,
            &mut state.config,
            &HookArgs::Hypervisor { kind },
        )?;
        for value in values {
            if let HookValue::Extras(extra) = value {
                state.config.extras.extend(extra);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "hypervisor_extra"
    }
}

/// Define the VM from the assembled description, fire `defined_vm`, then
/// start it.
pub struct CommitVmTask;

#[async_trait]
impl BuildTask<BuildCtx> for CommitVmTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let spec = DomainSpec {
            name: state.config.vm_hostname.clone(),
            memory_mib: state.config.memory_mib()?,
            vcpus: state.config.num_cpu()?,
            source_device: state.config.device()?.clone(),
            guest_block_device: state.config.vm_block_dev()?.clone(),
            vlan_tag: state.config.network()?.vlan_tag,
        };

        state.driver.define(&spec).await?;

        let hooks = Arc::clone(&state.hooks);
        let kind = state.kind;
        hooks.dispatch(
            HookStage::DefinedVm,
            &mut state.config,
            &HookArgs::Hypervisor { kind },
        )?;

        state.driver.start(&spec.name).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "hypervisor_commit"
    }
}

/// Poll guest reachability after start. Exceeding the bound is terminal:
/// the VM stays defined and started, the build is incomplete.
pub struct BootWaitTask;

#[async_trait]
impl BuildTask<BuildCtx> for BootWaitTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let (address, port, timeout) = {
            let state = ctx.lock().await;
            (
                state.config.vm()?.intern_ip,
                state.guest_probe_port,
                state.boot_timeout,
            )
        };
        wait_for_guest(address, port, timeout).await
    }

    fn name(&self) -> &str {
        "boot_wait"
    }
}

/// First contact with the booted guest.
pub struct VmBootedTask;

#[async_trait]
impl BuildTask<BuildCtx> for VmBootedTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        let hooks = Arc::clone(&state.hooks);
        hooks.dispatch(HookStage::VmBooted, &mut state.config, &HookArgs::None)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "vm_booted"
    }
}

/// Execute and remove the installed postboot script on the guest.
pub struct PostbootExecTask;

#[async_trait]
impl BuildTask<BuildCtx> for PostbootExecTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> VmforgeResult<()> {
        let mut state = ctx.lock().await;
        if state.config.postboot_script.is_none() {
            return Ok(());
        }

        let guest = state.guest_host()?.clone();
        guest.run(POSTBOOT_PATH).await?;
        guest.run(&format!("rm -f {POSTBOOT_PATH}")).await?;

        let hooks = Arc::clone(&state.hooks);
        hooks.dispatch(
            HookStage::PostbootExecuted,
            &mut state.config,
            &HookArgs::None,
        )?;
        Ok(())
    }

    fn name(&self) -> &str {
        "guest_postboot"
    }
}

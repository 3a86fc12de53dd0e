//! Hypervisor-side storage provisioning.
//!
//! Allocates a logical volume for the guest, mounts it at a fresh temporary
//! path, and tears both down again. The orchestrator guarantees the teardown
//! runs once a mount succeeded, even when a later staging step failed.

use crate::errors::{VmforgeError, VmforgeResult};
use crate::remote::{RemoteHost, RunOptions};

const MOUNT_TEMPLATE: &str = "/tmp/vmforge.XXXXXX";
const MOUNT_PREFIX: &str = "/tmp/vmforge.";

/// A provisioned and mounted guest volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedStorage {
    /// Block device backing the volume on the hypervisor.
    pub device: String,
    /// Temporary mount path holding the staged guest tree.
    pub path: String,
}

/// Allocate and format the guest volume, returning its device path.
pub async fn create_storage(
    host: &RemoteHost,
    hostname: &str,
    disk_size_gib: u64,
) -> VmforgeResult<String> {
    let volume = hostname.split('.').next().unwrap_or(hostname);

    let vg_output = host
        .run_with(
            "vgs --noheadings -o vg_name | head -n1",
            &RunOptions {
                silent: true,
                warn_only: false,
            },
        )
        .await?;
    let volume_group = vg_output.trimmed().to_string();
    if volume_group.is_empty() {
        return Err(VmforgeError::Storage(format!(
            "no volume group available on {}",
            host.target()
        )));
    }

    host.run(&format!(
        "lvcreate -y -L {disk_size_gib}g -n {volume} {volume_group}"
    ))
    .await?;

    let device = format!("/dev/{volume_group}/{volume}");
    host.run(&format!("mkfs.ext4 -q {device}")).await?;
    Ok(device)
}

/// Mount the device at a fresh temporary path.
pub async fn mount_storage(host: &RemoteHost, device: &str) -> VmforgeResult<MountedStorage> {
    let output = host
        .run_with(
            &format!("mktemp -d {MOUNT_TEMPLATE}"),
            &RunOptions {
                silent: true,
                warn_only: false,
            },
        )
        .await?;
    let path = output.trimmed().to_string();
    if !path.starts_with(MOUNT_PREFIX) {
        return Err(VmforgeError::Storage(format!(
            "unexpected mktemp output \"{path}\""
        )));
    }

    host.run(&format!("mount {device} {path}")).await?;
    Ok(MountedStorage {
        device: device.to_string(),
        path,
    })
}

/// Unmount and remove the temporary path. Both steps are attempted; the
/// first error is returned.
pub async fn cleanup_storage(host: &RemoteHost, mounted: &MountedStorage) -> VmforgeResult<()> {
    let umount = host.run(&format!("umount {}", mounted.device)).await;
    if let Err(ref err) = umount {
        tracing::warn!(device = %mounted.device, %err, "Unmount failed");
    }

    let removed = remove_temp(host, &mounted.path).await;
    if let Err(ref err) = removed {
        tracing::warn!(path = %mounted.path, %err, "Could not remove temporary mount path");
    }

    umount.map(|_| ()).and(removed)
}

async fn remove_temp(host: &RemoteHost, path: &str) -> VmforgeResult<()> {
    // Only ever remove paths we created through mktemp.
    if !path.starts_with(MOUNT_PREFIX) {
        return Err(VmforgeError::Storage(format!(
            "refusing to remove foreign path \"{path}\""
        )));
    }
    host.run(&format!("rm -rf {path}")).await?;
    Ok(())
}

//! Base image download and extraction on the hypervisor.

use crate::errors::VmforgeResult;
use crate::inventory::OsFamily;
use crate::remote::{RemoteHost, RunOptions};

const IMAGE_CACHE_DIR: &str = "/var/cache/vmforge";

/// Fetch the named base image into the hypervisor's cache, reusing an
/// already-downloaded copy. Returns the cache path.
pub async fn download_image(
    host: &RemoteHost,
    base_url: &str,
    image: &str,
) -> VmforgeResult<String> {
    let cache_path = format!("{IMAGE_CACHE_DIR}/{image}");

    let cached = host
        .run_with(
            &format!("test -f {cache_path}"),
            &RunOptions {
                silent: true,
                warn_only: true,
            },
        )
        .await?;
    if cached.succeeded() {
        tracing::debug!(image, "Reusing cached image");
        return Ok(cache_path);
    }

    tracing::info!(image, "Downloading base image");
    host.run(&format!("mkdir -p {IMAGE_CACHE_DIR}")).await?;
    host.run(&format!(
        "curl -fsS -o {cache_path}.part {base_url}/{image} && mv {cache_path}.part {cache_path}"
    ))
    .await?;
    Ok(cache_path)
}

/// Extract the image into the mounted guest tree. The extraction flags
/// depend on the guest OS family.
pub async fn extract_image(
    host: &RemoteHost,
    cache_path: &str,
    mount_path: &str,
    os: OsFamily,
) -> VmforgeResult<()> {
    let flags = match os {
        OsFamily::Debian => "--numeric-owner -xzf",
        // SELinux labels must survive extraction.
        OsFamily::Redhat => "--numeric-owner --xattrs --xattrs-include='*' -xzf",
    };
    host.run(&format!("tar {flags} {cache_path} -C {mount_path}"))
        .await?;
    Ok(())
}

//! Guest tree preparation inside the mounted image.
//!
//! Everything here runs on the hypervisor against the temporary mount path:
//! network configuration, hostname, DNS, swap, SSH host keys, the optional
//! configuration-management run, and the postboot script install.

use crate::errors::VmforgeResult;
use crate::inventory::OsFamily;
use crate::net::NetworkConfig;
use crate::remote::RemoteHost;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Path the postboot script is installed at inside the guest.
pub const POSTBOOT_PATH: &str = "/vmforge-postboot";

/// Inputs for preparing the guest tree.
pub struct GuestPrep<'a> {
    pub hostname: &'a str,
    pub mailname: Option<&'a str>,
    pub dns_servers: &'a [Ipv4Addr],
    pub network: &'a NetworkConfig,
    pub swap_size_mib: u64,
    pub guest_block_device: &'a str,
    pub os: OsFamily,
}

/// Write network config, hostname, DNS, swap and fresh SSH host keys into
/// the mounted tree.
pub async fn prepare_guest_tree(
    host: &RemoteHost,
    mount_path: &str,
    prep: &GuestPrep<'_>,
) -> VmforgeResult<()> {
    host.put(
        format!("{}\n", prep.hostname).as_bytes(),
        &format!("{mount_path}/etc/hostname"),
    )
    .await?;

    if let Some(mailname) = prep.mailname {
        host.put(
            format!("{mailname}\n").as_bytes(),
            &format!("{mount_path}/etc/mailname"),
        )
        .await?;
    }

    host.put(
        render_resolv_conf(prep.dns_servers).as_bytes(),
        &format!("{mount_path}/etc/resolv.conf"),
    )
    .await?;

    write_network_config(host, mount_path, prep).await?;

    host.put(
        render_fstab(prep.guest_block_device, prep.swap_size_mib).as_bytes(),
        &format!("{mount_path}/etc/fstab"),
    )
    .await?;
    if prep.swap_size_mib > 0 {
        host.run(&format!(
            "fallocate -l {}M {mount_path}/swap.img && chmod 600 {mount_path}/swap.img && mkswap {mount_path}/swap.img",
            prep.swap_size_mib
        ))
        .await?;
    }

    regenerate_ssh_host_keys(host, mount_path, prep.os).await?;
    Ok(())
}

async fn write_network_config(
    host: &RemoteHost,
    mount_path: &str,
    prep: &GuestPrep<'_>,
) -> VmforgeResult<()> {
    match prep.os {
        OsFamily::Debian => {
            host.put(
                render_interfaces(prep.network).as_bytes(),
                &format!("{mount_path}/etc/network/interfaces"),
            )
            .await
        }
        OsFamily::Redhat => {
            for (index, entry) in prep.network.addresses.iter().enumerate() {
                let device = ifcfg_device(index);
                host.put(
                    render_ifcfg(&device, entry.address, entry.netmask, entry.gateway).as_bytes(),
                    &format!("{mount_path}/etc/sysconfig/network-scripts/ifcfg-{device}"),
                )
                .await?;
            }
            if !prep.network.routes.is_empty() {
                host.put(
                    render_route_file(prep.network).as_bytes(),
                    &format!("{mount_path}/etc/sysconfig/network-scripts/route-eth0"),
                )
                .await?;
            }
            Ok(())
        }
    }
}

async fn regenerate_ssh_host_keys(
    host: &RemoteHost,
    mount_path: &str,
    os: OsFamily,
) -> VmforgeResult<()> {
    host.run(&format!("rm -f {mount_path}/etc/ssh/ssh_host_*"))
        .await?;
    for keytype in os.ssh_keytypes() {
        host.run(&format!(
            "ssh-keygen -q -t {keytype} -N '' -f {mount_path}/etc/ssh/ssh_host_{keytype}_key"
        ))
        .await?;
    }
    Ok(())
}

fn render_resolv_conf(dns_servers: &[Ipv4Addr]) -> String {
    let mut out = String::new();
    for server in dns_servers {
        let _ = writeln!(out, "nameserver {server}");
    }
    out
}

fn render_fstab(guest_block_device: &str, swap_size_mib: u64) -> String {
    let mut out = format!(
        "/dev/{guest_block_device} / ext4 defaults 0 1\nproc /proc proc defaults 0 0\n"
    );
    if swap_size_mib > 0 {
        out.push_str("/swap.img none swap sw 0 0\n");
    }
    out
}

fn ifcfg_device(index: usize) -> String {
    if index == 0 {
        "eth0".to_string()
    } else {
        format!("eth0:{index}")
    }
}

/// Debian-style /etc/network/interfaces: primary address on eth0 with the
/// gateway and static routes, additional addresses as numbered aliases.
fn render_interfaces(network: &NetworkConfig) -> String {
    let mut out = String::from("auto lo\niface lo inet loopback\n");

    for (index, entry) in network.addresses.iter().enumerate() {
        let device = ifcfg_device(index);
        let _ = write!(
            out,
            "\nauto {device}\niface {device} inet static\n    address {}\n    netmask {}\n",
            entry.address, entry.netmask
        );
        if let Some(gateway) = entry.gateway {
            let _ = writeln!(out, "    gateway {gateway}");
        }
        if index == 0 {
            for route in &network.routes {
                let _ = writeln!(
                    out,
                    "    up route add -net {} netmask {} gw {}",
                    route.destination, route.netmask, route.gateway
                );
            }
        }
    }
    out
}

fn render_ifcfg(
    device: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
) -> String {
    let mut out = format!(
        "DEVICE={device}\nBOOTPROTO=static\nONBOOT=yes\nIPADDR={address}\nNETMASK={netmask}\n"
    );
    if let Some(gateway) = gateway {
        let _ = writeln!(out, "GATEWAY={gateway}");
    }
    out
}

fn render_route_file(network: &NetworkConfig) -> String {
    let mut out = String::new();
    for (index, route) in network.routes.iter().enumerate() {
        let _ = writeln!(
            out,
            "ADDRESS{index}={}\nNETMASK{index}={}\nGATEWAY{index}={}",
            route.destination, route.netmask, route.gateway
        );
    }
    out
}

/// Keep the freshly configured guest from starting services before
/// configuration management has run.
pub async fn block_autostart(host: &RemoteHost, mount_path: &str, os: OsFamily) -> VmforgeResult<()> {
    if os == OsFamily::Debian {
        host.put(
            b"#!/bin/sh\nexit 101\n",
            &format!("{mount_path}/usr/sbin/policy-rc.d"),
        )
        .await?;
        host.run(&format!("chmod +x {mount_path}/usr/sbin/policy-rc.d"))
            .await?;
    }
    Ok(())
}

pub async fn unblock_autostart(
    host: &RemoteHost,
    mount_path: &str,
    os: OsFamily,
) -> VmforgeResult<()> {
    if os == OsFamily::Debian {
        host.run(&format!("rm -f {mount_path}/usr/sbin/policy-rc.d"))
            .await?;
    }
    Ok(())
}

/// Run the configuration-management agent in the mounted tree. Success is
/// required; a failing run fails the build.
pub async fn run_config_management(
    host: &RemoteHost,
    mount_path: &str,
    hostname: &str,
) -> VmforgeResult<()> {
    tracing::info!(hostname, "Running configuration management in chroot");
    host.run(&format!(
        "chroot {mount_path} puppet agent --onetime --no-daemonize --verbose --waitforcert 60 --certname {hostname}"
    ))
    .await?;
    Ok(())
}

/// Install the postboot script into the mounted tree for execution after
/// first boot.
pub async fn install_postboot_script(
    host: &RemoteHost,
    mount_path: &str,
    script: &[u8],
) -> VmforgeResult<()> {
    let target = format!("{mount_path}{POSTBOOT_PATH}");
    host.put(script, &target).await?;
    host.run(&format!("chmod +x {target}")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{AddressEntry, Route};
    use pretty_assertions::assert_eq;

    fn network() -> NetworkConfig {
        NetworkConfig {
            addresses: vec![
                AddressEntry {
                    address: Ipv4Addr::new(10, 2, 3, 4),
                    netmask: Ipv4Addr::new(255, 255, 0, 0),
                    gateway: Some(Ipv4Addr::new(10, 2, 3, 1)),
                },
                AddressEntry {
                    address: Ipv4Addr::new(198, 51, 100, 9),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    gateway: None,
                },
            ],
            routes: vec![Route {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 0, 0, 0),
                gateway: Ipv4Addr::new(10, 2, 3, 2),
            }],
            loadbalancers: Vec::new(),
            vlan_tag: Some(23),
        }
    }

    #[test]
    fn interfaces_put_gateway_and_routes_on_primary_only() {
        let rendered = render_interfaces(&network());
        assert!(rendered.contains("iface eth0 inet static"));
        assert!(rendered.contains("    gateway 10.2.3.1"));
        assert!(rendered.contains("up route add -net 10.0.0.0 netmask 255.0.0.0 gw 10.2.3.2"));
        assert!(rendered.contains("iface eth0:1 inet static"));

        let alias_block = rendered.split("auto eth0:1").nth(1).unwrap();
        assert!(!alias_block.contains("gateway"));
        assert!(!alias_block.contains("route add"));
    }

    #[test]
    fn ifcfg_omits_gateway_when_absent() {
        let with = render_ifcfg("eth0", Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 0, 0, 0), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(with.contains("GATEWAY=10.0.0.1"));

        let without = render_ifcfg("eth0:1", Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(255, 0, 0, 0), None);
        assert!(!without.contains("GATEWAY"));
    }

    #[test]
    fn fstab_lists_swap_only_when_sized() {
        assert_eq!(
            render_fstab("vda", 0),
            "/dev/vda / ext4 defaults 0 1\nproc /proc proc defaults 0 0\n"
        );
        assert!(render_fstab("vda", 1024).contains("/swap.img none swap sw 0 0"));
    }

    #[test]
    fn resolv_conf_lists_all_servers() {
        let rendered = render_resolv_conf(&[
            Ipv4Addr::new(10, 0, 0, 53),
            Ipv4Addr::new(10, 0, 1, 53),
        ]);
        assert_eq!(rendered, "nameserver 10.0.0.53\nnameserver 10.0.1.53\n");
    }
}

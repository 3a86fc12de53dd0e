//! KVM driver speaking `virsh` over the remote transport.

use super::{DomainSpec, HypervisorDriver};
use crate::errors::{VmforgeError, VmforgeResult};
use crate::remote::{RemoteHost, RunOptions};
use async_trait::async_trait;

pub struct KvmDriver {
    host: RemoteHost,
}

impl KvmDriver {
    pub fn new(host: RemoteHost) -> Self {
        Self { host }
    }

    async fn count(&self, command: &str, what: &str) -> VmforgeResult<u64> {
        let output = self
            .host
            .run_with(command, &RunOptions { silent: true, warn_only: false })
            .await?;
        output.trimmed().parse::<u64>().map_err(|_| {
            VmforgeError::Hypervisor(format!(
                "cannot parse {what} from \"{}\"",
                output.trimmed()
            ))
        })
    }
}

#[async_trait]
impl HypervisorDriver for KvmDriver {
    async fn exists(&self, name: &str) -> VmforgeResult<bool> {
        let output = self
            .host
            .run_with(
                &format!("virsh domstate {name}"),
                &RunOptions {
                    silent: true,
                    warn_only: true,
                },
            )
            .await?;
        Ok(output.succeeded())
    }

    async fn free_cpu(&self) -> VmforgeResult<u32> {
        let total = self
            .count("grep -c ^processor /proc/cpuinfo", "host cpu count")
            .await?;
        // Sum of vcpus allocated to running domains. The subshell prints 0
        // when nothing is running.
        let used = self
            .count(
                "virsh list --name --state-running | sed '/^$/d' | \
                 while read dom; do virsh dominfo \"$dom\" | awk '/^CPU\\(s\\)/ {print $2}'; done | \
                 awk '{s+=$1} END {print s+0}'",
                "allocated vcpu count",
            )
            .await?;
        Ok(total.saturating_sub(used) as u32)
    }

    async fn free_memory_mib(&self) -> VmforgeResult<u64> {
        self.count(
            "awk '/MemAvailable/ {print int($2/1024)}' /proc/meminfo",
            "available memory",
        )
        .await
    }

    async fn define(&self, spec: &DomainSpec) -> VmforgeResult<()> {
        let xml = domain_xml(spec);
        let xml_path = format!("/tmp/{}.xml", spec.name);
        self.host.put(xml.as_bytes(), &xml_path).await?;
        self.host.run(&format!("virsh define {xml_path}")).await?;
        self.host.run(&format!("rm -f {xml_path}")).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> VmforgeResult<()> {
        self.host.run(&format!("virsh start {name}")).await?;
        Ok(())
    }
}

/// Render the libvirt domain definition.
fn domain_xml(spec: &DomainSpec) -> String {
    let interface = match spec.vlan_tag {
        Some(tag) => format!(
            "  <interface type='bridge'>\n    <source bridge='br{tag}'/>\n    <model type='virtio'/>\n  </interface>\n"
        ),
        None => String::from(
            "  <interface type='bridge'>\n    <source bridge='br0'/>\n    <model type='virtio'/>\n  </interface>\n",
        ),
    };

    format!(
        "<domain type='kvm'>\n\
         <name>{name}</name>\n\
         <memory unit='MiB'>{memory}</memory>\n\
         <vcpu>{vcpus}</vcpu>\n\
         <os>\n  <type arch='x86_64'>hvm</type>\n  <boot dev='hd'/>\n</os>\n\
         <devices>\n\
         \x20 <disk type='block' device='disk'>\n\
         \x20   <driver name='qemu' type='raw' cache='none'/>\n\
         \x20   <source dev='{source}'/>\n\
         \x20   <target dev='{target}' bus='virtio'/>\n\
         \x20 </disk>\n\
         {interface}\
         \x20 <console type='pty'/>\n\
         </devices>\n\
         </domain>\n",
        name = spec.name,
        memory = spec.memory_mib,
        vcpus = spec.vcpus,
        source = spec.source_device,
        target = spec.guest_block_device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DomainSpec {
        DomainSpec {
            name: "web01".into(),
            memory_mib: 4096,
            vcpus: 2,
            source_device: "/dev/vg0/web01".into(),
            guest_block_device: "vda".into(),
            vlan_tag: Some(23),
        }
    }

    #[test]
    fn domain_xml_carries_the_assembled_description() {
        let xml = domain_xml(&spec());
        assert!(xml.contains("<name>web01</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<source dev='/dev/vg0/web01'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<source bridge='br23'/>"));
    }

    #[test]
    fn domain_xml_defaults_to_untagged_bridge() {
        let mut spec = spec();
        spec.vlan_tag = None;
        assert!(domain_xml(&spec).contains("<source bridge='br0'/>"));
    }
}

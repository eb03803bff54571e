/// 域 XML 解析
///
/// define 前校验 XML，统计时找出磁盘与网卡目标设备

use common::{Error, Result};

fn parse(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(xml).map_err(|e| Error::InvalidArgument(format!("XML 解析失败: {}", e)))
}

/// 域标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdentity {
    pub name: String,
    pub uuid: Option<String>,
}

/// 解析域 XML 的 name 与 uuid
pub fn domain_identity(xml: &str) -> Result<DomainIdentity> {
    let doc = parse(xml)?;
    let root = doc.root_element();
    if !root.has_tag_name("domain") {
        return Err(Error::InvalidArgument(format!(
            "期望 <domain> 根节点，实际为 <{}>",
            root.tag_name().name()
        )));
    }
    let child_text = |tag: &str| {
        root.children()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    };
    let name = child_text("name").ok_or_else(|| Error::InvalidArgument("域 XML 缺少 name".to_string()))?;
    Ok(DomainIdentity {
        name,
        uuid: child_text("uuid"),
    })
}

/// 设备 XML 的根标签（disk / hostdev / interface ...）
pub fn device_kind(xml: &str) -> Result<String> {
    let doc = parse(xml)?;
    Ok(doc.root_element().tag_name().name().to_string())
}

/// 磁盘目标设备名（vda、vdb ...）
pub fn disk_targets(xml: &str) -> Result<Vec<String>> {
    targets_of(xml, "disk", |n| n.attribute("device").map_or(true, |d| d == "disk"))
}

/// 网卡目标设备名（vnet0 ...），未运行的域没有
pub fn interface_targets(xml: &str) -> Result<Vec<String>> {
    targets_of(xml, "interface", |_| true)
}

fn targets_of(xml: &str, tag: &str, keep: impl Fn(&roxmltree::Node) -> bool) -> Result<Vec<String>> {
    let doc = parse(xml)?;
    let targets = doc
        .descendants()
        .filter(|n| n.has_tag_name(tag) && keep(n))
        .filter_map(|n| {
            n.children()
                .find(|c| c.has_tag_name("target"))
                .and_then(|t| t.attribute("dev"))
                .map(str::to_string)
        })
        .collect();
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm'>
  <name>vm-a</name>
  <uuid>2f6c0e36c5f54f0e9a0c1b1d8e7a1234</uuid>
  <devices>
    <disk type='network' device='disk'>
      <source protocol='rbd' name='vm/2f6c0e36c5f54f0e9a0c1b1d8e7a1234'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='hda' bus='ide'/>
    </disk>
    <disk type='network' device='disk'>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:0a:00:05'/>
      <target dev='vnet3'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_domain_identity() {
        let id = domain_identity(DOMAIN).unwrap();
        assert_eq!(id.name, "vm-a");
        assert_eq!(id.uuid.as_deref(), Some("2f6c0e36c5f54f0e9a0c1b1d8e7a1234"));

        let id = domain_identity("<domain><name> b </name></domain>").unwrap();
        assert_eq!(id.name, "b");
        assert!(id.uuid.is_none());
    }

    #[test]
    fn test_domain_identity_rejects_bad_xml() {
        assert!(matches!(domain_identity("<domain>"), Err(Error::InvalidArgument(_))));
        assert!(matches!(domain_identity("<disk/>"), Err(Error::InvalidArgument(_))));
        assert!(matches!(domain_identity("<domain><uuid>x</uuid></domain>"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_targets() {
        assert_eq!(disk_targets(DOMAIN).unwrap(), vec!["vda", "vdb"]);
        assert_eq!(interface_targets(DOMAIN).unwrap(), vec!["vnet3"]);
        assert_eq!(device_kind("<hostdev mode='subsystem' type='pci'/>").unwrap(), "hostdev");
    }
}

/// 虚拟机 XML 生成与编辑
///
/// 模板占位符替换生成初始定义；编辑基于 roxmltree 解析出的节点区间做文本替换

use std::ops::Range;

use crate::db::models::center::Center;
use crate::errors::{CloudError, Result};

/// 模板渲染参数
pub struct DomainTemplate<'a> {
    pub name: &'a str,
    pub uuid: &'a str,
    /// 内存（MiB）
    pub mem_mib: i64,
    pub vcpu: i32,
    /// 系统盘镜像名
    pub disk: &'a str,
    pub mac: &'a str,
    pub bridge: &'a str,
}

fn parse(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(xml).map_err(|e| CloudError::Internal(format!("虚拟机 XML 无效: {}", e)))
}

/// 按区间替换，区间之间不能重叠
fn apply_edits(xml: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    let mut out = xml.to_string();
    for (range, text) in edits {
        out.replace_range(range, &text);
    }
    out
}

/// 渲染镜像 XML 模板
///
/// 数据中心未启用 ceph 认证时删除 `<auth>` 元素
pub fn render_domain(tpl: &str, t: &DomainTemplate<'_>, center: &Center) -> Result<String> {
    let xml = tpl
        .replace("{name}", t.name)
        .replace("{uuid}", t.uuid)
        .replace("{mem}", &t.mem_mib.to_string())
        .replace("{vcpu}", &t.vcpu.to_string())
        .replace("{ceph_uuid}", &center.ceph_uuid)
        .replace("{ceph_pool}", &center.ceph_pool)
        .replace("{diskname}", t.disk)
        .replace("{ceph_username}", &center.ceph_username)
        .replace("{ceph_hosts_xml}", &center.ceph_hosts_xml)
        .replace("{mac}", t.mac)
        .replace("{bridge}", t.bridge);

    let xml = if center.ceph_has_auth {
        xml
    } else {
        remove_elements(&xml, "auth")?
    };

    parse(&xml)?;
    Ok(xml)
}

/// 删除所有指定名称的元素
pub fn remove_elements(xml: &str, tag: &str) -> Result<String> {
    let edits: Vec<_> = {
        let doc = parse(xml)?;
        doc.descendants()
            .filter(|n| n.has_tag_name(tag))
            .map(|n| (n.range(), String::new()))
            .collect()
    };
    Ok(apply_edits(xml, edits))
}

/// 修改 vcpu、memory、currentMemory（MiB）
pub fn set_vcpu_mem(xml: &str, vcpu: i32, mem_mib: i64) -> Result<String> {
    let doc = parse(xml)?;
    let root = doc.root_element();
    let mut edits = Vec::new();
    let mut has_vcpu = false;

    for node in root.children().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "vcpu" => {
                has_vcpu = true;
                let attrs: String = node
                    .attributes()
                    .map(|a| format!(" {}='{}'", a.name(), a.value()))
                    .collect();
                edits.push((node.range(), format!("<vcpu{}>{}</vcpu>", attrs, vcpu)));
            }
            "memory" | "currentMemory" => {
                let tag = node.tag_name().name();
                edits.push((node.range(), format!("<{tag} unit='MiB'>{mem_mib}</{tag}>")));
            }
            _ => {}
        }
    }

    if !has_vcpu {
        return Err(CloudError::Internal("虚拟机 XML 缺少 vcpu 元素".to_string()));
    }
    Ok(apply_edits(xml, edits))
}

/// 列出所有磁盘的目标设备名（vda、vdb ...）
pub fn disk_targets(xml: &str) -> Result<Vec<String>> {
    let doc = parse(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name("disk"))
        .filter_map(|disk| {
            disk.children()
                .find(|c| c.has_tag_name("target"))
                .and_then(|t| t.attribute("dev"))
                .map(str::to_string)
        })
        .collect())
}

/// 根元素下的 uuid
pub fn domain_uuid(xml: &str) -> Result<String> {
    let doc = parse(xml)?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("uuid"))
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| CloudError::Internal("虚拟机 XML 缺少 uuid".to_string()))
}

/// 云硬盘 XML
pub fn vdisk_xml(center: &Center, vdisk_uuid: &str, dev: &str) -> String {
    let auth = if center.ceph_has_auth {
        format!(
            "<auth username='{}'><secret type='ceph' uuid='{}'/></auth>",
            center.ceph_username, center.ceph_uuid
        )
    } else {
        String::new()
    };
    format!(
        "<disk type='network' device='disk'>\
<driver name='qemu' type='raw' cache='none'/>{auth}\
<source protocol='rbd' name='{pool}/{uuid}'>{hosts}</source>\
<target dev='{dev}' bus='virtio'/>\
</disk>",
        auth = auth,
        pool = center.ceph_pool,
        uuid = vdisk_uuid,
        hosts = center.ceph_hosts_xml,
        dev = dev,
    )
}

/// PCI 直通设备 XML，地址格式 domain:bus:slot:function（function 前也可用 '.'）
pub fn pci_hostdev_xml(address: &str) -> Result<String> {
    let parts: Vec<&str> = address.split([':', '.']).collect();
    let valid = parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && u32::from_str_radix(p, 16).is_ok());
    if !valid {
        return Err(CloudError::bad_request(format!("无效的 PCI 地址: {}", address)));
    }
    Ok(format!(
        "<hostdev mode='subsystem' type='pci' managed='yes'><source>\
<address domain='0x{}' bus='0x{}' slot='0x{}' function='0x{}'/>\
</source></hostdev>",
        parts[0], parts[1], parts[2], parts[3]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{center_model, XML_TPL};

    fn tpl() -> DomainTemplate<'static> {
        DomainTemplate {
            name: "abc",
            uuid: "abc",
            mem_mib: 2048,
            vcpu: 2,
            disk: "abc",
            mac: "52:54:00:00:00:01",
            bridge: "br0",
        }
    }

    #[test]
    fn test_render_with_and_without_auth() {
        let mut center = center_model();
        center.ceph_has_auth = true;
        let xml = render_domain(XML_TPL, &tpl(), &center).unwrap();
        assert!(xml.contains("<auth username='admin'>"));
        assert!(xml.contains("name='vm_pool/abc'"));
        assert!(xml.contains("<mac address='52:54:00:00:00:01'/>"));

        center.ceph_has_auth = false;
        let xml = render_domain(XML_TPL, &tpl(), &center).unwrap();
        assert!(!xml.contains("<auth"));
        assert_eq!(domain_uuid(&xml).unwrap(), "abc");
    }

    #[test]
    fn test_set_vcpu_mem() {
        let xml = render_domain(XML_TPL, &tpl(), &center_model()).unwrap();
        let edited = set_vcpu_mem(&xml, 8, 16384).unwrap();
        assert!(edited.contains("<vcpu placement='static'>8</vcpu>"));
        assert!(edited.contains("<memory unit='MiB'>16384</memory>"));
        assert!(edited.contains("<currentMemory unit='MiB'>16384</currentMemory>"));
        assert!(!edited.contains(">2048<"));
    }

    #[test]
    fn test_disk_targets() {
        let center = center_model();
        let xml = render_domain(XML_TPL, &tpl(), &center).unwrap();
        assert_eq!(disk_targets(&xml).unwrap(), vec!["vda"]);

        let disk = vdisk_xml(&center, "d1", "vdc");
        let with_disk = xml.replace("</devices>", &format!("{}</devices>", disk));
        assert_eq!(disk_targets(&with_disk).unwrap(), vec!["vda", "vdc"]);
    }

    #[test]
    fn test_pci_hostdev_xml() {
        let xml = pci_hostdev_xml("0000:84:00.0").unwrap();
        assert!(xml.contains("domain='0x0000' bus='0x84' slot='0x00' function='0x0'"));
        assert!(pci_hostdev_xml("0000:84:00:1").is_ok());
        assert!(pci_hostdev_xml("84:00.0").is_err());
        assert!(pci_hostdev_xml("zz:84:00:0").is_err());
    }
}

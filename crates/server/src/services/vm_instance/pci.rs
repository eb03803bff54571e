/// PCI 设备直通
///
/// 挂载与卸载都要求虚拟机已关机，设备固定在所在宿主机上

use tracing::info;

use super::VmInstance;
use crate::db::models::host::Host;
use crate::db::models::pci_device::PciDevice;
use crate::db::models::vm_log::LogAbout;
use crate::errors::{DeviceError, Result};
use crate::services::access::{self, UserContext};
use crate::services::device;

impl VmInstance {
    pub async fn mount_pci(&self, user: &UserContext, uuid: &str, pci_id: i32) -> Result<PciDevice> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        let dev = device::get_pci(&self.ctx.db, pci_id).await?;
        if !dev.enable {
            return Err(DeviceError::NotActive(format!("PCI 设备({})未启用", dev.address)).into());
        }
        if dev.host_id != host.id {
            return Err(DeviceError::NotFound(format!(
                "宿主机({})上没有 PCI 设备({})",
                host.ipv4, dev.address
            ))
            .into());
        }
        if !access::group_has_user(&self.ctx.db, host.group_id, user).await? {
            return Err(DeviceError::AccessDenied(format!("无权使用 PCI 设备({})", dev.address)).into());
        }
        match dev.vm_uuid.as_deref() {
            Some(v) if v == uuid => return Ok(dev),
            Some(v) => {
                return Err(DeviceError::NotActive(format!("PCI 设备({})已被虚拟机({})占用", dev.address, v)).into());
            }
            None => {}
        }
        let xml = device::pci_xml_fragment(&dev)?;
        self.ensure_powered_off(&host, uuid).await?;

        device::pci_mount_meta(&self.ctx.db, dev.id, uuid).await?;
        if let Err(e) = self.ctx.hypervisor.attach_device(&host, uuid, &xml).await {
            if let Err(me) = device::pci_umount_meta(&self.ctx.db, dev.id).await {
                self.ctx
                    .vm_log()
                    .write(
                        "PCI 设备元数据回滚失败",
                        LogAbout::Unknown,
                        &format!("vm={}, pci={}: {}", uuid, dev.address, me),
                    )
                    .await;
            }
            return Err(e.into());
        }

        self.refresh_xml(&host, uuid).await;
        info!("🔌 PCI 设备 {} 已挂载到 {}", dev.address, uuid);
        device::get_pci(&self.ctx.db, pci_id).await
    }

    pub async fn umount_pci(&self, user: &UserContext, pci_id: i32) -> Result<PciDevice> {
        let dev = device::get_pci(&self.ctx.db, pci_id).await?;
        let Some(vm_uuid) = dev.vm_uuid.clone() else {
            return Ok(dev);
        };
        let vm = self.get_owned_vm(user, &vm_uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        self.ensure_powered_off(&host, &vm_uuid).await?;
        self.detach_pci(&host, &vm_uuid, &dev).await?;
        self.refresh_xml(&host, &vm_uuid).await;
        device::get_pci(&self.ctx.db, pci_id).await
    }

    /// 从虚拟机上卸下设备并清除挂载记录，记录清除失败时重新挂上
    pub(super) async fn detach_pci(&self, host: &Host, vm_uuid: &str, dev: &PciDevice) -> Result<()> {
        let xml = device::pci_xml_fragment(dev)?;
        self.ctx.hypervisor.detach_device(host, vm_uuid, &xml).await?;
        if let Err(e) = device::pci_umount_meta(&self.ctx.db, dev.id).await {
            if let Err(ae) = self.ctx.hypervisor.attach_device(host, vm_uuid, &xml).await {
                self.ctx
                    .vm_log()
                    .write(
                        "PCI 设备重新挂载失败",
                        LogAbout::Unknown,
                        &format!("vm={}, pci={}: {}", vm_uuid, dev.address, ae),
                    )
                    .await;
            }
            return Err(e);
        }
        info!("PCI 设备 {} 已从 {} 卸载", dev.address, vm_uuid);
        Ok(())
    }

    /// 虚拟机重新定义后按挂载记录恢复 PCI 设备，失败的清除记录
    pub(super) async fn reattach_pci(&self, host: &Host, vm_uuid: &str) -> Result<()> {
        for dev in device::vm_pci_devices(&self.ctx.db, vm_uuid).await? {
            let attached = match device::pci_xml_fragment(&dev) {
                Ok(xml) => self.ctx.hypervisor.attach_device(host, vm_uuid, &xml).await.map_err(Into::into),
                Err(e) => Err(e),
            };
            if let Err(e) = attached {
                let msg = format!("PCI 设备({})挂载到虚拟机({})失败: {}", dev.address, vm_uuid, e);
                if let Err(me) = device::pci_umount_meta(&self.ctx.db, dev.id).await {
                    self.ctx
                        .vm_log()
                        .write("PCI 设备元数据卸载失败", LogAbout::Unknown, &format!("{}; {}", msg, me))
                        .await;
                }
                self.ctx.vm_log().write("重新挂载 PCI 设备失败", LogAbout::Unknown, &msg).await;
            }
        }
        Ok(())
    }
}

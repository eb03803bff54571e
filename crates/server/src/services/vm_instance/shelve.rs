/// 搁置
///
/// 删除宿主机上的定义并归还宿主机资源与 IP，系统盘与云硬盘保留

use sea_orm::{ActiveModelTrait, IntoActiveModel, Set};
use tracing::info;

use super::VmInstance;
use crate::db::models::pci_device::PciKind;
use crate::db::models::vm::{Vm, VmStatus};
use crate::db::models::vm_log::LogAbout;
use crate::errors::{CloudError, Result, VmError};
use crate::services::access::UserContext;
use crate::services::device;

impl VmInstance {
    pub async fn shelve(&self, user: &UserContext, uuid: &str) -> Result<Vm> {
        let vm = self.get_owned_vm(user, uuid).await?;
        if vm.is_shelved() {
            return Err(CloudError::bad_request(format!("虚拟机({})已搁置", uuid)));
        }
        if vm.is_local_disk() {
            return Err(VmError::Unsupported(format!("虚拟机({})使用本地系统盘，不能搁置", uuid)).into());
        }
        let host = self.ctx.vm_host(&vm).await?;
        self.ensure_powered_off(&host, uuid).await?;

        let pci_devices = device::vm_pci_devices(&self.ctx.db, uuid).await?;
        if let Some(dev) = pci_devices.iter().find(|d| d.pci_kind() == PciKind::Other) {
            return Err(VmError::Unsupported(format!("PCI 设备({})类型不支持自动卸载", dev.address)).into());
        }
        for dev in &pci_devices {
            self.detach_pci(&host, uuid, dev).await?;
        }

        self.ctx.hypervisor.undefine(&host, uuid).await?;

        let last_ip = match vm.mac_ip_id {
            Some(id) => Some(self.ctx.get_mac_ip(id).await?.ipv4),
            None => vm.last_ip.clone(),
        };
        let mut active = vm.clone().into_active_model();
        active.host_id = Set(None);
        active.mac_ip_id = Set(None);
        active.last_ip = Set(last_ip);
        active.status = Set(VmStatus::Shelve.as_str().to_string());
        let saved = active.update(&self.ctx.db).await?;

        let ledger = self.ctx.ledger();
        let log = self.ctx.vm_log();
        if let Some(id) = vm.mac_ip_id {
            if let Err(e) = ledger.release_ip(id).await {
                log.write("释放IP失败", LogAbout::MacIp, &format!("vm={}, mac_ip_id={}: {}", uuid, id, e))
                    .await;
            }
        }
        if let Err(e) = ledger.free(host.id, vm.vcpu, vm.mem, false).await {
            log.write(
                "释放宿主机资源失败",
                LogAbout::HostCpuMem,
                &format!("host={}, vcpu={}, mem={}MiB: {}", host.ipv4, vm.vcpu, vm.mem, e),
            )
            .await;
        }
        if let Err(e) = ledger.vm_created_add(host.id, -1).await {
            log.write(
                "宿主机虚拟机数量减1失败",
                LogAbout::HostVmCreated,
                &format!("host={}, vm={}: {}", host.ipv4, uuid, e),
            )
            .await;
        }

        info!("📦 虚拟机已搁置: {} (last_ip={:?})", uuid, saved.last_ip);
        Ok(saved)
    }
}

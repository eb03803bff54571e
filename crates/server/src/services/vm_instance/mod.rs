/// 虚拟机实例操作
///
/// 电源、状态、删除、修改配置等；磁盘、PCI 设备与搁置操作分别在子模块中

mod disk;
mod pci;
mod shelve;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, Set, TryIntoModel};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::access::UserContext;
use super::context::CloudContext;
use super::device;
use super::domain_xml;
use crate::db::models::center::Center;
use crate::db::models::host::Host;
use crate::db::models::vm::{self, Vm};
use crate::db::models::vm_archive;
use crate::db::models::vm_disk_snap;
use crate::db::models::vm_log::LogAbout;
use crate::errors::{CloudError, HypervisorError, Result, VmError};
use crate::storage::PoolRef;
use common::DomainState;

/// 可通过 `operate` 执行的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmOperation {
    Start,
    Reboot,
    Shutdown,
    Poweroff,
    Delete,
    DeleteForce,
}

pub struct VmInstance {
    ctx: CloudContext,
}

impl VmInstance {
    pub fn new(ctx: CloudContext) -> Self {
        Self { ctx }
    }

    /// 获取虚拟机并检查归属
    pub async fn get_owned_vm(&self, user: &UserContext, uuid: &str) -> Result<Vm> {
        let vm = self.ctx.get_vm(uuid).await?;
        if !user.owns(vm.user_id) {
            return Err(VmError::AccessDenied(format!("无权访问虚拟机({})", uuid)).into());
        }
        Ok(vm)
    }

    /// 要求虚拟机已关机；域不存在视为未运行
    async fn ensure_powered_off(&self, host: &Host, uuid: &str) -> Result<()> {
        match self.ctx.hypervisor.status(host, uuid).await? {
            DomainState::HostUnreachable => Err(HypervisorError::HostUnreachable(format!(
                "宿主机({})无法连接",
                host.ipv4
            ))
            .into()),
            s if s.is_running() => Err(VmError::Running(format!("虚拟机({})正在运行，请先关机", uuid)).into()),
            _ => Ok(()),
        }
    }

    /// 运行中时强制断电
    async fn power_off_if_running(&self, host: &Host, uuid: &str) -> Result<()> {
        match self.ctx.hypervisor.status(host, uuid).await? {
            DomainState::HostUnreachable => Err(HypervisorError::HostUnreachable(format!(
                "宿主机({})无法连接",
                host.ipv4
            ))
            .into()),
            s if s.is_running() => {
                self.ctx.hypervisor.poweroff(host, uuid).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// 从宿主机读取持久化 XML 更新元数据，失败只记录日志
    async fn refresh_xml(&self, host: &Host, uuid: &str) {
        let xml = match self.ctx.hypervisor.xml_desc(host, uuid, false).await {
            Ok(x) => x,
            Err(e) => {
                warn!("获取虚拟机({}) XML 失败: {}", uuid, e);
                return;
            }
        };
        let res = vm::Entity::update_many()
            .col_expr(vm::Column::Xml, Expr::value(xml))
            .filter(vm::Column::Uuid.eq(uuid))
            .exec(&self.ctx.db)
            .await;
        if let Err(e) = res {
            warn!("更新虚拟机({}) XML 失败: {}", uuid, e);
        }
    }

    pub async fn start(&self, user: &UserContext, uuid: &str) -> Result<bool> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        let changed = self.ctx.hypervisor.start(&host, uuid).await?;
        info!("▶️ 启动虚拟机: {} (changed={})", uuid, changed);
        Ok(changed)
    }

    pub async fn reboot(&self, user: &UserContext, uuid: &str) -> Result<bool> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        Ok(self.ctx.hypervisor.reboot(&host, uuid).await?)
    }

    pub async fn shutdown(&self, user: &UserContext, uuid: &str) -> Result<bool> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        Ok(self.ctx.hypervisor.shutdown(&host, uuid).await?)
    }

    pub async fn poweroff(&self, user: &UserContext, uuid: &str) -> Result<bool> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        Ok(self.ctx.hypervisor.poweroff(&host, uuid).await?)
    }

    /// 查询运行状态，搁置的虚拟机返回 NoState
    pub async fn status(&self, user: &UserContext, uuid: &str) -> Result<DomainState> {
        let vm = self.get_owned_vm(user, uuid).await?;
        if vm.is_shelved() {
            return Ok(DomainState::NoState);
        }
        let host = self.ctx.vm_host(&vm).await?;
        Ok(self.ctx.hypervisor.status(&host, uuid).await?)
    }

    pub async fn stats(&self, user: &UserContext, uuid: &str) -> Result<common::DomainStats> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        Ok(self.ctx.hypervisor.stats(&host, uuid).await?)
    }

    pub async fn operate(&self, user: &UserContext, uuid: &str, op: VmOperation) -> Result<bool> {
        match op {
            VmOperation::Start => self.start(user, uuid).await,
            VmOperation::Reboot => self.reboot(user, uuid).await,
            VmOperation::Shutdown => self.shutdown(user, uuid).await,
            VmOperation::Poweroff => self.poweroff(user, uuid).await,
            VmOperation::Delete => self.delete(user, uuid, false).await.map(|_| true),
            VmOperation::DeleteForce => self.delete(user, uuid, true).await.map(|_| true),
        }
    }

    pub async fn modify_remarks(&self, user: &UserContext, uuid: &str, remarks: &str) -> Result<Vm> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let mut active = vm.into_active_model();
        active.remarks = Set(remarks.to_string());
        Ok(active.update(&self.ctx.db).await?)
    }

    /// 删除虚拟机
    ///
    /// 归档后删除宿主机上的定义与元数据，随后尽力释放 IP、云硬盘、PCI 设备与宿主机资源
    pub async fn delete(&self, user: &UserContext, uuid: &str, force: bool) -> Result<()> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = match vm.host_id {
            Some(id) => Some(self.ctx.get_host(id).await?),
            None => None,
        };

        if let Some(host) = &host {
            match self.ctx.hypervisor.status(host, uuid).await? {
                DomainState::HostUnreachable if !force => {
                    return Err(HypervisorError::HostUnreachable(format!(
                        "宿主机({})无法连接，无法确认虚拟机已关机",
                        host.ipv4
                    ))
                    .into());
                }
                DomainState::HostUnreachable => {
                    warn!("宿主机({})不可达，强制删除虚拟机 {}", host.ipv4, uuid);
                }
                s if s.is_running() => {
                    if !force {
                        return Err(VmError::Running(format!("虚拟机({})正在运行，请先关机", uuid)).into());
                    }
                    self.ctx.hypervisor.poweroff(host, uuid).await?;
                }
                _ => {}
            }
        }

        let (center, pool) = self.ctx.vm_pool(&vm).await?;
        self.remove_all_snaps(&vm, &pool).await?;

        let archive = self.archive(&vm, host.as_ref(), &center).await?;

        if let Some(host) = &host {
            match self.ctx.hypervisor.undefine(host, uuid).await {
                Ok(()) => {}
                Err(HypervisorError::HostUnreachable(msg)) => {
                    warn!("宿主机不可达，虚拟机定义未删除: {}", msg);
                    let mut active = archive.clone().into_active_model();
                    active.host_released = Set(false);
                    active.update(&self.ctx.db).await?;
                }
                Err(e) => {
                    if let Err(de) = vm_archive::Entity::delete_by_id(archive.id).exec(&self.ctx.db).await {
                        warn!("删除归档记录失败: {}", de);
                    }
                    return Err(e.into());
                }
            }
        }

        vm::Entity::delete_by_id(uuid.to_string()).exec(&self.ctx.db).await?;
        info!("🗑️ 虚拟机已删除: {}", uuid);

        self.cleanup_after_delete(&vm, host.as_ref()).await;
        Ok(())
    }

    /// 删除后的资源释放，失败写运维日志
    async fn cleanup_after_delete(&self, vm: &Vm, host: Option<&Host>) {
        let ledger = self.ctx.ledger();
        let log = self.ctx.vm_log();

        if let Some(host) = host {
            if let Err(e) = ledger.vm_created_add(host.id, -1).await {
                log.write(
                    "宿主机虚拟机数量减1失败",
                    LogAbout::HostVmCreated,
                    &format!("host={}, vm={}: {}", host.ipv4, vm.uuid, e),
                )
                .await;
            }
        }

        if let Some(mac_ip_id) = vm.mac_ip_id {
            if let Err(e) = ledger.release_ip(mac_ip_id).await {
                log.write(
                    "释放IP失败",
                    LogAbout::MacIp,
                    &format!("vm={}, mac_ip_id={}: {}", vm.uuid, mac_ip_id, e),
                )
                .await;
            }
        }

        match device::vm_vdisks(&self.ctx.db, &vm.uuid).await {
            Ok(disks) => {
                for disk in disks {
                    if let Err(e) = device::vdisk_umount_meta(&self.ctx.db, &disk.uuid).await {
                        log.write(
                            "卸载云硬盘元数据失败",
                            LogAbout::VmDisk,
                            &format!("vm={}, vdisk={}: {}", vm.uuid, disk.uuid, e),
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                log.write("查询云硬盘失败", LogAbout::VmDisk, &format!("vm={}: {}", vm.uuid, e))
                    .await;
            }
        }

        match device::vm_pci_devices(&self.ctx.db, &vm.uuid).await {
            Ok(devs) => {
                for dev in devs {
                    if let Err(e) = device::pci_umount_meta(&self.ctx.db, dev.id).await {
                        log.write(
                            "卸载PCI设备元数据失败",
                            LogAbout::Unknown,
                            &format!("vm={}, pci={}: {}", vm.uuid, dev.address, e),
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                log.write("查询PCI设备失败", LogAbout::Unknown, &format!("vm={}: {}", vm.uuid, e))
                    .await;
            }
        }

        if let Some(host) = host {
            if let Err(e) = ledger.free(host.id, vm.vcpu, vm.mem, false).await {
                log.write(
                    "释放宿主机资源失败",
                    LogAbout::HostCpuMem,
                    &format!("host={}, vcpu={}, mem={}MiB: {}", host.ipv4, vm.vcpu, vm.mem, e),
                )
                .await;
            }
        }
    }

    /// 删除系统盘的全部快照
    async fn remove_all_snaps(&self, vm: &Vm, pool: &PoolRef) -> Result<()> {
        let snaps = vm_disk_snap::Entity::find()
            .filter(vm_disk_snap::Column::VmUuid.eq(vm.uuid.as_str()))
            .all(&self.ctx.db)
            .await?;
        for snap in snaps {
            self.ctx.storage.remove_snapshot(pool, &snap.disk, &snap.snap).await?;
            vm_disk_snap::Entity::delete_by_id(snap.id).exec(&self.ctx.db).await?;
        }
        Ok(())
    }

    /// 归档，已有同 uuid 的归档时覆盖
    async fn archive(&self, vm: &Vm, host: Option<&Host>, center: &Center) -> Result<vm_archive::Model> {
        let image = self.ctx.get_image(vm.image_id).await?;
        let (mac, ipv4, vlan_id, br) = match vm.mac_ip_id {
            Some(id) => {
                let ip = self.ctx.get_mac_ip(id).await?;
                let v = self.ctx.get_vlan(ip.vlan_id).await?;
                (ip.mac, ip.ipv4, Some(v.id), v.br)
            }
            None => (String::new(), vm.last_ip.clone().unwrap_or_default(), None, String::new()),
        };
        let (group_id, group_name) = match host {
            Some(h) => {
                let g = self.ctx.get_group(h.group_id).await?;
                (Some(g.id), g.name)
            }
            None => (None, String::new()),
        };

        let existing = vm_archive::Entity::find()
            .filter(vm_archive::Column::Uuid.eq(vm.uuid.as_str()))
            .one(&self.ctx.db)
            .await?;
        let mut active = match existing {
            Some(a) => a.into_active_model(),
            None => vm_archive::ActiveModel {
                uuid: Set(vm.uuid.clone()),
                ..Default::default()
            },
        };
        active.name = Set(vm.name.clone());
        active.vcpu = Set(vm.vcpu);
        active.mem = Set(vm.mem);
        active.disk = Set(vm.disk.clone());
        active.sys_disk_size = Set(vm.sys_disk_size);
        active.image_id = Set(vm.image_id);
        active.image_parent = Set(image.base_image.clone());
        active.mac = Set(mac);
        active.ipv4 = Set(ipv4);
        active.vlan_id = Set(vlan_id);
        active.br = Set(br);
        active.xml = Set(vm.xml.clone());
        active.ceph_id = Set(Some(center.ceph_id));
        active.ceph_pool = Set(center.ceph_pool.clone());
        active.center_id = Set(Some(center.id));
        active.center_name = Set(center.name.clone());
        active.group_id = Set(group_id);
        active.group_name = Set(group_name);
        active.host_id = Set(host.map(|h| h.id));
        active.host_ipv4 = Set(host.map(|h| h.ipv4.clone()).unwrap_or_default());
        active.user_id = Set(vm.user_id);
        active.remarks = Set(vm.remarks.clone());
        active.host_released = Set(true);
        active.create_time = Set(vm.create_time);
        active.archive_time = Set(Utc::now().into());

        Ok(active.save(&self.ctx.db).await?.try_into_model()?)
    }

    /// 修改 vCPU 与内存
    pub async fn edit_vcpu_mem(
        &self,
        user: &UserContext,
        uuid: &str,
        vcpu: Option<i32>,
        mem: Option<i64>,
        force: bool,
    ) -> Result<Vm> {
        if vcpu.is_some_and(|v| v <= 0) || mem.is_some_and(|m| m <= 0) {
            return Err(CloudError::bad_request("vCPU 和内存必须大于 0"));
        }
        let vm = self.get_owned_vm(user, uuid).await?;
        let new_vcpu = vcpu.unwrap_or(vm.vcpu);
        let new_mem = mem.unwrap_or(vm.mem);
        if new_vcpu == vm.vcpu && new_mem == vm.mem {
            return Ok(vm);
        }

        if vm.is_shelved() {
            let mut active = vm.clone().into_active_model();
            active.vcpu = Set(new_vcpu);
            active.mem = Set(new_mem);
            active.xml = Set(domain_xml::set_vcpu_mem(&vm.xml, new_vcpu, new_mem)?);
            return Ok(active.update(&self.ctx.db).await?);
        }

        let host = self.ctx.vm_host(&vm).await?;
        if force {
            self.power_off_if_running(&host, uuid).await?;
        } else {
            self.ensure_powered_off(&host, uuid).await?;
        }

        let base_xml = match self.ctx.hypervisor.xml_desc(&host, uuid, false).await {
            Ok(x) => x,
            Err(e) => {
                warn!("获取虚拟机({})持久化 XML 失败，使用元数据中的 XML: {}", uuid, e);
                vm.xml.clone()
            }
        };
        let new_xml = domain_xml::set_vcpu_mem(&base_xml, new_vcpu, new_mem)?;

        let dvcpu = new_vcpu - vm.vcpu;
        let dmem = new_mem - vm.mem;
        let ledger = self.ctx.ledger();
        ledger.deduct_delta(host.id, dvcpu, dmem).await?;

        if let Err(e) = self.ctx.hypervisor.define(&host, &new_xml).await {
            self.reverse_delta(&host, dvcpu, dmem).await;
            return Err(e.into());
        }

        let mut active = vm.clone().into_active_model();
        active.vcpu = Set(new_vcpu);
        active.mem = Set(new_mem);
        active.xml = Set(new_xml);
        match active.update(&self.ctx.db).await {
            Ok(saved) => {
                info!("虚拟机 {} 配置已修改: vcpu {}→{}, mem {}→{}MiB", uuid, vm.vcpu, new_vcpu, vm.mem, new_mem);
                Ok(saved)
            }
            Err(e) => {
                self.reverse_delta(&host, dvcpu, dmem).await;
                if let Err(de) = self.ctx.hypervisor.define(&host, &base_xml).await {
                    self.ctx
                        .vm_log()
                        .write(
                            "恢复虚拟机定义失败",
                            LogAbout::VmMetadata,
                            &format!("vm={}: {}", uuid, de),
                        )
                        .await;
                }
                Err(e.into())
            }
        }
    }

    async fn reverse_delta(&self, host: &Host, dvcpu: i32, dmem: i64) {
        if let Err(e) = self.ctx.ledger().deduct_delta(host.id, -dvcpu, -dmem).await {
            self.ctx
                .vm_log()
                .write(
                    "回滚宿主机资源增量失败",
                    LogAbout::HostCpuMem,
                    &format!("host={}, dvcpu={}, dmem={}MiB: {}", host.ipv4, -dvcpu, -dmem, e),
                )
                .await;
        }
    }

    /// 通过 guest agent 修改系统用户密码
    pub async fn change_password(
        &self,
        user: &UserContext,
        uuid: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if username.is_empty() || password.is_empty() {
            return Err(CloudError::bad_request("用户名和密码不能为空"));
        }
        let vm = self.get_owned_vm(user, uuid).await?;
        let image = self.ctx.get_image(vm.image_id).await?;
        if !image.supports_password_change() {
            return Err(VmError::Unsupported(format!("{} 系统不支持修改密码", image.sys_type)).into());
        }
        let host = self.ctx.vm_host(&vm).await?;
        if !self.ctx.hypervisor.status(&host, uuid).await?.is_running() {
            return Err(CloudError::bad_request(format!("虚拟机({})未运行", uuid)));
        }
        self.ctx
            .hypervisor
            .set_user_password(&host, uuid, username, password)
            .await?;
        info!("虚拟机 {} 用户 {} 密码已修改", uuid, username);
        Ok(())
    }
}

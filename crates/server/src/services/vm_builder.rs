/// 虚拟机创建
///
/// 调度 → 克隆系统盘 → 生成 XML → 保存元数据 → 定义虚拟机。
/// 任一步失败都按 释放宿主机资源、释放 IP、删除系统盘 的顺序回滚

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, Set};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::access::{self, UserContext};
use super::context::CloudContext;
use super::device;
use super::domain_xml::{self, DomainTemplate};
use super::scheduler::{ScheduleRequest, Scheduler};
use crate::db::models::center::Center;
use crate::db::models::host::Host;
use crate::db::models::image::Image;
use crate::db::models::mac_ip::{self, MacIp};
use crate::db::models::vm::{self, Vm, VmStatus, DISK_TYPE_CEPH};
use crate::db::models::vm_log::LogAbout;
use crate::errors::{CloudError, Result, ScheduleError, StorageError, VmError};
use crate::storage::PoolRef;

/// 系统盘最大容量（GiB）
pub const MAX_SYS_DISK_GB: i32 = 5120;

/// 创建虚拟机请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateVmRequest {
    pub vcpu: i32,
    /// 内存（MiB）
    pub mem: i64,
    pub image_id: i32,
    pub center_id: Option<i32>,
    pub group_id: Option<i32>,
    pub host_id: Option<i32>,
    pub vlan_id: Option<i32>,
    pub ipv4: Option<String>,
    pub ip_public: Option<bool>,
    /// 系统盘大小（GiB），默认与镜像一致
    pub sys_disk_size: Option<i32>,
    #[serde(default)]
    pub remarks: String,
}

/// 解析后的放置范围
struct Placement {
    center: Center,
    /// 已确定的宿主机组
    group_id: Option<i32>,
    host_id: Option<i32>,
    /// 可供调度的宿主机组
    group_ids: Vec<i32>,
}

/// 已申请、需要在失败时归还的资源
pub(crate) struct Claimed<'a> {
    pub host_id: i32,
    pub vcpu: i32,
    pub mem: i64,
    pub mac_ip_id: i32,
    pub disk: Option<(&'a PoolRef, &'a str)>,
}

/// 按 宿主机资源 → IP → 系统盘 的顺序归还，失败写运维日志
///
/// 宿主机资源由调度占用了虚拟机名额，一并归还
pub(crate) async fn rollback_claimed(ctx: &CloudContext, claimed: &Claimed<'_>) {
    let ledger = ctx.ledger();
    if let Err(e) = ledger.free(claimed.host_id, claimed.vcpu, claimed.mem, true).await {
        ctx.vm_log()
            .write(
                "回滚释放宿主机资源失败",
                LogAbout::HostCpuMem,
                &format!(
                    "host_id={}, vcpu={}, mem={}MiB: {}",
                    claimed.host_id, claimed.vcpu, claimed.mem, e
                ),
            )
            .await;
    }
    if let Err(e) = ledger.release_ip(claimed.mac_ip_id).await {
        ctx.vm_log()
            .write(
                "回滚释放IP失败",
                LogAbout::MacIp,
                &format!("mac_ip_id={}: {}", claimed.mac_ip_id, e),
            )
            .await;
    }
    if let Some((pool, disk)) = claimed.disk {
        if let Err(e) = ctx.storage.remove(pool, disk).await {
            ctx.vm_log()
                .write("回滚删除系统盘失败", LogAbout::VmDisk, &format!("{}/{}: {}", pool.pool, disk, e))
                .await;
        }
    }
}

pub fn check_sys_disk_size(size_gb: i32, image_size_gb: i32) -> Result<()> {
    if size_gb < image_size_gb {
        return Err(VmError::SysDiskTooSmall(format!(
            "系统盘大小{}GiB不能小于镜像大小{}GiB",
            size_gb, image_size_gb
        ))
        .into());
    }
    if size_gb > MAX_SYS_DISK_GB {
        return Err(CloudError::bad_request(format!(
            "系统盘大小不能超过{}GiB",
            MAX_SYS_DISK_GB
        )));
    }
    Ok(())
}

pub struct VmBuilder {
    ctx: CloudContext,
}

impl VmBuilder {
    pub fn new(ctx: CloudContext) -> Self {
        Self { ctx }
    }

    /// 创建虚拟机
    pub async fn create_vm(&self, user: &UserContext, req: CreateVmRequest) -> Result<Vm> {
        if req.vcpu <= 0 || req.mem <= 0 {
            return Err(CloudError::bad_request("vCPU 和内存必须大于 0"));
        }
        if req.center_id.is_none() && req.group_id.is_none() && req.host_id.is_none() {
            return Err(CloudError::bad_request("必须指定数据中心、宿主机组或宿主机之一"));
        }

        let image = self.ctx.get_image(req.image_id).await?;
        if !image.enable {
            return Err(CloudError::bad_request(format!("镜像({})未启用", image.name)));
        }
        let sys_disk_size = req.sys_disk_size.unwrap_or(image.size_gb);
        check_sys_disk_size(sys_disk_size, image.size_gb)?;

        let mut placement = self
            .resolve_placement(user, req.center_id, req.group_id, req.host_id)
            .await?;
        if placement.center.id != image.center_id {
            return Err(VmError::AcrossCenterConflict("镜像与宿主机不在同一个数据中心".to_string()).into());
        }

        if let Some(vlan_id) = req.vlan_id {
            let v = self.ctx.get_vlan(vlan_id).await?;
            self.narrow_to_network_group(&mut placement, v.group_id).await?;
        }

        // 指定 IP 时先租用，调度只申请宿主机
        let pre_leased = match &req.ipv4 {
            Some(ip) => {
                let found = mac_ip::Entity::find()
                    .filter(mac_ip::Column::Ipv4.eq(ip.as_str()))
                    .one(&self.ctx.db)
                    .await?
                    .ok_or_else(|| ScheduleError::NoMacIp(format!("IP({})不存在", ip)))?;
                if req.vlan_id.is_some_and(|vid| vid != found.vlan_id) {
                    return Err(CloudError::bad_request(format!("IP({})不属于指定的 VLAN", ip)));
                }
                let v = self.ctx.get_vlan(found.vlan_id).await?;
                self.narrow_to_network_group(&mut placement, v.group_id).await?;
                Some(self.ctx.ledger().lease_ip_by_id(found.id).await?)
            }
            None => None,
        };

        let sreq = ScheduleRequest {
            vcpu: req.vcpu,
            mem: req.mem,
            host_id: placement.host_id,
            group_ids: Some(placement.group_ids.clone()),
            vlan_id: req.vlan_id,
            ip_public: req.ip_public,
            need_mac_ip: pre_leased.is_none(),
        };
        let (host, leased) = match Scheduler::new(self.ctx.clone()).schedule(&sreq).await {
            Ok(found) => found,
            Err(e) => {
                if let Some(ip) = &pre_leased {
                    if let Err(re) = self.ctx.ledger().release_ip(ip.id).await {
                        warn!("释放预租用 IP({})失败: {}", ip.ipv4, re);
                    }
                }
                return Err(e);
            }
        };
        let Some(mac_ip) = pre_leased.or(leased) else {
            if let Err(e) = self.ctx.ledger().free(host.id, req.vcpu, req.mem, true).await {
                warn!("释放宿主机({})资源失败: {}", host.ipv4, e);
            }
            return Err(ScheduleError::NoMacIp("没有可用的 IP".to_string()).into());
        };

        let uuid = common::utils::new_vm_uuid();
        let pool = PoolRef::from_center(&placement.center);
        let claimed = Claimed {
            host_id: host.id,
            vcpu: req.vcpu,
            mem: req.mem,
            mac_ip_id: mac_ip.id,
            disk: Some((&pool, uuid.as_str())),
        };

        let provisioned = self
            .provision(user, &req, &uuid, &image, sys_disk_size, &placement.center, &pool, &host, &mac_ip)
            .await;
        match provisioned {
            Ok(vm) => {
                info!("✅ 虚拟机创建成功: uuid={}, host={}, ip={}", vm.uuid, host.ipv4, mac_ip.ipv4);
                Ok(vm)
            }
            Err(e) => {
                error!("创建虚拟机失败，开始回滚: {}", e);
                rollback_claimed(&self.ctx, &claimed).await;
                Err(e)
            }
        }
    }

    /// 克隆系统盘、生成 XML、保存元数据并定义虚拟机
    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        user: &UserContext,
        req: &CreateVmRequest,
        uuid: &str,
        image: &Image,
        sys_disk_size: i32,
        center: &Center,
        pool: &PoolRef,
        host: &Host,
        mac_ip: &MacIp,
    ) -> Result<Vm> {
        match self
            .ctx
            .storage
            .clone_from_snapshot(pool, &image.base_image, &image.snap, uuid)
            .await
        {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => warn!("系统盘 {} 已存在，直接使用", uuid),
            Err(e) => return Err(e.into()),
        }
        if sys_disk_size > image.size_gb {
            self.ctx.storage.resize(pool, uuid, sys_disk_size).await?;
        }

        let vlan = self.ctx.get_vlan(mac_ip.vlan_id).await?;
        let tpl = DomainTemplate {
            name: uuid,
            uuid,
            mem_mib: req.mem,
            vcpu: req.vcpu,
            disk: uuid,
            mac: &mac_ip.mac,
            bridge: &vlan.br,
        };
        let xml = domain_xml::render_domain(&image.xml_tpl, &tpl, center)?;

        let record = vm::ActiveModel {
            uuid: Set(uuid.to_string()),
            name: Set(uuid.to_string()),
            vcpu: Set(req.vcpu),
            mem: Set(req.mem),
            disk: Set(uuid.to_string()),
            sys_disk_size: Set(sys_disk_size),
            disk_type: Set(DISK_TYPE_CEPH.to_string()),
            image_id: Set(image.id),
            user_id: Set(user.id),
            host_id: Set(Some(host.id)),
            mac_ip_id: Set(Some(mac_ip.id)),
            last_ip: Set(None),
            xml: Set(xml.clone()),
            status: Set(VmStatus::Normal.as_str().to_string()),
            remarks: Set(req.remarks.clone()),
            create_time: Set(Utc::now().into()),
        };
        let vm = record.insert(&self.ctx.db).await?;

        if let Err(e) = self.ctx.hypervisor.define(host, &xml).await {
            if let Err(de) = vm::Entity::delete_by_id(uuid.to_string()).exec(&self.ctx.db).await {
                self.ctx
                    .vm_log()
                    .write("删除虚拟机元数据失败", LogAbout::VmMetadata, &format!("vm={}: {}", uuid, de))
                    .await;
            }
            return Err(e.into());
        }
        Ok(vm)
    }

    /// 恢复搁置的虚拟机
    ///
    /// 优先复用搁置前的 IP
    pub async fn unshelve_vm(
        &self,
        user: &UserContext,
        uuid: &str,
        group_id: Option<i32>,
        host_id: Option<i32>,
        mac_ip_id: Option<i32>,
    ) -> Result<Vm> {
        let vm = self.ctx.get_vm(uuid).await?;
        if !user.owns(vm.user_id) {
            return Err(VmError::AccessDenied(format!("无权访问虚拟机({})", uuid)).into());
        }
        if !vm.is_shelved() {
            return Err(CloudError::bad_request(format!("虚拟机({})未搁置", uuid)));
        }

        let image = self.ctx.get_image(vm.image_id).await?;
        let center_id = if group_id.is_none() && host_id.is_none() {
            Some(image.center_id)
        } else {
            None
        };
        let mut placement = self.resolve_placement(user, center_id, group_id, host_id).await?;
        if placement.center.id != image.center_id {
            return Err(VmError::AcrossCenterConflict("镜像与宿主机不在同一个数据中心".to_string()).into());
        }

        let pre_leased = match mac_ip_id {
            Some(id) => {
                let ip = self.ctx.get_mac_ip(id).await?;
                let v = self.ctx.get_vlan(ip.vlan_id).await?;
                self.narrow_to_network_group(&mut placement, v.group_id).await?;
                Some(self.ctx.ledger().lease_ip_by_id(id).await?)
            }
            None => self.try_lease_last_ip(&vm, &mut placement).await?,
        };

        let sreq = ScheduleRequest {
            vcpu: vm.vcpu,
            mem: vm.mem,
            host_id: placement.host_id,
            group_ids: Some(placement.group_ids.clone()),
            need_mac_ip: pre_leased.is_none(),
            ..Default::default()
        };
        let (host, leased) = match Scheduler::new(self.ctx.clone()).schedule(&sreq).await {
            Ok(found) => found,
            Err(e) => {
                if let Some(ip) = &pre_leased {
                    if let Err(re) = self.ctx.ledger().release_ip(ip.id).await {
                        warn!("释放预租用 IP({})失败: {}", ip.ipv4, re);
                    }
                }
                return Err(e);
            }
        };
        let Some(mac_ip) = pre_leased.or(leased) else {
            if let Err(e) = self.ctx.ledger().free(host.id, vm.vcpu, vm.mem, true).await {
                warn!("释放宿主机({})资源失败: {}", host.ipv4, e);
            }
            return Err(ScheduleError::NoMacIp("没有可用的 IP".to_string()).into());
        };

        let claimed = Claimed {
            host_id: host.id,
            vcpu: vm.vcpu,
            mem: vm.mem,
            mac_ip_id: mac_ip.id,
            disk: None,
        };
        match self.redeploy(&vm, &placement.center, &host, &mac_ip).await {
            Ok(vm) => {
                // 已在新宿主机上定义，云硬盘重新挂载失败不影响恢复结果
                match device::reattach_vdisks(&self.ctx, &host, &vm.uuid, &placement.center).await {
                    Ok(msgs) => {
                        for msg in msgs {
                            warn!("虚拟机({})恢复后: {}", vm.uuid, msg);
                        }
                    }
                    Err(e) => {
                        self.ctx
                            .vm_log()
                            .write(
                                "恢复后重新挂载云硬盘失败",
                                LogAbout::VmDisk,
                                &format!("vm={}, host={}: {}", vm.uuid, host.ipv4, e),
                            )
                            .await;
                    }
                }
                info!("✅ 虚拟机已恢复: uuid={}, host={}, ip={}", vm.uuid, host.ipv4, mac_ip.ipv4);
                Ok(vm)
            }
            Err(e) => {
                error!("恢复虚拟机失败，开始回滚: {}", e);
                rollback_claimed(&self.ctx, &claimed).await;
                Err(e)
            }
        }
    }

    /// 搁置前的 IP 仍空闲时租用它；不在可调度范围内则放弃
    async fn try_lease_last_ip(&self, vm: &Vm, placement: &mut Placement) -> Result<Option<MacIp>> {
        let Some(last_ip) = vm.last_ip.as_deref() else {
            return Ok(None);
        };
        let Some(found) = mac_ip::Entity::find()
            .filter(mac_ip::Column::Ipv4.eq(last_ip))
            .one(&self.ctx.db)
            .await?
        else {
            return Ok(None);
        };
        if !found.can_used() {
            return Ok(None);
        }
        let v = self.ctx.get_vlan(found.vlan_id).await?;
        let usable = match placement.group_id {
            Some(gid) => gid == v.group_id,
            None => placement.group_ids.contains(&v.group_id),
        };
        if !usable {
            return Ok(None);
        }
        match self.ctx.ledger().lease_ip_by_id(found.id).await {
            Ok(ip) => {
                placement.group_id = Some(v.group_id);
                placement.group_ids = vec![v.group_id];
                Ok(Some(ip))
            }
            Err(_) => Ok(None),
        }
    }

    /// 在新宿主机上定义并更新元数据
    async fn redeploy(&self, vm: &Vm, center: &Center, host: &Host, mac_ip: &MacIp) -> Result<Vm> {
        let pool = PoolRef::from_center(center);
        if !self.ctx.storage.exists(&pool, &vm.disk).await? {
            return Err(VmError::DiskImageMiss(format!("系统盘({})不存在", vm.disk)).into());
        }

        let mut updated = vm.clone();
        updated.host_id = Some(host.id);
        updated.mac_ip_id = Some(mac_ip.id);
        updated.status = VmStatus::Normal.as_str().to_string();
        updated.xml = self.ctx.render_vm_xml(&updated).await?;

        self.ctx.hypervisor.define(host, &updated.xml).await?;

        let mut active = updated.clone().into_active_model();
        active.host_id = Set(updated.host_id);
        active.mac_ip_id = Set(updated.mac_ip_id);
        active.status = Set(updated.status.clone());
        active.xml = Set(updated.xml.clone());
        match active.update(&self.ctx.db).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                if let Err(ue) = self.ctx.hypervisor.undefine(host, &vm.uuid).await {
                    warn!("删除虚拟机定义失败: {}", ue);
                }
                Err(e.into())
            }
        }
    }

    /// 解析放置范围：宿主机 > 宿主机组 > 数据中心
    async fn resolve_placement(
        &self,
        user: &UserContext,
        center_id: Option<i32>,
        group_id: Option<i32>,
        host_id: Option<i32>,
    ) -> Result<Placement> {
        let db = &self.ctx.db;

        if let Some(hid) = host_id {
            let host = self.ctx.get_host(hid).await?;
            let group = self.ctx.get_group(host.group_id).await?;
            if group_id.is_some_and(|g| g != group.id) {
                return Err(VmError::AcrossGroupConflict("宿主机不属于指定的宿主机组".to_string()).into());
            }
            if center_id.is_some_and(|c| c != group.center_id) {
                return Err(VmError::AcrossCenterConflict("宿主机不属于指定的数据中心".to_string()).into());
            }
            self.check_group_access(user, group.id).await?;
            let center = self.ctx.get_center(group.center_id).await?;
            return Ok(Placement {
                center,
                group_id: Some(group.id),
                host_id: Some(host.id),
                group_ids: vec![group.id],
            });
        }

        if let Some(gid) = group_id {
            let group = self.ctx.get_group(gid).await?;
            if center_id.is_some_and(|c| c != group.center_id) {
                return Err(VmError::AcrossCenterConflict("宿主机组不属于指定的数据中心".to_string()).into());
            }
            self.check_group_access(user, gid).await?;
            let center = self.ctx.get_center(group.center_id).await?;
            return Ok(Placement {
                center,
                group_id: Some(gid),
                host_id: None,
                group_ids: vec![gid],
            });
        }

        let cid = center_id.ok_or_else(|| CloudError::bad_request("必须指定数据中心、宿主机组或宿主机之一"))?;
        let center = self.ctx.get_center(cid).await?;
        let group_ids = access::user_group_ids(db, cid, user).await?;
        if group_ids.is_empty() {
            return Err(ScheduleError::NoHostGroup(format!("数据中心({})中没有可用的宿主机组", center.name)).into());
        }
        Ok(Placement {
            center,
            group_id: None,
            host_id: None,
            group_ids,
        })
    }

    async fn check_group_access(&self, user: &UserContext, group_id: i32) -> Result<()> {
        if !access::group_has_user(&self.ctx.db, group_id, user).await? {
            return Err(VmError::AccessDenied(format!("无权使用宿主机组({})", group_id)).into());
        }
        Ok(())
    }

    /// VLAN 或 IP 必须与宿主机在同一宿主机组，只给了数据中心时据此收窄调度范围
    async fn narrow_to_network_group(&self, placement: &mut Placement, net_group_id: i32) -> Result<()> {
        let net_group = self.ctx.get_group(net_group_id).await?;
        if net_group.center_id != placement.center.id {
            return Err(VmError::AcrossCenterConflict("网络与宿主机不在同一个数据中心".to_string()).into());
        }
        match placement.group_id {
            Some(gid) if gid != net_group_id => {
                Err(VmError::AcrossGroupConflict("网络与宿主机不在同一个宿主机组".to_string()).into())
            }
            Some(_) => Ok(()),
            None => {
                if !placement.group_ids.contains(&net_group_id) {
                    return Err(VmError::AccessDenied(format!("无权使用宿主机组({})", net_group_id)).into());
                }
                placement.group_id = Some(net_group_id);
                placement.group_ids = vec![net_group_id];
                Ok(())
            }
        }
    }
}

/// 系统盘与云硬盘操作

use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use std::collections::HashSet;
use tracing::{info, warn};

use super::VmInstance;
use crate::db::models::host::Host;
use crate::db::models::image::Image;
use crate::db::models::vdisk::Vdisk;
use crate::db::models::vm::Vm;
use crate::db::models::vm_disk_snap::{self, VmDiskSnap};
use crate::db::models::vm_log::LogAbout;
use crate::errors::{CloudError, DeviceError, Result, StorageError, VmError};
use crate::services::access::UserContext;
use crate::services::device;
use crate::services::domain_xml;
use crate::services::vm_builder::MAX_SYS_DISK_GB;
use crate::storage::PoolRef;
use common::utils::bytes_to_gib_ceil;

impl VmInstance {
    fn ensure_ceph_disk(vm: &Vm) -> Result<()> {
        if vm.is_local_disk() {
            return Err(VmError::Unsupported(format!("虚拟机({})使用本地系统盘，不支持该操作", vm.uuid)).into());
        }
        Ok(())
    }

    /// 挂载云硬盘，设备名取 vdb..vdz 中第一个空闲的
    pub async fn mount_disk(&self, user: &UserContext, uuid: &str, vdisk_uuid: &str) -> Result<Vdisk> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        let disk = device::get_vdisk(&self.ctx.db, vdisk_uuid).await?;
        if !device::user_has_vdisk_perms(user, &disk) {
            return Err(DeviceError::AccessDenied(format!("无权使用云硬盘({})", vdisk_uuid)).into());
        }
        if !disk.enable {
            return Err(DeviceError::NotActive(format!("云硬盘({})未启用", vdisk_uuid)).into());
        }

        let group = self.ctx.get_group(host.group_id).await?;
        if disk.center_id != group.center_id {
            return Err(VmError::AcrossCenterConflict("云硬盘与虚拟机不在同一个数据中心".to_string()).into());
        }
        if disk.group_id != host.group_id {
            return Err(VmError::AcrossGroupConflict("云硬盘与虚拟机不在同一个宿主机组".to_string()).into());
        }

        match disk.vm_uuid.as_deref() {
            Some(v) if v == uuid => return Ok(disk),
            Some(v) => {
                return Err(DeviceError::NotActive(format!("云硬盘({})已挂载到虚拟机({})", vdisk_uuid, v)).into());
            }
            None => {}
        }

        let dev = self.free_disk_dev(&host, uuid).await?;
        device::vdisk_mount_meta(&self.ctx.db, vdisk_uuid, uuid, &dev).await?;

        let center = self.ctx.get_center(group.center_id).await?;
        let xml = domain_xml::vdisk_xml(&center, vdisk_uuid, &dev);
        if let Err(e) = self.ctx.hypervisor.attach_device(&host, uuid, &xml).await {
            if let Err(me) = device::vdisk_umount_meta(&self.ctx.db, vdisk_uuid).await {
                self.ctx
                    .vm_log()
                    .write(
                        "云硬盘元数据回滚失败",
                        LogAbout::VmDisk,
                        &format!("vm={}, vdisk={}: {}", uuid, vdisk_uuid, me),
                    )
                    .await;
            }
            return Err(e.into());
        }

        self.refresh_xml(&host, uuid).await;
        info!("💽 云硬盘 {} 已挂载到 {} ({})", vdisk_uuid, uuid, dev);
        device::get_vdisk(&self.ctx.db, vdisk_uuid).await
    }

    /// 元数据与运行时 XML 都未占用的设备名
    async fn free_disk_dev(&self, host: &Host, uuid: &str) -> Result<String> {
        let mut used: HashSet<String> = device::vm_vdisks(&self.ctx.db, uuid)
            .await?
            .into_iter()
            .filter_map(|d| d.dev)
            .collect();
        match self.ctx.hypervisor.xml_desc(host, uuid, true).await {
            Ok(xml) => used.extend(domain_xml::disk_targets(&xml)?),
            Err(e) => warn!("读取虚拟机({})运行时 XML 失败: {}", uuid, e),
        }
        device::vdisk_dev_candidates()
            .find(|d| !used.contains(d))
            .ok_or_else(|| VmError::TooManyVdiskMounted(format!("虚拟机({})挂载的云硬盘已达上限", uuid)).into())
    }

    /// 卸载云硬盘，未挂载时直接返回
    pub async fn umount_disk(&self, user: &UserContext, vdisk_uuid: &str) -> Result<Vdisk> {
        let disk = device::get_vdisk(&self.ctx.db, vdisk_uuid).await?;
        if !device::user_has_vdisk_perms(user, &disk) {
            return Err(DeviceError::AccessDenied(format!("无权使用云硬盘({})", vdisk_uuid)).into());
        }
        let Some(vm_uuid) = disk.vm_uuid.clone() else {
            return Ok(disk);
        };
        let vm = self.ctx.get_vm(&vm_uuid).await?;
        if vm.is_shelved() {
            device::vdisk_umount_meta(&self.ctx.db, vdisk_uuid).await?;
            return device::get_vdisk(&self.ctx.db, vdisk_uuid).await;
        }

        let host = self.ctx.vm_host(&vm).await?;
        let center = self.ctx.get_center(disk.center_id).await?;
        let dev = disk.dev.clone().unwrap_or_default();
        let xml = domain_xml::vdisk_xml(&center, vdisk_uuid, &dev);
        self.ctx.hypervisor.detach_device(&host, &vm_uuid, &xml).await?;

        if let Err(e) = device::vdisk_umount_meta(&self.ctx.db, vdisk_uuid).await {
            if let Err(ae) = self.ctx.hypervisor.attach_device(&host, &vm_uuid, &xml).await {
                self.ctx
                    .vm_log()
                    .write(
                        "云硬盘重新挂载失败",
                        LogAbout::VmDisk,
                        &format!("vm={}, vdisk={}: {}", vm_uuid, vdisk_uuid, ae),
                    )
                    .await;
            }
            return Err(e);
        }

        self.refresh_xml(&host, &vm_uuid).await;
        info!("云硬盘 {} 已从 {} 卸载", vdisk_uuid, vm_uuid);
        device::get_vdisk(&self.ctx.db, vdisk_uuid).await
    }

    /// 创建系统盘快照
    pub async fn create_sys_snap(&self, user: &UserContext, uuid: &str, remarks: &str) -> Result<VmDiskSnap> {
        let vm = self.get_owned_vm(user, uuid).await?;
        Self::ensure_ceph_disk(&vm)?;
        let (_, pool) = self.ctx.vm_pool(&vm).await?;

        let snap = format!("{}_{}", vm.disk, Utc::now().format("%Y%m%d%H%M%S%6f"));
        self.ctx.storage.create_snapshot(&pool, &vm.disk, &snap).await?;

        let record = vm_disk_snap::ActiveModel {
            vm_uuid: Set(Some(vm.uuid.clone())),
            disk: Set(vm.disk.clone()),
            snap: Set(snap.clone()),
            sys_disk_size: Set(vm.sys_disk_size),
            remarks: Set(remarks.to_string()),
            create_time: Set(Utc::now().into()),
            ..Default::default()
        };
        match record.insert(&self.ctx.db).await {
            Ok(saved) => {
                info!("📸 系统盘快照已创建: {}@{}", vm.disk, snap);
                Ok(saved)
            }
            Err(e) => {
                if let Err(re) = self.ctx.storage.remove_snapshot(&pool, &vm.disk, &snap).await {
                    self.ctx
                        .vm_log()
                        .write(
                            "删除系统盘快照失败",
                            LogAbout::VmDisk,
                            &format!("{}@{}: {}", vm.disk, snap, re),
                        )
                        .await;
                }
                Err(e.into())
            }
        }
    }

    async fn get_snap(&self, snap_id: i32) -> Result<VmDiskSnap> {
        vm_disk_snap::Entity::find_by_id(snap_id)
            .one(&self.ctx.db)
            .await?
            .ok_or_else(|| VmError::SnapNotExist(format!("快照({})不存在", snap_id)).into())
    }

    /// 删除系统盘快照，所属虚拟机已删除时只允许超级用户操作
    pub async fn delete_sys_snap(&self, user: &UserContext, snap_id: i32) -> Result<()> {
        let snap = self.get_snap(snap_id).await?;
        let vm = match snap.vm_uuid.as_deref() {
            Some(vm_uuid) => self.get_owned_vm(user, vm_uuid).await?,
            None if user.is_superuser => {
                vm_disk_snap::Entity::delete_by_id(snap.id).exec(&self.ctx.db).await?;
                return Ok(());
            }
            None => return Err(VmError::AccessDenied(format!("无权删除快照({})", snap_id)).into()),
        };

        let (_, pool) = self.ctx.vm_pool(&vm).await?;
        self.ctx.storage.remove_snapshot(&pool, &snap.disk, &snap.snap).await?;
        vm_disk_snap::Entity::delete_by_id(snap.id).exec(&self.ctx.db).await?;
        info!("系统盘快照已删除: {}@{}", snap.disk, snap.snap);
        Ok(())
    }

    /// 修改系统盘快照备注
    pub async fn modify_sys_snap_remarks(&self, user: &UserContext, snap_id: i32, remarks: &str) -> Result<VmDiskSnap> {
        let snap = self.get_snap(snap_id).await?;
        match snap.vm_uuid.as_deref() {
            Some(vm_uuid) => {
                self.get_owned_vm(user, vm_uuid).await?;
            }
            None if user.is_superuser => {}
            None => return Err(VmError::AccessDenied(format!("无权修改快照({})", snap_id)).into()),
        }

        let mut active = snap.into_active_model();
        active.remarks = Set(remarks.to_string());
        Ok(active.update(&self.ctx.db).await?)
    }

    /// 系统盘回滚到快照，回滚后按实际镜像大小更新系统盘容量
    pub async fn rollback_to_snap(&self, user: &UserContext, uuid: &str, snap_id: i32) -> Result<Vm> {
        let vm = self.get_owned_vm(user, uuid).await?;
        Self::ensure_ceph_disk(&vm)?;
        let host = self.ctx.vm_host(&vm).await?;
        self.ensure_powered_off(&host, uuid).await?;

        let snap = self.get_snap(snap_id).await?;
        if snap.disk != vm.disk {
            return Err(VmError::SnapNotBelongToVm(format!("快照({})不属于虚拟机({})", snap_id, uuid)).into());
        }

        let (_, pool) = self.ctx.vm_pool(&vm).await?;
        self.ctx
            .storage
            .rollback_to_snapshot(&pool, &vm.disk, &snap.snap)
            .await?;
        let size_gb = self.disk_size_gb(&pool, &vm.disk).await?;

        let mut active = vm.into_active_model();
        active.sys_disk_size = Set(size_gb);
        let saved = active.update(&self.ctx.db).await?;
        info!("⏪ 系统盘已回滚: {}@{} ({}GiB)", saved.disk, snap.snap, size_gb);
        Ok(saved)
    }

    async fn disk_size_gb(&self, pool: &PoolRef, name: &str) -> Result<i32> {
        let bytes = self.ctx.storage.size_bytes(pool, name).await?;
        i32::try_from(bytes_to_gib_ceil(bytes))
            .map_err(|_| CloudError::Internal(format!("系统盘({})大小异常: {} bytes", name, bytes)))
    }

    /// 扩容系统盘，只能增大
    pub async fn sys_disk_expand(&self, user: &UserContext, uuid: &str, size_gb: i32) -> Result<Vm> {
        let vm = self.get_owned_vm(user, uuid).await?;
        Self::ensure_ceph_disk(&vm)?;
        if size_gb <= vm.sys_disk_size {
            return Err(CloudError::bad_request(format!(
                "新容量({}GiB)必须大于当前系统盘容量({}GiB)",
                size_gb, vm.sys_disk_size
            )));
        }
        if size_gb > MAX_SYS_DISK_GB {
            return Err(CloudError::bad_request(format!("系统盘容量不能超过 {}GiB", MAX_SYS_DISK_GB)));
        }
        let host = self.ctx.vm_host(&vm).await?;
        self.ensure_powered_off(&host, uuid).await?;

        let (_, pool) = self.ctx.vm_pool(&vm).await?;
        self.ctx.storage.resize(&pool, &vm.disk, size_gb).await?;

        let mut active = vm.into_active_model();
        active.sys_disk_size = Set(size_gb);
        let saved = active.update(&self.ctx.db).await?;
        info!("系统盘已扩容: {} → {}GiB", saved.disk, size_gb);
        Ok(saved)
    }

    /// 更换系统镜像
    ///
    /// 旧系统盘改名保留，新系统盘从镜像克隆；定义或元数据更新失败时恢复旧盘与旧定义
    pub async fn change_sys_disk(&self, user: &UserContext, uuid: &str, image_id: i32) -> Result<Vm> {
        let vm = self.get_owned_vm(user, uuid).await?;
        Self::ensure_ceph_disk(&vm)?;
        let host = self.ctx.vm_host(&vm).await?;
        self.ensure_powered_off(&host, uuid).await?;

        let image = self.ctx.get_image(image_id).await?;
        if !image.enable {
            return Err(CloudError::bad_request(format!("镜像({})未启用", image.name)));
        }
        let (center, pool) = self.ctx.vm_pool(&vm).await?;
        if image.center_id != center.id {
            return Err(VmError::AcrossCenterConflict("镜像与虚拟机不在同一个数据中心".to_string()).into());
        }
        let size_gb = vm.sys_disk_size.max(image.size_gb);

        self.remove_all_snaps(&vm, &pool).await?;

        let bak = format!("{}_{}_bak", vm.disk, Utc::now().timestamp());
        self.ctx.storage.rename(&pool, &vm.disk, &bak).await?;

        let mut updated = vm.clone();
        updated.image_id = image.id;
        updated.sys_disk_size = size_gb;
        if let Err(e) = self.provision_new_sys_disk(&host, &pool, &updated, &image).await {
            self.restore_sys_disk(&host, &pool, &vm, &bak).await;
            return Err(e);
        }

        let failures = device::reattach_vdisks(&self.ctx, &host, uuid, &center).await?;
        if !failures.is_empty() {
            warn!("更换系统盘后 {} 个云硬盘未能重新挂载", failures.len());
        }
        self.reattach_pci(&host, uuid).await?;
        self.refresh_xml(&host, uuid).await;
        info!("🔄 虚拟机 {} 已更换系统镜像为 {}", uuid, image.name);
        self.ctx.get_vm(uuid).await
    }

    async fn provision_new_sys_disk(
        &self,
        host: &Host,
        pool: &PoolRef,
        updated: &Vm,
        image: &Image,
    ) -> Result<()> {
        self.ctx
            .storage
            .clone_from_snapshot(pool, &image.base_image, &image.snap, &updated.disk)
            .await?;
        if updated.sys_disk_size > image.size_gb {
            self.ctx.storage.resize(pool, &updated.disk, updated.sys_disk_size).await?;
        }
        let xml = self.ctx.render_vm_xml(updated).await?;
        self.ctx.hypervisor.define(host, &xml).await?;

        let mut active = updated.clone().into_active_model();
        active.image_id = Set(updated.image_id);
        active.sys_disk_size = Set(updated.sys_disk_size);
        active.xml = Set(xml);
        active.update(&self.ctx.db).await?;
        Ok(())
    }

    /// 删除新盘、旧盘改回原名并恢复旧定义，失败写运维日志
    async fn restore_sys_disk(&self, host: &Host, pool: &PoolRef, vm: &Vm, bak: &str) {
        let log = self.ctx.vm_log();
        if let Err(e) = self.ctx.storage.remove(pool, &vm.disk).await {
            log.write("删除新系统盘失败", LogAbout::VmDisk, &format!("{}: {}", vm.disk, e))
                .await;
        }
        if let Err(e) = self.ctx.storage.rename(pool, bak, &vm.disk).await {
            log.write(
                "恢复旧系统盘失败",
                LogAbout::VmDisk,
                &format!("{} → {}: {}", bak, vm.disk, e),
            )
            .await;
        }
        if let Err(e) = self.ctx.hypervisor.define(host, &vm.xml).await {
            log.write("恢复虚拟机定义失败", LogAbout::VmMetadata, &format!("vm={}: {}", vm.uuid, e))
                .await;
        }
    }

    /// 修复宿主机上丢失的虚拟机定义
    pub async fn miss_fix(&self, user: &UserContext, uuid: &str) -> Result<Vm> {
        let vm = self.get_owned_vm(user, uuid).await?;
        let host = self.ctx.vm_host(&vm).await?;
        if self.ctx.hypervisor.domain_exists(&host, uuid).await? {
            return Err(VmError::AlreadyExist(format!("宿主机上已存在虚拟机({})", uuid)).into());
        }

        let (center, pool) = self.ctx.vm_pool(&vm).await?;
        match self.ctx.storage.exists(&pool, &vm.disk).await {
            Ok(true) => {}
            Ok(false) | Err(StorageError::NotFound(_)) => {
                return Err(VmError::DiskImageMiss(format!("系统盘({})不存在", vm.disk)).into());
            }
            Err(e) => return Err(e.into()),
        }

        let xml = self.ctx.render_vm_xml(&vm).await?;
        self.ctx.hypervisor.define(&host, &xml).await?;

        let mut active = vm.into_active_model();
        active.xml = Set(xml);
        let saved = active.update(&self.ctx.db).await?;

        device::reattach_vdisks(&self.ctx, &host, uuid, &center).await?;
        self.reattach_pci(&host, uuid).await?;
        self.refresh_xml(&host, uuid).await;
        info!("🩹 虚拟机 {} 已在宿主机 {} 上重新定义", uuid, host.ipv4);
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::admin;
    use super::*;
    use crate::hypervisor::HypervisorClient;
    use crate::storage::DiskStorage;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn test_mount_and_umount_disk() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());
        let d1 = env.seed_vdisk(host.group_id, 1).await;
        let d2 = env.seed_vdisk(host.group_id, 1).await;

        let m1 = inst.mount_disk(&admin(), &vm.uuid, &d1.uuid).await.unwrap();
        assert_eq!(m1.dev.as_deref(), Some("vdb"));
        let m2 = inst.mount_disk(&admin(), &vm.uuid, &d2.uuid).await.unwrap();
        assert_eq!(m2.dev.as_deref(), Some("vdc"));
        // 重复挂载是幂等的
        let again = inst.mount_disk(&admin(), &vm.uuid, &d1.uuid).await.unwrap();
        assert_eq!(again.dev.as_deref(), Some("vdb"));
        assert_eq!(env.hv.domain(host.id, &vm.uuid).unwrap().devices.len(), 2);
        assert!(env.ctx.get_vm(&vm.uuid).await.unwrap().xml.contains(&d1.uuid));

        let freed = inst.umount_disk(&admin(), &d1.uuid).await.unwrap();
        assert!(freed.vm_uuid.is_none());
        assert_eq!(env.hv.domain(host.id, &vm.uuid).unwrap().devices.len(), 1);
        // 卸载未挂载的云硬盘直接返回
        inst.umount_disk(&admin(), &d1.uuid).await.unwrap();

        // 空出的设备名被复用
        let m3 = inst.mount_disk(&admin(), &vm.uuid, &d1.uuid).await.unwrap();
        assert_eq!(m3.dev.as_deref(), Some("vdb"));
    }

    #[tokio::test]
    async fn test_mount_disk_checks() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());

        let other_group = env.seed_group().await;
        let far = env.seed_vdisk(other_group.id, 1).await;
        let err = inst.mount_disk(&admin(), &vm.uuid, &far.uuid).await.unwrap_err();
        assert_eq!(err.code(), "ACROSS_GROUP_CONFLICT");

        let foreign = env.seed_vdisk(host.group_id, 77).await;
        let user = UserContext::new(1, false);
        let err = inst.mount_disk(&user, &vm.uuid, &foreign.uuid).await.unwrap_err();
        assert_eq!(err.code(), "DEVICE_ACCESS_DENIED");

        // 挂载失败回滚元数据
        let disk = env.seed_vdisk(host.group_id, 1).await;
        env.hv.fail_on("attach_device");
        assert!(inst.mount_disk(&admin(), &vm.uuid, &disk.uuid).await.is_err());
        assert!(device::get_vdisk(&env.ctx.db, &disk.uuid).await.unwrap().vm_uuid.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let env = TestEnv::new().await;
        let (vm, _) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());

        let snap = inst.create_sys_snap(&admin(), &vm.uuid, "before upgrade").await.unwrap();
        assert!(env.storage.has_snapshot(&env.pool(), &vm.disk, &snap.snap));

        inst.sys_disk_expand(&admin(), &vm.uuid, 40).await.unwrap();
        let rolled = inst.rollback_to_snap(&admin(), &vm.uuid, snap.id).await.unwrap();
        assert_eq!(rolled.sys_disk_size, env.image.size_gb);
        // 再次回滚结果不变
        let rolled = inst.rollback_to_snap(&admin(), &vm.uuid, snap.id).await.unwrap();
        assert_eq!(rolled.sys_disk_size, env.image.size_gb);

        inst.delete_sys_snap(&admin(), snap.id).await.unwrap();
        assert!(!env.storage.has_snapshot(&env.pool(), &vm.disk, &snap.snap));
        let err = inst.rollback_to_snap(&admin(), &vm.uuid, snap.id).await.unwrap_err();
        assert_eq!(err.code(), "SNAP_NOT_EXIST");
    }

    #[tokio::test]
    async fn test_modify_sys_snap_remarks() {
        let env = TestEnv::new().await;
        let (vm, _) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());
        let snap = inst.create_sys_snap(&admin(), &vm.uuid, "old").await.unwrap();

        let changed = inst.modify_sys_snap_remarks(&admin(), snap.id, "before kernel upgrade").await.unwrap();
        assert_eq!(changed.remarks, "before kernel upgrade");
        assert_eq!(changed.snap, snap.snap);
        let stored = inst.get_snap(snap.id).await.unwrap();
        assert_eq!(stored.remarks, "before kernel upgrade");

        let stranger = UserContext::new(vm.user_id + 100, false);
        let err = inst.modify_sys_snap_remarks(&stranger, snap.id, "x").await.unwrap_err();
        assert_eq!(err.code(), "VM_ACCESS_DENIED");
        assert_eq!(inst.get_snap(snap.id).await.unwrap().remarks, "before kernel upgrade");

        let err = inst.modify_sys_snap_remarks(&admin(), snap.id + 1000, "x").await.unwrap_err();
        assert_eq!(err.code(), "SNAP_NOT_EXIST");
    }

    #[tokio::test]
    async fn test_rollback_rejects_foreign_snap_and_running_vm() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let (other, _) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());

        let snap = inst.create_sys_snap(&admin(), &other.uuid, "").await.unwrap();
        let err = inst.rollback_to_snap(&admin(), &vm.uuid, snap.id).await.unwrap_err();
        assert_eq!(err.code(), "SNAP_NOT_BELONG_TO_VM");

        env.hv.set_running(host.id, &vm.uuid, true);
        let own = inst.create_sys_snap(&admin(), &vm.uuid, "").await.unwrap();
        let err = inst.rollback_to_snap(&admin(), &vm.uuid, own.id).await.unwrap_err();
        assert_eq!(err.code(), "VM_RUNNING");
    }

    #[tokio::test]
    async fn test_sys_disk_expand_bounds() {
        let env = TestEnv::new().await;
        let (vm, _) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());

        let err = inst.sys_disk_expand(&admin(), &vm.uuid, vm.sys_disk_size).await.unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
        let err = inst.sys_disk_expand(&admin(), &vm.uuid, MAX_SYS_DISK_GB + 1).await.unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");

        let vm = inst.sys_disk_expand(&admin(), &vm.uuid, 30).await.unwrap();
        assert_eq!(vm.sys_disk_size, 30);
    }

    #[tokio::test]
    async fn test_change_sys_disk() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let disk = env.seed_vdisk(host.group_id, 1).await;
        let inst = VmInstance::new(env.ctx.clone());
        inst.mount_disk(&admin(), &vm.uuid, &disk.uuid).await.unwrap();
        inst.create_sys_snap(&admin(), &vm.uuid, "").await.unwrap();

        let image = env.seed_image("ubuntu", 30).await;
        let changed = inst.change_sys_disk(&admin(), &vm.uuid, image.id).await.unwrap();
        assert_eq!(changed.image_id, image.id);
        assert_eq!(changed.sys_disk_size, 30);
        assert!(env.storage.has_image(&env.pool(), &vm.disk));
        assert!(env.storage.image_names().iter().any(|n| n.ends_with("_bak")));
        assert_eq!(env.snap_count(&vm.uuid).await, 0);
        // 云硬盘重新挂载
        assert_eq!(env.hv.domain(host.id, &vm.uuid).unwrap().devices.len(), 1);
    }

    #[tokio::test]
    async fn test_change_sys_disk_define_failure_restores() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());
        let image = env.seed_image("ubuntu", 30).await;

        env.hv.fail_on("define");
        assert!(inst.change_sys_disk(&admin(), &vm.uuid, image.id).await.is_err());
        let kept = env.ctx.get_vm(&vm.uuid).await.unwrap();
        assert_eq!(kept.image_id, vm.image_id);
        assert!(env.storage.has_image(&env.pool(), &vm.disk));
        assert!(!env.storage.image_names().iter().any(|n| n.ends_with("_bak")));
        assert!(env.hv.has_domain(host.id, &vm.uuid));
    }

    #[tokio::test]
    async fn test_miss_fix() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let inst = VmInstance::new(env.ctx.clone());

        let err = inst.miss_fix(&admin(), &vm.uuid).await.unwrap_err();
        assert_eq!(err.code(), "VM_ALREADY_EXIST");

        env.hv.undefine(&host, &vm.uuid).await.unwrap();
        inst.miss_fix(&admin(), &vm.uuid).await.unwrap();
        assert!(env.hv.has_domain(host.id, &vm.uuid));

        env.hv.undefine(&host, &vm.uuid).await.unwrap();
        env.storage.remove(&env.pool(), &vm.disk).await.unwrap();
        let err = inst.miss_fix(&admin(), &vm.uuid).await.unwrap_err();
        assert_eq!(err.code(), "DISK_IMAGE_MISS");
    }
}

/// 设备元数据
///
/// 云硬盘与 PCI 设备的挂载记录，挂载/卸载都是带条件的单条 UPDATE

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use tracing::info;

use super::access::UserContext;
use super::context::CloudContext;
use super::domain_xml;
use crate::db::models::center::Center;
use crate::db::models::host::Host;
use crate::db::models::pci_device::{self, PciDevice, PciKind};
use crate::db::models::vdisk::{self, Vdisk};
use crate::db::models::vm_log::LogAbout;
use crate::errors::{CloudError, DeviceError, Result};

/// 云硬盘设备名候选
pub fn vdisk_dev_candidates() -> impl Iterator<Item = String> {
    (b'b'..=b'z').map(|c| format!("vd{}", c as char))
}

pub fn user_has_vdisk_perms(user: &UserContext, disk: &Vdisk) -> bool {
    user.owns(disk.user_id)
}

/// PCI 设备的 XML 片段
pub fn pci_xml_fragment(dev: &PciDevice) -> Result<String> {
    match dev.pci_kind() {
        PciKind::Gpu | PciKind::Eth => domain_xml::pci_hostdev_xml(&dev.address),
        PciKind::Other => Err(CloudError::bad_request(format!(
            "不支持的 PCI 设备类型: {}",
            dev.kind
        ))),
    }
}

pub async fn get_vdisk(db: &DatabaseConnection, uuid: &str) -> Result<Vdisk> {
    vdisk::Entity::find_by_id(uuid.to_string())
        .one(db)
        .await?
        .ok_or_else(|| DeviceError::NotFound(format!("云硬盘({})不存在", uuid)).into())
}

pub async fn get_pci(db: &DatabaseConnection, id: i32) -> Result<PciDevice> {
    pci_device::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| DeviceError::NotFound(format!("PCI 设备({})不存在", id)).into())
}

pub async fn vm_vdisks(db: &DatabaseConnection, vm_uuid: &str) -> Result<Vec<Vdisk>> {
    Ok(vdisk::Entity::find()
        .filter(vdisk::Column::VmUuid.eq(vm_uuid))
        .order_by_asc(vdisk::Column::Dev)
        .all(db)
        .await?)
}

pub async fn vm_pci_devices(db: &DatabaseConnection, vm_uuid: &str) -> Result<Vec<PciDevice>> {
    Ok(pci_device::Entity::find()
        .filter(pci_device::Column::VmUuid.eq(vm_uuid))
        .all(db)
        .await?)
}

/// 记录云硬盘挂载，云硬盘已被挂载时失败
pub async fn vdisk_mount_meta(db: &DatabaseConnection, disk_uuid: &str, vm_uuid: &str, dev: &str) -> Result<()> {
    let res = vdisk::Entity::update_many()
        .col_expr(vdisk::Column::VmUuid, Expr::value(vm_uuid))
        .col_expr(vdisk::Column::Dev, Expr::value(dev))
        .col_expr(vdisk::Column::AttachTime, Expr::value(chrono::DateTime::<chrono::FixedOffset>::from(Utc::now())))
        .filter(vdisk::Column::Uuid.eq(disk_uuid))
        .filter(vdisk::Column::VmUuid.is_null())
        .exec(db)
        .await?;
    if res.rows_affected == 0 {
        return Err(DeviceError::NotActive(format!("云硬盘({})已被挂载", disk_uuid)).into());
    }
    Ok(())
}

pub async fn vdisk_umount_meta(db: &DatabaseConnection, disk_uuid: &str) -> Result<()> {
    vdisk::Entity::update_many()
        .col_expr(vdisk::Column::VmUuid, Expr::value(Option::<String>::None))
        .col_expr(vdisk::Column::Dev, Expr::value(Option::<String>::None))
        .col_expr(
            vdisk::Column::AttachTime,
            Expr::value(Option::<chrono::DateTime<chrono::FixedOffset>>::None),
        )
        .filter(vdisk::Column::Uuid.eq(disk_uuid))
        .exec(db)
        .await?;
    Ok(())
}

/// 记录 PCI 设备挂载，设备已被占用时失败
pub async fn pci_mount_meta(db: &DatabaseConnection, dev_id: i32, vm_uuid: &str) -> Result<()> {
    let res = pci_device::Entity::update_many()
        .col_expr(pci_device::Column::VmUuid, Expr::value(vm_uuid))
        .col_expr(
            pci_device::Column::AttachTime,
            Expr::value(chrono::DateTime::<chrono::FixedOffset>::from(Utc::now())),
        )
        .filter(pci_device::Column::Id.eq(dev_id))
        .filter(pci_device::Column::VmUuid.is_null())
        .exec(db)
        .await?;
    if res.rows_affected == 0 {
        return Err(DeviceError::NotActive(format!("PCI 设备({})已被占用", dev_id)).into());
    }
    Ok(())
}

pub async fn pci_umount_meta(db: &DatabaseConnection, dev_id: i32) -> Result<()> {
    pci_device::Entity::update_many()
        .col_expr(pci_device::Column::VmUuid, Expr::value(Option::<String>::None))
        .col_expr(
            pci_device::Column::AttachTime,
            Expr::value(Option::<chrono::DateTime<chrono::FixedOffset>>::None),
        )
        .filter(pci_device::Column::Id.eq(dev_id))
        .exec(db)
        .await?;
    Ok(())
}

/// 按元数据把云硬盘重新挂到虚拟机上
///
/// 尽力而为：挂载失败的云硬盘回滚元数据并写运维日志，返回失败说明
pub async fn reattach_vdisks(ctx: &CloudContext, host: &Host, vm_uuid: &str, center: &Center) -> Result<Vec<String>> {
    let mut failures = Vec::new();
    for disk in vm_vdisks(&ctx.db, vm_uuid).await? {
        let Some(dev) = disk.dev.as_deref() else {
            continue;
        };
        let xml = domain_xml::vdisk_xml(center, &disk.uuid, dev);
        match ctx.hypervisor.attach_device(host, vm_uuid, &xml).await {
            Ok(()) => info!("云硬盘 {} 已重新挂载到 {} ({})", disk.uuid, vm_uuid, dev),
            Err(e) => {
                let msg = format!("云硬盘({})挂载到虚拟机({})失败: {}", disk.uuid, vm_uuid, e);
                if let Err(me) = vdisk_umount_meta(&ctx.db, &disk.uuid).await {
                    ctx.vm_log()
                        .write("云硬盘元数据卸载失败", LogAbout::VmDisk, &format!("{}; {}", msg, me))
                        .await;
                }
                ctx.vm_log().write("重新挂载云硬盘失败", LogAbout::VmDisk, &msg).await;
                failures.push(msg);
            }
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[test]
    fn test_dev_candidates() {
        let devs: Vec<String> = vdisk_dev_candidates().collect();
        assert_eq!(devs.len(), 25);
        assert_eq!(devs.first().map(String::as_str), Some("vdb"));
        assert_eq!(devs.last().map(String::as_str), Some("vdz"));
    }

    #[tokio::test]
    async fn test_vdisk_meta_mount_is_exclusive() {
        let env = TestEnv::new().await;
        let disk = env.seed_vdisk(env.group.id, 5).await;
        let db = &env.ctx.db;

        vdisk_mount_meta(db, &disk.uuid, "vm1", "vdb").await.unwrap();
        let err = vdisk_mount_meta(db, &disk.uuid, "vm2", "vdc").await.unwrap_err();
        assert_eq!(err.code(), "DEVICE_NOT_ACTIVE");

        let mounted = get_vdisk(db, &disk.uuid).await.unwrap();
        assert_eq!(mounted.vm_uuid.as_deref(), Some("vm1"));
        assert_eq!(mounted.dev.as_deref(), Some("vdb"));
        assert_eq!(vm_vdisks(db, "vm1").await.unwrap().len(), 1);

        vdisk_umount_meta(db, &disk.uuid).await.unwrap();
        let free = get_vdisk(db, &disk.uuid).await.unwrap();
        assert!(free.vm_uuid.is_none() && free.dev.is_none());
    }

    #[tokio::test]
    async fn test_pci_meta_and_fragment() {
        let env = TestEnv::new().await;
        let host = env.seed_host(4, 4096).await;
        let gpu = env.seed_pci(host.id, PciKind::Gpu).await;
        let other = env.seed_pci(host.id, PciKind::Other).await;
        let db = &env.ctx.db;

        pci_mount_meta(db, gpu.id, "vm1").await.unwrap();
        assert!(pci_mount_meta(db, gpu.id, "vm2").await.is_err());
        assert_eq!(vm_pci_devices(db, "vm1").await.unwrap().len(), 1);
        pci_umount_meta(db, gpu.id).await.unwrap();
        assert!(vm_pci_devices(db, "vm1").await.unwrap().is_empty());

        assert!(pci_xml_fragment(&gpu).unwrap().contains("<hostdev"));
        assert!(pci_xml_fragment(&other).is_err());
    }
}

/// 数据模型
///
/// 控制面持久化实体（SeaORM）

pub mod center;
pub mod group;
pub mod group_user;
pub mod host;
pub mod image;
pub mod mac_ip;
pub mod migrate_task;
pub mod pci_device;
pub mod vdisk;
pub mod vlan;
pub mod vm;
pub mod vm_archive;
pub mod vm_disk_snap;
pub mod vm_log;

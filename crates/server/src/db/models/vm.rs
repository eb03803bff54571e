/// 虚拟机数据模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 虚拟机模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vms")]
pub struct Model {
    /// 32 位十六进制 UUID，同时是系统盘镜像名
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: String,
    pub name: String,
    pub vcpu: i32,
    /// 内存（MiB）
    pub mem: i64,
    /// 系统盘镜像名
    pub disk: String,
    /// 系统盘大小（GiB）
    pub sys_disk_size: i32,
    /// 系统盘类型：ceph / local
    pub disk_type: String,
    pub image_id: i32,
    pub user_id: i32,
    /// 搁置时为空
    pub host_id: Option<i32>,
    /// 搁置时为空
    pub mac_ip_id: Option<i32>,
    /// 搁置前使用的 IP，恢复时优先复用
    pub last_ip: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub xml: String,
    pub status: String,
    pub remarks: String,
    pub create_time: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type Vm = Model;

/// 虚拟机生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Normal,
    Shelve,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Normal => "normal",
            VmStatus::Shelve => "shelve",
        }
    }
}

impl From<String> for VmStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "shelve" => VmStatus::Shelve,
            _ => VmStatus::Normal,
        }
    }
}

pub const DISK_TYPE_CEPH: &str = "ceph";
pub const DISK_TYPE_LOCAL: &str = "local";

impl Model {
    pub fn vm_status(&self) -> VmStatus {
        VmStatus::from(self.status.clone())
    }

    /// 系统盘是否位于宿主机本地（不支持快照与迁移）
    pub fn is_local_disk(&self) -> bool {
        self.disk_type == DISK_TYPE_LOCAL
    }

    pub fn is_shelved(&self) -> bool {
        self.vm_status() == VmStatus::Shelve
    }
}

/// 运维日志
///
/// 补偿/清理步骤失败时写入，供运维人员人工处理

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub title: String,
    pub about: String,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    pub create_time: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// 日志涉及的资源类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogAbout {
    MacIp,
    HostCpuMem,
    VmMetadata,
    VmDisk,
    HostVmCreated,
    Unknown,
}

impl LogAbout {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAbout::MacIp => "mac-ip",
            LogAbout::HostCpuMem => "host-cpu-mem",
            LogAbout::VmMetadata => "vm-metadata",
            LogAbout::VmDisk => "vm-disk",
            LogAbout::HostVmCreated => "host-vm-created",
            LogAbout::Unknown => "unknown",
        }
    }
}

impl From<String> for LogAbout {
    fn from(s: String) -> Self {
        match s.as_str() {
            "mac-ip" => LogAbout::MacIp,
            "host-cpu-mem" => LogAbout::HostCpuMem,
            "vm-metadata" => LogAbout::VmMetadata,
            "vm-disk" => LogAbout::VmDisk,
            "host-vm-created" => LogAbout::HostVmCreated,
            _ => LogAbout::Unknown,
        }
    }
}

/// 迁移任务模型
///
/// 热迁移的持久化任务句柄，进程重启后仍可据此恢复

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migrate_tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub vm_uuid: String,
    pub src_host_id: i32,
    pub src_host_ipv4: String,
    pub dst_host_id: i32,
    pub dst_host_ipv4: String,
    /// 目标宿主机资源已申请
    pub dst_is_claim: bool,
    /// 源宿主机资源已释放
    pub src_is_free: bool,
    /// 源宿主机上的虚拟机定义已删除
    pub src_undefined: bool,
    pub status: String,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    /// live / static
    pub tag: String,
    pub migrate_time: DateTimeWithTimeZone,
    pub migrate_complete_time: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type MigrateTask = Model;

/// 迁移任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrateStatus {
    /// 已创建，等待工作线程处理
    Waiting,
    InProcess,
    /// 目标端已完成，源端清理未确认
    SomeTodo,
    Complete,
    Failed,
}

impl MigrateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrateStatus::Waiting => "WAITING",
            MigrateStatus::InProcess => "IN_PROCESS",
            MigrateStatus::SomeTodo => "SOME_TODO",
            MigrateStatus::Complete => "COMPLETE",
            MigrateStatus::Failed => "FAILED",
        }
    }
}

impl From<String> for MigrateStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "WAITING" => MigrateStatus::Waiting,
            "IN_PROCESS" => MigrateStatus::InProcess,
            "SOME_TODO" => MigrateStatus::SomeTodo,
            "COMPLETE" => MigrateStatus::Complete,
            _ => MigrateStatus::Failed,
        }
    }
}

pub const TAG_LIVE: &str = "live";
pub const TAG_STATIC: &str = "static";

impl Model {
    pub fn migrate_status(&self) -> MigrateStatus {
        MigrateStatus::from(self.status.clone())
    }
}

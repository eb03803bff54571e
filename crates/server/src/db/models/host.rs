/// 宿主机模型
///
/// 资源计数字段只能经由 ResourceLedger 修改

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hosts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub group_id: i32,
    pub ipv4: String,
    /// 宿主机上 Agent 注册使用的节点 ID
    #[sea_orm(unique)]
    pub agent_node_id: String,

    pub vcpu_total: i32,
    pub vcpu_allocated: i32,
    /// 内存（MiB）
    pub mem_total: i64,
    pub mem_allocated: i64,
    pub mem_reserved: i64,

    pub vm_limit: i32,
    pub vm_created: i32,
    pub enable: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::group::Entity",
        from = "Column::GroupId",
        to = "super::group::Column::Id"
    )]
    Group,
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub type Host = Model;

impl Model {
    pub fn vcpu_free(&self) -> i32 {
        self.vcpu_total - self.vcpu_allocated
    }

    pub fn mem_free(&self) -> i64 {
        self.mem_total - self.mem_reserved - self.mem_allocated
    }
}

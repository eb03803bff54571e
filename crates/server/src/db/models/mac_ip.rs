/// MAC/IP 租约模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "mac_ips")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub vlan_id: i32,
    #[sea_orm(unique)]
    pub mac: String,
    #[sea_orm(unique)]
    pub ipv4: String,
    pub ipv6: Option<String>,
    /// 是否已被租用
    pub used: bool,
    /// 管理员是否允许使用
    pub enable: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::vlan::Entity",
        from = "Column::VlanId",
        to = "super::vlan::Column::Id"
    )]
    Vlan,
}

impl Related<super::vlan::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vlan.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub type MacIp = Model;

impl Model {
    /// 是否可被租用
    pub fn can_used(&self) -> bool {
        self.enable && !self.used
    }
}

/// VLAN 子网模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vlans")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub group_id: i32,
    pub name: String,
    /// 宿主机上的网桥名
    pub br: String,
    /// 公网/私网
    pub public: bool,
    pub subnet: String,
    pub gateway: String,
    pub dns: String,
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
    #[sea_orm(has_many = "super::mac_ip::Entity")]
    MacIp,
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl Related<super::mac_ip::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MacIp.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub type Vlan = Model;

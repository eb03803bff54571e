/// 数据中心模型
///
/// 存储后端（Ceph）连接参数挂在数据中心上，生成虚拟机 XML 时使用

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "centers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub ceph_id: i32,
    pub ceph_pool: String,
    /// 数据池，可为空（纠删码池场景）
    pub ceph_data_pool: Option<String>,
    pub ceph_username: String,
    /// libvirt secret uuid
    pub ceph_uuid: String,
    /// `<host name=... port=.../>` 列表
    pub ceph_hosts_xml: String,
    pub ceph_has_auth: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::group::Entity")]
    Group,
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub type Center = Model;

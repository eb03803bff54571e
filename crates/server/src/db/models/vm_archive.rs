/// 已删除虚拟机归档

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_archives")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub uuid: String,
    pub name: String,
    pub vcpu: i32,
    pub mem: i64,
    pub disk: String,
    pub sys_disk_size: i32,
    pub image_id: i32,
    /// 镜像父盘名
    pub image_parent: String,
    pub mac: String,
    pub ipv4: String,
    pub vlan_id: Option<i32>,
    pub br: String,
    #[sea_orm(column_type = "Text")]
    pub xml: String,
    pub ceph_id: Option<i32>,
    pub ceph_pool: String,
    pub center_id: Option<i32>,
    pub center_name: String,
    pub group_id: Option<i32>,
    pub group_name: String,
    pub host_id: Option<i32>,
    pub host_ipv4: String,
    pub user_id: i32,
    pub remarks: String,
    /// 宿主机上的虚拟机定义是否已删除，宿主机不可达时为 false，需人工清理
    pub host_released: bool,
    pub create_time: DateTimeWithTimeZone,
    pub archive_time: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type VmArchive = Model;

/// 系统盘快照模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_disk_snaps")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub vm_uuid: Option<String>,
    /// 快照所属的系统盘镜像名
    pub disk: String,
    pub snap: String,
    pub sys_disk_size: i32,
    pub remarks: String,
    pub create_time: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type VmDiskSnap = Model;

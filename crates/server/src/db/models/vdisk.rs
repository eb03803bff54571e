/// 云硬盘模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vdisks")]
pub struct Model {
    /// 存储后端中的镜像名
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: String,
    pub center_id: i32,
    pub group_id: i32,
    pub size_gb: i32,
    pub user_id: i32,
    pub vm_uuid: Option<String>,
    /// 挂载后的设备名，如 vdb
    pub dev: Option<String>,
    pub attach_time: Option<DateTimeWithTimeZone>,
    pub enable: bool,
    pub remarks: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type Vdisk = Model;

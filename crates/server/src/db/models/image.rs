/// 系统镜像模型
///
/// 镜像的增删改由镜像目录服务负责，这里只做查询

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "images")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub center_id: i32,
    /// 存储后端中的父镜像名
    pub base_image: String,
    /// 父镜像快照名，新系统盘由此克隆
    pub snap: String,
    pub enable: bool,
    /// 镜像大小（GiB）
    pub size_gb: i32,
    /// 系统类型：linux / unix / windows
    pub sys_type: String,
    /// 虚拟机 XML 模板
    pub xml_tpl: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type Image = Model;

impl Model {
    /// 是否支持通过 guest agent 修改密码
    pub fn supports_password_change(&self) -> bool {
        matches!(self.sys_type.as_str(), "linux" | "unix")
    }
}

/// PCI 设备模型
///
/// 设备种类以 `kind` 标签区分，XML 片段按种类生成

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pci_devices")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 设备固定所在的宿主机
    pub host_id: i32,
    pub kind: String,
    /// domain:bus:slot:function
    pub address: String,
    pub vm_uuid: Option<String>,
    pub attach_time: Option<DateTimeWithTimeZone>,
    pub enable: bool,
    pub remarks: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type PciDevice = Model;

/// PCI 设备种类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PciKind {
    Gpu,
    Eth,
    Other,
}

impl PciKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PciKind::Gpu => "gpu",
            PciKind::Eth => "eth",
            PciKind::Other => "other",
        }
    }
}

impl From<String> for PciKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "gpu" => PciKind::Gpu,
            "eth" => PciKind::Eth,
            _ => PciKind::Other,
        }
    }
}

impl Model {
    pub fn pci_kind(&self) -> PciKind {
        PciKind::from(self.kind.clone())
    }
}

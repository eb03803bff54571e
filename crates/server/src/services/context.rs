/// 服务共享上下文
///
/// 数据库连接、虚拟化客户端与块存储三个协作者，以及各服务共用的查询

use sea_orm::{DatabaseConnection, EntityTrait};
use std::sync::Arc;

use super::domain_xml::{self, DomainTemplate};
use super::ledger::ResourceLedger;
use super::vm_log::VmLogWriter;
use crate::db::models::center::{self, Center};
use crate::db::models::group::{self, Group};
use crate::db::models::host::{self, Host};
use crate::db::models::image::{self, Image};
use crate::db::models::mac_ip::{self, MacIp};
use crate::db::models::vlan::{self, Vlan};
use crate::db::models::vm::{self, Vm};
use crate::errors::{CloudError, Result, ScheduleError, VmError};
use crate::hypervisor::HypervisorClient;
use crate::storage::{DiskStorage, PoolRef};

#[derive(Clone)]
pub struct CloudContext {
    pub db: DatabaseConnection,
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub storage: Arc<dyn DiskStorage>,
}

impl CloudContext {
    pub fn new(
        db: DatabaseConnection,
        hypervisor: Arc<dyn HypervisorClient>,
        storage: Arc<dyn DiskStorage>,
    ) -> Self {
        Self { db, hypervisor, storage }
    }

    pub fn ledger(&self) -> ResourceLedger {
        ResourceLedger::new(self.db.clone())
    }

    pub fn vm_log(&self) -> VmLogWriter {
        VmLogWriter::new(self.db.clone())
    }

    pub async fn get_vm(&self, uuid: &str) -> Result<Vm> {
        vm::Entity::find_by_id(uuid.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| VmError::NotExist(format!("虚拟机({})不存在", uuid)).into())
    }

    pub async fn get_host(&self, id: i32) -> Result<Host> {
        host::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ScheduleError::NoHost(format!("宿主机({})不存在", id)).into())
    }

    pub async fn get_group(&self, id: i32) -> Result<Group> {
        group::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ScheduleError::NoHostGroup(format!("宿主机组({})不存在", id)).into())
    }

    pub async fn get_center(&self, id: i32) -> Result<Center> {
        center::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CloudError::bad_request(format!("数据中心({})不存在", id)))
    }

    pub async fn get_image(&self, id: i32) -> Result<Image> {
        image::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CloudError::bad_request(format!("镜像({})不存在", id)))
    }

    pub async fn get_mac_ip(&self, id: i32) -> Result<MacIp> {
        mac_ip::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ScheduleError::NoMacIp(format!("MAC/IP({})不存在", id)).into())
    }

    pub async fn get_vlan(&self, id: i32) -> Result<Vlan> {
        vlan::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CloudError::bad_request(format!("VLAN({})不存在", id)))
    }

    /// 虚拟机所在宿主机，搁置状态的虚拟机没有宿主机
    pub async fn vm_host(&self, vm: &Vm) -> Result<Host> {
        match vm.host_id {
            Some(id) => self.get_host(id).await,
            None => Err(VmError::Unsupported(format!("虚拟机({})已搁置，不在任何宿主机上", vm.uuid)).into()),
        }
    }

    /// 虚拟机系统盘所在的数据中心与存储池
    pub async fn vm_pool(&self, vm: &Vm) -> Result<(Center, PoolRef)> {
        let image = self.get_image(vm.image_id).await?;
        let center = self.get_center(image.center_id).await?;
        let pool = PoolRef::from_center(&center);
        Ok((center, pool))
    }

    /// 按镜像模板和当前元数据重新生成虚拟机 XML
    pub async fn render_vm_xml(&self, vm: &Vm) -> Result<String> {
        let mac_ip_id = vm
            .mac_ip_id
            .ok_or_else(|| CloudError::bad_request(format!("虚拟机({})未分配 IP", vm.uuid)))?;
        let image = self.get_image(vm.image_id).await?;
        let center = self.get_center(image.center_id).await?;
        let mac_ip = self.get_mac_ip(mac_ip_id).await?;
        let vlan = self.get_vlan(mac_ip.vlan_id).await?;

        let tpl = DomainTemplate {
            name: &vm.uuid,
            uuid: &vm.uuid,
            mem_mib: vm.mem,
            vcpu: vm.vcpu,
            disk: &vm.disk,
            mac: &mac_ip.mac,
            bridge: &vlan.br,
        };
        domain_xml::render_domain(&image.xml_tpl, &tpl, &center)
    }
}

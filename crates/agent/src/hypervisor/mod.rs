/// 虚拟化模块
///
/// `DomainBackend` 是 RPC 处理器依赖的域操作接口，生产实现为 libvirt

pub mod libvirt;
pub mod xml;

use async_trait::async_trait;
use common::ws_rpc::DomainRef;
use common::{DomainState, DomainStats, Result};

pub use libvirt::LibvirtDriver;

/// 宿主机上的域操作
///
/// 域不存在时返回 `Error::DomainNotFound`，电源操作返回状态是否发生变化
#[async_trait]
pub trait DomainBackend: Send + Sync {
    /// 检查 hypervisor 连接可用
    async fn ping(&self) -> Result<()>;

    async fn define(&self, xml: &str) -> Result<DomainRef>;

    /// 删除定义，运行中的域先强制关机，域不存在视为成功
    async fn undefine(&self, uuid: &str) -> Result<()>;

    async fn start(&self, uuid: &str) -> Result<bool>;
    async fn reboot(&self, uuid: &str) -> Result<bool>;
    async fn shutdown(&self, uuid: &str) -> Result<bool>;
    async fn poweroff(&self, uuid: &str) -> Result<bool>;

    async fn status(&self, uuid: &str) -> Result<DomainState>;
    async fn exists(&self, uuid: &str) -> Result<bool>;

    /// 持久挂载设备，域运行时同时热挂载
    async fn attach_device(&self, uuid: &str, xml: &str) -> Result<()>;
    async fn detach_device(&self, uuid: &str, xml: &str) -> Result<()>;

    /// `live` 为 false 时返回持久化定义
    async fn xml_desc(&self, uuid: &str, live: bool) -> Result<String>;
    async fn stats(&self, uuid: &str) -> Result<DomainStats>;

    /// 热迁移到目标宿主机，成功后源端定义被删除
    async fn live_migrate(&self, uuid: &str, dest_ip: &str) -> Result<DomainRef>;

    /// 通过 guest agent 设置系统用户密码
    async fn set_user_password(&self, uuid: &str, user: &str, password: &str) -> Result<()>;
}

/// 虚拟化抽象层
///
/// 控制面对宿主机虚拟化能力的全部需求都定义在 `HypervisorClient` 上，
/// 具体传输方式由实现决定（当前为经由宿主机 Agent 的 WebSocket RPC）

pub mod agent_client;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use common::{DomainState, DomainStats};

pub use agent_client::{AgentHypervisor, HypervisorTimeouts};
pub use common::ws_rpc::DomainRef;

use crate::db::models::host::Host;
use crate::errors::HypervisorError;

pub type HvResult<T> = std::result::Result<T, HypervisorError>;

/// 宿主机虚拟化客户端
///
/// 宿主机不可达统一返回 `HostUnreachable`，域不存在返回 `DomainNotExist`
#[async_trait]
pub trait HypervisorClient: Send + Sync + 'static {
    /// 带超时的宿主机连通性探测
    async fn connect(&self, host: &Host) -> HvResult<()>;

    /// 定义（持久化）虚拟机
    async fn define(&self, host: &Host, xml: &str) -> HvResult<DomainRef>;

    /// 删除虚拟机定义，域不存在视为成功
    async fn undefine(&self, host: &Host, uuid: &str) -> HvResult<()>;

    /// 启动，已运行时返回 false
    async fn start(&self, host: &Host, uuid: &str) -> HvResult<bool>;

    /// 重启，未运行时返回 false
    async fn reboot(&self, host: &Host, uuid: &str) -> HvResult<bool>;

    /// 正常关机，未运行时返回 false
    async fn shutdown(&self, host: &Host, uuid: &str) -> HvResult<bool>;

    /// 强制断电，未运行时返回 false
    async fn poweroff(&self, host: &Host, uuid: &str) -> HvResult<bool>;

    /// 查询域状态
    ///
    /// 宿主机不可达和域不存在分别折叠为 `HostUnreachable` / `Missing` 状态
    async fn status(&self, host: &Host, uuid: &str) -> HvResult<DomainState>;

    async fn domain_exists(&self, host: &Host, uuid: &str) -> HvResult<bool>;

    /// 挂载设备：先改持久化配置，运行中再改运行时配置，运行时失败回滚持久化修改
    async fn attach_device(&self, host: &Host, uuid: &str, xml: &str) -> HvResult<()>;

    /// 卸载设备，回滚方式与挂载对称
    async fn detach_device(&self, host: &Host, uuid: &str, xml: &str) -> HvResult<()>;

    /// 获取 XML 描述，`live` 为 false 时取持久化配置
    async fn xml_desc(&self, host: &Host, uuid: &str, live: bool) -> HvResult<String>;

    async fn stats(&self, host: &Host, uuid: &str) -> HvResult<DomainStats>;

    /// 热迁移到目标宿主机，成功后源端定义已删除
    async fn live_migrate(&self, src: &Host, uuid: &str, dst: &Host) -> HvResult<DomainRef>;

    /// 通过 guest agent 修改系统用户密码
    async fn set_user_password(
        &self,
        host: &Host,
        uuid: &str,
        user: &str,
        password: &str,
    ) -> HvResult<()>;
}

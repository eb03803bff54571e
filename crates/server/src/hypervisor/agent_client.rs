/// 基于 Agent RPC 的虚拟化客户端
///
/// 每次调用都带超时；Agent 未连接、连接断开或超时都归为宿主机不可达

use async_trait::async_trait;
use common::ws_rpc::{
    methods, DefineDomainRequest, DeviceRequest, DomainRef, DomainRequest, Empty,
    ExistsResponse, LiveMigrateRequest, PowerResponse, RpcError, RpcErrorCode,
    SetPasswordRequest, StatsResponse, StatusResponse, XmlDescRequest, XmlDescResponse,
};
use common::{DomainState, DomainStats};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{HvResult, HypervisorClient};
use crate::db::models::host::Host;
use crate::errors::HypervisorError;
use crate::ws::AgentConnectionManager;

/// 超时配置
#[derive(Debug, Clone, Copy)]
pub struct HypervisorTimeouts {
    /// 普通 RPC
    pub rpc: Duration,
    /// 连通性探测
    pub ping: Duration,
    /// 热迁移
    pub migrate: Duration,
}

pub struct AgentHypervisor {
    agents: AgentConnectionManager,
    timeouts: HypervisorTimeouts,
}

impl AgentHypervisor {
    pub fn new(agents: AgentConnectionManager, timeouts: HypervisorTimeouts) -> Self {
        Self { agents, timeouts }
    }

    async fn call<Req, Resp>(
        &self,
        host: &Host,
        method: &str,
        req: &Req,
        timeout: Duration,
    ) -> HvResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(req)
            .map_err(|e| HypervisorError::Generic(format!("序列化请求失败: {}", e)))?;

        let value = self
            .agents
            .call(&host.agent_node_id, method, payload, timeout)
            .await
            .map_err(|e| classify(host, e))?;

        serde_json::from_value(value)
            .map_err(|e| HypervisorError::Generic(format!("解析 {} 响应失败: {}", method, e)))
    }

    async fn power(&self, host: &Host, uuid: &str, method: &str) -> HvResult<bool> {
        let req = DomainRequest { uuid: uuid.to_string() };
        let resp: PowerResponse = self.call(host, method, &req, self.timeouts.rpc).await?;
        Ok(resp.changed)
    }
}

/// RPC 错误分类
fn classify(host: &Host, err: RpcError) -> HypervisorError {
    if err.code.is_unreachable() {
        warn!("宿主机 {} 不可达: {}", host.ipv4, err);
        HypervisorError::HostUnreachable(format!("宿主机({})无法连接: {}", host.ipv4, err.message))
    } else if err.code == RpcErrorCode::DomainNotFound {
        HypervisorError::DomainNotExist(err.message)
    } else {
        HypervisorError::Generic(err.message)
    }
}

#[async_trait]
impl HypervisorClient for AgentHypervisor {
    async fn connect(&self, host: &Host) -> HvResult<()> {
        if !self.agents.is_online(&host.agent_node_id).await {
            return Err(HypervisorError::HostUnreachable(format!(
                "宿主机({})Agent 未连接",
                host.ipv4
            )));
        }
        let _: Empty = self.call(host, methods::PING, &Empty {}, self.timeouts.ping).await?;
        Ok(())
    }

    async fn define(&self, host: &Host, xml: &str) -> HvResult<DomainRef> {
        let req = DefineDomainRequest { xml: xml.to_string() };
        self.call(host, methods::DEFINE_DOMAIN, &req, self.timeouts.rpc).await
    }

    async fn undefine(&self, host: &Host, uuid: &str) -> HvResult<()> {
        let req = DomainRequest { uuid: uuid.to_string() };
        match self
            .call::<_, Empty>(host, methods::UNDEFINE_DOMAIN, &req, self.timeouts.rpc)
            .await
        {
            Ok(_) | Err(HypervisorError::DomainNotExist(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.power(host, uuid, methods::START_DOMAIN).await
    }

    async fn reboot(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.power(host, uuid, methods::REBOOT_DOMAIN).await
    }

    async fn shutdown(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.power(host, uuid, methods::SHUTDOWN_DOMAIN).await
    }

    async fn poweroff(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.power(host, uuid, methods::POWEROFF_DOMAIN).await
    }

    async fn status(&self, host: &Host, uuid: &str) -> HvResult<DomainState> {
        let req = DomainRequest { uuid: uuid.to_string() };
        match self
            .call::<_, StatusResponse>(host, methods::DOMAIN_STATUS, &req, self.timeouts.ping)
            .await
        {
            Ok(resp) => Ok(resp.state),
            Err(HypervisorError::HostUnreachable(_)) => Ok(DomainState::HostUnreachable),
            Err(HypervisorError::DomainNotExist(_)) => Ok(DomainState::Missing),
            Err(e) => Err(e),
        }
    }

    async fn domain_exists(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        let req = DomainRequest { uuid: uuid.to_string() };
        let resp: ExistsResponse = self
            .call(host, methods::DOMAIN_EXISTS, &req, self.timeouts.rpc)
            .await?;
        Ok(resp.exists)
    }

    async fn attach_device(&self, host: &Host, uuid: &str, xml: &str) -> HvResult<()> {
        debug!("挂载设备: host={}, vm={}", host.ipv4, uuid);
        let req = DeviceRequest { uuid: uuid.to_string(), xml: xml.to_string() };
        let _: Empty = self.call(host, methods::ATTACH_DEVICE, &req, self.timeouts.rpc).await?;
        Ok(())
    }

    async fn detach_device(&self, host: &Host, uuid: &str, xml: &str) -> HvResult<()> {
        debug!("卸载设备: host={}, vm={}", host.ipv4, uuid);
        let req = DeviceRequest { uuid: uuid.to_string(), xml: xml.to_string() };
        let _: Empty = self.call(host, methods::DETACH_DEVICE, &req, self.timeouts.rpc).await?;
        Ok(())
    }

    async fn xml_desc(&self, host: &Host, uuid: &str, live: bool) -> HvResult<String> {
        let req = XmlDescRequest { uuid: uuid.to_string(), live };
        let resp: XmlDescResponse = self.call(host, methods::XML_DESC, &req, self.timeouts.rpc).await?;
        Ok(resp.xml)
    }

    async fn stats(&self, host: &Host, uuid: &str) -> HvResult<DomainStats> {
        let req = DomainRequest { uuid: uuid.to_string() };
        let resp: StatsResponse = self.call(host, methods::DOMAIN_STATS, &req, self.timeouts.rpc).await?;
        Ok(resp.stats)
    }

    async fn live_migrate(&self, src: &Host, uuid: &str, dst: &Host) -> HvResult<DomainRef> {
        let req = LiveMigrateRequest {
            uuid: uuid.to_string(),
            dest_ip: dst.ipv4.clone(),
        };
        self.call(src, methods::LIVE_MIGRATE, &req, self.timeouts.migrate).await
    }

    async fn set_user_password(
        &self,
        host: &Host,
        uuid: &str,
        user: &str,
        password: &str,
    ) -> HvResult<()> {
        let req = SetPasswordRequest {
            uuid: uuid.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        };
        let _: Empty = self
            .call(host, methods::SET_USER_PASSWORD, &req, self.timeouts.rpc)
            .await?;
        Ok(())
    }
}

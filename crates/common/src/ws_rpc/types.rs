/// 虚拟化线协议负载定义
///
/// 每个 HypervisorClient 方法对应一组请求/响应结构，方法名见 `methods`

use serde::{Deserialize, Serialize};

use crate::models::{DomainState, DomainStats};

// ============================================================================
// 注册与心跳
// ============================================================================

/// Agent 注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
    /// CPU 线程数
    pub cpu_threads: u32,
    /// 内存总量（MiB）
    pub memory_total_mb: u64,
}

/// Agent 注册响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
}

/// 心跳通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

// ============================================================================
// 虚拟机域操作
// ============================================================================

/// 定义虚拟机
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefineDomainRequest {
    pub xml: String,
}

/// 针对单个域的请求（undefine/start/reboot/shutdown/poweroff/status/exists/stats）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRequest {
    pub uuid: String,
}

/// 域引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainRef {
    pub uuid: String,
    pub name: String,
}

/// 电源操作结果
///
/// `changed` 为 false 表示无需操作（如已运行的虚拟机再次启动）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerResponse {
    pub changed: bool,
}

/// 域状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: DomainState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

/// 挂载/卸载设备
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub uuid: String,
    pub xml: String,
}

/// 获取 XML 描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlDescRequest {
    pub uuid: String,
    /// true 取运行时配置，false 取持久化配置
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlDescResponse {
    pub xml: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: DomainStats,
}

/// 热迁移请求，发往源宿主机 Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMigrateRequest {
    pub uuid: String,
    /// 目标宿主机地址
    pub dest_ip: String,
}

/// 通过 guest agent 修改系统用户密码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPasswordRequest {
    pub uuid: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let resp = StatusResponse { state: DomainState::ShutOff };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["state"], "shut_off");
    }
}

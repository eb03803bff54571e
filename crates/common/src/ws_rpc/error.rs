/// WebSocket RPC 错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// RPC 错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    // 通用错误
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Timeout,
    ConnectionClosed,
    SerializationError,

    // 虚拟化错误
    DomainNotFound,
    HypervisorError,

    // 节点错误
    NodeNotFound,
    NodeOffline,
}

impl RpcErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::DomainNotFound => "VM_NOT_FOUND",
            Self::HypervisorError => "HYPERVISOR_ERROR",
            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::NodeOffline => "NODE_OFFLINE",
        }
    }

    /// 从字符串码解析，未知码归为内部错误
    pub fn parse(code: &str) -> Self {
        match code {
            "INVALID_REQUEST" => Self::InvalidRequest,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "INVALID_PARAMS" => Self::InvalidParams,
            "TIMEOUT" => Self::Timeout,
            "CONNECTION_CLOSED" => Self::ConnectionClosed,
            "SERIALIZATION_ERROR" => Self::SerializationError,
            "VM_NOT_FOUND" => Self::DomainNotFound,
            "HYPERVISOR_ERROR" => Self::HypervisorError,
            "NODE_NOT_FOUND" => Self::NodeNotFound,
            "NODE_OFFLINE" => Self::NodeOffline,
            _ => Self::InternalError,
        }
    }

    /// 是否表示节点不可达（连接缺失、断开或超时）
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionClosed | Self::NodeNotFound | Self::NodeOffline
        )
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    /// 创建新的 RPC 错误
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 无效请求错误
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    /// 方法不存在错误
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            RpcErrorCode::MethodNotFound,
            format!("方法不存在: {}", method.into()),
        )
    }

    /// 参数错误
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    /// 超时错误
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    /// 连接关闭错误
    pub fn connection_closed() -> Self {
        Self::new(RpcErrorCode::ConnectionClosed, "连接已关闭")
    }

    /// 序列化错误
    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("序列化错误: {}", err),
        )
    }

    /// 虚拟机不存在
    pub fn domain_not_found(uuid: impl Into<String>) -> Self {
        Self::new(
            RpcErrorCode::DomainNotFound,
            format!("虚拟机不存在: {}", uuid.into()),
        )
    }

    /// 节点未连接
    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::new(
            RpcErrorCode::NodeNotFound,
            format!("节点未连接: {}", node_id.into()),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<crate::Error> for RpcError {
    fn from(err: crate::Error) -> Self {
        let code = match &err {
            crate::Error::DomainNotFound(_) => RpcErrorCode::DomainNotFound,
            crate::Error::InvalidArgument(_) => RpcErrorCode::InvalidParams,
            crate::Error::Serialization(_) => RpcErrorCode::SerializationError,
            crate::Error::Hypervisor(_) => RpcErrorCode::HypervisorError,
            _ => RpcErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

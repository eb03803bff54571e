use thiserror::Error;

/// Agent 侧统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("虚拟机不存在: {0}")]
    DomainNotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("虚拟化错误: {0}")]
    Hypervisor(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

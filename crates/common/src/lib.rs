/// VM Cloud - 公共库
/// 
/// Server 与 Agent 共享的虚拟化线协议、域状态模型和错误类型

pub mod errors;
pub mod models;
pub mod utils;
pub mod ws_rpc;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use models::{DomainState, DomainStats};
pub use ws_rpc::{RpcMessage, RpcError, RpcErrorCode, MessageType};

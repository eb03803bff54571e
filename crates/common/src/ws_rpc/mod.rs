/// WebSocket RPC 模块
/// 
/// Server 与 Agent 之间的双向 RPC 消息格式，以及虚拟化线协议的方法与负载定义

pub mod message;
pub mod error;
pub mod methods;
pub mod types;

pub use message::{RpcMessage, MessageType, RpcErrorInfo};
pub use error::{RpcError, RpcErrorCode};
pub use types::*;

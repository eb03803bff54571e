/// WebSocket 通信模块

pub mod client;
pub mod handler;

pub use client::WsClient;
pub use handler::RpcHandler;

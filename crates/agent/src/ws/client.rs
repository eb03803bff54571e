/// WebSocket 客户端
///
/// Agent 主动连接 Server：注册、定时心跳、并发处理 RPC 请求，断线后自动重连

use common::ws_rpc::{methods, Heartbeat, RegisterResponse};
use common::{MessageType, RpcMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::RpcHandler;
use crate::node::NodeManager;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket 错误: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("注册失败: {0}")]
    Register(String),

    #[error("连接已关闭")]
    Closed,
}

/// WebSocket 客户端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Registered,
}

pub struct WsClient {
    server_url: String,
    node: NodeManager,
    handler: RpcHandler,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,
    state: Arc<RwLock<ClientState>>,
}

impl WsClient {
    pub fn new(
        server_url: impl Into<String>,
        node: NodeManager,
        handler: RpcHandler,
        heartbeat_interval: Duration,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            node,
            handler,
            heartbeat_interval,
            reconnect_interval,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
        }
    }

    async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }

    /// 保持与 Server 的连接直到收到退出信号
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            info!("尝试连接到 Server: {}", self.server_url);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("收到退出信号，断开 Server 连接");
                    return;
                }
                result = self.connect_and_run() => match result {
                    Ok(()) => info!("连接正常关闭"),
                    Err(e) => error!("连接错误: {}", e),
                }
            }
            if self.state().await == ClientState::Registered {
                warn!("与 Server 的连接已中断: node_id={}", self.node.node_id());
            }
            self.set_state(ClientState::Disconnected).await;

            warn!("{}秒后重新连接...", self.reconnect_interval.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }

    async fn connect_and_run(&self) -> Result<(), ClientError> {
        self.set_state(ClientState::Connecting).await;
        let (ws_stream, _) = connect_async(&self.server_url).await?;
        info!("✅ WebSocket 连接成功");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // 注册
        let register = RpcMessage::request(methods::REGISTER, serde_json::to_value(self.node.register_request())?);
        let register_id = register.id.clone();
        send_message(&mut ws_sender, &register).await?;
        debug!("已发送注册请求");

        let reply = loop {
            let next = tokio::time::timeout(REGISTER_TIMEOUT, ws_receiver.next())
                .await
                .map_err(|_| ClientError::Register("等待注册响应超时".to_string()))?;
            let msg = match next {
                Some(msg) => msg?,
                None => return Err(ClientError::Closed),
            };
            match parse_message(msg) {
                Some(rpc) if rpc.id == register_id => break rpc,
                Some(rpc) => debug!("注册完成前收到消息，忽略: id={}", rpc.id),
                None => {}
            }
        };
        let payload = reply
            .into_result()
            .map_err(|e| ClientError::Register(e.to_string()))?;
        let resp: RegisterResponse = serde_json::from_value(payload)?;
        if !resp.success {
            return Err(ClientError::Register(resp.message));
        }
        info!("✅ 注册成功: node_id={}", self.node.node_id());
        self.set_state(ClientState::Registered).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

        let mut send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = send_message(&mut ws_sender, &msg).await {
                    error!("发送消息失败: {}", e);
                    break;
                }
            }
            debug!("发送任务结束");
        });

        let heartbeat_tx = tx.clone();
        let heartbeat_interval = self.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            loop {
                interval.tick().await;
                let beat = Heartbeat {
                    timestamp: chrono::Utc::now().timestamp(),
                };
                let payload = match serde_json::to_value(&beat) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("序列化心跳失败: {}", e);
                        continue;
                    }
                };
                if heartbeat_tx.send(RpcMessage::notification(methods::HEARTBEAT, payload)).is_err() {
                    break;
                }
                debug!("发送心跳");
            }
        });

        let handler = self.handler.clone();
        let mut recv_task = tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                let msg = match result {
                    Ok(Message::Close(_)) => {
                        warn!("收到连接关闭消息");
                        break;
                    }
                    Ok(msg) => msg,
                    Err(e) => {
                        error!("接收消息错误: {}", e);
                        break;
                    }
                };
                let Some(rpc) = parse_message(msg) else {
                    continue;
                };
                match rpc.message_type {
                    MessageType::Request => {
                        // 每个请求独立处理，热迁移等长操作不阻塞其他请求
                        let handler = handler.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let response = handler.handle_request(rpc).await;
                            if tx.send(response).is_err() {
                                error!("发送响应失败: 连接已关闭");
                            }
                        });
                    }
                    other => debug!("忽略消息: type={:?}, method={:?}", other, rpc.method),
                }
            }
            debug!("接收任务结束");
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }
        heartbeat_task.abort();

        Ok(())
    }
}

async fn send_message(sender: &mut WsSink, msg: &RpcMessage) -> Result<(), ClientError> {
    let json = msg.to_json()?;
    sender.send(Message::Text(json)).await?;
    Ok(())
}

/// 解析文本或二进制帧，其他帧返回 None
fn parse_message(msg: Message) -> Option<RpcMessage> {
    let text = match msg {
        Message::Text(text) => text,
        Message::Binary(data) => match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                error!("二进制转字符串失败: {}", e);
                return None;
            }
        },
        _ => return None,
    };
    match RpcMessage::from_json(&text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            error!("解析消息失败: {}", e);
            None
        }
    }
}

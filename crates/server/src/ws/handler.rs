/// WebSocket 连接处理器
///
/// 处理与宿主机 Agent 的 WebSocket 连接：注册、心跳、RPC 响应分发

use super::agent_manager::AgentConnection;
use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use common::ws_rpc::{methods, MessageType, RegisterRequest, RegisterResponse, RpcMessage};
use futures_util::{SinkExt, StreamExt};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::db::models::host;

/// WebSocket 升级处理器
pub async fn handle_agent_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state))
}

/// 处理 Agent WebSocket 连接
async fn handle_agent_connection(socket: WebSocket, state: AppState) {
    info!("新的 Agent WebSocket 连接");
    let manager = state.agent_manager();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

    let (register_id, register_req) = match wait_for_registration(&mut ws_receiver).await {
        Ok(info) => info,
        Err(e) => {
            error!("Agent 注册失败: {}", e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    check_registered_host(&state, &register_req).await;

    let register_response = RegisterResponse {
        success: true,
        message: "注册成功".to_string(),
    };
    let payload = match serde_json::to_value(&register_response) {
        Ok(v) => v,
        Err(e) => {
            error!("序列化注册响应失败: {}", e);
            return;
        }
    };
    if let Err(e) = send_message(&mut ws_sender, RpcMessage::response(register_id, payload)).await {
        error!("发送注册响应失败: {}", e);
        return;
    }

    let connection = manager
        .register(AgentConnection::new(
            register_req.node_id.clone(),
            register_req.ip_address.clone(),
            tx,
        ))
        .await;

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut ws_sender, msg).await {
                error!("发送消息失败: {}", e);
                break;
            }
        }
        debug!("消息发送任务结束");
    });

    let connection_clone = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Err(e) = handle_incoming_message(msg, &connection_clone).await {
                        warn!("处理消息失败: {}", e);
                    }
                }
                Err(e) => {
                    error!("接收消息错误: {}", e);
                    break;
                }
            }
        }
        debug!("消息接收任务结束");
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.unregister(&connection).await;
    info!("Agent 连接已关闭: {}", register_req.node_id);
}

/// 等待并解析注册消息
async fn wait_for_registration(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Result<(String, RegisterRequest), String> {
    match tokio::time::timeout(std::time::Duration::from_secs(10), receiver.next()).await {
        Ok(Some(Ok(msg))) => {
            let rpc_msg = parse_websocket_message(msg)?;

            if rpc_msg.message_type != MessageType::Request
                || rpc_msg.method.as_deref() != Some(methods::REGISTER)
            {
                return Err(format!("期望 register 请求，收到: {:?}", rpc_msg.method));
            }

            let payload = rpc_msg.payload.ok_or("缺少注册信息")?;
            let register_req: RegisterRequest = serde_json::from_value(payload)
                .map_err(|e| format!("解析注册信息失败: {}", e))?;
            Ok((rpc_msg.id, register_req))
        }
        Ok(Some(Err(e))) => Err(format!("接收注册消息错误: {}", e)),
        Ok(None) => Err("连接已关闭".to_string()),
        Err(_) => Err("等待注册消息超时".to_string()),
    }
}

/// 核对注册的节点是否已登记为宿主机
///
/// 宿主机容量由管理员登记，这里只做比对告警
async fn check_registered_host(state: &AppState, req: &RegisterRequest) {
    let found = host::Entity::find()
        .filter(host::Column::AgentNodeId.eq(req.node_id.as_str()))
        .one(&state.sea_db)
        .await;

    match found {
        Ok(Some(h)) => {
            info!("✅ 宿主机已连接: host_id={}, ipv4={}, node_id={}", h.id, h.ipv4, req.node_id);
            if h.ipv4 != req.ip_address {
                warn!("宿主机登记 IP 与 Agent 上报不一致: {} != {}", h.ipv4, req.ip_address);
            }
            if i64::from(req.cpu_threads) < i64::from(h.vcpu_total) {
                warn!("宿主机 {} 登记 vCPU {} 大于实际线程数 {}", h.ipv4, h.vcpu_total, req.cpu_threads);
            }
            if (req.memory_total_mb as i64) < h.mem_total {
                warn!("宿主机 {} 登记内存 {}MiB 大于实际内存 {}MiB", h.ipv4, h.mem_total, req.memory_total_mb);
            }
        }
        Ok(None) => warn!("未登记的宿主机 Agent 连接: node_id={}, ip={}", req.node_id, req.ip_address),
        Err(e) => error!("查询宿主机失败: node_id={}, error={}", req.node_id, e),
    }
}

/// 处理收到的消息
async fn handle_incoming_message(
    ws_msg: AxumWsMessage,
    connection: &Arc<AgentConnection>,
) -> Result<(), String> {
    let rpc_msg = parse_websocket_message(ws_msg)?;

    match rpc_msg.message_type {
        MessageType::Notification => match rpc_msg.method.as_deref() {
            Some(methods::HEARTBEAT) => {
                connection.update_heartbeat().await;
                debug!("收到心跳: node_id={}", connection.node_id);
                Ok(())
            }
            other => {
                warn!("未知的通知方法: {:?}", other);
                Ok(())
            }
        },
        MessageType::Response => {
            connection.handle_response(rpc_msg).await;
            Ok(())
        }
        MessageType::Request => {
            let err = common::RpcError::method_not_found(rpc_msg.method.unwrap_or_default());
            connection
                .sender
                .send(RpcMessage::error_response(rpc_msg.id, &err))
                .map_err(|_| "发送错误响应失败".to_string())
        }
    }
}

/// 解析 WebSocket 消息为 RPC 消息
fn parse_websocket_message(ws_msg: AxumWsMessage) -> Result<RpcMessage, String> {
    match ws_msg {
        AxumWsMessage::Text(text) => {
            RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Binary(data) => {
            let text = String::from_utf8(data).map_err(|e| format!("二进制转字符串失败: {}", e))?;
            RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Close(_) => Err("连接关闭".to_string()),
        _ => Err("不支持的消息类型".to_string()),
    }
}

/// 发送 RPC 消息
async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, AxumWsMessage>,
    msg: RpcMessage,
) -> Result<(), String> {
    let json = msg.to_json().map_err(|e| format!("序列化消息失败: {}", e))?;
    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("发送 WebSocket 消息失败: {}", e))
}

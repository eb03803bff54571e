/// Agent 连接管理器
///
/// 负责管理所有宿主机 Agent 的 WebSocket 连接，并为虚拟化 RPC 关联请求与响应

use common::ws_rpc::{RpcMessage, RpcError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// 等待响应的请求信息
type PendingRequest = oneshot::Sender<RpcMessage>;

/// Agent 连接信息
pub struct AgentConnection {
    /// 节点 ID
    pub node_id: String,

    /// 节点 IP 地址
    pub ip_address: String,

    /// 发送消息的通道
    pub sender: mpsc::UnboundedSender<RpcMessage>,

    /// 最后心跳时间
    last_heartbeat: RwLock<Instant>,

    /// 等待响应的请求 Map: request_id -> response_sender
    pending_requests: RwLock<HashMap<String, PendingRequest>>,
}

impl AgentConnection {
    pub fn new(
        node_id: impl Into<String>,
        ip_address: impl Into<String>,
        sender: mpsc::UnboundedSender<RpcMessage>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            ip_address: ip_address.into(),
            sender,
            last_heartbeat: RwLock::new(Instant::now()),
            pending_requests: RwLock::new(HashMap::new()),
        }
    }

    /// 发送 RPC 请求并等待响应，错误响应还原为带错误码的 RpcError
    pub async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let msg = RpcMessage::request(method, payload);
        let request_id = msg.id.clone();

        debug!("📤 [Server -> Agent] node={}, method={}, id={}", self.node_id, method, request_id);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.write().await;
            pending.insert(request_id.clone(), tx);
        }

        if self.sender.send(msg).is_err() {
            self.pending_requests.write().await.remove(&request_id);
            return Err(RpcError::connection_closed());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => {
                self.pending_requests.write().await.remove(&request_id);
                Err(RpcError::connection_closed())
            }
            Err(_) => {
                self.pending_requests.write().await.remove(&request_id);
                Err(RpcError::timeout(format!(
                    "请求超时: node={}, method={}",
                    self.node_id, method
                )))
            }
        }
    }

    /// 处理收到的响应消息（由 WebSocket handler 调用）
    pub async fn handle_response(&self, response: RpcMessage) {
        if let Some(ref error_info) = response.error {
            warn!("📥 [Agent -> Server] 错误响应: node={}, id={}, code={}, message={}",
                  self.node_id, response.id, error_info.code, error_info.message);
        }

        let sender = self.pending_requests.write().await.remove(&response.id);
        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("等待者已放弃请求: node={}", self.node_id);
                }
            }
            None => debug!("收到未预期的响应: {}", response.id),
        }
    }

    /// 连接断开时唤醒所有等待者
    async fn fail_pending(&self) {
        let mut pending = self.pending_requests.write().await;
        for (id, _) in pending.drain() {
            debug!("清理待处理请求: {}", id);
        }
    }

    /// 更新最后心跳时间
    pub async fn update_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    /// 距离上次心跳的时间
    pub async fn heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.read().await.elapsed()
    }
}

/// Agent 连接管理器
#[derive(Clone, Default)]
pub struct AgentConnectionManager {
    /// 所有连接的映射：node_id -> AgentConnection
    connections: Arc<RwLock<HashMap<String, Arc<AgentConnection>>>>,
}

impl AgentConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新的 Agent 连接，同一节点重连时替换旧连接
    pub async fn register(&self, connection: AgentConnection) -> Arc<AgentConnection> {
        let connection = Arc::new(connection);
        let old = self
            .connections
            .write()
            .await
            .insert(connection.node_id.clone(), connection.clone());
        if let Some(old) = old {
            old.fail_pending().await;
        }
        info!("Agent 已注册: {} ({})", connection.node_id, connection.ip_address);
        connection
    }

    /// 注销 Agent 连接（仅当仍是同一个连接时）
    pub async fn unregister(&self, connection: &Arc<AgentConnection>) {
        let mut connections = self.connections.write().await;
        let same = connections
            .get(&connection.node_id)
            .map(|c| Arc::ptr_eq(c, connection))
            .unwrap_or(false);
        if same {
            connections.remove(&connection.node_id);
            info!("Agent 已注销: {}", connection.node_id);
        }
        drop(connections);
        connection.fail_pending().await;
    }

    /// 获取指定节点的连接
    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.read().await.get(node_id).cloned()
    }

    /// 检查节点是否在线
    pub async fn is_online(&self, node_id: &str) -> bool {
        self.connections.read().await.contains_key(node_id)
    }

    /// 在线节点数量
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 向指定节点发送 RPC 请求
    pub async fn call(
        &self,
        node_id: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let connection = self
            .get(node_id)
            .await
            .ok_or_else(|| RpcError::node_not_found(node_id))?;

        connection.call(method, payload, timeout).await
    }

    /// 清理心跳超时的连接，返回被清理的节点 ID 列表
    pub async fn cleanup_timeout_connections(&self, timeout: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let connections = self.connections.read().await;
            for (node_id, conn) in connections.iter() {
                let elapsed = conn.heartbeat_elapsed().await;
                if elapsed > timeout {
                    warn!("节点心跳超时: {} ({}秒)", node_id, elapsed.as_secs());
                    expired.push(conn.clone());
                }
            }
        }

        let mut removed = Vec::with_capacity(expired.len());
        for conn in expired {
            self.unregister(&conn).await;
            removed.push(conn.node_id.clone());
        }
        removed
    }

    /// 启动心跳超时检查任务
    pub fn start_heartbeat_monitor(self, timeout: Duration, check_interval: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                interval.tick().await;
                let removed = self.cleanup_timeout_connections(timeout).await;
                if !removed.is_empty() {
                    warn!("心跳监控: 清理了 {} 个超时节点", removed.len());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ws_rpc::RpcErrorCode;
    use serde_json::json;

    /// 模拟 Agent：对每个请求回显 payload
    fn spawn_echo_agent(
        conn: Arc<AgentConnection>,
        mut rx: mpsc::UnboundedReceiver<RpcMessage>,
    ) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let reply = match msg.method.as_deref() {
                    Some("missing") => RpcMessage::error_response(
                        msg.id.clone(),
                        &RpcError::domain_not_found("u1"),
                    ),
                    Some("silent") => continue,
                    _ => RpcMessage::response(msg.id.clone(), msg.payload.clone().unwrap_or_default()),
                };
                conn.handle_response(reply).await;
            }
        });
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let manager = AgentConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = manager.register(AgentConnection::new("node-1", "10.0.0.1", tx)).await;
        spawn_echo_agent(conn, rx);

        let value = manager
            .call("node-1", "ping", json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value["x"], 1);
    }

    #[tokio::test]
    async fn test_error_code_preserved() {
        let manager = AgentConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = manager.register(AgentConnection::new("node-1", "10.0.0.1", tx)).await;
        spawn_echo_agent(conn, rx);

        let err = manager
            .call("node-1", "missing", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::DomainNotFound);
    }

    #[tokio::test]
    async fn test_timeout_and_offline() {
        let manager = AgentConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = manager.register(AgentConnection::new("node-1", "10.0.0.1", tx)).await;
        spawn_echo_agent(conn.clone(), rx);

        let err = manager
            .call("node-1", "silent", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.code.is_unreachable());

        let err = manager
            .call("node-2", "ping", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NodeNotFound);

        manager.unregister(&conn).await;
        assert!(!manager.is_online("node-1").await);
    }
}

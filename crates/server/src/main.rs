/// VM Cloud - Server
///
/// 控制面主程序：虚拟机生命周期、资源记账、调度与迁移，经 WebSocket 驱动宿主机 Agent

mod api;
mod app_state;
mod config;
mod db;
mod errors;
mod hypervisor;
mod services;
mod storage;
#[cfg(test)]
mod test_support;
mod ws;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{app_state::AppState, db::establish_connection, ws::AgentConnectionManager};

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")));
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    let cfg = config::Config::from_env()?;
    init_tracing(cfg.json_logs());
    info!("🚀 启动 VM Cloud Server...");
    info!("✅ 配置加载成功");

    let sea_db = establish_connection(&cfg.database_url).await?;
    info!("✅ SeaORM 数据库连接成功");
    db::sync_schema(&sea_db).await?;
    info!("✅ 数据表检查完成");

    let agent_manager = AgentConnectionManager::new();
    let heartbeat_timeout = cfg.heartbeat_timeout();
    let app_state = AppState::new(sea_db, agent_manager.clone(), &cfg);

    // 上次进程退出时未完成的迁移任务
    match app_state.migration().recover_orphans().await {
        Ok(n) => info!("✅ 迁移任务检查完成，处理 {} 个遗留任务", n),
        Err(e) => warn!("迁移任务检查失败: {}", e),
    }

    agent_manager.start_heartbeat_monitor(heartbeat_timeout, Duration::from_secs(30));
    info!("✅ 心跳监控任务已启动（{}秒超时）", heartbeat_timeout.as_secs());

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ws/agent", get(ws::handle_agent_websocket))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root_handler() -> &'static str {
    "VM Cloud Server API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}

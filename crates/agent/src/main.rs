/// VM Cloud - Agent
///
/// 宿主机代理程序：连接 Server，经 libvirt 执行虚拟机域操作

mod config;
mod hypervisor;
mod node;
mod ws;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hypervisor::{DomainBackend, LibvirtDriver};
use node::NodeManager;
use ws::{RpcHandler, WsClient};

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
    dotenvy::dotenv().ok();

    let cfg = config::Config::from_env()?;
    init_tracing(cfg.json_logs());
    info!("🚀 启动 VM Cloud Agent...");
    info!("✅ 配置加载成功");

    info!("🔧 连接 libvirt...");
    let driver = Arc::new(LibvirtDriver::connect(cfg.libvirt_uri.clone())?);
    driver.ping().await?;
    let handler = RpcHandler::new(driver);
    info!("✅ RPC 处理器已初始化");

    let node = NodeManager::new(cfg.node_id.clone(), config::local_hostname(), cfg.node_ip.clone());
    node.log_summary();

    let client = WsClient::new(
        cfg.server_ws_url.clone(),
        node,
        handler,
        cfg.heartbeat_interval(),
        cfg.reconnect_interval(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("收到 Ctrl-C，准备退出");
                signal.cancel();
            }
            Err(e) => warn!("监听退出信号失败: {}", e),
        }
    });

    info!("🎯 连接到 Server: {}", cfg.server_ws_url);
    client.run(shutdown).await;
    info!("👋 Agent 已退出");

    Ok(())
}

/// 配置管理
///
/// 加载顺序：默认值 → config/agent.toml（可选）→ 环境变量

use common::{Error, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 节点 ID，须与控制面登记的宿主机 agent_node_id 一致，为空时取主机名
    pub node_id: String,
    /// 宿主机 IPv4，热迁移时作为目标地址
    pub node_ip: String,
    pub server_ws_url: String,
    pub heartbeat_interval: u64,
    pub reconnect_interval: u64,
    pub libvirt_uri: String,
    /// text / json
    pub log_format: String,
}

impl Config {
    fn defaults() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("node_id", "")?
            .set_default("node_ip", "127.0.0.1")?
            .set_default("server_ws_url", "ws://localhost:3000/ws/agent")?
            .set_default("heartbeat_interval", 30)?
            .set_default("reconnect_interval", 5)?
            .set_default("libvirt_uri", "qemu:///system")?
            .set_default("log_format", "text")
    }

    /// 从配置文件和环境变量加载配置
    pub fn from_env() -> Result<Self> {
        let cfg: Config = Self::defaults()
            .and_then(|b| {
                b.add_source(File::with_name("config/agent").required(false))
                    .add_source(Environment::default().try_parsing(true))
                    .build()
            })
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(config_err)?;
        cfg.finish()
    }

    /// 补全节点 ID 并校验
    fn finish(mut self) -> Result<Self> {
        if self.node_id.trim().is_empty() {
            self.node_id = local_hostname();
        }
        if !common::utils::validate_ip_address(&self.node_ip) {
            return Err(Error::Config(format!("NODE_IP 不是合法的 IPv4 地址: {}", self.node_ip)));
        }
        if self.heartbeat_interval == 0 {
            return Err(Error::Config("HEARTBEAT_INTERVAL 必须大于 0".to_string()));
        }
        Ok(self)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval.max(1))
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

fn config_err(e: ConfigError) -> Error {
    Error::Config(e.to_string())
}

/// 本机主机名
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 节点信息
///
/// 注册时上报宿主机的标识与实际容量，控制面只用于比对登记值

use common::utils::format_bytes;
use common::ws_rpc::RegisterRequest;
use std::path::Path;
use sysinfo::System;
use tracing::{info, warn};

const MIB: u64 = 1024 * 1024;

/// 节点信息管理器
#[derive(Debug, Clone)]
pub struct NodeManager {
    node_id: String,
    hostname: String,
    ip_address: String,
}

/// 宿主机资源快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    pub cpu_threads: u32,
    /// 内存总量（字节）
    pub memory_total: u64,
}

impl NodeCapacity {
    /// 采集本机 CPU 线程数与内存
    pub fn collect() -> Self {
        let sys = System::new_all();
        Self {
            cpu_threads: u32::try_from(sys.cpus().len()).unwrap_or(u32::MAX),
            memory_total: sys.total_memory(),
        }
    }

    pub fn memory_total_mb(&self) -> u64 {
        self.memory_total / MIB
    }
}

impl NodeManager {
    pub fn new(
        node_id: impl Into<String>,
        hostname: impl Into<String>,
        ip_address: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            ip_address: ip_address.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 构造注册请求，每次连接时重新采集容量
    pub fn register_request(&self) -> RegisterRequest {
        self.register_request_with(NodeCapacity::collect())
    }

    fn register_request_with(&self, capacity: NodeCapacity) -> RegisterRequest {
        RegisterRequest {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone(),
            cpu_threads: capacity.cpu_threads,
            memory_total_mb: capacity.memory_total_mb(),
        }
    }

    /// 启动时打印节点概况并检查 KVM
    pub fn log_summary(&self) {
        let capacity = NodeCapacity::collect();
        info!(
            "📌 节点: id={}, hostname={}, ip={}, cpu_threads={}, memory={}",
            self.node_id,
            self.hostname,
            self.ip_address,
            capacity.cpu_threads,
            format_bytes(capacity.memory_total)
        );
        if !Path::new("/dev/kvm").exists() {
            warn!("未检测到 /dev/kvm，虚拟机将无法使用硬件加速");
        }
    }
}

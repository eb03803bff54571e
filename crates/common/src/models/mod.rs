/// 共享数据模型
///
/// 定义 Server 和 Agent 共享的虚拟机域状态与性能统计

use serde::{Deserialize, Serialize};

/// 虚拟机域状态
///
/// 0-7 与 libvirt 的 virDomainState 取值一致，9/10 为控制面补充的状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    Suspended,
    /// 宿主机无法连接
    HostUnreachable,
    /// 宿主机上找不到该域
    Missing,
}

impl DomainState {
    /// 从状态码构造，未知状态码视为 NoState
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::ShuttingDown,
            5 => Self::ShutOff,
            6 => Self::Crashed,
            7 => Self::Suspended,
            9 => Self::HostUnreachable,
            10 => Self::Missing,
            _ => Self::NoState,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::NoState => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Paused => 3,
            Self::ShuttingDown => 4,
            Self::ShutOff => 5,
            Self::Crashed => 6,
            Self::Suspended => 7,
            Self::HostUnreachable => 9,
            Self::Missing => 10,
        }
    }

    pub fn as_text(&self) -> &'static str {
        match self {
            Self::NoState => "no state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::ShuttingDown => "shut down",
            Self::ShutOff => "shut off",
            Self::Crashed => "crashed",
            Self::Suspended => "suspended",
            Self::HostUnreachable => "host connect failed",
            Self::Missing => "miss",
        }
    }

    /// 是否处于运行中（含阻塞、暂停、挂起）
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Blocked | Self::Paused | Self::Suspended
        )
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// 虚拟机性能统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainStats {
    /// CPU 累计时间（纳秒）
    pub cpu_time: u64,
    /// 已用内存（KiB）
    pub mem_used: u64,
    /// 内存总量（KiB）
    pub mem_total: u64,
    pub disk_rd: u64,
    pub disk_wr: u64,
    pub net_rx: u64,
    pub net_tx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_state_codes() {
        for code in [0u32, 1, 2, 3, 4, 5, 6, 7, 9, 10] {
            assert_eq!(DomainState::from_code(code).code(), code);
        }
        assert_eq!(DomainState::from_code(8), DomainState::NoState);
        assert_eq!(DomainState::from_code(42), DomainState::NoState);
    }

    #[test]
    fn test_is_running() {
        assert!(DomainState::Running.is_running());
        assert!(DomainState::Paused.is_running());
        assert!(DomainState::Suspended.is_running());
        assert!(!DomainState::ShutOff.is_running());
        assert!(!DomainState::HostUnreachable.is_running());
        assert!(!DomainState::Missing.is_running());
    }

    #[test]
    fn test_state_text() {
        assert_eq!(DomainState::ShutOff.to_string(), "shut off");
        assert_eq!(DomainState::HostUnreachable.as_text(), "host connect failed");
    }
}

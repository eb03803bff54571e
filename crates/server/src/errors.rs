/// 控制面错误类型
///
/// 每个错误都带稳定的机器可读错误码（`code()`）和人类可读信息

use thiserror::Error;

/// 调度错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{0}")]
    NoHost(String),
    #[error("{0}")]
    NoMacIp(String),
    #[error("{0}")]
    NoHostOrMacIp(String),
    #[error("{0}")]
    NoHostGroup(String),
}

impl ScheduleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoHost(_) => "NO_HOST",
            Self::NoMacIp(_) => "NO_MAC_IP",
            Self::NoHostOrMacIp(_) => "NO_HOST_OR_MAC_IP",
            Self::NoHostGroup(_) => "NO_HOST_GROUP",
        }
    }
}

/// 计算资源错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("{0}")]
    VcpuNotEnough(String),
    #[error("{0}")]
    RamNotEnough(String),
}

impl ComputeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::VcpuNotEnough(_) => "VCPU_NOT_ENOUGH",
            Self::RamNotEnough(_) => "RAM_NOT_ENOUGH",
        }
    }
}

/// 虚拟机错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("{0}")]
    NotExist(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    Running(String),
    #[error("{0}")]
    AlreadyExist(String),
    #[error("{0}")]
    DiskImageMiss(String),
    #[error("{0}")]
    SysDiskTooSmall(String),
    #[error("{0}")]
    AcrossGroupConflict(String),
    #[error("{0}")]
    AcrossCenterConflict(String),
    #[error("{0}")]
    TooManyVdiskMounted(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    SnapNotExist(String),
    #[error("{0}")]
    SnapNotBelongToVm(String),
}

impl VmError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotExist(_) => "VM_NOT_EXIST",
            Self::AccessDenied(_) => "VM_ACCESS_DENIED",
            Self::Running(_) => "VM_RUNNING",
            Self::AlreadyExist(_) => "VM_ALREADY_EXIST",
            Self::DiskImageMiss(_) => "DISK_IMAGE_MISS",
            Self::SysDiskTooSmall(_) => "SYS_DISK_TOO_SMALL",
            Self::AcrossGroupConflict(_) => "ACROSS_GROUP_CONFLICT",
            Self::AcrossCenterConflict(_) => "ACROSS_CENTER_CONFLICT",
            Self::TooManyVdiskMounted(_) => "TOO_MANY_VDISK_MOUNTED",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::SnapNotExist(_) => "SNAP_NOT_EXIST",
            Self::SnapNotBelongToVm(_) => "SNAP_NOT_BELONG_TO_VM",
        }
    }
}

/// 设备错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    NotActive(String),
}

impl DeviceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "DEVICE_NOT_FOUND",
            Self::AccessDenied(_) => "DEVICE_ACCESS_DENIED",
            Self::NotActive(_) => "DEVICE_NOT_ACTIVE",
        }
    }
}

/// 虚拟化层错误
///
/// 宿主机不可达与虚拟机不存在必须区分：前者可能重试或强制处理，后者按幂等成功处理
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("{0}")]
    HostUnreachable(String),
    #[error("{0}")]
    DomainNotExist(String),
    #[error("{0}")]
    Generic(String),
}

impl HypervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::HostUnreachable(_) => "HOST_UNREACHABLE",
            Self::DomainNotExist(_) => "DOMAIN_NOT_EXIST",
            Self::Generic(_) => "HYPERVISOR_ERROR",
        }
    }
}

/// 存储后端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "STORAGE_ALREADY_EXISTS",
            Self::NotFound(_) => "STORAGE_NOT_FOUND",
            Self::Backend(_) => "STORAGE_ERROR",
        }
    }
}

/// 控制面统一错误类型
#[derive(Error, Debug)]
pub enum CloudError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("存储错误: {0}")]
    Storage(#[from] StorageError),

    #[error("无效参数: {0}")]
    BadRequest(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CloudError {
    /// 稳定的机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schedule(e) => e.code(),
            Self::Compute(e) => e.code(),
            Self::Vm(e) => e.code(),
            Self::Device(e) => e.code(),
            Self::Hypervisor(e) => e.code(),
            Self::Storage(e) => e.code(),
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_host_unreachable(&self) -> bool {
        matches!(self, Self::Hypervisor(HypervisorError::HostUnreachable(_)))
    }

    pub fn is_domain_not_exist(&self) -> bool {
        matches!(self, Self::Hypervisor(HypervisorError::DomainNotExist(_)))
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

/// 控制面结果类型
pub type Result<T> = std::result::Result<T, CloudError>;

/// 块存储协作者
///
/// 系统盘与云硬盘都是存储池中的镜像，控制面只通过 `DiskStorage` 操作它们

pub mod rbd;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;

pub use rbd::RbdStorage;

use crate::db::models::center::Center;
use crate::errors::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// 存储池定位信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRef {
    /// 集群 ID，对应 `<conf_dir>/<ceph_id>.conf`
    pub ceph_id: i32,
    pub pool: String,
    pub data_pool: Option<String>,
    pub username: String,
}

impl PoolRef {
    pub fn from_center(center: &Center) -> Self {
        Self {
            ceph_id: center.ceph_id,
            pool: center.ceph_pool.clone(),
            data_pool: center.ceph_data_pool.clone(),
            username: center.ceph_username.clone(),
        }
    }
}

#[async_trait]
pub trait DiskStorage: Send + Sync + 'static {
    /// 从父镜像快照克隆新镜像，目标已存在时返回 `AlreadyExists`
    async fn clone_from_snapshot(
        &self,
        pool: &PoolRef,
        src: &str,
        snap: &str,
        new_name: &str,
    ) -> StorageResult<()>;

    /// 扩容到指定大小（GiB）
    async fn resize(&self, pool: &PoolRef, name: &str, size_gb: i32) -> StorageResult<()>;

    /// 删除镜像，不存在视为成功
    async fn remove(&self, pool: &PoolRef, name: &str) -> StorageResult<()>;

    async fn exists(&self, pool: &PoolRef, name: &str) -> StorageResult<bool>;

    async fn rename(&self, pool: &PoolRef, src: &str, dst: &str) -> StorageResult<()>;

    async fn size_bytes(&self, pool: &PoolRef, name: &str) -> StorageResult<u64>;

    async fn create_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()>;

    /// 删除快照，不存在视为成功
    async fn remove_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()>;

    async fn rollback_to_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()>;
}

/// Ceph RBD 存储实现
///
/// 通过 `rbd` 命令行操作镜像

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{DiskStorage, PoolRef, StorageResult};
use crate::errors::StorageError;

pub struct RbdStorage {
    rbd_bin: String,
    conf_dir: PathBuf,
}

impl RbdStorage {
    pub fn new(rbd_bin: impl Into<String>, conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            rbd_bin: rbd_bin.into(),
            conf_dir: conf_dir.into(),
        }
    }

    fn base_args(&self, pool: &PoolRef) -> Vec<String> {
        let conf = self.conf_dir.join(format!("{}.conf", pool.ceph_id));
        vec![
            "--id".to_string(),
            pool.username.clone(),
            "-c".to_string(),
            conf.to_string_lossy().to_string(),
        ]
    }

    /// 执行 rbd 子命令，返回标准输出
    async fn run(&self, pool: &PoolRef, args: &[String]) -> StorageResult<Vec<u8>> {
        let mut all = self.base_args(pool);
        all.extend_from_slice(args);
        debug!("执行: {} {}", self.rbd_bin, all.join(" "));

        let output = Command::new(&self.rbd_bin)
            .args(&all)
            .output()
            .await
            .map_err(|e| StorageError::Backend(format!("无法执行 {}: {}", self.rbd_bin, e)))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = classify_stderr(&stderr);
        if matches!(err, StorageError::Backend(_)) {
            error!("rbd {} 失败: {}", args.first().map(String::as_str).unwrap_or(""), stderr.trim());
        }
        Err(err)
    }
}

fn image_spec(pool: &PoolRef, name: &str) -> String {
    format!("{}/{}", pool.pool, name)
}

fn snap_spec(pool: &PoolRef, name: &str, snap: &str) -> String {
    format!("{}/{}@{}", pool.pool, name, snap)
}

/// 按 rbd 的错误输出区分已存在/不存在
fn classify_stderr(stderr: &str) -> StorageError {
    let msg = stderr.trim().to_string();
    if msg.contains("(17)") || msg.contains("File exists") {
        StorageError::AlreadyExists(msg)
    } else if msg.contains("(2)") || msg.contains("No such file or directory") {
        StorageError::NotFound(msg)
    } else {
        StorageError::Backend(msg)
    }
}

fn parse_info_size(stdout: &[u8]) -> StorageResult<u64> {
    let info: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| StorageError::Backend(format!("解析 rbd info 输出失败: {}", e)))?;
    info["size"]
        .as_u64()
        .ok_or_else(|| StorageError::Backend("rbd info 输出缺少 size".to_string()))
}

#[async_trait]
impl DiskStorage for RbdStorage {
    async fn clone_from_snapshot(
        &self,
        pool: &PoolRef,
        src: &str,
        snap: &str,
        new_name: &str,
    ) -> StorageResult<()> {
        let mut args = vec![
            "clone".to_string(),
            snap_spec(pool, src, snap),
            image_spec(pool, new_name),
        ];
        if let Some(dp) = &pool.data_pool {
            args.push("--data-pool".to_string());
            args.push(dp.clone());
        }
        self.run(pool, &args).await?;
        info!("克隆镜像: {}@{} -> {}", src, snap, new_name);
        Ok(())
    }

    async fn resize(&self, pool: &PoolRef, name: &str, size_gb: i32) -> StorageResult<()> {
        let args = vec![
            "resize".to_string(),
            "--size".to_string(),
            format!("{}G", size_gb),
            image_spec(pool, name),
        ];
        self.run(pool, &args).await?;
        info!("镜像 {} 扩容到 {}GiB", name, size_gb);
        Ok(())
    }

    async fn remove(&self, pool: &PoolRef, name: &str) -> StorageResult<()> {
        match self.run(pool, &["rm".to_string(), image_spec(pool, name)]).await {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, pool: &PoolRef, name: &str) -> StorageResult<bool> {
        match self.run(pool, &["info".to_string(), image_spec(pool, name)]).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, pool: &PoolRef, src: &str, dst: &str) -> StorageResult<()> {
        let args = vec!["mv".to_string(), image_spec(pool, src), image_spec(pool, dst)];
        self.run(pool, &args).await?;
        Ok(())
    }

    async fn size_bytes(&self, pool: &PoolRef, name: &str) -> StorageResult<u64> {
        let args = vec![
            "info".to_string(),
            "--format".to_string(),
            "json".to_string(),
            image_spec(pool, name),
        ];
        let out = self.run(pool, &args).await?;
        parse_info_size(&out)
    }

    async fn create_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()> {
        let args = vec!["snap".to_string(), "create".to_string(), snap_spec(pool, name, snap)];
        self.run(pool, &args).await?;
        Ok(())
    }

    async fn remove_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()> {
        let args = vec!["snap".to_string(), "rm".to_string(), snap_spec(pool, name, snap)];
        match self.run(pool, &args).await {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rollback_to_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()> {
        let args = vec!["snap".to_string(), "rollback".to_string(), snap_spec(pool, name, snap)];
        self.run(pool, &args).await?;
        info!("镜像 {} 已回滚到快照 {}", name, snap);
        Ok(())
    }
}

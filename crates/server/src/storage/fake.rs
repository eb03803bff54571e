/// 测试用内存块存储

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{DiskStorage, PoolRef, StorageResult};
use crate::errors::StorageError;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct FakeImage {
    size: u64,
    /// 快照名 -> 快照时的大小
    snaps: HashMap<String, u64>,
}

#[derive(Default)]
pub struct FakeStorage {
    images: Mutex<HashMap<String, FakeImage>>,
    failing: Mutex<HashSet<&'static str>>,
}

fn key(pool: &PoolRef, name: &str) -> String {
    format!("{}/{}", pool.pool, name)
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入一个带快照的父镜像
    pub fn put_image(&self, pool: &PoolRef, name: &str, size_gb: u64, snap: Option<&str>) {
        let mut snaps = HashMap::new();
        if let Some(s) = snap {
            snaps.insert(s.to_string(), size_gb * GIB);
        }
        self.images.lock().unwrap().insert(
            key(pool, name),
            FakeImage {
                size: size_gb * GIB,
                snaps,
            },
        );
    }

    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn has_image(&self, pool: &PoolRef, name: &str) -> bool {
        self.images.lock().unwrap().contains_key(&key(pool, name))
    }

    pub fn image_names(&self) -> Vec<String> {
        self.images.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> bool {
        self.images
            .lock()
            .unwrap()
            .get(&key(pool, name))
            .map(|i| i.snaps.contains_key(snap))
            .unwrap_or(false)
    }

    fn check(&self, op: &'static str) -> StorageResult<()> {
        if self.failing.lock().unwrap().contains(op) {
            return Err(StorageError::Backend(format!("{} 失败", op)));
        }
        Ok(())
    }

    fn not_found(pool: &PoolRef, name: &str) -> StorageError {
        StorageError::NotFound(format!("镜像 {} 不存在", key(pool, name)))
    }
}

#[async_trait]
impl DiskStorage for FakeStorage {
    async fn clone_from_snapshot(
        &self,
        pool: &PoolRef,
        src: &str,
        snap: &str,
        new_name: &str,
    ) -> StorageResult<()> {
        self.check("clone")?;
        let mut images = self.images.lock().unwrap();
        let size = images
            .get(&key(pool, src))
            .and_then(|i| i.snaps.get(snap).copied())
            .ok_or_else(|| Self::not_found(pool, src))?;
        let k = key(pool, new_name);
        if images.contains_key(&k) {
            return Err(StorageError::AlreadyExists(format!("镜像 {} 已存在", k)));
        }
        images.insert(k, FakeImage { size, snaps: HashMap::new() });
        Ok(())
    }

    async fn resize(&self, pool: &PoolRef, name: &str, size_gb: i32) -> StorageResult<()> {
        self.check("resize")?;
        let mut images = self.images.lock().unwrap();
        let img = images
            .get_mut(&key(pool, name))
            .ok_or_else(|| Self::not_found(pool, name))?;
        img.size = size_gb.max(0) as u64 * GIB;
        Ok(())
    }

    async fn remove(&self, pool: &PoolRef, name: &str) -> StorageResult<()> {
        self.check("remove")?;
        self.images.lock().unwrap().remove(&key(pool, name));
        Ok(())
    }

    async fn exists(&self, pool: &PoolRef, name: &str) -> StorageResult<bool> {
        self.check("exists")?;
        Ok(self.has_image(pool, name))
    }

    async fn rename(&self, pool: &PoolRef, src: &str, dst: &str) -> StorageResult<()> {
        self.check("rename")?;
        let mut images = self.images.lock().unwrap();
        let img = images
            .remove(&key(pool, src))
            .ok_or_else(|| Self::not_found(pool, src))?;
        images.insert(key(pool, dst), img);
        Ok(())
    }

    async fn size_bytes(&self, pool: &PoolRef, name: &str) -> StorageResult<u64> {
        self.check("size_bytes")?;
        self.images
            .lock()
            .unwrap()
            .get(&key(pool, name))
            .map(|i| i.size)
            .ok_or_else(|| Self::not_found(pool, name))
    }

    async fn create_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()> {
        self.check("create_snapshot")?;
        let mut images = self.images.lock().unwrap();
        let img = images
            .get_mut(&key(pool, name))
            .ok_or_else(|| Self::not_found(pool, name))?;
        let size = img.size;
        img.snaps.insert(snap.to_string(), size);
        Ok(())
    }

    async fn remove_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()> {
        self.check("remove_snapshot")?;
        if let Some(img) = self.images.lock().unwrap().get_mut(&key(pool, name)) {
            img.snaps.remove(snap);
        }
        Ok(())
    }

    async fn rollback_to_snapshot(&self, pool: &PoolRef, name: &str, snap: &str) -> StorageResult<()> {
        self.check("rollback")?;
        let mut images = self.images.lock().unwrap();
        let img = images
            .get_mut(&key(pool, name))
            .ok_or_else(|| Self::not_found(pool, name))?;
        let size = img
            .snaps
            .get(snap)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("快照 {} 不存在", snap)))?;
        img.size = size;
        Ok(())
    }
}

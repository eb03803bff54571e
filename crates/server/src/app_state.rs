/// 应用全局状态

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::Config;
use crate::hypervisor::AgentHypervisor;
use crate::services::{CloudContext, MigrationEngine, MigrationWorkerPool, VmBuilder, VmInstance};
use crate::storage::RbdStorage;
use crate::ws::AgentConnectionManager;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub sea_db: DatabaseConnection,
    /// Agent WebSocket 连接管理器
    pub agent_manager: AgentConnectionManager,
    pub ctx: CloudContext,
    /// 热迁移工作池，进程内唯一
    pub migration_pool: MigrationWorkerPool,
}

impl AppState {
    /// 组装控制面依赖并启动迁移工作池
    pub fn new(sea_db: DatabaseConnection, agent_manager: AgentConnectionManager, config: &Config) -> Self {
        let hypervisor = Arc::new(AgentHypervisor::new(agent_manager.clone(), config.hypervisor_timeouts()));
        let storage = Arc::new(RbdStorage::new(config.rbd_bin.clone(), config.ceph_conf_dir.clone()));
        let ctx = CloudContext::new(sea_db.clone(), hypervisor, storage);
        let migration_pool = MigrationWorkerPool::start(ctx.clone(), config.migration_workers, config.migration_queue);
        Self {
            sea_db,
            agent_manager,
            ctx,
            migration_pool,
        }
    }

    #[cfg(test)]
    pub fn for_test(ctx: CloudContext) -> Self {
        Self {
            sea_db: ctx.db.clone(),
            agent_manager: AgentConnectionManager::new(),
            migration_pool: MigrationWorkerPool::start(ctx.clone(), 1, 8),
            ctx,
        }
    }

    /// 获取 Agent 连接管理器
    pub fn agent_manager(&self) -> AgentConnectionManager {
        self.agent_manager.clone()
    }

    pub fn vm_builder(&self) -> VmBuilder {
        VmBuilder::new(self.ctx.clone())
    }

    pub fn vm_instance(&self) -> VmInstance {
        VmInstance::new(self.ctx.clone())
    }

    pub fn migration(&self) -> MigrationEngine {
        MigrationEngine::new(self.ctx.clone(), self.migration_pool.clone())
    }
}

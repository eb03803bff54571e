/// 虚拟机迁移
///
/// 静态迁移同步执行；热迁移持久化为 MigrateTask 后交给工作池异步执行。
/// 任务行是迁移的持久句柄，进程重启或中途失败后据此恢复

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::access::UserContext;
use super::context::CloudContext;
use super::device;
use crate::db::models::host::Host;
use crate::db::models::migrate_task::{self, MigrateStatus, MigrateTask, TAG_LIVE, TAG_STATIC};
use crate::db::models::vm::{self, Vm};
use crate::db::models::vm_log::LogAbout;
use crate::errors::{CloudError, HypervisorError, Result, VmError};
use common::DomainState;

const CONTENT_OK: &str = "迁移正常";

async fn save_task(db: &DatabaseConnection, task: &MigrateTask) -> Result<MigrateTask> {
    Ok(task.clone().into_active_model().reset_all().update(db).await?)
}

async fn set_vm_host(db: &DatabaseConnection, uuid: &str, host_id: i32) -> Result<()> {
    vm::Entity::update_many()
        .col_expr(vm::Column::HostId, Expr::value(host_id))
        .filter(vm::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

/// 从宿主机读取持久化 XML 写回元数据，失败只记录日志
async fn refresh_vm_xml(ctx: &CloudContext, host: &Host, uuid: &str) {
    let xml = match ctx.hypervisor.xml_desc(host, uuid, false).await {
        Ok(x) => x,
        Err(e) => {
            warn!("获取虚拟机({}) XML 失败: {}", uuid, e);
            return;
        }
    };
    let res = vm::Entity::update_many()
        .col_expr(vm::Column::Xml, Expr::value(xml))
        .filter(vm::Column::Uuid.eq(uuid))
        .exec(&ctx.db)
        .await;
    if let Err(e) = res {
        warn!("更新虚拟机({}) XML 失败: {}", uuid, e);
    }
}

/// 调整宿主机虚拟机数量，失败写运维日志并记入 `msgs`
async fn vm_created_add_logged(ctx: &CloudContext, host: &Host, n: i32, msgs: &mut Vec<String>) {
    if let Err(e) = ctx.ledger().vm_created_add(host.id, n).await {
        let msg = format!("宿主机({})虚拟机数量调整({:+})失败: {}", host.ipv4, n, e);
        ctx.vm_log().write("宿主机虚拟机数量调整失败", LogAbout::HostVmCreated, &msg).await;
        msgs.push(msg);
    }
}

/// 释放宿主机资源，失败写运维日志并记入 `msgs`
///
/// 归还目标宿主机的申请时 `release_vm` 为真，连同虚拟机名额一起归还
async fn free_logged(ctx: &CloudContext, host: &Host, vm: &Vm, release_vm: bool, msgs: &mut Vec<String>) -> bool {
    match ctx.ledger().free(host.id, vm.vcpu, vm.mem, release_vm).await {
        Ok(()) => true,
        Err(e) => {
            let msg = format!("释放宿主机({})资源失败: vcpu={}, mem={}MiB: {}", host.ipv4, vm.vcpu, vm.mem, e);
            ctx.vm_log().write("释放宿主机资源失败", LogAbout::HostCpuMem, &msg).await;
            msgs.push(msg);
            false
        }
    }
}

fn join_content(msgs: &[String]) -> String {
    if msgs.is_empty() {
        CONTENT_OK.to_string()
    } else {
        msgs.join("; ")
    }
}

/// 受理中的虚拟机，守卫释放时移出
type Accepting = Arc<StdMutex<HashSet<String>>>;

/// 同一虚拟机同时只受理一个迁移请求
///
/// 从检查遗留任务开始持有，直到新任务已提交工作池（或静态迁移结束）
pub struct MigrateGuard {
    uuid: String,
    accepting: Accepting,
}

impl Drop for MigrateGuard {
    fn drop(&mut self) {
        let mut set = self.accepting.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.uuid);
    }
}

/// 热迁移工作池
///
/// 进程启动时创建，由 AppState 持有；`in_flight` 记录已提交但未执行完的任务
#[derive(Clone)]
pub struct MigrationWorkerPool {
    tx: mpsc::Sender<i32>,
    in_flight: Arc<RwLock<HashSet<i32>>>,
    accepting: Accepting,
}

impl MigrationWorkerPool {
    pub fn start(ctx: CloudContext, workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(RwLock::new(HashSet::new()));

        for worker_id in 0..workers.max(1) {
            let ctx = ctx.clone();
            let rx = rx.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(task_id) = next else {
                        debug!("迁移工作线程 {} 退出", worker_id);
                        break;
                    };
                    run_live_task(&ctx, task_id).await;
                    in_flight.write().await.remove(&task_id);
                }
            });
        }
        info!("✅ 迁移工作池已启动: workers={}", workers.max(1));

        Self {
            tx,
            in_flight,
            accepting: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// 占用虚拟机的迁移受理权，已被占用时返回错误
    pub fn lock_vm(&self, uuid: &str) -> Result<MigrateGuard> {
        let mut set = self.accepting.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(uuid.to_string()) {
            return Err(CloudError::bad_request(format!("虚拟机({})有正在进行的迁移任务", uuid)));
        }
        Ok(MigrateGuard {
            uuid: uuid.to_string(),
            accepting: self.accepting.clone(),
        })
    }

    fn is_accepting(&self, uuid: &str) -> bool {
        self.accepting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(uuid)
    }

    pub async fn submit(&self, task_id: i32) -> Result<()> {
        self.in_flight.write().await.insert(task_id);
        if let Err(e) = self.tx.try_send(task_id) {
            self.in_flight.write().await.remove(&task_id);
            return Err(CloudError::Internal(format!("迁移任务({})提交失败: {}", task_id, e)));
        }
        Ok(())
    }

    pub async fn is_in_flight(&self, task_id: i32) -> bool {
        self.in_flight.read().await.contains(&task_id)
    }
}

/// 工作线程执行一个热迁移任务
async fn run_live_task(ctx: &CloudContext, task_id: i32) {
    let claimed = migrate_task::Entity::update_many()
        .col_expr(migrate_task::Column::Status, Expr::value(MigrateStatus::InProcess.as_str()))
        .filter(migrate_task::Column::Id.eq(task_id))
        .filter(migrate_task::Column::Status.eq(MigrateStatus::Waiting.as_str()))
        .exec(&ctx.db)
        .await;
    match claimed {
        Ok(res) if res.rows_affected == 1 => {}
        Ok(_) => {
            warn!("迁移任务({})不是等待状态，跳过", task_id);
            return;
        }
        Err(e) => {
            error!("迁移任务({})状态更新失败: {}", task_id, e);
            return;
        }
    }

    if let Err(e) = execute_live(ctx, task_id).await {
        error!("❌ 迁移任务({})执行出错: {}", task_id, e);
    }
}

async fn execute_live(ctx: &CloudContext, task_id: i32) -> Result<()> {
    let mut task = migrate_task::Entity::find_by_id(task_id)
        .one(&ctx.db)
        .await?
        .ok_or_else(|| CloudError::Internal(format!("迁移任务({})不存在", task_id)))?;
    let vm = ctx.get_vm(&task.vm_uuid).await?;
    let src = ctx.get_host(task.src_host_id).await?;
    let dst = ctx.get_host(task.dst_host_id).await?;

    info!("🚚 开始热迁移: vm={}, {} → {}", vm.uuid, src.ipv4, dst.ipv4);
    if let Err(e) = ctx.hypervisor.live_migrate(&src, &vm.uuid, &dst).await {
        let mut msgs = vec![format!("热迁移失败: {}", e)];
        if free_logged(ctx, &dst, &vm, true, &mut msgs).await {
            task.dst_is_claim = false;
        }
        task.status = MigrateStatus::Failed.as_str().to_string();
        task.content = msgs.join("; ");
        task.migrate_complete_time = Some(Utc::now().into());
        save_task(&ctx.db, &task).await?;
        warn!("迁移任务({})失败: {}", task_id, e);
        return Ok(());
    }

    let mut msgs = Vec::new();
    if let Err(e) = set_vm_host(&ctx.db, &vm.uuid, dst.id).await {
        let msg = format!("更新虚拟机宿主机失败: {}", e);
        ctx.vm_log().write("热迁移后更新元数据失败", LogAbout::VmMetadata, &msg).await;
        task.status = MigrateStatus::SomeTodo.as_str().to_string();
        task.content = msg;
        save_task(&ctx.db, &task).await?;
        return Ok(());
    }

    task.src_undefined = true;
    task.status = MigrateStatus::SomeTodo.as_str().to_string();
    task = save_task(&ctx.db, &task).await?;

    vm_created_add_logged(ctx, &src, -1, &mut msgs).await;
    task.src_is_free = free_logged(ctx, &src, &vm, false, &mut msgs).await;
    refresh_vm_xml(ctx, &dst, &vm.uuid).await;

    if task.src_is_free {
        task.status = MigrateStatus::Complete.as_str().to_string();
        task.migrate_complete_time = Some(Utc::now().into());
    }
    task.content = join_content(&msgs);
    save_task(&ctx.db, &task).await?;
    info!("✅ 热迁移完成: vm={}, host={}", vm.uuid, dst.ipv4);
    Ok(())
}

pub struct MigrationEngine {
    ctx: CloudContext,
    pool: MigrationWorkerPool,
}

impl MigrationEngine {
    pub fn new(ctx: CloudContext, pool: MigrationWorkerPool) -> Self {
        Self { ctx, pool }
    }

    fn ensure_admin(user: &UserContext) -> Result<()> {
        if !user.is_superuser {
            return Err(VmError::AccessDenied("只有管理员可以迁移虚拟机".to_string()).into());
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: i32) -> Result<MigrateTask> {
        migrate_task::Entity::find_by_id(task_id)
            .one(&self.ctx.db)
            .await?
            .ok_or_else(|| CloudError::bad_request(format!("迁移任务({})不存在", task_id)))
    }

    pub async fn list_tasks(&self, vm_uuid: &str) -> Result<Vec<MigrateTask>> {
        Ok(migrate_task::Entity::find()
            .filter(migrate_task::Column::VmUuid.eq(vm_uuid))
            .order_by_desc(migrate_task::Column::Id)
            .all(&self.ctx.db)
            .await?)
    }

    /// 源宿主机与目标宿主机必须不同且在同一宿主机组
    async fn check_destination(&self, src: &Host, dst_host_id: i32) -> Result<Host> {
        if dst_host_id == src.id {
            return Err(VmError::AcrossGroupConflict("目标宿主机与源宿主机相同".to_string()).into());
        }
        let dst = self.ctx.get_host(dst_host_id).await?;
        if dst.group_id != src.group_id {
            return Err(VmError::AcrossGroupConflict("目标宿主机与源宿主机不在同一个宿主机组".to_string()).into());
        }
        if !dst.enable {
            return Err(CloudError::bad_request(format!("目标宿主机({})未启用", dst.ipv4)));
        }
        Ok(dst)
    }

    /// 静态迁移
    ///
    /// 目标宿主机定义成功后即视为迁移完成，源端清理失败时任务记为 SOME_TODO
    pub async fn migrate_static(
        &self,
        user: &UserContext,
        uuid: &str,
        dst_host_id: i32,
        force: bool,
    ) -> Result<MigrateTask> {
        Self::ensure_admin(user)?;
        let _guard = self.pool.lock_vm(uuid)?;
        let vm = self.ctx.get_vm(uuid).await?;
        if vm.is_local_disk() {
            return Err(VmError::Unsupported(format!("虚拟机({})使用本地系统盘，不能迁移", uuid)).into());
        }
        let src = self.ctx.vm_host(&vm).await?;
        let dst = self.check_destination(&src, dst_host_id).await?;
        self.check_old_tasks(&vm).await?;

        let src_down = match self.ctx.hypervisor.status(&src, uuid).await? {
            DomainState::HostUnreachable if !force => {
                return Err(HypervisorError::HostUnreachable(format!("源宿主机({})无法连接", src.ipv4)).into());
            }
            DomainState::HostUnreachable => true,
            s if s.is_running() => {
                if !force {
                    return Err(VmError::Running(format!("虚拟机({})正在运行，请先关机", uuid)).into());
                }
                self.ctx.hypervisor.poweroff(&src, uuid).await?;
                false
            }
            _ => false,
        };
        self.ctx.hypervisor.connect(&dst).await?;

        let pci_devices = device::vm_pci_devices(&self.ctx.db, uuid).await?;
        if !pci_devices.is_empty() {
            if !force {
                return Err(VmError::Unsupported(format!("虚拟机({})挂载了 PCI 设备，不能迁移", uuid)).into());
            }
            for dev in &pci_devices {
                if !src_down {
                    if let Ok(xml) = device::pci_xml_fragment(dev) {
                        if let Err(e) = self.ctx.hypervisor.detach_device(&src, uuid, &xml).await {
                            warn!("卸载 PCI 设备({})失败: {}", dev.address, e);
                        }
                    }
                }
                device::pci_umount_meta(&self.ctx.db, dev.id).await?;
            }
        }

        let (center, _) = self.ctx.vm_pool(&vm).await?;
        self.ctx.ledger().claim(dst.id, vm.vcpu, vm.mem, true).await?;

        let live_xml = if src_down {
            None
        } else {
            match self.ctx.hypervisor.xml_desc(&src, uuid, false).await {
                Ok(x) => Some(x),
                Err(e) => {
                    warn!("获取源虚拟机 XML 失败，按元数据重建: {}", e);
                    None
                }
            }
        };
        let from_begin_create = live_xml.is_none();
        let xml = match live_xml {
            Some(x) => x,
            None => match self.ctx.render_vm_xml(&vm).await {
                Ok(x) => x,
                Err(e) => {
                    self.free_claim(&dst, &vm).await;
                    return Err(e);
                }
            },
        };

        if let Err(e) = self.ctx.hypervisor.define(&dst, &xml).await {
            self.free_claim(&dst, &vm).await;
            return Err(e.into());
        }
        if let Err(e) = set_vm_host(&self.ctx.db, uuid, dst.id).await {
            if let Err(ue) = self.ctx.hypervisor.undefine(&dst, uuid).await {
                warn!("删除目标宿主机上的虚拟机定义失败: {}", ue);
            }
            self.free_claim(&dst, &vm).await;
            return Err(e);
        }

        // 元数据已指向目标宿主机，之后的失败只记入任务内容
        let mut msgs = Vec::new();
        if from_begin_create {
            match device::reattach_vdisks(&self.ctx, &dst, uuid, &center).await {
                Ok(failures) => msgs.extend(failures),
                Err(e) => {
                    let msg = format!("重新挂载云硬盘失败: {}", e);
                    self.ctx.vm_log().write("静态迁移后重新挂载云硬盘失败", LogAbout::VmDisk, &msg).await;
                    msgs.push(msg);
                }
            }
        }
        refresh_vm_xml(&self.ctx, &dst, uuid).await;

        let mut src_undefined = false;
        if src_down {
            msgs.push(format!("源宿主机({})不可达，未删除源虚拟机定义", src.ipv4));
        } else {
            match self.ctx.hypervisor.undefine(&src, uuid).await {
                Ok(()) => {
                    src_undefined = true;
                    vm_created_add_logged(&self.ctx, &src, -1, &mut msgs).await;
                }
                Err(e) => msgs.push(format!("删除源虚拟机定义失败: {}", e)),
            }
        }
        let src_is_free = free_logged(&self.ctx, &src, &vm, false, &mut msgs).await;

        let done = src_undefined && src_is_free;
        let status = if done { MigrateStatus::Complete } else { MigrateStatus::SomeTodo };
        let task = migrate_task::ActiveModel {
            vm_uuid: Set(uuid.to_string()),
            src_host_id: Set(src.id),
            src_host_ipv4: Set(src.ipv4.clone()),
            dst_host_id: Set(dst.id),
            dst_host_ipv4: Set(dst.ipv4.clone()),
            dst_is_claim: Set(true),
            src_is_free: Set(src_is_free),
            src_undefined: Set(src_undefined),
            status: Set(status.as_str().to_string()),
            content: Set(join_content(&msgs)),
            tag: Set(TAG_STATIC.to_string()),
            migrate_time: Set(Utc::now().into()),
            migrate_complete_time: Set(done.then(|| Utc::now().into())),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await;
        let task = match task {
            Ok(t) => t,
            Err(e) => {
                let msg = format!(
                    "vm={}, {} → {}, 迁移已完成但任务记录保存失败: {}; {}",
                    uuid,
                    src.ipv4,
                    dst.ipv4,
                    e,
                    join_content(&msgs)
                );
                self.ctx.vm_log().write("静态迁移任务记录保存失败", LogAbout::VmMetadata, &msg).await;
                return Err(e.into());
            }
        };

        info!("🚚 静态迁移完成: vm={}, {} → {} ({})", uuid, src.ipv4, dst.ipv4, task.status);
        Ok(task)
    }

    /// 归还目标宿主机的申请（含虚拟机名额）
    async fn free_claim(&self, host: &Host, vm: &Vm) {
        let mut msgs = Vec::new();
        free_logged(&self.ctx, host, vm, true, &mut msgs).await;
    }

    /// 热迁移，返回等待执行的任务
    pub async fn migrate_live(&self, user: &UserContext, uuid: &str, dst_host_id: i32) -> Result<MigrateTask> {
        Self::ensure_admin(user)?;
        let _guard = self.pool.lock_vm(uuid)?;
        let vm = self.ctx.get_vm(uuid).await?;
        self.check_old_tasks(&vm).await?;

        if vm.is_local_disk() {
            return Err(VmError::Unsupported(format!("虚拟机({})使用本地系统盘，不能热迁移", uuid)).into());
        }
        let src = self.ctx.vm_host(&vm).await?;
        match self.ctx.hypervisor.status(&src, uuid).await? {
            DomainState::HostUnreachable => {
                return Err(HypervisorError::HostUnreachable(format!("源宿主机({})无法连接", src.ipv4)).into());
            }
            DomainState::Missing => {
                return Err(HypervisorError::DomainNotExist(format!("源宿主机上不存在虚拟机({})", uuid)).into());
            }
            s if !s.is_running() => {
                return Err(CloudError::bad_request(format!("虚拟机({})未运行，请使用静态迁移", uuid)));
            }
            _ => {}
        }
        let dst = self.check_destination(&src, dst_host_id).await?;
        self.ctx.hypervisor.connect(&dst).await?;
        if !device::vm_pci_devices(&self.ctx.db, uuid).await?.is_empty() {
            return Err(VmError::Unsupported(format!("虚拟机({})挂载了 PCI 设备，不能热迁移", uuid)).into());
        }

        self.ctx.ledger().claim(dst.id, vm.vcpu, vm.mem, true).await?;

        let inserted = migrate_task::ActiveModel {
            vm_uuid: Set(uuid.to_string()),
            src_host_id: Set(src.id),
            src_host_ipv4: Set(src.ipv4.clone()),
            dst_host_id: Set(dst.id),
            dst_host_ipv4: Set(dst.ipv4.clone()),
            dst_is_claim: Set(true),
            src_is_free: Set(false),
            src_undefined: Set(false),
            status: Set(MigrateStatus::Waiting.as_str().to_string()),
            content: Set(String::new()),
            tag: Set(TAG_LIVE.to_string()),
            migrate_time: Set(Utc::now().into()),
            migrate_complete_time: Set(None),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await;
        let task = match inserted {
            Ok(t) => t,
            Err(e) => {
                self.free_claim(&dst, &vm).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.pool.submit(task.id).await {
            self.free_claim(&dst, &vm).await;
            if let Err(de) = migrate_task::Entity::delete_by_id(task.id).exec(&self.ctx.db).await {
                warn!("删除迁移任务({})失败: {}", task.id, de);
            }
            return Err(e);
        }
        info!("迁移任务已提交: task={}, vm={}, {} → {}", task.id, uuid, src.ipv4, dst.ipv4);
        Ok(task)
    }

    /// 检查虚拟机未结束的迁移任务
    async fn check_old_tasks(&self, vm: &Vm) -> Result<()> {
        let pending = migrate_task::Entity::find()
            .filter(migrate_task::Column::VmUuid.eq(vm.uuid.as_str()))
            .filter(migrate_task::Column::Status.is_in([
                MigrateStatus::Waiting.as_str(),
                MigrateStatus::InProcess.as_str(),
            ]))
            .all(&self.ctx.db)
            .await?;
        for task in pending {
            if self.pool.is_in_flight(task.id).await {
                return Err(CloudError::bad_request(format!("虚拟机({})有正在进行的迁移任务", vm.uuid)));
            }
            self.settle_orphan(task).await?;
        }

        let todo = migrate_task::Entity::find()
            .filter(migrate_task::Column::VmUuid.eq(vm.uuid.as_str()))
            .filter(migrate_task::Column::Status.eq(MigrateStatus::SomeTodo.as_str()))
            .all(&self.ctx.db)
            .await?;
        match todo.as_slice() {
            [] => Ok(()),
            [task] => {
                if self.handle_some_todo(task.id).await? {
                    Ok(())
                } else {
                    let task = self.get_task(task.id).await?;
                    Err(CloudError::bad_request(format!(
                        "上次迁移({})遗留问题未解决: {}",
                        task.id, task.content
                    )))
                }
            }
            _ => Err(CloudError::bad_request(format!(
                "虚拟机({})有多个未完成的迁移任务，需人工处理",
                vm.uuid
            ))),
        }
    }

    /// 没有工作线程执行的任务：等待中的记为失败并归还目标宿主机资源，执行中的转入恢复流程
    async fn settle_orphan(&self, mut task: MigrateTask) -> Result<()> {
        match task.migrate_status() {
            MigrateStatus::Waiting => {
                let mut msgs = vec!["迁移任务未被执行".to_string()];
                if task.dst_is_claim {
                    match self.ctx.get_vm(&task.vm_uuid).await {
                        Ok(vm) => {
                            let dst = self.ctx.get_host(task.dst_host_id).await?;
                            if free_logged(&self.ctx, &dst, &vm, true, &mut msgs).await {
                                task.dst_is_claim = false;
                            }
                        }
                        Err(e) => msgs.push(format!("虚拟机元数据读取失败: {}", e)),
                    }
                }
                task.status = MigrateStatus::Failed.as_str().to_string();
                task.content = msgs.join("; ");
                task.migrate_complete_time = Some(Utc::now().into());
                save_task(&self.ctx.db, &task).await?;
                warn!("迁移任务({})已标记失败", task.id);
            }
            MigrateStatus::InProcess => {
                task.status = MigrateStatus::SomeTodo.as_str().to_string();
                task.content = "迁移过程中断，待恢复".to_string();
                save_task(&self.ctx.db, &task).await?;
                warn!("迁移任务({})执行中断，转入恢复", task.id);
            }
            _ => {}
        }
        Ok(())
    }

    /// 进程启动时处理遗留任务，返回处理数量
    pub async fn recover_orphans(&self) -> Result<usize> {
        let pending = migrate_task::Entity::find()
            .filter(migrate_task::Column::Status.is_in([
                MigrateStatus::Waiting.as_str(),
                MigrateStatus::InProcess.as_str(),
            ]))
            .all(&self.ctx.db)
            .await?;
        let mut count = 0;
        for task in pending {
            // 受理中的任务可能还没提交到工作池
            if self.pool.is_accepting(&task.vm_uuid) || self.pool.is_in_flight(task.id).await {
                continue;
            }
            self.settle_orphan(task).await?;
            count += 1;
        }
        if count > 0 {
            info!("🔧 已处理 {} 个遗留迁移任务", count);
        }
        Ok(count)
    }

    /// 恢复 SOME_TODO 任务，返回问题是否已全部解决
    ///
    /// 可重复执行
    pub async fn handle_some_todo(&self, task_id: i32) -> Result<bool> {
        let mut task = self.get_task(task_id).await?;
        match task.migrate_status() {
            MigrateStatus::Complete => return Ok(true),
            MigrateStatus::SomeTodo => {}
            other => {
                return Err(CloudError::bad_request(format!(
                    "迁移任务({})状态为 {}，无需恢复",
                    task_id,
                    other.as_str()
                )));
            }
        }

        let vm = match self.ctx.get_vm(&task.vm_uuid).await {
            Ok(vm) => vm,
            Err(CloudError::Vm(VmError::NotExist(_))) => {
                task.status = MigrateStatus::Complete.as_str().to_string();
                task.content = "虚拟机已删除".to_string();
                task.migrate_complete_time = Some(Utc::now().into());
                save_task(&self.ctx.db, &task).await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        let src = self.ctx.get_host(task.src_host_id).await?;
        let dst = self.ctx.get_host(task.dst_host_id).await?;
        let on_src = self.ctx.hypervisor.domain_exists(&src, &vm.uuid).await?;
        let on_dst = self.ctx.hypervisor.domain_exists(&dst, &vm.uuid).await?;

        let mut msgs = Vec::new();
        match (on_src, on_dst) {
            (_, true) => {
                if vm.host_id == Some(src.id) {
                    // 目标宿主机的名额在申请时已占用
                    set_vm_host(&self.ctx.db, &vm.uuid, dst.id).await?;
                    info!("虚拟机 {} 元数据已指向目标宿主机 {}", vm.uuid, dst.ipv4);
                }
                if on_src {
                    match self.ctx.hypervisor.undefine(&src, &vm.uuid).await {
                        Ok(()) => {
                            if !task.src_undefined {
                                vm_created_add_logged(&self.ctx, &src, -1, &mut msgs).await;
                            }
                            task.src_undefined = true;
                        }
                        Err(e) => msgs.push(format!("删除源虚拟机定义失败: {}", e)),
                    }
                } else if !task.src_undefined {
                    vm_created_add_logged(&self.ctx, &src, -1, &mut msgs).await;
                    task.src_undefined = true;
                }
            }
            (true, false) if vm.host_id == Some(src.id) && !task.src_undefined => {
                // 迁移没有发生
                let mut fail_msgs = vec!["虚拟机仍在源宿主机上，迁移未完成".to_string()];
                if task.dst_is_claim && free_logged(&self.ctx, &dst, &vm, true, &mut fail_msgs).await {
                    task.dst_is_claim = false;
                }
                task.status = MigrateStatus::Failed.as_str().to_string();
                task.content = fail_msgs.join("; ");
                task.migrate_complete_time = Some(Utc::now().into());
                save_task(&self.ctx.db, &task).await?;
                return Ok(true);
            }
            (true, false) => msgs.push("虚拟机只在源宿主机上，但元数据已指向目标宿主机".to_string()),
            (false, false) => msgs.push("源宿主机和目标宿主机上都找不到虚拟机".to_string()),
        }

        if !task.src_is_free {
            task.src_is_free = free_logged(&self.ctx, &src, &vm, false, &mut msgs).await;
        }

        let ok = msgs.is_empty() && task.src_undefined && task.src_is_free;
        if ok {
            task.status = MigrateStatus::Complete.as_str().to_string();
            task.migrate_complete_time = Some(Utc::now().into());
            refresh_vm_xml(&self.ctx, &dst, &vm.uuid).await;
        }
        task.content = join_content(&msgs);
        save_task(&self.ctx.db, &task).await?;
        info!("迁移任务({})恢复结果: ok={}", task_id, ok);
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::pci_device::PciKind;
    use crate::hypervisor::HypervisorClient;
    use crate::test_support::TestEnv;
    use std::time::Duration;

    fn admin() -> UserContext {
        UserContext::new(1, true)
    }

    fn engine(env: &TestEnv) -> MigrationEngine {
        MigrationEngine::new(env.ctx.clone(), MigrationWorkerPool::start(env.ctx.clone(), 2, 8))
    }

    async fn wait_task(env: &TestEnv, id: i32) -> MigrateTask {
        for _ in 0..300 {
            let task = migrate_task::Entity::find_by_id(id)
                .one(&env.ctx.db)
                .await
                .unwrap()
                .unwrap();
            if !matches!(task.migrate_status(), MigrateStatus::Waiting | MigrateStatus::InProcess) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("迁移任务({})未结束", id);
    }

    #[tokio::test]
    async fn test_same_host_claims_nothing() {
        let env = TestEnv::new().await;
        let (vm, host) = env.create_vm().await;
        let engine = engine(&env);

        let err = engine.migrate_static(&admin(), &vm.uuid, host.id, true).await.unwrap_err();
        assert_eq!(err.code(), "ACROSS_GROUP_CONFLICT");
        env.hv.set_running(host.id, &vm.uuid, true);
        let err = engine.migrate_live(&admin(), &vm.uuid, host.id).await.unwrap_err();
        assert_eq!(err.code(), "ACROSS_GROUP_CONFLICT");

        let h = env.host(host.id).await;
        assert_eq!((h.vcpu_allocated, h.mem_allocated, h.vm_created), (vm.vcpu, vm.mem, 1));
        assert!(env.migrate_tasks(&vm.uuid).await.is_empty());
    }

    #[tokio::test]
    async fn test_static_migration() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        let disk = env.seed_vdisk(src.group_id, 1).await;
        crate::services::VmInstance::new(env.ctx.clone())
            .mount_disk(&admin(), &vm.uuid, &disk.uuid)
            .await
            .unwrap();
        let engine = engine(&env);

        let task = engine.migrate_static(&admin(), &vm.uuid, dst.id, false).await.unwrap();
        assert_eq!(task.tag, TAG_STATIC);
        assert_eq!(task.migrate_status(), MigrateStatus::Complete);
        assert!(task.src_undefined && task.src_is_free);

        let moved = env.ctx.get_vm(&vm.uuid).await.unwrap();
        assert_eq!(moved.host_id, Some(dst.id));
        assert!(!env.hv.has_domain(src.id, &vm.uuid));
        assert!(env.hv.domain(dst.id, &vm.uuid).unwrap().xml.contains(&disk.uuid));

        let s = env.host(src.id).await;
        assert_eq!((s.vcpu_allocated, s.mem_allocated, s.vm_created), (0, 0, 0));
        let d = env.host(dst.id).await;
        assert_eq!((d.vcpu_allocated, d.mem_allocated, d.vm_created), (vm.vcpu, vm.mem, 1));
    }

    #[tokio::test]
    async fn test_static_migration_rebuilds_xml_and_reattaches() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        let disk = env.seed_vdisk(src.group_id, 1).await;
        device::vdisk_mount_meta(&env.ctx.db, &disk.uuid, &vm.uuid, "vdb").await.unwrap();
        env.hv.fail_on("xml_desc");

        let task = engine(&env).migrate_static(&admin(), &vm.uuid, dst.id, false).await.unwrap();
        assert_eq!(task.migrate_status(), MigrateStatus::Complete);
        assert_eq!(env.hv.domain(dst.id, &vm.uuid).unwrap().devices.len(), 1);
    }

    #[tokio::test]
    async fn test_static_migration_preconditions() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let other_group = env.seed_group().await;
        let far = env.seed_host_in(other_group.id, 8, 16384).await;
        let dst = env.seed_host(8, 16384).await;
        let engine = engine(&env);

        let err = engine.migrate_static(&admin(), &vm.uuid, far.id, false).await.unwrap_err();
        assert_eq!(err.code(), "ACROSS_GROUP_CONFLICT");

        let err = engine
            .migrate_static(&UserContext::new(1, false), &vm.uuid, dst.id, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VM_ACCESS_DENIED");

        env.hv.set_running(src.id, &vm.uuid, true);
        let err = engine.migrate_static(&admin(), &vm.uuid, dst.id, false).await.unwrap_err();
        assert_eq!(err.code(), "VM_RUNNING");
        env.hv.set_running(src.id, &vm.uuid, false);

        let gpu = env.seed_pci(src.id, PciKind::Gpu).await;
        device::pci_mount_meta(&env.ctx.db, gpu.id, &vm.uuid).await.unwrap();
        let err = engine.migrate_static(&admin(), &vm.uuid, dst.id, false).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");

        env.hv.set_unreachable(dst.id, true);
        let err = engine.migrate_static(&admin(), &vm.uuid, dst.id, true).await.unwrap_err();
        assert!(err.is_host_unreachable());
        assert_eq!(env.host(dst.id).await.vcpu_allocated, 0);
    }

    #[tokio::test]
    async fn test_static_migration_with_source_down() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        env.hv.set_unreachable(src.id, true);

        let task = engine(&env).migrate_static(&admin(), &vm.uuid, dst.id, true).await.unwrap();
        assert_eq!(task.migrate_status(), MigrateStatus::SomeTodo);
        assert!(!task.src_undefined);
        assert!(task.src_is_free);
        assert!(env.hv.has_domain(dst.id, &vm.uuid));
    }

    #[tokio::test]
    async fn test_live_migration_happy_path() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        env.hv.set_running(src.id, &vm.uuid, true);
        let engine = engine(&env);

        let task = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap();
        assert_eq!(task.tag, TAG_LIVE);
        let task = wait_task(&env, task.id).await;
        assert_eq!(task.migrate_status(), MigrateStatus::Complete);
        assert_eq!(task.content, CONTENT_OK);
        assert!(task.src_undefined && task.src_is_free && task.dst_is_claim);

        assert_eq!(env.ctx.get_vm(&vm.uuid).await.unwrap().host_id, Some(dst.id));
        assert!(env.hv.domain(dst.id, &vm.uuid).unwrap().running);
        let s = env.host(src.id).await;
        assert_eq!((s.vcpu_allocated, s.vm_created), (0, 0));
        let d = env.host(dst.id).await;
        assert_eq!((d.vcpu_allocated, d.vm_created), (vm.vcpu, 1));
        assert_eq!(engine.list_tasks(&vm.uuid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_live_migration_failure_frees_destination() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        env.hv.set_running(src.id, &vm.uuid, true);
        env.hv.fail_on("live_migrate");
        let engine = engine(&env);

        let task = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap();
        let task = wait_task(&env, task.id).await;
        assert_eq!(task.migrate_status(), MigrateStatus::Failed);
        assert!(!task.dst_is_claim);
        assert!(task.content.contains("live_migrate"));

        assert_eq!(env.ctx.get_vm(&vm.uuid).await.unwrap().host_id, Some(src.id));
        assert_eq!(env.host(dst.id).await.vcpu_allocated, 0);
        assert_eq!(env.host(src.id).await.vcpu_allocated, vm.vcpu);

        // 失败任务不阻塞后续迁移
        env.hv.clear_failures();
        let retry = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap();
        assert_eq!(wait_task(&env, retry.id).await.migrate_status(), MigrateStatus::Complete);
    }

    #[tokio::test]
    async fn test_live_migration_prechecks() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        let engine = engine(&env);

        let err = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");

        env.hv.set_running(src.id, &vm.uuid, true);
        let gpu = env.seed_pci(src.id, PciKind::Gpu).await;
        device::pci_mount_meta(&env.ctx.db, gpu.id, &vm.uuid).await.unwrap();
        let err = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
        assert_eq!(env.host(dst.id).await.vcpu_allocated, 0);
    }

    #[tokio::test]
    async fn test_handle_some_todo_is_idempotent() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        env.ctx.ledger().claim(dst.id, vm.vcpu, vm.mem, true).await.unwrap();
        // 域已到目标宿主机，元数据仍指向源
        env.hv.live_migrate(&src, &vm.uuid, &dst).await.unwrap();
        let task = env.seed_migrate_task(&vm, &src, &dst, "SOME_TODO").await;
        let engine = engine(&env);

        assert!(engine.handle_some_todo(task.id).await.unwrap());
        let task = engine.get_task(task.id).await.unwrap();
        assert_eq!(task.migrate_status(), MigrateStatus::Complete);
        assert_eq!(env.ctx.get_vm(&vm.uuid).await.unwrap().host_id, Some(dst.id));
        let s = env.host(src.id).await;
        assert_eq!((s.vcpu_allocated, s.vm_created), (0, 0));
        assert_eq!(env.host(dst.id).await.vm_created, 1);

        assert!(engine.handle_some_todo(task.id).await.unwrap());
        assert_eq!(env.host(dst.id).await.vm_created, 1);
    }

    #[tokio::test]
    async fn test_some_todo_unresolved_blocks_new_migration() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        // 两台宿主机上都没有域
        env.hv.undefine(&src, &vm.uuid).await.unwrap();
        let task = env.seed_migrate_task(&vm, &src, &dst, "SOME_TODO").await;
        let engine = engine(&env);

        assert!(!engine.handle_some_todo(task.id).await.unwrap());
        let err = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");

        env.seed_migrate_task(&vm, &src, &dst, "SOME_TODO").await;
        let err = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap_err();
        assert!(err.to_string().contains("多个"));
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        env.ctx.ledger().claim(dst.id, vm.vcpu, vm.mem, true).await.unwrap();
        let waiting = env.seed_migrate_task(&vm, &src, &dst, "WAITING").await;
        let running = env.seed_migrate_task(&vm, &src, &dst, "IN_PROCESS").await;
        let engine = engine(&env);

        assert_eq!(engine.recover_orphans().await.unwrap(), 2);
        let waiting = engine.get_task(waiting.id).await.unwrap();
        assert_eq!(waiting.migrate_status(), MigrateStatus::Failed);
        assert!(!waiting.dst_is_claim);
        let d = env.host(dst.id).await;
        assert_eq!((d.vcpu_allocated, d.vm_created), (0, 0));
        assert_eq!(
            engine.get_task(running.id).await.unwrap().migrate_status(),
            MigrateStatus::SomeTodo
        );
        assert_eq!(engine.recover_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_orphans_skips_vm_being_accepted() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        let engine = engine(&env);

        // 任务行已写入、尚未提交工作池
        let guard = engine.pool.lock_vm(&vm.uuid).unwrap();
        let waiting = env.seed_migrate_task(&vm, &src, &dst, "WAITING").await;
        assert_eq!(engine.recover_orphans().await.unwrap(), 0);
        assert_eq!(
            engine.get_task(waiting.id).await.unwrap().migrate_status(),
            MigrateStatus::Waiting
        );
        let err = engine.migrate_live(&admin(), &vm.uuid, dst.id).await.unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");

        drop(guard);
        assert_eq!(engine.recover_orphans().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_live_migrations_accept_one() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        env.hv.set_running(src.id, &vm.uuid, true);
        let engine = engine(&env);

        let (admin_a, admin_b) = (admin(), admin());
        let (a, b) = tokio::join!(
            engine.migrate_live(&admin_a, &vm.uuid, dst.id),
            engine.migrate_live(&admin_b, &vm.uuid, dst.id)
        );
        let task = match (a, b) {
            (Ok(t), Err(e)) | (Err(e), Ok(t)) => {
                assert_eq!(e.code(), "BAD_REQUEST");
                t
            }
            (a, b) => panic!("应只受理一个迁移: {:?} {:?}", a.map(|t| t.id), b.map(|t| t.id)),
        };
        assert_eq!(wait_task(&env, task.id).await.migrate_status(), MigrateStatus::Complete);
        assert_eq!(env.migrate_tasks(&vm.uuid).await.len(), 1);
        let d = env.host(dst.id).await;
        assert_eq!((d.vcpu_allocated, d.vm_created), (vm.vcpu, 1));
    }

    #[tokio::test]
    async fn test_concurrent_static_migrations_accept_one() {
        let env = TestEnv::new().await;
        let (vm, _) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        let engine = engine(&env);

        let (admin_a, admin_b) = (admin(), admin());
        let (a, b) = tokio::join!(
            engine.migrate_static(&admin_a, &vm.uuid, dst.id, false),
            engine.migrate_static(&admin_b, &vm.uuid, dst.id, false)
        );
        assert_eq!(u8::from(a.is_ok()) + u8::from(b.is_ok()), 1);
        assert_eq!(env.migrate_tasks(&vm.uuid).await.len(), 1);
        let d = env.host(dst.id).await;
        assert_eq!((d.vcpu_allocated, d.vm_created), (vm.vcpu, 1));
    }

    #[tokio::test]
    async fn test_static_migration_finishes_after_reattach_failure() {
        let env = TestEnv::new().await;
        let (vm, src) = env.create_vm().await;
        let dst = env.seed_host(8, 16384).await;
        let disk = env.seed_vdisk(src.group_id, 1).await;
        device::vdisk_mount_meta(&env.ctx.db, &disk.uuid, &vm.uuid, "vdb").await.unwrap();
        env.hv.fail_on("xml_desc");
        env.hv.fail_on("attach_device");

        let task = engine(&env).migrate_static(&admin(), &vm.uuid, dst.id, false).await.unwrap();
        assert!(task.src_undefined && task.src_is_free);
        assert!(task.content.contains(&disk.uuid));

        assert_eq!(env.ctx.get_vm(&vm.uuid).await.unwrap().host_id, Some(dst.id));
        assert!(device::get_vdisk(&env.ctx.db, &disk.uuid).await.unwrap().vm_uuid.is_none());
        let s = env.host(src.id).await;
        assert_eq!((s.vcpu_allocated, s.vm_created), (0, 0));
        let d = env.host(dst.id).await;
        assert_eq!((d.vcpu_allocated, d.vm_created), (vm.vcpu, 1));
    }
}

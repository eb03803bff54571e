/// 虚拟机管理接口

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use super::{validated, ApiError, ApiResult, Caller};
use crate::app_state::AppState;
use crate::db::models::migrate_task::MigrateTask;
use crate::db::models::pci_device::PciDevice;
use crate::db::models::vdisk::Vdisk;
use crate::db::models::vm::Vm;
use crate::db::models::vm_disk_snap::VmDiskSnap;
use crate::services::{CreateVmRequest, VmOperation};

/// 创建虚拟机请求
#[derive(Debug, Deserialize, Validate)]
pub struct CreateVmDto {
    #[validate(range(min = 1, max = 256))]
    pub vcpu: i32,
    /// 内存（MiB）
    #[validate(range(min = 128))]
    pub mem: i64,
    pub image_id: i32,
    pub center_id: Option<i32>,
    pub group_id: Option<i32>,
    pub host_id: Option<i32>,
    pub vlan_id: Option<i32>,
    #[validate(length(min = 7, max = 15))]
    pub ipv4: Option<String>,
    pub ip_public: Option<bool>,
    #[validate(range(min = 1, max = 5120))]
    pub sys_disk_size: Option<i32>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub remarks: String,
}

impl From<CreateVmDto> for CreateVmRequest {
    fn from(dto: CreateVmDto) -> Self {
        Self {
            vcpu: dto.vcpu,
            mem: dto.mem,
            image_id: dto.image_id,
            center_id: dto.center_id,
            group_id: dto.group_id,
            host_id: dto.host_id,
            vlan_id: dto.vlan_id,
            ipv4: dto.ipv4,
            ip_public: dto.ip_public,
            sys_disk_size: dto.sys_disk_size,
            remarks: dto.remarks,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OperateDto {
    pub op: VmOperation,
}

/// 修改 vCPU / 内存
#[derive(Debug, Deserialize, Validate)]
pub struct EditVmDto {
    #[validate(range(min = 1, max = 256))]
    pub vcpu: Option<i32>,
    #[validate(range(min = 128))]
    pub mem: Option<i64>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RemarksDto {
    #[validate(length(max = 255))]
    pub remarks: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordDto {
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    #[validate(length(min = 6, max = 64))]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SnapDto {
    #[serde(default)]
    #[validate(length(max = 255))]
    pub remarks: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExpandDto {
    #[validate(range(min = 1, max = 5120))]
    pub size_gb: i32,
}

#[derive(Debug, Deserialize)]
pub struct ChangeImageDto {
    pub image_id: i32,
}

#[derive(Debug, Default, Deserialize)]
pub struct UnshelveDto {
    pub group_id: Option<i32>,
    pub host_id: Option<i32>,
    pub mac_ip_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct MigrateDto {
    pub host_id: i32,
    #[serde(default)]
    pub force: bool,
}

/// VM 路由
pub fn vm_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_vm))
        .route("/:uuid", get(get_vm).patch(edit_vm).delete(delete_vm))
        .route("/:uuid/status", get(vm_status))
        .route("/:uuid/stats", get(vm_stats))
        .route("/:uuid/operate", post(operate_vm))
        .route("/:uuid/remarks", put(modify_remarks))
        .route("/:uuid/password", post(change_password))
        .route("/:uuid/vdisks/:disk_uuid", post(mount_disk))
        .route("/vdisks/:disk_uuid", delete(umount_disk))
        .route("/:uuid/pci/:pci_id", post(mount_pci))
        .route("/pci/:pci_id", delete(umount_pci))
        .route("/:uuid/snaps", post(create_snap))
        .route("/:uuid/snaps/:snap_id/rollback", post(rollback_snap))
        .route("/snaps/:snap_id", delete(delete_snap))
        .route("/snaps/:snap_id/remarks", put(modify_snap_remarks))
        .route("/:uuid/sys-disk/expand", patch(expand_sys_disk))
        .route("/:uuid/sys-disk/change", post(change_sys_disk))
        .route("/:uuid/miss-fix", post(miss_fix))
        .route("/:uuid/shelve", post(shelve_vm))
        .route("/:uuid/unshelve", post(unshelve_vm))
        .route("/:uuid/migrate/static", post(migrate_static))
        .route("/:uuid/migrate/live", post(migrate_live))
        .route("/:uuid/migrate/tasks", get(list_migrate_tasks))
        .route("/migrate-tasks/:task_id", get(get_migrate_task))
        .route("/migrate-tasks/:task_id/recover", post(recover_migrate_task))
}

/// 创建虚拟机
///
/// POST /api/vms
pub async fn create_vm(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(dto): Json<CreateVmDto>,
) -> Result<(StatusCode, Json<Vm>), ApiError> {
    let dto = validated(dto)?;
    let vm = state.vm_builder().create_vm(&user, dto.into()).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

/// GET /api/vms/:uuid
pub async fn get_vm(State(state): State<AppState>, Caller(user): Caller, Path(uuid): Path<String>) -> ApiResult<Vm> {
    Ok(Json(state.vm_instance().get_owned_vm(&user, &uuid).await?))
}

pub async fn vm_status(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
) -> ApiResult<Value> {
    let s = state.vm_instance().status(&user, &uuid).await?;
    Ok(Json(json!({ "status_code": s.code(), "status_text": s.as_text() })))
}

pub async fn vm_stats(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
) -> ApiResult<common::DomainStats> {
    Ok(Json(state.vm_instance().stats(&user, &uuid).await?))
}

/// 电源与删除操作
///
/// POST /api/vms/:uuid/operate
/// Body: { "op": "start" | "reboot" | "shutdown" | "poweroff" | "delete" | "delete_force" }
pub async fn operate_vm(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<OperateDto>,
) -> ApiResult<Value> {
    let changed = state.vm_instance().operate(&user, &uuid, dto.op).await?;
    Ok(Json(json!({ "success": true, "changed": changed })))
}

/// PATCH /api/vms/:uuid
pub async fn edit_vm(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<EditVmDto>,
) -> ApiResult<Vm> {
    let dto = validated(dto)?;
    let vm = state
        .vm_instance()
        .edit_vcpu_mem(&user, &uuid, dto.vcpu, dto.mem, dto.force)
        .await?;
    Ok(Json(vm))
}

pub async fn modify_remarks(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<RemarksDto>,
) -> ApiResult<Vm> {
    let dto = validated(dto)?;
    Ok(Json(state.vm_instance().modify_remarks(&user, &uuid, &dto.remarks).await?))
}

pub async fn change_password(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<PasswordDto>,
) -> ApiResult<Value> {
    let dto = validated(dto)?;
    state
        .vm_instance()
        .change_password(&user, &uuid, &dto.username, &dto.password)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// DELETE /api/vms/:uuid?force=true
pub async fn delete_vm(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Query(q): Query<ForceQuery>,
) -> Result<StatusCode, ApiError> {
    state.vm_instance().delete(&user, &uuid, q.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mount_disk(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path((uuid, disk_uuid)): Path<(String, String)>,
) -> ApiResult<Vdisk> {
    Ok(Json(state.vm_instance().mount_disk(&user, &uuid, &disk_uuid).await?))
}

pub async fn umount_disk(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(disk_uuid): Path<String>,
) -> ApiResult<Vdisk> {
    Ok(Json(state.vm_instance().umount_disk(&user, &disk_uuid).await?))
}

pub async fn mount_pci(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path((uuid, pci_id)): Path<(String, i32)>,
) -> ApiResult<PciDevice> {
    Ok(Json(state.vm_instance().mount_pci(&user, &uuid, pci_id).await?))
}

pub async fn umount_pci(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(pci_id): Path<i32>,
) -> ApiResult<PciDevice> {
    Ok(Json(state.vm_instance().umount_pci(&user, pci_id).await?))
}

pub async fn create_snap(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<SnapDto>,
) -> Result<(StatusCode, Json<VmDiskSnap>), ApiError> {
    let dto = validated(dto)?;
    let snap = state.vm_instance().create_sys_snap(&user, &uuid, &dto.remarks).await?;
    Ok((StatusCode::CREATED, Json(snap)))
}

pub async fn rollback_snap(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path((uuid, snap_id)): Path<(String, i32)>,
) -> ApiResult<Vm> {
    Ok(Json(state.vm_instance().rollback_to_snap(&user, &uuid, snap_id).await?))
}

pub async fn delete_snap(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(snap_id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    state.vm_instance().delete_sys_snap(&user, snap_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn modify_snap_remarks(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(snap_id): Path<i32>,
    Json(dto): Json<SnapDto>,
) -> ApiResult<VmDiskSnap> {
    let dto = validated(dto)?;
    Ok(Json(state.vm_instance().modify_sys_snap_remarks(&user, snap_id, &dto.remarks).await?))
}

pub async fn expand_sys_disk(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<ExpandDto>,
) -> ApiResult<Vm> {
    let dto = validated(dto)?;
    Ok(Json(state.vm_instance().sys_disk_expand(&user, &uuid, dto.size_gb).await?))
}

pub async fn change_sys_disk(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<ChangeImageDto>,
) -> ApiResult<Vm> {
    Ok(Json(state.vm_instance().change_sys_disk(&user, &uuid, dto.image_id).await?))
}

pub async fn miss_fix(State(state): State<AppState>, Caller(user): Caller, Path(uuid): Path<String>) -> ApiResult<Vm> {
    Ok(Json(state.vm_instance().miss_fix(&user, &uuid).await?))
}

pub async fn shelve_vm(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
) -> ApiResult<Vm> {
    Ok(Json(state.vm_instance().shelve(&user, &uuid).await?))
}

pub async fn unshelve_vm(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<UnshelveDto>,
) -> ApiResult<Vm> {
    let vm = state
        .vm_builder()
        .unshelve_vm(&user, &uuid, dto.group_id, dto.host_id, dto.mac_ip_id)
        .await?;
    Ok(Json(vm))
}

/// 静态迁移，同步完成
pub async fn migrate_static(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<MigrateDto>,
) -> ApiResult<MigrateTask> {
    let task = state
        .migration()
        .migrate_static(&user, &uuid, dto.host_id, dto.force)
        .await?;
    Ok(Json(task))
}

/// 热迁移，返回等待执行的任务
pub async fn migrate_live(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
    Json(dto): Json<MigrateDto>,
) -> Result<(StatusCode, Json<MigrateTask>), ApiError> {
    let task = state.migration().migrate_live(&user, &uuid, dto.host_id).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

pub async fn list_migrate_tasks(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(uuid): Path<String>,
) -> ApiResult<Vec<MigrateTask>> {
    state.vm_instance().get_owned_vm(&user, &uuid).await?;
    Ok(Json(state.migration().list_tasks(&uuid).await?))
}

pub async fn get_migrate_task(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(task_id): Path<i32>,
) -> ApiResult<MigrateTask> {
    let task = state.migration().get_task(task_id).await?;
    state.vm_instance().get_owned_vm(&user, &task.vm_uuid).await?;
    Ok(Json(task))
}

/// 处理 SOME_TODO 状态的迁移任务
pub async fn recover_migrate_task(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(task_id): Path<i32>,
) -> ApiResult<Value> {
    if !user.is_superuser {
        return Err(ApiError::Unauthorized("只有管理员可以处理迁移任务".to_string()));
    }
    let engine = state.migration();
    let resolved = engine.handle_some_todo(task_id).await?;
    let task = engine.get_task(task_id).await?;
    Ok(Json(json!({ "resolved": resolved, "task": task })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dto_validation() {
        let dto: CreateVmDto = serde_json::from_value(json!({
            "vcpu": 2, "mem": 2048, "image_id": 1, "group_id": 3
        }))
        .unwrap();
        assert!(dto.validate().is_ok());
        let req = CreateVmRequest::from(dto);
        assert_eq!((req.vcpu, req.mem, req.group_id), (2, 2048, Some(3)));

        let dto: CreateVmDto = serde_json::from_value(json!({ "vcpu": 0, "mem": 2048, "image_id": 1 })).unwrap();
        assert!(dto.validate().is_err());
    }

    #[test]
    fn test_operate_dto() {
        let dto: OperateDto = serde_json::from_value(json!({ "op": "delete_force" })).unwrap();
        assert_eq!(dto.op, VmOperation::DeleteForce);
        assert!(serde_json::from_value::<OperateDto>(json!({ "op": "explode" })).is_err());
    }

    #[test]
    fn test_password_dto_validation() {
        let dto = PasswordDto { username: "root".into(), password: "123".into() };
        assert!(dto.validate().is_err());
    }
}

/// 资源账本
///
/// 宿主机 vCPU/内存/虚拟机数量计数与 MAC/IP 租用。
/// 每次修改都是一条带条件的 UPDATE 语句，并发申请不会超卖

use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use tracing::{debug, warn};

use crate::db::models::host::{self, Host};
use crate::db::models::mac_ip::{self, MacIp};
use crate::errors::{CloudError, ComputeError, Result, ScheduleError};

/// 申请资源时最多重试的次数（条件更新失败但复查显示资源充足时）
const CLAIM_RETRIES: usize = 3;
/// 租用 IP 时最多重试的次数
const LEASE_RETRIES: usize = 10;

#[derive(Clone)]
pub struct ResourceLedger {
    db: DatabaseConnection,
}

/// `col + delta`，结果小于 0 时取 0
fn clamped_add(col: host::Column, delta: i64) -> SimpleExpr {
    Expr::case(
        Expr::expr(Expr::col(col).add(delta)).lt(0),
        Expr::val(0),
    )
    .finally(Expr::col(col).add(delta))
    .into()
}

impl ResourceLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 只读判断宿主机是否满足需求
    pub fn meets_needs(host: &Host, vcpu: i32, mem: i64, check_vm_limit: bool) -> bool {
        if !host.enable {
            return false;
        }
        if check_vm_limit && host.vm_created >= host.vm_limit {
            return false;
        }
        host.vcpu_free() >= vcpu && host.mem_free() >= mem
    }

    /// 申请宿主机 vCPU 与内存
    ///
    /// `check_vm_limit` 为真时表示在该宿主机上放置一台虚拟机：
    /// 同一条 UPDATE 内检查数量上限并占用一个名额（`vm_created + 1`），
    /// 失败回滚时需用 `free(.., true)` 归还
    pub async fn claim(&self, host_id: i32, vcpu: i32, mem: i64, check_vm_limit: bool) -> Result<()> {
        if vcpu < 0 || mem < 0 {
            return Err(CloudError::bad_request("申请的 vCPU 和内存不能为负数"));
        }

        for _ in 0..CLAIM_RETRIES {
            let mut update = host::Entity::update_many()
                .col_expr(
                    host::Column::VcpuAllocated,
                    Expr::col(host::Column::VcpuAllocated).add(vcpu),
                )
                .col_expr(
                    host::Column::MemAllocated,
                    Expr::col(host::Column::MemAllocated).add(mem),
                )
                .filter(host::Column::Id.eq(host_id))
                .filter(
                    Expr::expr(Expr::col(host::Column::VcpuAllocated).add(vcpu))
                        .lte(Expr::col(host::Column::VcpuTotal)),
                )
                .filter(
                    Expr::expr(Expr::col(host::Column::MemAllocated).add(mem)).lte(
                        Expr::col(host::Column::MemTotal).sub(Expr::col(host::Column::MemReserved)),
                    ),
                );
            if check_vm_limit {
                update = update
                    .col_expr(host::Column::VmCreated, Expr::col(host::Column::VmCreated).add(1))
                    .filter(Expr::col(host::Column::VmCreated).lt(Expr::col(host::Column::VmLimit)));
            }

            let res = update.exec(&self.db).await?;
            if res.rows_affected > 0 {
                debug!(
                    "宿主机({})申请资源: vcpu={}, mem={}MiB, 占用名额={}",
                    host_id, vcpu, mem, check_vm_limit
                );
                return Ok(());
            }

            // 复查失败原因
            let host = host::Entity::find_by_id(host_id)
                .one(&self.db)
                .await?
                .ok_or_else(|| ScheduleError::NoHost(format!("宿主机({})不存在", host_id)))?;
            if host.vcpu_allocated + vcpu > host.vcpu_total {
                return Err(ComputeError::VcpuNotEnough(format!(
                    "宿主机({})vCPU资源不足，剩余{}，需要{}",
                    host.ipv4,
                    host.vcpu_free(),
                    vcpu
                ))
                .into());
            }
            if host.mem_allocated + mem > host.mem_total - host.mem_reserved {
                return Err(ComputeError::RamNotEnough(format!(
                    "宿主机({})内存资源不足，剩余{}MiB，需要{}MiB",
                    host.ipv4,
                    host.mem_free(),
                    mem
                ))
                .into());
            }
            if check_vm_limit && host.vm_created >= host.vm_limit {
                return Err(ScheduleError::NoHost(format!(
                    "宿主机({})虚拟机数量已达上限{}",
                    host.ipv4, host.vm_limit
                ))
                .into());
            }
        }

        Err(ScheduleError::NoHost(format!("宿主机({})资源申请冲突", host_id)).into())
    }

    /// 释放宿主机 vCPU 与内存，计数最低减到 0
    ///
    /// `release_vm` 为真时同时归还 `claim(.., true)` 占用的虚拟机名额
    pub async fn free(&self, host_id: i32, vcpu: i32, mem: i64, release_vm: bool) -> Result<()> {
        if vcpu < 0 || mem < 0 {
            return Err(CloudError::bad_request("释放的 vCPU 和内存不能为负数"));
        }
        let mut update = host::Entity::update_many()
            .col_expr(
                host::Column::VcpuAllocated,
                clamped_add(host::Column::VcpuAllocated, -i64::from(vcpu)),
            )
            .col_expr(host::Column::MemAllocated, clamped_add(host::Column::MemAllocated, -mem))
            .filter(host::Column::Id.eq(host_id));
        if release_vm {
            update = update.col_expr(host::Column::VmCreated, clamped_add(host::Column::VmCreated, -1));
        }
        update.exec(&self.db).await?;
        debug!(
            "宿主机({})释放资源: vcpu={}, mem={}MiB, 归还名额={}",
            host_id, vcpu, mem, release_vm
        );
        Ok(())
    }

    /// 按有符号增量调整已分配资源
    ///
    /// 正增量与 claim 一样原子检查（不检查虚拟机数量），负增量最低减到 0
    pub async fn deduct_delta(&self, host_id: i32, dvcpu: i32, dmem: i64) -> Result<()> {
        if dvcpu == 0 && dmem == 0 {
            return Ok(());
        }
        let mut update = host::Entity::update_many()
            .col_expr(
                host::Column::VcpuAllocated,
                clamped_add(host::Column::VcpuAllocated, i64::from(dvcpu)),
            )
            .col_expr(host::Column::MemAllocated, clamped_add(host::Column::MemAllocated, dmem))
            .filter(host::Column::Id.eq(host_id));
        if dvcpu > 0 {
            update = update.filter(
                Expr::expr(Expr::col(host::Column::VcpuAllocated).add(dvcpu))
                    .lte(Expr::col(host::Column::VcpuTotal)),
            );
        }
        if dmem > 0 {
            update = update.filter(
                Expr::expr(Expr::col(host::Column::MemAllocated).add(dmem)).lte(
                    Expr::col(host::Column::MemTotal).sub(Expr::col(host::Column::MemReserved)),
                ),
            );
        }

        let res = update.exec(&self.db).await?;
        if res.rows_affected > 0 {
            return Ok(());
        }

        let host = host::Entity::find_by_id(host_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ScheduleError::NoHost(format!("宿主机({})不存在", host_id)))?;
        if dvcpu > 0 && host.vcpu_allocated + dvcpu > host.vcpu_total {
            return Err(ComputeError::VcpuNotEnough(format!(
                "宿主机({})vCPU资源不足，剩余{}，需要增加{}",
                host.ipv4,
                host.vcpu_free(),
                dvcpu
            ))
            .into());
        }
        Err(ComputeError::RamNotEnough(format!(
            "宿主机({})内存资源不足，剩余{}MiB，需要增加{}MiB",
            host.ipv4,
            host.mem_free(),
            dmem
        ))
        .into())
    }

    /// 调整已创建虚拟机数量，最低减到 0
    pub async fn vm_created_add(&self, host_id: i32, n: i32) -> Result<()> {
        host::Entity::update_many()
            .col_expr(host::Column::VmCreated, clamped_add(host::Column::VmCreated, i64::from(n)))
            .filter(host::Column::Id.eq(host_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// 从 VLAN 中租用一个空闲 IP，`exact_ip` 指定时只租用该地址
    pub async fn lease_free_ip(&self, vlan_id: i32, exact_ip: Option<&str>) -> Result<Option<MacIp>> {
        for _ in 0..LEASE_RETRIES {
            let mut query = mac_ip::Entity::find()
                .filter(mac_ip::Column::VlanId.eq(vlan_id))
                .filter(mac_ip::Column::Used.eq(false))
                .filter(mac_ip::Column::Enable.eq(true));
            if let Some(ip) = exact_ip {
                query = query.filter(mac_ip::Column::Ipv4.eq(ip));
            }
            let Some(candidate) = query.order_by_asc(mac_ip::Column::Id).one(&self.db).await? else {
                return Ok(None);
            };

            if self.try_mark_used(candidate.id).await? {
                debug!("租用 IP: vlan={}, ip={}", vlan_id, candidate.ipv4);
                return Ok(Some(MacIp { used: true, ..candidate }));
            }
            // 被并发请求抢先，重新查找
        }
        warn!("VLAN({})租用 IP 多次冲突", vlan_id);
        Ok(None)
    }

    /// 租用指定的 MAC/IP
    pub async fn lease_ip_by_id(&self, id: i32) -> Result<MacIp> {
        let found = mac_ip::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ScheduleError::NoMacIp(format!("MAC/IP({})不存在", id)))?;
        if !found.enable {
            return Err(ScheduleError::NoMacIp(format!("IP({})未启用", found.ipv4)).into());
        }
        if !self.try_mark_used(id).await? {
            return Err(ScheduleError::NoMacIp(format!("IP({})已被占用", found.ipv4)).into());
        }
        Ok(MacIp { used: true, ..found })
    }

    /// 释放 MAC/IP
    pub async fn release_ip(&self, id: i32) -> Result<()> {
        mac_ip::Entity::update_many()
            .col_expr(mac_ip::Column::Used, Expr::value(false))
            .filter(mac_ip::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        debug!("释放 MAC/IP({})", id);
        Ok(())
    }

    async fn try_mark_used(&self, id: i32) -> Result<bool> {
        let res = mac_ip::Entity::update_many()
            .col_expr(mac_ip::Column::Used, Expr::value(true))
            .filter(mac_ip::Column::Id.eq(id))
            .filter(mac_ip::Column::Used.eq(false))
            .filter(mac_ip::Column::Enable.eq(true))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected == 1)
    }
}

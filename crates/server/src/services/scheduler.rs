/// 资源调度
///
/// 选择宿主机并租用 MAC/IP，成功返回时宿主机资源已经申请

use rand::seq::SliceRandom;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tracing::{debug, info, warn};

use super::context::CloudContext;
use super::ledger::ResourceLedger;
use crate::db::models::host::{self, Host};
use crate::db::models::mac_ip::MacIp;
use crate::db::models::vlan;
use crate::errors::{CloudError, Result, ScheduleError};

/// 调度请求
#[derive(Debug, Clone, Default)]
pub struct ScheduleRequest {
    pub vcpu: i32,
    /// 内存（MiB）
    pub mem: i64,
    /// 指定宿主机，优先于 `group_ids`
    pub host_id: Option<i32>,
    pub group_ids: Option<Vec<i32>>,
    pub vlan_id: Option<i32>,
    /// 只在公网或私网 VLAN 中选择 IP
    pub ip_public: Option<bool>,
    pub need_mac_ip: bool,
}

pub struct Scheduler {
    ctx: CloudContext,
}

impl Scheduler {
    pub fn new(ctx: CloudContext) -> Self {
        Self { ctx }
    }

    pub async fn schedule(&self, req: &ScheduleRequest) -> Result<(Host, Option<MacIp>)> {
        if let Some(host_id) = req.host_id {
            return self.schedule_on_host(host_id, req).await;
        }

        let mut group_ids = req.group_ids.clone().unwrap_or_default();
        if group_ids.is_empty() {
            return Err(ScheduleError::NoHostGroup("没有可用的宿主机组".to_string()).into());
        }
        group_ids.shuffle(&mut rand::thread_rng());

        let single = group_ids.len() == 1;
        let mut last_err: Option<CloudError> = None;
        for group_id in group_ids {
            match self.schedule_in_group(group_id, req).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    debug!("宿主机组({})调度失败: {}", group_id, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if single => Err(e),
            _ => Err(ScheduleError::NoHostOrMacIp("没有满足需求的宿主机或可用 IP".to_string()).into()),
        }
    }

    /// 在指定宿主机上申请
    async fn schedule_on_host(&self, host_id: i32, req: &ScheduleRequest) -> Result<(Host, Option<MacIp>)> {
        let host = self.ctx.get_host(host_id).await?;
        if !host.enable {
            return Err(ScheduleError::NoHost(format!("宿主机({})未启用", host.ipv4)).into());
        }

        let mac_ip = if req.need_mac_ip {
            let leased = self.lease_in_group(host.group_id, req).await?;
            Some(leased.ok_or_else(|| {
                ScheduleError::NoMacIp(format!("宿主机组({})没有可用的 IP", host.group_id))
            })?)
        } else {
            None
        };

        self.claim_or_release(&host, mac_ip.as_ref(), req).await?;
        let host = self.ctx.get_host(host_id).await?;
        info!("🎯 调度到指定宿主机: {}", host.ipv4);
        Ok((host, mac_ip))
    }

    async fn schedule_in_group(&self, group_id: i32, req: &ScheduleRequest) -> Result<(Host, Option<MacIp>)> {
        let mut hosts = host::Entity::find()
            .filter(host::Column::GroupId.eq(group_id))
            .filter(host::Column::Enable.eq(true))
            .all(&self.ctx.db)
            .await?;
        hosts.shuffle(&mut rand::thread_rng());

        let host = hosts
            .into_iter()
            .find(|h| ResourceLedger::meets_needs(h, req.vcpu, req.mem, true))
            .ok_or_else(|| ScheduleError::NoHost(format!("宿主机组({})没有满足需求的宿主机", group_id)))?;

        let mac_ip = if req.need_mac_ip {
            let leased = self.lease_in_group(group_id, req).await?;
            Some(leased.ok_or_else(|| {
                ScheduleError::NoMacIp(format!("宿主机组({})没有可用的 IP", group_id))
            })?)
        } else {
            None
        };

        self.claim_or_release(&host, mac_ip.as_ref(), req).await?;
        let host = self.ctx.get_host(host.id).await?;
        info!("🎯 调度到宿主机: {} (group={})", host.ipv4, group_id);
        Ok((host, mac_ip))
    }

    /// 申请宿主机资源，失败时释放已租用的 IP
    async fn claim_or_release(&self, host: &Host, mac_ip: Option<&MacIp>, req: &ScheduleRequest) -> Result<()> {
        let ledger = self.ctx.ledger();
        if let Err(e) = ledger.claim(host.id, req.vcpu, req.mem, true).await {
            if let Some(ip) = mac_ip {
                if let Err(re) = ledger.release_ip(ip.id).await {
                    warn!("释放 IP({})失败: {}", ip.ipv4, re);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// 从宿主机组的 VLAN 中租用 IP
    async fn lease_in_group(&self, group_id: i32, req: &ScheduleRequest) -> Result<Option<MacIp>> {
        let ledger = self.ctx.ledger();

        if let Some(vlan_id) = req.vlan_id {
            let v = self.ctx.get_vlan(vlan_id).await?;
            if v.group_id != group_id {
                return Ok(None);
            }
            return ledger.lease_free_ip(vlan_id, None).await;
        }

        let mut query = vlan::Entity::find()
            .filter(vlan::Column::GroupId.eq(group_id))
            .filter(vlan::Column::Enable.eq(true));
        if let Some(public) = req.ip_public {
            query = query.filter(vlan::Column::Public.eq(public));
        }
        let mut vlans = query.all(&self.ctx.db).await?;
        vlans.shuffle(&mut rand::thread_rng());

        for v in vlans {
            if let Some(ip) = ledger.lease_free_ip(v.id, None).await? {
                return Ok(Some(ip));
            }
        }
        Ok(None)
    }
}

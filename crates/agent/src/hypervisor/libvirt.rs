/// libvirt 域驱动
///
/// 所有域操作都走 libvirt API；热迁移打开到目标宿主机的连接后由源端发起

use async_trait::async_trait;
use common::utils::validate_ip_address;
use common::ws_rpc::DomainRef;
use common::{DomainState, DomainStats, Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::sys;

use super::{xml, DomainBackend};

/// 热迁移：持久化到目标端、删除源端定义、允许非共享缓存的磁盘
const LIVE_MIGRATE_FLAGS: u32 = sys::VIR_MIGRATE_LIVE
    | sys::VIR_MIGRATE_PERSIST_DEST
    | sys::VIR_MIGRATE_UNDEFINE_SOURCE
    | sys::VIR_MIGRATE_UNSAFE;

pub struct LibvirtDriver {
    conn: Arc<Mutex<Connect>>,
    uri: String,
}

fn hv_err(action: &str) -> impl FnOnce(virt::error::Error) -> Error + '_ {
    move |e| Error::Hypervisor(format!("{}: {}", action, e))
}

fn non_negative(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

impl LibvirtDriver {
    /// 连接 libvirt
    pub fn connect(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        let conn = Connect::open(Some(uri.as_str()))
            .map_err(|e| Error::Hypervisor(format!("无法连接到 libvirt({}): {}", uri, e)))?;
        info!("✅ 成功连接到 libvirt: {}", uri);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            uri,
        })
    }

    fn lookup(conn: &Connect, uuid: &str) -> Result<Domain> {
        Domain::lookup_by_uuid_string(conn, uuid).map_err(|e| match e.code() {
            ErrorNumber::NoDomain => Error::DomainNotFound(uuid.to_string()),
            _ => Error::Hypervisor(format!("查找虚拟机 {} 失败: {}", uuid, e)),
        })
    }

    /// 对运行中的域执行电源操作，返回状态是否变化
    async fn power_if(
        &self,
        uuid: &str,
        want_active: bool,
        action: &str,
        op: impl FnOnce(&Domain) -> std::result::Result<(), virt::error::Error> + Send,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        let active = domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))?;
        if active != want_active {
            debug!("虚拟机 {} 无需{}", uuid, action);
            return Ok(false);
        }
        op(&domain).map_err(hv_err(action))?;
        info!("虚拟机 {} 已{}", uuid, action);
        Ok(true)
    }
}

#[async_trait]
impl DomainBackend for LibvirtDriver {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_alive().unwrap_or(false) {
            return Ok(());
        }
        warn!("libvirt 连接已断开，尝试重新连接: {}", self.uri);
        *conn = Connect::open(Some(self.uri.as_str()))
            .map_err(|e| Error::Hypervisor(format!("无法连接到 libvirt({}): {}", self.uri, e)))?;
        info!("✅ libvirt 重新连接成功");
        Ok(())
    }

    async fn define(&self, xml: &str) -> Result<DomainRef> {
        let identity = xml::domain_identity(xml)?;
        let conn = self.conn.lock().await;
        let domain = Domain::define_xml(&conn, xml).map_err(hv_err("定义虚拟机失败"))?;
        let uuid = match identity.uuid {
            Some(uuid) => uuid,
            None => domain.get_uuid_string().map_err(hv_err("获取虚拟机 UUID 失败"))?,
        };
        info!("✅ 虚拟机已定义: name={}, uuid={}", identity.name, uuid);
        Ok(DomainRef {
            uuid,
            name: identity.name,
        })
    }

    async fn undefine(&self, uuid: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = match Self::lookup(&conn, uuid) {
            Ok(d) => d,
            Err(Error::DomainNotFound(_)) => {
                debug!("虚拟机 {} 不存在，无需删除定义", uuid);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))? {
            domain.destroy().map_err(hv_err("强制关机失败"))?;
        }
        domain.undefine().map_err(hv_err("删除虚拟机定义失败"))?;
        info!("🗑️ 虚拟机定义已删除: {}", uuid);
        Ok(())
    }

    async fn start(&self, uuid: &str) -> Result<bool> {
        self.power_if(uuid, false, "启动", |d| d.create().map(|_| ())).await
    }

    async fn reboot(&self, uuid: &str) -> Result<bool> {
        self.power_if(uuid, true, "重启", |d| d.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT).map(|_| ())).await
    }

    async fn shutdown(&self, uuid: &str) -> Result<bool> {
        self.power_if(uuid, true, "关机", |d| d.shutdown().map(|_| ())).await
    }

    async fn poweroff(&self, uuid: &str) -> Result<bool> {
        self.power_if(uuid, true, "强制关机", |d| d.destroy().map(|_| ())).await
    }

    async fn status(&self, uuid: &str) -> Result<DomainState> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        let (state, _reason) = domain.get_state().map_err(hv_err("获取虚拟机状态失败"))?;
        Ok(DomainState::from_code(state as u32))
    }

    async fn exists(&self, uuid: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        match Self::lookup(&conn, uuid) {
            Ok(_) => Ok(true),
            Err(Error::DomainNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn attach_device(&self, uuid: &str, xml: &str) -> Result<()> {
        let kind = xml::device_kind(xml)?;
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        let active = domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))?;

        domain
            .attach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(hv_err("挂载设备失败"))?;
        if active {
            if let Err(e) = domain.attach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_LIVE) {
                // 撤销已写入的持久化配置
                if let Err(re) = domain.detach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CONFIG) {
                    warn!("回滚设备持久化配置失败: vm={}, error={}", uuid, re);
                }
                return Err(Error::Hypervisor(format!("热挂载设备失败: {}", e)));
            }
        }
        info!("设备已挂载: vm={}, kind={}, live={}", uuid, kind, active);
        Ok(())
    }

    async fn detach_device(&self, uuid: &str, xml: &str) -> Result<()> {
        let kind = xml::device_kind(xml)?;
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        let active = domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))?;

        domain
            .detach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(hv_err("卸载设备失败"))?;
        if active {
            if let Err(e) = domain.detach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_LIVE) {
                if let Err(re) = domain.attach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CONFIG) {
                    warn!("回滚设备持久化配置失败: vm={}, error={}", uuid, re);
                }
                return Err(Error::Hypervisor(format!("热卸载设备失败: {}", e)));
            }
        }
        info!("设备已卸载: vm={}, kind={}, live={}", uuid, kind, active);
        Ok(())
    }

    async fn xml_desc(&self, uuid: &str, live: bool) -> Result<String> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        let flags = if live { 0 } else { sys::VIR_DOMAIN_XML_INACTIVE };
        domain.get_xml_desc(flags).map_err(hv_err("获取虚拟机 XML 失败"))
    }

    async fn stats(&self, uuid: &str) -> Result<DomainStats> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        let info = domain.get_info().map_err(hv_err("获取虚拟机信息失败"))?;
        let mut stats = DomainStats {
            cpu_time: info.cpu_time,
            mem_used: info.memory,
            mem_total: info.max_mem,
            ..Default::default()
        };
        if !domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))? {
            return Ok(stats);
        }

        let desc = domain.get_xml_desc(0).map_err(hv_err("获取虚拟机 XML 失败"))?;
        for dev in xml::disk_targets(&desc)? {
            match domain.get_block_stats(&dev) {
                Ok(s) => {
                    stats.disk_rd += non_negative(s.rd_bytes);
                    stats.disk_wr += non_negative(s.wr_bytes);
                }
                Err(e) => debug!("读取磁盘统计失败: vm={}, dev={}, error={}", uuid, dev, e),
            }
        }
        for dev in xml::interface_targets(&desc)? {
            match domain.interface_stats(&dev) {
                Ok(s) => {
                    stats.net_rx += non_negative(s.rx_bytes);
                    stats.net_tx += non_negative(s.tx_bytes);
                }
                Err(e) => debug!("读取网卡统计失败: vm={}, dev={}, error={}", uuid, dev, e),
            }
        }
        Ok(stats)
    }

    async fn live_migrate(&self, uuid: &str, dest_ip: &str) -> Result<DomainRef> {
        if !validate_ip_address(dest_ip) {
            return Err(Error::InvalidArgument(format!("目标宿主机 IP 无效: {}", dest_ip)));
        }
        // 迁移耗时较长，只在查找域时持有连接锁
        let (domain, name) = {
            let conn = self.conn.lock().await;
            let domain = Self::lookup(&conn, uuid)?;
            if !domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))? {
                return Err(Error::Hypervisor(format!("虚拟机 {} 未运行，无法热迁移", uuid)));
            }
            let name = domain.get_name().map_err(hv_err("获取虚拟机名称失败"))?;
            (domain, name)
        };

        let dest_uri = format!("qemu+ssh://{}/system", dest_ip);
        info!("🚚 开始热迁移: vm={}, dest={}", uuid, dest_uri);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut dest = Connect::open(Some(dest_uri.as_str()))
                .map_err(|e| Error::Hypervisor(format!("无法连接到目标宿主机({}): {}", dest_uri, e)))?;
            let migrated = domain
                .migrate(&dest, LIVE_MIGRATE_FLAGS, None, None, 0)
                .map(|_| ())
                .map_err(hv_err("热迁移失败"));
            if let Err(e) = dest.close() {
                warn!("关闭目标宿主机连接失败: {}", e);
            }
            migrated
        })
        .await
        .map_err(|e| Error::Internal(format!("热迁移任务异常退出: {}", e)))??;
        info!("✅ 热迁移完成: vm={}, dest={}", uuid, dest_ip);

        Ok(DomainRef {
            uuid: uuid.to_string(),
            name,
        })
    }

    async fn set_user_password(&self, uuid: &str, user: &str, password: &str) -> Result<()> {
        if user.is_empty() || password.is_empty() {
            return Err(Error::InvalidArgument("用户名和密码不能为空".to_string()));
        }
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, uuid)?;
        if !domain.is_active().map_err(hv_err("获取虚拟机运行状态失败"))? {
            return Err(Error::Hypervisor(format!("虚拟机 {} 未运行，无法设置密码", uuid)));
        }
        // 经 guest agent 设置
        domain
            .set_user_password(user, password, 0)
            .map_err(hv_err("设置虚拟机用户密码失败"))?;
        info!("虚拟机 {} 用户 {} 密码已重置", uuid, user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_migrate_flags() {
        for flag in [
            sys::VIR_MIGRATE_LIVE,
            sys::VIR_MIGRATE_PERSIST_DEST,
            sys::VIR_MIGRATE_UNDEFINE_SOURCE,
            sys::VIR_MIGRATE_UNSAFE,
        ] {
            assert_eq!(LIVE_MIGRATE_FLAGS & flag, flag);
        }
        assert_eq!(LIVE_MIGRATE_FLAGS & sys::VIR_MIGRATE_OFFLINE, 0);
    }
}

/// 测试用内存虚拟化客户端
///
/// 按宿主机 ID 保存域定义，可注入宿主机不可达与指定操作失败

use async_trait::async_trait;
use common::{DomainState, DomainStats};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{DomainRef, HvResult, HypervisorClient};
use crate::db::models::host::Host;
use crate::errors::HypervisorError;

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub name: String,
    pub xml: String,
    pub running: bool,
    /// 已挂载的设备 XML 片段
    pub devices: Vec<String>,
}

impl FakeDomain {
    fn full_xml(&self) -> String {
        let extra: String = self.devices.concat();
        match self.xml.rfind("</devices>") {
            Some(pos) => format!("{}{}{}", &self.xml[..pos], extra, &self.xml[pos..]),
            None => self.xml.clone(),
        }
    }
}

#[derive(Default)]
pub struct FakeHypervisor {
    domains: Mutex<HashMap<i32, HashMap<String, FakeDomain>>>,
    unreachable: Mutex<HashSet<i32>>,
    failing: Mutex<HashSet<&'static str>>,
    passwords: Mutex<Vec<(String, String, String)>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, host_id: i32, down: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if down {
            set.insert(host_id);
        } else {
            set.remove(&host_id);
        }
    }

    /// 让指定操作失败，如 "define"、"attach_device"、"live_migrate"
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn put_domain(&self, host_id: i32, uuid: &str, xml: &str, running: bool) {
        self.domains.lock().unwrap().entry(host_id).or_default().insert(
            uuid.to_string(),
            FakeDomain {
                name: uuid.to_string(),
                xml: xml.to_string(),
                running,
                devices: Vec::new(),
            },
        );
    }

    pub fn set_running(&self, host_id: i32, uuid: &str, running: bool) {
        if let Some(d) = self
            .domains
            .lock()
            .unwrap()
            .get_mut(&host_id)
            .and_then(|m| m.get_mut(uuid))
        {
            d.running = running;
        }
    }

    pub fn has_domain(&self, host_id: i32, uuid: &str) -> bool {
        self.domains
            .lock()
            .unwrap()
            .get(&host_id)
            .map(|m| m.contains_key(uuid))
            .unwrap_or(false)
    }

    pub fn domain(&self, host_id: i32, uuid: &str) -> Option<FakeDomain> {
        self.domains
            .lock()
            .unwrap()
            .get(&host_id)
            .and_then(|m| m.get(uuid).cloned())
    }

    pub fn domain_count(&self, host_id: i32) -> usize {
        self.domains.lock().unwrap().get(&host_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn passwords(&self) -> Vec<(String, String, String)> {
        self.passwords.lock().unwrap().clone()
    }

    fn check(&self, host: &Host, op: &'static str) -> HvResult<()> {
        if self.unreachable.lock().unwrap().contains(&host.id) {
            return Err(HypervisorError::HostUnreachable(format!("宿主机({})无法连接", host.ipv4)));
        }
        if self.failing.lock().unwrap().contains(op) {
            return Err(HypervisorError::Generic(format!("{} 失败", op)));
        }
        Ok(())
    }

    fn with_domain<T>(
        &self,
        host: &Host,
        uuid: &str,
        f: impl FnOnce(&mut FakeDomain) -> T,
    ) -> HvResult<T> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&host.id)
            .and_then(|m| m.get_mut(uuid))
            .ok_or_else(|| HypervisorError::DomainNotExist(format!("虚拟机({})不存在", uuid)))?;
        Ok(f(domain))
    }
}

fn parse_ref(xml: &str) -> HvResult<DomainRef> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| HypervisorError::Generic(format!("XML 无效: {}", e)))?;
    let text = |tag: &str| {
        doc.root_element()
            .children()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(|s| s.trim().to_string())
    };
    let uuid = text("uuid").ok_or_else(|| HypervisorError::Generic("XML 缺少 uuid".into()))?;
    let name = text("name").unwrap_or_else(|| uuid.clone());
    Ok(DomainRef { uuid, name })
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn connect(&self, host: &Host) -> HvResult<()> {
        self.check(host, "connect")
    }

    async fn define(&self, host: &Host, xml: &str) -> HvResult<DomainRef> {
        self.check(host, "define")?;
        let r = parse_ref(xml)?;
        let mut domains = self.domains.lock().unwrap();
        let map = domains.entry(host.id).or_default();
        let running = map.get(&r.uuid).map(|d| d.running).unwrap_or(false);
        map.insert(
            r.uuid.clone(),
            FakeDomain {
                name: r.name.clone(),
                xml: xml.to_string(),
                running,
                devices: Vec::new(),
            },
        );
        Ok(r)
    }

    async fn undefine(&self, host: &Host, uuid: &str) -> HvResult<()> {
        self.check(host, "undefine")?;
        if let Some(m) = self.domains.lock().unwrap().get_mut(&host.id) {
            m.remove(uuid);
        }
        Ok(())
    }

    async fn start(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.check(host, "start")?;
        self.with_domain(host, uuid, |d| !std::mem::replace(&mut d.running, true))
    }

    async fn reboot(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.check(host, "reboot")?;
        self.with_domain(host, uuid, |d| d.running)
    }

    async fn shutdown(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.check(host, "shutdown")?;
        self.with_domain(host, uuid, |d| std::mem::replace(&mut d.running, false))
    }

    async fn poweroff(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.check(host, "poweroff")?;
        self.with_domain(host, uuid, |d| std::mem::replace(&mut d.running, false))
    }

    async fn status(&self, host: &Host, uuid: &str) -> HvResult<DomainState> {
        match self.check(host, "status") {
            Err(HypervisorError::HostUnreachable(_)) => return Ok(DomainState::HostUnreachable),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        match self.with_domain(host, uuid, |d| d.running) {
            Ok(true) => Ok(DomainState::Running),
            Ok(false) => Ok(DomainState::ShutOff),
            Err(_) => Ok(DomainState::Missing),
        }
    }

    async fn domain_exists(&self, host: &Host, uuid: &str) -> HvResult<bool> {
        self.check(host, "domain_exists")?;
        Ok(self.has_domain(host.id, uuid))
    }

    async fn attach_device(&self, host: &Host, uuid: &str, xml: &str) -> HvResult<()> {
        self.check(host, "attach_device")?;
        self.with_domain(host, uuid, |d| d.devices.push(xml.to_string()))
    }

    async fn detach_device(&self, host: &Host, uuid: &str, xml: &str) -> HvResult<()> {
        self.check(host, "detach_device")?;
        self.with_domain(host, uuid, |d| d.devices.retain(|x| x != xml))
    }

    async fn xml_desc(&self, host: &Host, uuid: &str, _live: bool) -> HvResult<String> {
        self.check(host, "xml_desc")?;
        self.with_domain(host, uuid, |d| d.full_xml())
    }

    async fn stats(&self, host: &Host, uuid: &str) -> HvResult<DomainStats> {
        self.check(host, "stats")?;
        self.with_domain(host, uuid, |_| DomainStats {
            cpu_time: 1_000,
            mem_used: 512,
            mem_total: 1024,
            ..Default::default()
        })
    }

    async fn live_migrate(&self, src: &Host, uuid: &str, dst: &Host) -> HvResult<DomainRef> {
        self.check(src, "live_migrate")?;
        self.check(dst, "live_migrate")?;
        let domain = {
            let mut domains = self.domains.lock().unwrap();
            domains
                .get_mut(&src.id)
                .and_then(|m| m.remove(uuid))
                .ok_or_else(|| HypervisorError::DomainNotExist(format!("虚拟机({})不存在", uuid)))?
        };
        let r = DomainRef {
            uuid: uuid.to_string(),
            name: domain.name.clone(),
        };
        self.domains
            .lock()
            .unwrap()
            .entry(dst.id)
            .or_default()
            .insert(uuid.to_string(), domain);
        Ok(r)
    }

    async fn set_user_password(
        &self,
        host: &Host,
        uuid: &str,
        user: &str,
        password: &str,
    ) -> HvResult<()> {
        self.check(host, "set_user_password")?;
        self.with_domain(host, uuid, |_| ())?;
        self.passwords
            .lock()
            .unwrap()
            .push((uuid.to_string(), user.to_string(), password.to_string()));
        Ok(())
    }
}

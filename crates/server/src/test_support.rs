/// 测试环境
///
/// 内存 SQLite + 内存虚拟化客户端 + 内存块存储，预置一个数据中心、宿主机组和镜像

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::db::models::center::{self, Center};
use crate::db::models::group::{self, Group};
use crate::db::models::host::{self, Host};
use crate::db::models::image::{self, Image};
use crate::db::models::mac_ip::{self, MacIp};
use crate::db::models::migrate_task::{self, MigrateTask};
use crate::db::models::pci_device::{self, PciDevice, PciKind};
use crate::db::models::vdisk::{self, Vdisk};
use crate::db::models::vlan::{self, Vlan};
use crate::db::models::vm::{self, Vm};
use crate::db::models::vm_archive::{self, VmArchive};
use crate::db::models::{group_user, vm_disk_snap, vm_log};
use crate::hypervisor::fake::FakeHypervisor;
use crate::services::access::UserContext;
use crate::services::context::CloudContext;
use crate::services::vm_builder::{CreateVmRequest, VmBuilder};
use crate::storage::fake::FakeStorage;
use crate::storage::PoolRef;

/// 镜像 XML 模板
pub const XML_TPL: &str = "<domain type='kvm'>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <memory unit='MiB'>{mem}</memory>
  <currentMemory unit='MiB'>{mem}</currentMemory>
  <vcpu placement='static'>{vcpu}</vcpu>
  <os><type arch='x86_64'>hvm</type></os>
  <devices>
    <disk type='network' device='disk'>
      <driver name='qemu' type='raw'/>
      <auth username='{ceph_username}'><secret type='ceph' uuid='{ceph_uuid}'/></auth>
      <source protocol='rbd' name='{ceph_pool}/{diskname}'>{ceph_hosts_xml}</source>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <mac address='{mac}'/>
      <source bridge='{bridge}'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>";

static SEQ: AtomicU32 = AtomicU32::new(1);

fn next_seq() -> u32 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

pub fn center_model() -> Center {
    Center {
        id: 1,
        name: "center-1".to_string(),
        ceph_id: 1,
        ceph_pool: "vm_pool".to_string(),
        ceph_data_pool: None,
        ceph_username: "admin".to_string(),
        ceph_uuid: "4b5c3e2a-0000-4000-8000-000000000001".to_string(),
        ceph_hosts_xml: "<host name='10.0.0.1' port='6789'/>".to_string(),
        ceph_has_auth: true,
    }
}

pub struct TestEnv {
    pub ctx: CloudContext,
    pub hv: Arc<FakeHypervisor>,
    pub storage: Arc<FakeStorage>,
    pub center: Center,
    pub group: Group,
    pub image: Image,
}

impl TestEnv {
    pub async fn new() -> Self {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Database::connect(opt).await.unwrap();
        crate::db::sync_schema(&db).await.unwrap();

        let hv = Arc::new(FakeHypervisor::new());
        let storage = Arc::new(FakeStorage::new());
        let ctx = CloudContext::new(db, hv.clone(), storage.clone());

        let c = center_model();
        let center = center::ActiveModel {
            name: Set(c.name),
            ceph_id: Set(c.ceph_id),
            ceph_pool: Set(c.ceph_pool),
            ceph_data_pool: Set(None),
            ceph_username: Set(c.ceph_username),
            ceph_uuid: Set(c.ceph_uuid),
            ceph_hosts_xml: Set(c.ceph_hosts_xml),
            ceph_has_auth: Set(c.ceph_has_auth),
            ..Default::default()
        }
        .insert(&ctx.db)
        .await
        .unwrap();
        let group = insert_group(&ctx.db, center.id).await;

        let mut env = Self {
            ctx,
            hv,
            storage,
            center,
            group,
            image: Image {
                id: 0,
                name: String::new(),
                center_id: 0,
                base_image: String::new(),
                snap: String::new(),
                enable: true,
                size_gb: 0,
                sys_type: String::new(),
                xml_tpl: String::new(),
            },
        };
        env.image = env.seed_image("centos7", 20).await;
        env
    }

    pub fn pool(&self) -> PoolRef {
        PoolRef::from_center(&self.center)
    }

    /// 新镜像，父镜像放入块存储
    pub async fn seed_image(&self, base: &str, size_gb: i32) -> Image {
        let image = image::ActiveModel {
            name: Set(base.to_string()),
            center_id: Set(self.center.id),
            base_image: Set(base.to_string()),
            snap: Set("base".to_string()),
            enable: Set(true),
            size_gb: Set(size_gb),
            sys_type: Set("linux".to_string()),
            xml_tpl: Set(XML_TPL.to_string()),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await
        .unwrap();
        self.storage
            .put_image(&self.pool(), base, size_gb as u64, Some("base"));
        image
    }

    pub async fn seed_group(&self) -> Group {
        insert_group(&self.ctx.db, self.center.id).await
    }

    pub async fn seed_center_with_group(&self) -> (Center, Group) {
        let n = next_seq();
        let center = center::ActiveModel {
            name: Set(format!("center-{}", n)),
            ceph_id: Set(n as i32),
            ceph_pool: Set(format!("pool_{}", n)),
            ceph_data_pool: Set(None),
            ceph_username: Set("admin".to_string()),
            ceph_uuid: Set(String::new()),
            ceph_hosts_xml: Set(String::new()),
            ceph_has_auth: Set(false),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await
        .unwrap();
        let group = insert_group(&self.ctx.db, center.id).await;
        (center, group)
    }

    /// 在默认宿主机组中添加宿主机
    pub async fn seed_host(&self, vcpu: i32, mem: i64) -> Host {
        self.seed_host_in(self.group.id, vcpu, mem).await
    }

    pub async fn seed_host_in(&self, group_id: i32, vcpu: i32, mem: i64) -> Host {
        let n = next_seq();
        host::ActiveModel {
            group_id: Set(group_id),
            ipv4: Set(format!("192.168.{}.{}", n / 250, n % 250 + 1)),
            agent_node_id: Set(format!("node-{}", n)),
            vcpu_total: Set(vcpu),
            vcpu_allocated: Set(0),
            mem_total: Set(mem),
            mem_allocated: Set(0),
            mem_reserved: Set(0),
            vm_limit: Set(100),
            vm_created: Set(0),
            enable: Set(true),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await
        .unwrap()
    }

    pub async fn host(&self, id: i32) -> Host {
        host::Entity::find_by_id(id).one(&self.ctx.db).await.unwrap().unwrap()
    }

    pub async fn set_host_reserved(&self, id: i32, mem: i64) {
        self.update_host(id, host::Column::MemReserved, Expr::value(mem)).await;
    }

    pub async fn set_host_vm_limit(&self, id: i32, limit: i32) {
        self.update_host(id, host::Column::VmLimit, Expr::value(limit)).await;
    }

    pub async fn disable_host(&self, id: i32) {
        self.update_host(id, host::Column::Enable, Expr::value(false)).await;
    }

    async fn update_host(&self, id: i32, col: host::Column, value: sea_orm::sea_query::SimpleExpr) {
        host::Entity::update_many()
            .col_expr(col, value)
            .filter(host::Column::Id.eq(id))
            .exec(&self.ctx.db)
            .await
            .unwrap();
    }

    pub async fn add_group_user(&self, group_id: i32, user_id: i32) {
        group_user::ActiveModel {
            group_id: Set(group_id),
            user_id: Set(user_id),
        }
        .insert(&self.ctx.db)
        .await
        .unwrap();
    }

    pub async fn seed_vlan(&self, group_id: i32, public: bool) -> Vlan {
        let n = next_seq();
        vlan::ActiveModel {
            group_id: Set(group_id),
            name: Set(format!("vlan-{}", n)),
            br: Set(format!("br{}", n)),
            public: Set(public),
            subnet: Set(format!("10.{}.0.0/24", n % 250)),
            gateway: Set(format!("10.{}.0.1", n % 250)),
            dns: Set("114.114.114.114".to_string()),
            enable: Set(true),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await
        .unwrap()
    }

    /// 按 id 递增顺序返回
    pub async fn seed_mac_ips(&self, vlan_id: i32, count: usize) -> Vec<MacIp> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let n = next_seq();
            let ip = mac_ip::ActiveModel {
                vlan_id: Set(vlan_id),
                mac: Set(format!("52:54:00:{:02x}:{:02x}:{:02x}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)),
                ipv4: Set(format!("10.{}.{}.{}", vlan_id % 250, n / 250 % 250, n % 250 + 2)),
                ipv6: Set(None),
                used: Set(false),
                enable: Set(true),
                ..Default::default()
            }
            .insert(&self.ctx.db)
            .await
            .unwrap();
            out.push(ip);
        }
        out
    }

    pub async fn mac_ip(&self, id: i32) -> MacIp {
        mac_ip::Entity::find_by_id(id).one(&self.ctx.db).await.unwrap().unwrap()
    }

    pub async fn seed_vdisk(&self, group_id: i32, user_id: i32) -> Vdisk {
        let g = group::Entity::find_by_id(group_id)
            .one(&self.ctx.db)
            .await
            .unwrap()
            .unwrap();
        vdisk::ActiveModel {
            uuid: Set(common::utils::new_vm_uuid()),
            center_id: Set(g.center_id),
            group_id: Set(group_id),
            size_gb: Set(10),
            user_id: Set(user_id),
            vm_uuid: Set(None),
            dev: Set(None),
            attach_time: Set(None),
            enable: Set(true),
            remarks: Set(String::new()),
        }
        .insert(&self.ctx.db)
        .await
        .unwrap()
    }

    pub async fn seed_pci(&self, host_id: i32, kind: PciKind) -> PciDevice {
        let n = next_seq();
        pci_device::ActiveModel {
            host_id: Set(host_id),
            kind: Set(kind.as_str().to_string()),
            address: Set(format!("0000:{:02x}:00.0", n % 256)),
            vm_uuid: Set(None),
            attach_time: Set(None),
            enable: Set(true),
            remarks: Set(String::new()),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await
        .unwrap()
    }

    /// 新宿主机上创建一台关机状态的虚拟机（属于用户 1）
    pub async fn create_vm(&self) -> (Vm, Host) {
        let host = self.seed_host(8, 16384).await;
        let vlan = self.seed_vlan(host.group_id, false).await;
        self.seed_mac_ips(vlan.id, 2).await;
        let vm = VmBuilder::new(self.ctx.clone())
            .create_vm(
                &UserContext::new(1, true),
                CreateVmRequest {
                    vcpu: 2,
                    mem: 2048,
                    image_id: self.image.id,
                    host_id: Some(host.id),
                    vlan_id: Some(vlan.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let host = self.host(host.id).await;
        (vm, host)
    }

    pub async fn vm_count(&self) -> u64 {
        vm::Entity::find().count(&self.ctx.db).await.unwrap()
    }

    pub async fn archive(&self, uuid: &str) -> Option<VmArchive> {
        vm_archive::Entity::find()
            .filter(vm_archive::Column::Uuid.eq(uuid))
            .one(&self.ctx.db)
            .await
            .unwrap()
    }

    pub async fn snap_count(&self, vm_uuid: &str) -> u64 {
        vm_disk_snap::Entity::find()
            .filter(vm_disk_snap::Column::VmUuid.eq(vm_uuid))
            .count(&self.ctx.db)
            .await
            .unwrap()
    }

    pub async fn logs(&self) -> Vec<vm_log::Model> {
        vm_log::Entity::find()
            .order_by_asc(vm_log::Column::Id)
            .all(&self.ctx.db)
            .await
            .unwrap()
    }

    pub async fn migrate_tasks(&self, vm_uuid: &str) -> Vec<MigrateTask> {
        migrate_task::Entity::find()
            .filter(migrate_task::Column::VmUuid.eq(vm_uuid))
            .order_by_asc(migrate_task::Column::Id)
            .all(&self.ctx.db)
            .await
            .unwrap()
    }

    /// 直接写入一条迁移任务，用于恢复流程测试
    pub async fn seed_migrate_task(&self, vm: &Vm, src: &Host, dst: &Host, status: &str) -> MigrateTask {
        migrate_task::ActiveModel {
            vm_uuid: Set(vm.uuid.clone()),
            src_host_id: Set(src.id),
            src_host_ipv4: Set(src.ipv4.clone()),
            dst_host_id: Set(dst.id),
            dst_host_ipv4: Set(dst.ipv4.clone()),
            dst_is_claim: Set(true),
            src_is_free: Set(false),
            src_undefined: Set(false),
            status: Set(status.to_string()),
            content: Set(String::new()),
            tag: Set(migrate_task::TAG_LIVE.to_string()),
            migrate_time: Set(Utc::now().into()),
            migrate_complete_time: Set(None),
            ..Default::default()
        }
        .insert(&self.ctx.db)
        .await
        .unwrap()
    }
}

async fn insert_group(db: &DatabaseConnection, center_id: i32) -> Group {
    let n = next_seq();
    group::ActiveModel {
        center_id: Set(center_id),
        name: Set(format!("group-{}", n)),
        enable: Set(true),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

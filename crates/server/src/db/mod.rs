/// 数据库访问层

pub mod models;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;
use tracing::info;

use models::{
    center, group, group_user, host, image, mac_ip, migrate_task, pci_device, vdisk, vlan, vm,
    vm_archive, vm_disk_snap, vm_log,
};

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, anyhow::Error> {
    info!("正在连接数据库: {}", redact(database_url));

    let mut opts = ConnectOptions::new(database_url);
    opts.max_connections(20)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(opts).await?;
    info!("数据库连接成功");

    Ok(db)
}

/// 按实体定义建表，已存在的表保持不变
pub async fn sync_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let stmts = [
        schema.create_table_from_entity(center::Entity),
        schema.create_table_from_entity(group::Entity),
        schema.create_table_from_entity(group_user::Entity),
        schema.create_table_from_entity(host::Entity),
        schema.create_table_from_entity(vlan::Entity),
        schema.create_table_from_entity(mac_ip::Entity),
        schema.create_table_from_entity(image::Entity),
        schema.create_table_from_entity(vm::Entity),
        schema.create_table_from_entity(vm_archive::Entity),
        schema.create_table_from_entity(vm_disk_snap::Entity),
        schema.create_table_from_entity(vm_log::Entity),
        schema.create_table_from_entity(vdisk::Entity),
        schema.create_table_from_entity(pci_device::Entity),
        schema.create_table_from_entity(migrate_task::Entity),
    ];
    for mut stmt in stmts {
        stmt.if_not_exists();
        db.execute(backend.build(&stmt)).await?;
    }
    Ok(())
}

/// 隐去连接串中的密码
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            let cred = &url[scheme + 3..at];
            match cred.find(':') {
                Some(colon) => format!("{}{}:***{}", &url[..scheme + 3], &cred[..colon], &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

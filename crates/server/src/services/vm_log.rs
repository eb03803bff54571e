/// 运维日志
///
/// 补偿操作失败时写入，供管理员人工处理；写日志本身失败只记录 tracing 日志

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use tracing::{error, warn};

use crate::db::models::vm_log::{self, LogAbout};

#[derive(Clone)]
pub struct VmLogWriter {
    db: DatabaseConnection,
}

impl VmLogWriter {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn write(&self, title: &str, about: LogAbout, content: &str) {
        warn!("📝 [{}] {}: {}", about.as_str(), title, content);

        let record = vm_log::ActiveModel {
            title: Set(title.to_string()),
            about: Set(about.as_str().to_string()),
            content: Set(content.to_string()),
            create_time: Set(Utc::now().into()),
            ..Default::default()
        };
        if let Err(e) = record.insert(&self.db).await {
            error!("写入运维日志失败: title={}, error={}", title, e);
        }
    }
}

/// 控制面业务服务
///
/// 依赖顺序（叶子在前）：ledger → scheduler → vm_builder → vm_instance → migration

pub mod access;
pub mod context;
pub mod device;
pub mod domain_xml;
pub mod ledger;
pub mod migration;
pub mod scheduler;
pub mod vm_builder;
pub mod vm_instance;
pub mod vm_log;

pub use access::UserContext;
pub use context::CloudContext;
pub use ledger::ResourceLedger;
pub use migration::{MigrationEngine, MigrationWorkerPool};
pub use scheduler::{ScheduleRequest, Scheduler};
pub use vm_builder::{CreateVmRequest, VmBuilder};
pub use vm_instance::{VmInstance, VmOperation};

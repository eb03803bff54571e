/// 虚拟化线协议方法名
///
/// Server 端 HypervisorClient 与 Agent 端处理器共用，修改需两端同步

pub const REGISTER: &str = "register";
pub const HEARTBEAT: &str = "heartbeat";

pub const PING: &str = "ping";
pub const DEFINE_DOMAIN: &str = "define_domain";
pub const UNDEFINE_DOMAIN: &str = "undefine_domain";
pub const START_DOMAIN: &str = "start_domain";
pub const REBOOT_DOMAIN: &str = "reboot_domain";
pub const SHUTDOWN_DOMAIN: &str = "shutdown_domain";
pub const POWEROFF_DOMAIN: &str = "poweroff_domain";
pub const DOMAIN_STATUS: &str = "domain_status";
pub const DOMAIN_EXISTS: &str = "domain_exists";
pub const ATTACH_DEVICE: &str = "attach_device";
pub const DETACH_DEVICE: &str = "detach_device";
pub const XML_DESC: &str = "xml_desc";
pub const DOMAIN_STATS: &str = "domain_stats";
pub const LIVE_MIGRATE: &str = "live_migrate";
pub const SET_USER_PASSWORD: &str = "set_user_password";

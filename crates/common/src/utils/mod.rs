/// 工具函数集合

use uuid::Uuid;

const GIB: u64 = 1024 * 1024 * 1024;

/// 生成虚拟机 UUID（32 位十六进制，同时用作系统盘镜像名）
pub fn new_vm_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// GiB 转字节
pub fn gib_to_bytes(gib: u64) -> u64 {
    gib.saturating_mul(GIB)
}

/// 字节转 GiB，向上取整
pub fn bytes_to_gib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 验证 IPv4 地址格式
pub fn validate_ip_address(ip: &str) -> bool {
    ip.parse::<std::net::Ipv4Addr>().is_ok()
}

pub mod config;
pub mod logger;

pub use config::{Config, ConfigError};
pub use logger::{parse_log_level, setup_logger};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// 获取应用程序版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 当前Unix时间戳（秒）
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 格式化时间戳为人类可读时间
pub fn format_timestamp(timestamp: u64) -> String {
    match chrono::DateTime::from_timestamp(timestamp as i64, 0) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}

/// Hex form of an address for the routing-table snapshot: the IP octets
/// (4 or 16) followed by the 2-byte port, two hex digits per byte.
pub fn hexify_addr(addr: &SocketAddr) -> String {
    let mut bytes = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&addr.port().to_be_bytes());
    hex::encode(bytes)
}

/// Inverse of [`hexify_addr`]; `None` on anything malformed.
pub fn unhexify_addr(line: &str) -> Option<SocketAddr> {
    let bytes = hex::decode(line.trim()).ok()?;
    let (ip, port) = match bytes.len() {
        6 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes[..4]);
            (IpAddr::V4(Ipv4Addr::from(octets)), &bytes[4..])
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), &bytes[16..])
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])))
}

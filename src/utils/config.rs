use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 监听地址
    pub bind_host: IpAddr,

    /// Address peers reach this node at, and the one its id is derived
    /// from. Needed when `bind_host` is a wildcard; loopback otherwise.
    pub advertise_host: Option<IpAddr>,

    /// UDP数据报最大长度
    pub buffer_size: usize,

    /// Diffie-Hellman私钥长度（字节）
    pub dh_key_length: usize,

    /// Diffie-Hellman生成元
    pub generator: u64,

    /// Hex override of the built-in 1024-bit prime.
    pub dh_prime: Option<String>,

    /// 每个桶的容量K
    pub k_nodes: usize,

    /// 并发查询数α
    pub alpha: usize,

    /// Hex ed25519 key events must be signed with.
    pub trusted_public_key: Option<String>,

    /// 签名密钥路径
    pub signing_key_path: Option<PathBuf>,

    /// Fallback bootstrap addresses, `host:port`.
    pub backup_hosts: Vec<String>,

    pub request_timeout_secs: u64,

    /// Age after which a full bucket's oldest peer is re-probed.
    pub stale_peer_secs: u64,

    pub mining_difficulty: usize,

    /// Capacity of the miner queue.
    pub miner_queue: usize,

    /// 路由表快照目录（默认为系统临时目录）
    pub snapshot_dir: Option<PathBuf>,

    pub snapshot_poll_secs: u64,

    pub snapshot_interval_secs: u64,

    /// 日志级别
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise_host: None,
            buffer_size: 4096,
            dh_key_length: 32,
            generator: 2,
            dh_prime: None,
            k_nodes: 20,
            alpha: 3,
            trusted_public_key: None,
            signing_key_path: None,
            backup_hosts: vec![],
            request_timeout_secs: 5,
            stale_peer_secs: 3600,
            mining_difficulty: 3,
            miner_queue: 64,
            snapshot_dir: None,
            snapshot_poll_secs: 10,
            snapshot_interval_secs: 600,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // 检查文件是否存在
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Default location: `<config dir>/beacon/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("beacon")
            .join("config.json")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.advertise_host.map_or(false, |host| host.is_unspecified()) {
            return Err(invalid("advertise_host", "must be a concrete address"));
        }
        if self.k_nodes < 2 {
            return Err(invalid("k_nodes", "buckets must hold at least 2 entries"));
        }
        if self.alpha == 0 {
            return Err(invalid("alpha", "must be at least 1"));
        }
        if !(1..=9).contains(&self.mining_difficulty) {
            return Err(invalid("mining_difficulty", "must be between 1 and 9"));
        }
        if self.buffer_size < 4 {
            return Err(invalid("buffer_size", "must fit the 4-byte length prefix"));
        }
        if self.dh_key_length == 0 {
            return Err(invalid("dh_key_length", "must be at least 1"));
        }
        if self.miner_queue == 0 {
            return Err(invalid("miner_queue", "must be at least 1"));
        }
        if let Some(key) = &self.trusted_public_key {
            crate::crypto::parse_public_key(key).map_err(|e| invalid("trusted_public_key", e))?;
        }
        for host in &self.backup_hosts {
            host.parse::<SocketAddr>().map_err(|e| invalid("backup_hosts", e))?;
        }
        Ok(())
    }

    /// Backup hosts that parse as socket addresses.
    pub fn backup_addrs(&self) -> Vec<SocketAddr> {
        self.backup_hosts.iter().filter_map(|host| host.parse().ok()).collect()
    }

    /// The IP this node announces. A wildcard `bind_host` without an
    /// `advertise_host` falls back to the loopback address of its family.
    pub fn advertised_ip(&self) -> IpAddr {
        match (self.advertise_host, self.bind_host) {
            (Some(host), _) => host,
            (None, IpAddr::V4(ip)) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (None, IpAddr::V6(ip)) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            (None, host) => host,
        }
    }

    pub fn snapshot_root(&self) -> PathBuf {
        self.snapshot_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn invalid(field: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.k_nodes, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.request_timeout_secs, 5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.k_nodes = 5;
        config.backup_hosts = vec!["127.0.0.1:9001".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.k_nodes, 5);
        assert_eq!(loaded.backup_addrs(), vec!["127.0.0.1:9001".parse().unwrap()]);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.k_nodes, Config::default().k_nodes);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"alpha": 5}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.alpha, 5);
        assert_eq!(config.buffer_size, 4096);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.k_nodes = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mining_difficulty = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trusted_public_key = Some("zz".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backup_hosts = vec!["nowhere".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_advertised_ip() {
        let config = Config::default();
        assert_eq!(config.advertised_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut config = Config::default();
        config.bind_host = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.advertised_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        config.advertise_host = Some("10.1.2.3".parse().unwrap());
        assert_eq!(config.advertised_ip(), "10.1.2.3".parse::<IpAddr>().unwrap());
        assert!(config.validate().is_ok());

        config.advertise_host = Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(config.validate().is_err());
    }
}

//! Routing-table snapshots: one hex-encoded address per line, rewritten
//! periodically and read back on the next start.

use crate::node::LocalNode;
use crate::utils::{hexify_addr, unhexify_addr};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const SNAPSHOT_FILE: &str = "routing_table.log";

/// `<root>/<node id hex>/routing_table.log`
pub fn snapshot_file(root: &Path, id: &crate::dht::NodeId) -> PathBuf {
    root.join(id.to_hex()).join(SNAPSHOT_FILE)
}

pub fn write_snapshot(path: &Path, addrs: &[SocketAddr]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = String::new();
    for addr in addrs {
        contents.push_str(&hexify_addr(addr));
        contents.push('\n');
    }
    fs::write(path, contents)
}

/// Reads a snapshot back. Malformed lines are skipped.
pub fn read_snapshot(path: &Path) -> io::Result<Vec<SocketAddr>> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let addr = unhexify_addr(line);
            if addr.is_none() {
                debug!("Skipping malformed snapshot line {:?}", line);
            }
            addr
        })
        .collect())
}

impl LocalNode {
    pub fn snapshot_path(&self) -> PathBuf {
        snapshot_file(&self.config.snapshot_root(), &self.id)
    }

    /// Writes the addresses of every known peer. Returns how many.
    pub async fn save_snapshot(&self) -> io::Result<usize> {
        let addrs: Vec<SocketAddr> = self.peers().await.into_iter().map(|peer| peer.addr).collect();
        let path = self.snapshot_path();
        let count = addrs.len();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &addrs))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(count)
    }

    /// Wakes every `snapshot_poll_secs` and writes a snapshot when none was
    /// written yet or `snapshot_interval_secs` have passed since the last.
    pub(crate) fn spawn_snapshot_task(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let poll = Duration::from_secs(node.config.snapshot_poll_secs.max(1));
            let interval = Duration::from_secs(node.config.snapshot_interval_secs);
            let mut last_written: Option<Instant> = None;
            let mut ticker = tokio::time::interval(poll);

            loop {
                ticker.tick().await;
                if node.peers().await.is_empty() {
                    continue;
                }
                if last_written.map_or(false, |at| at.elapsed() < interval) {
                    continue;
                }
                match node.save_snapshot().await {
                    Ok(count) => {
                        info!("Routing table snapshot written ({} peers)", count);
                        last_written = Some(Instant::now());
                    }
                    Err(e) => warn!("Routing table snapshot failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::NodeId;

    #[test]
    fn test_snapshot_roundtrip_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SNAPSHOT_FILE);
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:9001".parse().unwrap(), "10.0.0.2:9002".parse().unwrap()];

        write_snapshot(&path, &addrs).unwrap();
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("not-hex\n\n");
        fs::write(&path, contents).unwrap();

        assert_eq!(read_snapshot(&path).unwrap(), addrs);
    }

    #[test]
    fn test_missing_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(&dir.path().join(SNAPSHOT_FILE)).is_err());
    }

    #[test]
    fn test_snapshot_file_layout() {
        let id = NodeId::from_address(&"127.0.0.1:9001".parse().unwrap());
        let path = snapshot_file(Path::new("/tmp/beacon"), &id);
        assert_eq!(path, Path::new("/tmp/beacon").join(id.to_hex()).join("routing_table.log"));
    }
}

use beacon::cli::CommandProcessor;
use beacon::crypto::SigningKeyPair;
use beacon::node::{LocalNode, Node};
use beacon::utils::{parse_log_level, setup_logger, Config};

use anyhow::Context;
use clap::Parser;
use colored::*;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// 监听端口
    #[clap(default_value = "0")]
    port: u16,

    /// 引导节点端口（同一主机）
    boot_port: Option<u16>,

    /// 配置文件路径
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// 日志级别
    #[clap(long)]
    log_level: Option<String>,

    /// Signing key file, overrides `signing_key_path`
    #[clap(long)]
    signing_key: Option<PathBuf>,

    /// Writes a new signing key to this path, prints its public key and exits
    #[clap(long, value_name = "PATH")]
    gen_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.gen_key {
        let keypair = SigningKeyPair::generate()?;
        keypair.save(path).with_context(|| format!("writing {}", path.display()))?;
        println!("Signing key written to {}", path.display());
        println!("Public key: {}", keypair.public_hex().cyan());
        return Ok(());
    }

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(path) = args.signing_key.clone() {
        config.signing_key_path = Some(path);
    }

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let level = parse_log_level(level).map_err(anyhow::Error::msg)?;
    setup_logger(Some(level));

    let boot_host = config.advertised_ip();
    let node = LocalNode::bind(config, args.port).await.context("starting node")?;
    info!("{}", format!("Beacon node {} listening", node.id()).green().bold());
    let (_service, _snapshots) = node.start();

    let boot = args.boot_port.map(|port| SocketAddr::new(boot_host, port));
    if !node.join(boot).await {
        warn!("Running without peers");
    }

    CommandProcessor::new(node.clone()).start().await?;
    Ok(())
}

use crate::dht::NodeId;
use crate::node::{LocalNode, Node};
use crate::utils::format_timestamp;

use clap::{Arg, ArgMatches, Command as ClapCommand};
use colored::*;
use indoc::indoc;
use log::{debug, error};
use std::path::PathBuf;
use std::sync::Arc;

/// 命令结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(String),
    Info(String),
    Warning(String),
    Error(String),
    Exit,
}

/// 命令类型
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Upload(PathBuf),
    Download { key: String, output: Option<PathBuf> },
    Chat(String),
    Peers,
    Events,
    WhoAmI,
    Help,
    Exit,
}

/// 子命令定义，输入行不带二进制名
fn command_app() -> ClapCommand {
    ClapCommand::new("beacon")
        .no_binary_name(true)
        .disable_help_subcommand(true)
        .disable_help_flag(true)
        .subcommand(ClapCommand::new("upload").arg(Arg::new("path").required(true).index(1)))
        .subcommand(
            ClapCommand::new("download")
                .arg(Arg::new("key").required(true).index(1))
                .arg(Arg::new("output").index(2)),
        )
        .subcommand(ClapCommand::new("peers"))
        .subcommand(ClapCommand::new("events"))
        .subcommand(ClapCommand::new("whoami"))
        .subcommand(ClapCommand::new("help"))
        .subcommand(ClapCommand::new("exit"))
        .subcommand(ClapCommand::new("quit"))
}

const KEYWORDS: &[&str] = &["upload", "download"];
const SLASH_ONLY: &[&str] = &["peers", "events", "whoami", "help", "exit", "quit"];

impl Command {
    /// Parses one input line. `upload` and `download` work with or without
    /// a leading slash; other commands need it. Anything else is chat.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (slashed, rest) = match line.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let first = rest.split_whitespace().next().unwrap_or("");
        let is_command = KEYWORDS.contains(&first) || (slashed && SLASH_ONLY.contains(&first));
        if !is_command {
            if slashed {
                return Err(format!("Unknown command: /{}", first));
            }
            return Ok(Some(Command::Chat(line.to_string())));
        }

        let args = shlex::split(rest).ok_or_else(|| "Unbalanced quotes".to_string())?;
        let matches = command_app()
            .try_get_matches_from(args)
            .map_err(|e| format!("Usage error: {}", e.kind()))?;

        match matches.subcommand() {
            Some((name, sub)) => Ok(Some(Self::from_matches(name, sub))),
            None => Ok(Some(Command::Help)),
        }
    }

    fn from_matches(name: &str, matches: &ArgMatches) -> Command {
        let arg = |id: &str| matches.get_one::<String>(id).cloned();
        match name {
            "upload" => Command::Upload(PathBuf::from(arg("path").unwrap_or_default())),
            "download" => Command::Download {
                key: arg("key").unwrap_or_default(),
                output: arg("output").map(PathBuf::from),
            },
            "peers" => Command::Peers,
            "events" => Command::Events,
            "whoami" => Command::WhoAmI,
            "exit" | "quit" => Command::Exit,
            _ => Command::Help,
        }
    }

    /// 执行命令
    pub async fn execute(&self, node: &Arc<LocalNode>) -> CommandResult {
        match self {
            Command::Upload(path) => Self::upload(node, path).await,
            Command::Download { key, output } => Self::download(node, key, output.as_ref()).await,
            Command::Chat(text) => Self::chat(node, text).await,
            Command::Peers => Self::peers(node).await,
            Command::Events => Self::events(node).await,
            Command::WhoAmI => Self::whoami(node),
            Command::Help => Self::help(),
            Command::Exit => CommandResult::Exit,
        }
    }

    fn help() -> CommandResult {
        let help_text = indoc! {"
            Available commands:

            upload <path>               - Publish a file; prints its key
            download <key> [output]     - Fetch a file by key; prints it or writes to output
            /peers                      - Show the routing table
            /events                     - Show the local event chain
            /whoami                     - Show this node's id, address and signing key
            /help                       - Show this help message
            /exit, /quit                - Exit

            Any other line is signed and broadcast as a chat event.
        "};

        CommandResult::Info(help_text.to_string())
    }

    async fn upload(node: &Arc<LocalNode>, path: &PathBuf) -> CommandResult {
        match node.store(path).await {
            Ok(report) => CommandResult::Success(format!(
                "Uploaded {} ({} bytes)\n  key: {}\n  replicas: {}",
                report.file.filename,
                report.file.size,
                report.file.content_id.to_string().cyan(),
                report.replicas
            )),
            Err(e) => {
                error!("Upload of {} failed: {}", path.display(), e);
                CommandResult::Error(format!("Upload failed: {}", e))
            }
        }
    }

    async fn download(node: &Arc<LocalNode>, key: &str, output: Option<&PathBuf>) -> CommandResult {
        let key = match key.parse::<NodeId>() {
            Ok(key) => key,
            Err(e) => return CommandResult::Error(format!("Invalid key {}: {}", key, e)),
        };

        let contents = match node.find_value(&key).await {
            Ok(contents) => contents,
            Err(e) => return CommandResult::Error(format!("Download failed: {}", e)),
        };

        match output {
            Some(path) => match tokio::fs::write(path, &contents).await {
                Ok(()) => CommandResult::Success(format!("Saved {} bytes to {}", contents.len(), path.display())),
                Err(e) => CommandResult::Error(format!("Could not write {}: {}", path.display(), e)),
            },
            None => CommandResult::Info(String::from_utf8_lossy(&contents).into_owned()),
        }
    }

    async fn chat(node: &Arc<LocalNode>, text: &str) -> CommandResult {
        match node.broadcast_chat(text).await {
            Ok(event) => {
                debug!("Queued chat event ({} bytes)", event.data.len());
                CommandResult::Success(String::new())
            }
            Err(e) => CommandResult::Warning(format!("Message not sent: {}", e)),
        }
    }

    async fn peers(node: &Arc<LocalNode>) -> CommandResult {
        let peers = node.peers().await;
        if peers.is_empty() {
            return CommandResult::Info("Routing table is empty.".to_string());
        }

        let mut result = format!("Routing table ({} peers):\n", peers.len());
        for (i, peer) in peers.iter().enumerate() {
            result.push_str(&format!(
                "{}. {} {} (last seen {})\n",
                i + 1,
                peer.id.to_string().green(),
                peer.addr.to_string().cyan(),
                format_timestamp(peer.last_seen)
            ));
        }
        CommandResult::Info(result)
    }

    async fn events(node: &Arc<LocalNode>) -> CommandResult {
        let events = node.events().await;
        if events.is_empty() {
            return CommandResult::Info("Event chain is empty.".to_string());
        }

        let mut result = format!("Event chain ({} events):\n", events.len());
        for event in &events {
            let hash = event.hash.as_deref().unwrap_or("unmined");
            result.push_str(&format!("{} {}\n", hash.yellow(), event.data));
        }
        CommandResult::Info(result)
    }

    fn whoami(node: &Arc<LocalNode>) -> CommandResult {
        let signing_key = node
            .signer()
            .map(|signer| signer.public_hex())
            .unwrap_or_else(|| "none".to_string());

        let result = format!(
            indoc! {"
                Node:
                  ID: {}
                  Address: {}
                  Signing key: {}
            "},
            node.id().to_string().green(),
            node.address().to_string().cyan(),
            signing_key.yellow(),
        );
        CommandResult::Info(result)
    }
}

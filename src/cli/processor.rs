use super::commands::{Command, CommandResult};
use crate::node::{LocalNode, Node};

use colored::*;
use log::{debug, error};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Line editor input. The editor lives on its own thread; each line waits
/// for the previous command to finish before the next prompt is shown.
enum Input {
    Line(String),
    Closed,
}

/// 命令处理器
pub struct CommandProcessor {
    node: Arc<LocalNode>,
    history_path: PathBuf,
}

impl CommandProcessor {
    pub fn new(node: Arc<LocalNode>) -> Self {
        // 设置历史记录文件路径
        let mut history_path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        history_path.push("beacon");
        history_path.push("history.txt");

        if let Some(parent) = history_path.parent() {
            let _ = create_dir_all(parent);
        }

        Self { node, history_path }
    }

    /// Runs until `/exit`, Ctrl-C or end of input.
    pub async fn start(&self) -> anyhow::Result<()> {
        println!("{}", self.welcome_message());

        let chat_printer = Self::spawn_chat_printer(self.node.subscribe_chat());

        let (line_tx, mut line_rx) = mpsc::channel::<Input>(1);
        let (ack_tx, ack_rx) = std_mpsc::channel::<bool>();
        let history_path = self.history_path.clone();
        let reader = std::thread::spawn(move || read_lines(history_path, line_tx, ack_rx));

        while let Some(input) = line_rx.recv().await {
            let line = match input {
                Input::Line(line) => line,
                Input::Closed => break,
            };

            let keep_going = match Command::parse(&line) {
                Ok(Some(command)) => {
                    let result = command.execute(&self.node).await;
                    print_result(result)
                }
                Ok(None) => true,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    true
                }
            };

            if ack_tx.send(keep_going).is_err() || !keep_going {
                break;
            }
        }

        drop(ack_tx);
        chat_printer.abort();
        if reader.join().is_err() {
            error!("Line reader thread panicked");
        }
        Ok(())
    }

    fn spawn_chat_printer(mut chat_rx: broadcast::Receiver<crate::node::ChatLine>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match chat_rx.recv().await {
                    Ok(line) => println!("\n{} {}", line.from.to_string()[..8].yellow(), line.text.green()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Chat display skipped {} lines", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn welcome_message(&self) -> String {
        format!(
            "\n{}\n{}\n\nType {} for a list of available commands.\n\n  Node ID: {}\n  Address: {}\n",
            format!("Beacon v{}", crate::utils::version()).green().bold(),
            "Kademlia-style file sharing and signed chat".cyan(),
            "/help".yellow(),
            self.node.id().to_string().green(),
            self.node.address().to_string().cyan()
        )
    }
}

fn read_lines(history_path: PathBuf, line_tx: mpsc::Sender<Input>, ack_rx: std_mpsc::Receiver<bool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            error!("Could not start line editor: {}", e);
            let _ = line_tx.blocking_send(Input::Closed);
            return;
        }
    };
    let _ = editor.load_history(&history_path);

    loop {
        match editor.readline(&format!("{} ", "beacon>".green())) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                if line_tx.blocking_send(Input::Line(line)).is_err() {
                    break;
                }
                // 等待命令执行完成
                match ack_rx.recv() {
                    Ok(true) => continue,
                    _ => break,
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                let _ = line_tx.blocking_send(Input::Closed);
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                let _ = line_tx.blocking_send(Input::Closed);
                break;
            }
            Err(err) => {
                error!("Error reading line: {}", err);
                let _ = line_tx.blocking_send(Input::Closed);
                break;
            }
        }
    }

    if let Err(e) = editor.save_history(&history_path) {
        debug!("Failed to save command history: {}", e);
    }
}

/// Prints a command result; returns false when the shell should exit.
fn print_result(result: CommandResult) -> bool {
    match result {
        CommandResult::Success(message) => {
            if !message.is_empty() {
                println!("{} {}", "Success:".green().bold(), message);
            }
        }
        CommandResult::Info(message) => println!("{}", message),
        CommandResult::Warning(message) => println!("{} {}", "Warning:".yellow().bold(), message),
        CommandResult::Error(message) => eprintln!("{} {}", "Error:".red().bold(), message),
        CommandResult::Exit => {
            println!("Exiting...");
            return false;
        }
    }
    true
}

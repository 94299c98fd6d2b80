mod commands;
mod processor;

pub use commands::{Command, CommandResult};
pub use processor::CommandProcessor;

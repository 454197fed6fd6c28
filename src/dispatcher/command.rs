//! The inbound command grammar: a conventional space-separated,
//! case-insensitive verb vocabulary (`help`, `run <task-id>`,
//! `cancel <instance-id>`). Bare or unrecognized text falls back to `help`,
//! the same forgiving default a chat-facing command surface needs since
//! users will invariably fat-finger it.

pub const HELP_TEXT: &str = "commands: help | run <task-id> | cancel <instance-id>";

/// A parsed inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Run(String),
    Cancel(String),
}

/// Parse one line of inbound text into a [`Command`]. Never fails: anything
/// that isn't a recognized verb with its required argument becomes `Help`.
pub fn parse(text: &str) -> Command {
    let mut parts = text.trim().split_whitespace();
    let Some(verb) = parts.next() else { return Command::Help };

    match verb.to_ascii_lowercase().as_str() {
        "help" => Command::Help,
        "run" => match parts.next() {
            Some(task_id) if !task_id.is_empty() => Command::Run(task_id.to_string()),
            _ => Command::Help,
        },
        "cancel" => match parts.next() {
            Some(instance_id) if !instance_id.is_empty() => Command::Cancel(instance_id.to_string()),
            _ => Command::Help,
        },
        _ => Command::Help,
    }
}

/// One parsed line of REPL input.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// Empty input; nothing to do.
    Noop,
    Help,
    Quit,
    /// `/export [path]` — write the export document, optionally somewhere
    /// other than the default location.
    Export { path: Option<String> },
    /// `/stream on|off` — toggle incremental reply rendering.
    Stream { enabled: bool },
    /// Anything that is not a slash command is a follow-up message.
    Message(String),
    Unknown { command: String },
}

pub const CHAT_HELP_COMMANDS: &[&str] = &["/help", "/export [path]", "/stream on|off", "/quit"];

pub fn parse_chat_command(text: &str) -> ChatCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ChatCommand::Noop;
    }

    let Some(slash_tail) = trimmed.strip_prefix('/') else {
        return ChatCommand::Message(trimmed.to_string());
    };

    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return ChatCommand::Message(trimmed.to_string());
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    match command.as_str() {
        "help" => ChatCommand::Help,
        "quit" | "exit" => ChatCommand::Quit,
        "export" => ChatCommand::Export {
            path: parse_single_path_arg(arg),
        },
        "stream" => match arg.to_ascii_lowercase().as_str() {
            "off" | "false" | "0" => ChatCommand::Stream { enabled: false },
            _ => ChatCommand::Stream { enabled: true },
        },
        _ => ChatCommand::Unknown { command },
    }
}

fn parse_single_path_arg(arg: &str) -> Option<String> {
    if arg.is_empty() {
        return None;
    }
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts,
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    };
    match parts.len() {
        0 => None,
        1 => Some(parts[0].clone()),
        _ => Some(parts.join(" ")),
    }
}

//! Canonical protocol enums and small payload types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Plugin command verb - what the orchestrator is asking the plugin to do.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Ask the plugin to look for new work of its own accord
    Poll,
    /// Deliver an event for processing (the pipeline hop command)
    Handle,
    /// Liveness / readiness probe
    Health,
    /// One-time setup before first use
    Init,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Poll => "poll",
            Command::Handle => "handle",
            Command::Health => "health",
            Command::Init => "init",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "poll" => Ok(Command::Poll),
            "handle" => Ok(Command::Handle),
            "health" => Ok(Command::Health),
            "init" => Ok(Command::Init),
            _ => Err(format!(
                "Invalid command: '{}'. Expected: poll, handle, health, or init",
                s
            )),
        }
    }
}

/// Response status - the only two words a plugin may say about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Error => "error",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Log level for plugin-emitted log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One log line carried back in a plugin response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_str() {
        for cmd in [Command::Poll, Command::Handle, Command::Health, Command::Init] {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
        }
    }

    #[test]
    fn command_parse_rejects_unknown() {
        assert!("reap".parse::<Command>().is_err());
    }

    #[test]
    fn log_entry_deserializes_lowercase_levels() {
        let entry: LogEntry =
            serde_json::from_str(r#"{"level":"warn","message":"low disk"}"#).unwrap();
        assert_eq!(entry.level, LogLevel::Warn);
    }
}

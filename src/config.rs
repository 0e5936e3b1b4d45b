//! Environment configuration.

use std::env;

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// Append every chunk written to the terminal to this file.
    pub write_log: Option<String>,
    /// Force the plain (no cursor choreography) console even on ANSI terminals.
    pub force_plain: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            write_log: env_string_opt("TERMSTATUS_WRITE_LOG"),
            force_plain: env_flag("TERMSTATUS_FORCE_PLAIN"),
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|value| value == "1").unwrap_or(false)
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

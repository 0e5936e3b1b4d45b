//! Error types surfaced at the registration seams.

use thiserror::Error;

/// Expected, recoverable failures when registering console commands.
///
/// Key collisions are a normal startup condition when several subsystems
/// register commands independently, so they are reported as values rather
/// than panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// The requested command key is already bound by another command.
    #[error("command key '{key}' is already registered")]
    KeyInUse { key: char },
}

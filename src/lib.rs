//! Concurrent terminal status console.
//!
//! Multiplexes an interactive terminal between a scrolling log stream and a
//! pinned status area (prompt + registered status lines) at the bottom of the
//! screen, while staying safe under concurrent writers, resize events, and
//! teardown.
//!
//! Invariant: single output gate — every terminal write flows through the
//! console's deadlock-safe write queue (nested and post-close writes bypass
//! it by contract).
//!
//! # Public API Overview
//! - Open a [`Connection`] (usually [`ProcessConnection`]) and pick a console
//!   flavor once with [`console::build`].
//! - Log through [`Console::write`]; the status block stays pinned below.
//! - Register status lines with [`Console::register_status_line`] and drive
//!   them through the returned [`StatusLine`] handle.
//! - Attach a [`CommandRegistry`] for single-key commands and the prompt
//!   line.

pub mod command;
pub mod config;
pub mod console;
pub mod core;
pub mod error;
pub mod platform;

/// Command registry, contexts, and command descriptors.
pub use crate::command::{
    CommandAction, CommandPrompt, CommandRegistry, ConsoleCommand, ConsoleContext, HelpState,
};

/// Console flavors and outward handles.
pub use crate::console::{build, AnsiConsole, Console, OutputFilter, PlainConsole, StatusLine};

/// Connection seam consumed by the consoles.
pub use crate::core::connection::{Attributes, Connection, Signal, Size};

/// ANSI-aware text helpers.
pub use crate::core::text::ansi::strip_ansi_codes;
pub use crate::core::text::wrap::{count_lines, trailing_columns, visible_width};

pub use crate::config::EnvConfig;
pub use crate::error::RegistrationError;

#[cfg(unix)]
pub use crate::platform::ProcessConnection;

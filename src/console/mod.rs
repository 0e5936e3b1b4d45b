//! Console flavors and outward-facing handles.
//!
//! Invariant: single output gate — every terminal write flows through the
//! console's write-queue drain (nested and post-close writes excepted, which
//! bypass by contract).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::core::connection::{Connection, SignalHandler, StdinHandler};

pub mod ansi;
pub mod plain;
pub(crate) mod write_queue;

pub use ansi::AnsiConsole;
pub use plain::PlainConsole;

/// Predicate deciding whether an output chunk is written; `false` suppresses.
pub type OutputFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Capability interface over the two console flavors.
///
/// Selection happens once at startup via [`build`]; afterwards collaborators
/// only see this trait.
pub trait Console: Send + Sync {
    /// Write ordinary log output above the status area.
    fn write(&self, s: &str) -> io::Result<()>;

    /// Register a status line at the requested priority. A taken priority is
    /// resolved by probing to the next free integer; the effective priority
    /// is available on the returned handle.
    fn register_status_line(&self, priority: i32) -> StatusLine;

    /// Replace the prompt message (slot 0 of the status block).
    fn set_prompt_message(&self, message: &str);

    /// Install or remove the output filter.
    fn set_output_filter(&self, filter: Option<OutputFilter>);

    /// Install the handler receiving raw stdin bytes.
    fn set_input_handler(&self, handler: Option<StdinHandler>);

    /// Install the handler receiving terminal signals. Without one, an
    /// interrupt closes the console.
    fn set_signal_handler(&self, handler: Option<SignalHandler>);

    /// Suspend terminal writes; chunks are retained, not dropped.
    fn pause_output(&self);

    /// Resume terminal writes and flush everything retained while paused.
    fn resume_output(&self) -> io::Result<()>;

    fn supports_ansi(&self) -> bool;

    /// Restore terminal attributes, emit the shutdown reset, and suppress
    /// status rendering from now on. Subsequent writes pass through raw.
    fn close(&self) -> io::Result<()>;
}

/// Internal seam the [`StatusLine`] handle calls back into.
pub(crate) trait StatusBackend: Send + Sync {
    fn status_set_message(&self, priority: i32, message: Option<String>);
    fn status_close(&self, priority: i32);
}

/// Caller-held handle to a registered status line.
///
/// The console-side registry is authoritative; the handle only addresses it
/// by effective priority. Closes itself on drop.
pub struct StatusLine {
    backend: Weak<dyn StatusBackend>,
    priority: i32,
    closed: AtomicBool,
}

impl StatusLine {
    pub(crate) fn new(backend: Weak<dyn StatusBackend>, priority: i32) -> Self {
        Self {
            backend,
            priority,
            closed: AtomicBool::new(false),
        }
    }

    /// Effective priority after collision probing.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_message(&self, message: impl Into<String>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(backend) = self.backend.upgrade() {
            backend.status_set_message(self.priority, Some(message.into()));
        }
    }

    pub fn clear_message(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(backend) = self.backend.upgrade() {
            backend.status_set_message(self.priority, None);
        }
    }

    /// Remove the line and rebalance the remaining ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(backend) = self.backend.upgrade() {
            backend.status_close(self.priority);
        }
    }
}

impl Drop for StatusLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pick the console flavor for `connection` and install it.
///
/// ANSI-capable terminals get the full status-area renderer; everything else
/// falls back to plain line-by-line passthrough.
pub fn build(connection: Arc<dyn Connection>) -> io::Result<Arc<dyn Console>> {
    if connection.supports_ansi() {
        let console: Arc<dyn Console> = AnsiConsole::install(connection)?;
        Ok(console)
    } else {
        let console: Arc<dyn Console> = PlainConsole::install(connection);
        Ok(console)
    }
}

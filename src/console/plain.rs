//! Plain console fallback for terminals without ANSI support.
//!
//! No cursor choreography: log output passes through line by line, and
//! status/prompt changes are printed as ordinary lines when they change.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::console::write_queue::{self, NestedWrite, WriteQueue};
use crate::console::{Console, OutputFilter, StatusBackend, StatusLine};
use crate::core::connection::{Connection, Signal, SignalHandler, StdinHandler};

pub struct PlainConsole {
    connection: Arc<dyn Connection>,
    queue: WriteQueue,
    filter: Mutex<Option<OutputFilter>>,
    prompt: Mutex<Option<String>>,
    registry: RwLock<BTreeMap<i32, PlainEntry>>,
    input: Mutex<Option<StdinHandler>>,
    signal: Mutex<Option<SignalHandler>>,
    closed: AtomicBool,
    weak: Weak<PlainConsole>,
}

struct PlainEntry {
    /// Last printed message, so periodic updaters don't spam duplicates.
    last: Mutex<Option<String>>,
}

impl PlainConsole {
    /// Wire `connection` callbacks and return the installed console.
    ///
    /// Raw mode is deliberately not entered; input arrives however the
    /// terminal delivers it (usually line-buffered).
    pub fn install(connection: Arc<dyn Connection>) -> Arc<Self> {
        let console = Arc::new_cyclic(|weak| Self {
            connection: Arc::clone(&connection),
            queue: WriteQueue::new(),
            filter: Mutex::new(None),
            prompt: Mutex::new(None),
            registry: RwLock::new(BTreeMap::new()),
            input: Mutex::new(None),
            signal: Mutex::new(None),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });

        let weak = console.weak.clone();
        connection.set_stdin_handler(Box::new(move |bytes| {
            if let Some(console) = weak.upgrade() {
                if let Some(handler) = lock(&console.input).as_mut() {
                    handler(bytes);
                }
            }
        }));
        let weak = console.weak.clone();
        connection.set_signal_handler(Box::new(move |signal| {
            if let Some(console) = weak.upgrade() {
                console.dispatch_signal(signal);
            }
        }));
        let weak = console.weak.clone();
        connection.set_close_handler(Box::new(move || {
            if let Some(console) = weak.upgrade() {
                let _ = console.close_console();
            }
        }));
        console
    }

    fn dispatch_signal(&self, signal: Signal) {
        let mut slot = lock(&self.signal);
        match slot.as_mut() {
            Some(handler) => handler(signal),
            None => {
                drop(slot);
                if matches!(signal, Signal::Interrupt) {
                    let _ = self.close_console();
                }
            }
        }
    }

    fn write_line(&self, message: &str) -> io::Result<()> {
        self.write_console(&format!("{message}\n"))
    }

    fn write_console(&self, s: &str) -> io::Result<()> {
        if write_queue::nested() || self.closed.load(Ordering::Acquire) {
            let _nested = NestedWrite::enter();
            return self.connection.write(s);
        }
        if let Some(filter) = lock(&self.filter).as_ref() {
            if !filter(s) {
                return Ok(());
            }
        }
        self.queue.enqueue(s.to_string());
        self.queue.drain(self.connection.as_ref())
    }

    fn close_console(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue.enqueue("\n".to_string());
        self.queue.drain(self.connection.as_ref())
    }
}

impl Console for PlainConsole {
    fn write(&self, s: &str) -> io::Result<()> {
        self.write_console(s)
    }

    fn register_status_line(&self, priority: i32) -> StatusLine {
        let mut lines = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut priority = priority;
        while lines.contains_key(&priority) {
            priority += 1;
        }
        lines.insert(
            priority,
            PlainEntry {
                last: Mutex::new(None),
            },
        );
        let backend: Weak<dyn StatusBackend> = self.weak.clone();
        StatusLine::new(backend, priority)
    }

    fn set_prompt_message(&self, message: &str) {
        let changed = {
            let mut prompt = lock(&self.prompt);
            if prompt.as_deref() == Some(message) {
                false
            } else {
                *prompt = Some(message.to_string());
                true
            }
        };
        if changed && !message.is_empty() {
            let _ = self.write_line(message);
        }
    }

    fn set_output_filter(&self, filter: Option<OutputFilter>) {
        *lock(&self.filter) = filter;
    }

    fn set_input_handler(&self, handler: Option<StdinHandler>) {
        *lock(&self.input) = handler;
    }

    fn set_signal_handler(&self, handler: Option<SignalHandler>) {
        *lock(&self.signal) = handler;
    }

    fn pause_output(&self) {
        self.queue.pause();
    }

    fn resume_output(&self) -> io::Result<()> {
        self.queue.unpause();
        self.queue.drain(self.connection.as_ref())
    }

    fn supports_ansi(&self) -> bool {
        false
    }

    fn close(&self) -> io::Result<()> {
        self.close_console()
    }
}

impl StatusBackend for PlainConsole {
    fn status_set_message(&self, priority: i32, message: Option<String>) {
        let changed = {
            let lines = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = lines.get(&priority) else {
                return;
            };
            let mut last = lock(&entry.last);
            if *last == message {
                false
            } else {
                *last = message.clone();
                true
            }
        };
        if changed {
            if let Some(message) = message {
                let _ = self.write_line(&message);
            }
        }
    }

    fn status_close(&self, priority: i32) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&priority);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::PlainConsole;
    use crate::console::Console;
    use crate::core::connection::{testing::RecordingConnection, Connection};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn output_passes_through_without_escapes() {
        let connection = RecordingConnection::new(24, 80);
        let console = PlainConsole::install(Arc::clone(&connection) as Arc<dyn Connection>);

        console.write("hello\n").unwrap();

        assert_eq!(connection.writes(), vec!["hello\n"]);
    }

    #[test]
    fn status_changes_print_as_plain_lines_once() {
        let connection = RecordingConnection::new(24, 80);
        let console = PlainConsole::install(Arc::clone(&connection) as Arc<dyn Connection>);

        let line = console.register_status_line(10);
        line.set_message("Compiling");
        line.set_message("Compiling");
        line.set_message("Done");

        assert_eq!(connection.writes(), vec!["Compiling\n", "Done\n"]);
    }

    #[test]
    fn prompt_updates_are_deduplicated() {
        let connection = RecordingConnection::new(24, 80);
        let console = PlainConsole::install(Arc::clone(&connection) as Arc<dyn Connection>);

        console.set_prompt_message("Press [h] for help >");
        console.set_prompt_message("Press [h] for help >");

        assert_eq!(connection.writes(), vec!["Press [h] for help >\n"]);
    }
}

//! Terminal connection trait and lifecycle types.

use std::fmt;
use std::io;

/// Current terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

/// Signals a connection can deliver to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Signal {
    Interrupt,
}

/// Saved terminal attributes returned by [`Connection::enter_raw_mode`].
///
/// Opaque to callers; handed back to [`Connection::set_attributes`] to restore
/// the terminal on shutdown. Mocks use [`Attributes::empty`].
#[derive(Clone)]
pub struct Attributes {
    #[cfg(unix)]
    pub(crate) termios: Option<libc::termios>,
}

impl Attributes {
    #[cfg(unix)]
    pub fn empty() -> Self {
        Self { termios: None }
    }

    #[cfg(not(unix))]
    pub fn empty() -> Self {
        Self {}
    }

    #[cfg(unix)]
    pub(crate) fn from_termios(termios: libc::termios) -> Self {
        Self {
            termios: Some(termios),
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes").finish_non_exhaustive()
    }
}

pub type StdinHandler = Box<dyn FnMut(&[u8]) + Send>;
pub type SizeHandler = Box<dyn FnMut() + Send>;
pub type SignalHandler = Box<dyn FnMut(Signal) + Send>;
pub type CloseHandler = Box<dyn FnMut() + Send>;

/// Raw terminal connection consumed by the consoles.
///
/// Implementations must be callable from any thread; every console write path
/// funnels into [`Connection::write`] with whole chunks (a chunk is never
/// split across two calls).
pub trait Connection: Send + Sync {
    fn size(&self) -> Size;

    /// Write one chunk to the terminal.
    fn write(&self, data: &str) -> io::Result<()>;

    /// Switch the terminal to raw mode, returning the previous attributes.
    fn enter_raw_mode(&self) -> io::Result<Attributes>;

    /// Restore previously saved attributes.
    fn set_attributes(&self, attributes: &Attributes) -> io::Result<()>;

    fn set_stdin_handler(&self, handler: StdinHandler);
    fn set_size_handler(&self, handler: SizeHandler);
    fn set_signal_handler(&self, handler: SignalHandler);
    fn set_close_handler(&self, handler: CloseHandler);

    /// Whether cursor addressing and SGR sequences may be emitted.
    fn supports_ansi(&self) -> bool;

    fn output_encoding(&self) -> &'static str {
        "utf-8"
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{
        Attributes, CloseHandler, Connection, Signal, SignalHandler, Size, SizeHandler,
        StdinHandler,
    };
    use std::io;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Connection mock recording each `write` call as one whole string, so
    /// chunk atomicity is observable.
    pub(crate) struct RecordingConnection {
        size: Mutex<Size>,
        writes: Mutex<Vec<String>>,
        ansi: bool,
        stdin: Mutex<Option<StdinHandler>>,
        size_handler: Mutex<Option<SizeHandler>>,
        signal: Mutex<Option<SignalHandler>>,
        close: Mutex<Option<CloseHandler>>,
    }

    impl RecordingConnection {
        pub(crate) fn new(rows: u16, cols: u16) -> Arc<Self> {
            Arc::new(Self {
                size: Mutex::new(Size { rows, cols }),
                writes: Mutex::new(Vec::new()),
                ansi: true,
                stdin: Mutex::new(None),
                size_handler: Mutex::new(None),
                signal: Mutex::new(None),
                close: Mutex::new(None),
            })
        }

        pub(crate) fn writes(&self) -> Vec<String> {
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub(crate) fn take_writes(&self) -> Vec<String> {
            std::mem::take(&mut *self.writes.lock().unwrap_or_else(PoisonError::into_inner))
        }

        pub(crate) fn feed(&self, bytes: &[u8]) {
            if let Some(handler) = self
                .stdin
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
            {
                handler(bytes);
            }
        }

        pub(crate) fn resize(&self, rows: u16, cols: u16) {
            *self.size.lock().unwrap_or_else(PoisonError::into_inner) = Size { rows, cols };
            if let Some(handler) = self
                .size_handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
            {
                handler();
            }
        }

        pub(crate) fn deliver_signal(&self, signal: Signal) {
            if let Some(handler) = self
                .signal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
            {
                handler(signal);
            }
        }
    }

    impl Connection for RecordingConnection {
        fn size(&self) -> Size {
            *self.size.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn write(&self, data: &str) -> io::Result<()> {
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(data.to_string());
            Ok(())
        }

        fn enter_raw_mode(&self) -> io::Result<Attributes> {
            Ok(Attributes::empty())
        }

        fn set_attributes(&self, _attributes: &Attributes) -> io::Result<()> {
            Ok(())
        }

        fn set_stdin_handler(&self, handler: StdinHandler) {
            *self.stdin.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        }

        fn set_size_handler(&self, handler: SizeHandler) {
            *self
                .size_handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        }

        fn set_signal_handler(&self, handler: SignalHandler) {
            *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        }

        fn set_close_handler(&self, handler: CloseHandler) {
            *self.close.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        }

        fn supports_ansi(&self) -> bool {
            self.ansi
        }
    }
}

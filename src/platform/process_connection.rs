//! Process-backed terminal connection (unix).

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use libc::c_int;
use once_cell::sync::OnceCell;
use signal_hook::consts::{SIGINT, SIGWINCH};
use signal_hook::iterator::Signals;

use crate::config::EnvConfig;
use crate::core::connection::{
    Attributes, CloseHandler, Connection, Signal, SignalHandler, Size, SizeHandler, StdinHandler,
};

const FALLBACK_SIZE: Size = Size { rows: 24, cols: 80 };
const INPUT_POLL_MS: i32 = 50;

#[derive(Default)]
struct Handlers {
    stdin: Mutex<Option<StdinHandler>>,
    size: Mutex<Option<SizeHandler>>,
    signal: Mutex<Option<SignalHandler>>,
    close: Mutex<Option<CloseHandler>>,
}

struct WriteLog {
    path: Option<PathBuf>,
    file: Option<File>,
    failed: bool,
}

/// [`Connection`] over the process stdin/stdout fds.
///
/// A poll-driven reader thread delivers stdin byte chunks; a signal-hook
/// iterator thread translates SIGWINCH into the size handler and SIGINT into
/// [`Signal::Interrupt`]. EOF on stdin fires the close handler.
pub struct ProcessConnection {
    stdin_fd: c_int,
    stdout_fd: c_int,
    handlers: Arc<Handlers>,
    stop_flag: Arc<AtomicBool>,
    input_thread: Mutex<Option<JoinHandle<()>>>,
    signal_thread: Mutex<Option<JoinHandle<()>>>,
    signals_handle: Mutex<Option<signal_hook::iterator::Handle>>,
    write_log: Mutex<WriteLog>,
    ansi_support: OnceCell<bool>,
    force_plain: bool,
}

impl ProcessConnection {
    /// Open a connection over this process's terminal and start its reader
    /// and signal threads.
    pub fn open() -> io::Result<Arc<Self>> {
        let config = EnvConfig::from_env();
        let connection = Arc::new(Self {
            stdin_fd: libc::STDIN_FILENO,
            stdout_fd: libc::STDOUT_FILENO,
            handlers: Arc::new(Handlers::default()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            input_thread: Mutex::new(None),
            signal_thread: Mutex::new(None),
            signals_handle: Mutex::new(None),
            write_log: Mutex::new(WriteLog {
                path: config.write_log.map(PathBuf::from),
                file: None,
                failed: false,
            }),
            ansi_support: OnceCell::new(),
            force_plain: config.force_plain,
        });
        connection.start_input_thread();
        connection.start_signal_thread()?;
        Ok(connection)
    }

    fn start_input_thread(&self) {
        let stdin_fd = self.stdin_fd;
        let handlers = Arc::clone(&self.handlers);
        let stop_flag = Arc::clone(&self.stop_flag);

        let handle = thread::spawn(move || {
            let mut buffer = [0u8; 4096];
            while !stop_flag.load(Ordering::SeqCst) {
                if !poll_readable(stdin_fd, INPUT_POLL_MS) {
                    continue;
                }
                let read_len =
                    unsafe { libc::read(stdin_fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
                if read_len == 0 {
                    // EOF: the terminal went away, not a dispatchable key.
                    if let Some(handler) = lock(&handlers.close).as_mut() {
                        handler();
                    }
                    return;
                }
                if read_len < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return;
                }
                if let Some(handler) = lock(&handlers.stdin).as_mut() {
                    handler(&buffer[..read_len as usize]);
                }
            }
        });
        *lock(&self.input_thread) = Some(handle);
    }

    fn start_signal_thread(&self) -> io::Result<()> {
        let mut signals = Signals::new([SIGWINCH, SIGINT])?;
        *lock(&self.signals_handle) = Some(signals.handle());
        let handlers = Arc::clone(&self.handlers);

        let handle = thread::spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGWINCH => {
                        if let Some(handler) = lock(&handlers.size).as_mut() {
                            handler();
                        }
                    }
                    SIGINT => {
                        if let Some(handler) = lock(&handlers.signal).as_mut() {
                            handler(Signal::Interrupt);
                        }
                    }
                    _ => {}
                }
            }
        });
        *lock(&self.signal_thread) = Some(handle);
        Ok(())
    }

    /// Stop the reader and signal threads and wait for them. Must not be
    /// called from either thread's own handlers.
    pub fn shutdown(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.signals_handle).take() {
            handle.close();
        }
        if let Some(thread) = lock(&self.input_thread).take() {
            let _ = thread.join();
        }
        if let Some(thread) = lock(&self.signal_thread).take() {
            let _ = thread.join();
        }
    }

    fn log_write(&self, data: &str) {
        let mut log = lock(&self.write_log);
        if log.failed {
            return;
        }
        let Some(path) = log.path.clone() else {
            return;
        };
        if log.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => log.file = Some(file),
                Err(_) => {
                    log.failed = true;
                    return;
                }
            }
        }
        if let Some(file) = log.file.as_mut() {
            if file.write_all(data.as_bytes()).is_err() {
                log.failed = true;
            }
        }
    }
}

impl Connection for ProcessConnection {
    fn size(&self) -> Size {
        read_winsize(self.stdout_fd).unwrap_or(FALLBACK_SIZE)
    }

    fn write(&self, data: &str) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.log_write(data);
        write_all_fd(self.stdout_fd, data.as_bytes())
    }

    fn enter_raw_mode(&self) -> io::Result<Attributes> {
        let original = get_termios(self.stdin_fd)?;
        let mut raw = original;
        unsafe {
            libc::cfmakeraw(&mut raw);
        }
        set_termios(self.stdin_fd, &raw)?;
        Ok(Attributes::from_termios(original))
    }

    fn set_attributes(&self, attributes: &Attributes) -> io::Result<()> {
        if let Some(termios) = attributes.termios.as_ref() {
            set_termios(self.stdin_fd, termios)?;
        }
        Ok(())
    }

    fn set_stdin_handler(&self, handler: StdinHandler) {
        *lock(&self.handlers.stdin) = Some(handler);
    }

    fn set_size_handler(&self, handler: SizeHandler) {
        *lock(&self.handlers.size) = Some(handler);
    }

    fn set_signal_handler(&self, handler: SignalHandler) {
        *lock(&self.handlers.signal) = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *lock(&self.handlers.close) = Some(handler);
    }

    fn supports_ansi(&self) -> bool {
        *self.ansi_support.get_or_init(|| {
            if self.force_plain {
                return false;
            }
            if unsafe { libc::isatty(self.stdout_fd) } != 1 {
                return false;
            }
            !matches!(env::var("TERM").as_deref(), Ok("dumb"))
        })
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn poll_readable(fd: c_int, timeout_ms: i32) -> bool {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
    result > 0 && (fds.revents & libc::POLLIN) != 0
}

fn wait_writable(fd: c_int) -> io::Result<()> {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let result = unsafe { libc::poll(&mut fds, 1, -1) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            // Infinite timeout should not return 0, but avoid a tight loop.
            continue;
        }
        if (fds.revents & libc::POLLOUT) != 0 {
            return Ok(());
        }

        return Err(io::Error::other(format!(
            "poll(POLLOUT) returned revents=0x{:x}",
            fds.revents
        )));
    }
}

fn write_all_with<FWrite, FWait>(
    fd: c_int,
    bytes: &[u8],
    mut write_once: FWrite,
    mut wait_writable: FWait,
) -> io::Result<()>
where
    FWrite: FnMut(c_int, &[u8]) -> io::Result<usize>,
    FWait: FnMut(c_int) -> io::Result<()>,
{
    let mut written = 0;
    while written < bytes.len() {
        match write_once(fd, &bytes[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                ));
            }
            Ok(count) => {
                let remaining = bytes.len() - written;
                if count > remaining {
                    return Err(io::Error::other(
                        "write returned more bytes than requested",
                    ));
                }
                written += count;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(fd)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn write_all_fd(fd: c_int, bytes: &[u8]) -> io::Result<()> {
    write_all_with(
        fd,
        bytes,
        |fd, buf| {
            let result = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if result < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(result as usize)
            }
        },
        wait_writable,
    )
}

fn read_winsize(fd: c_int) -> Option<Size> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    if result == 0 && size.ws_col > 0 && size.ws_row > 0 {
        Some(Size {
            rows: size.ws_row,
            cols: size.ws_col,
        })
    } else {
        None
    }
}

fn get_termios(fd: c_int) -> io::Result<libc::termios> {
    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    let result = unsafe { libc::tcgetattr(fd, &mut termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(termios)
}

fn set_termios(fd: c_int, termios: &libc::termios) -> io::Result<()> {
    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::write_all_with;
    use std::io;

    #[test]
    fn short_writes_accumulate() {
        let mut calls = Vec::new();
        write_all_with(
            1,
            b"abcdef",
            |_, buf| {
                calls.push(buf.len());
                Ok(buf.len().min(2))
            },
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(calls, vec![6, 4, 2]);
    }

    #[test]
    fn interrupted_writes_are_retried() {
        let mut first = true;
        write_all_with(
            1,
            b"ab",
            |_, buf| {
                if std::mem::take(&mut first) {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "eintr"))
                } else {
                    Ok(buf.len())
                }
            },
            |_| Ok(()),
        )
        .unwrap();
    }

    #[test]
    fn would_block_waits_for_writability() {
        let mut waited = false;
        let mut blocked_once = false;
        write_all_with(
            1,
            b"ab",
            |_, buf| {
                if !std::mem::replace(&mut blocked_once, true) {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "eagain"))
                } else {
                    Ok(buf.len())
                }
            },
            |_| {
                waited = true;
                Ok(())
            },
        )
        .unwrap();
        assert!(waited);
    }

    #[test]
    fn zero_length_write_is_an_error() {
        let err = write_all_with(1, b"ab", |_, _| Ok(0), |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}

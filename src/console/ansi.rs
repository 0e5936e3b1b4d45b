//! ANSI status console: status-area layout and the interleaved write path.
//!
//! A real terminal has no "insert N lines above my fixed footer" primitive;
//! the only tools are cursor moves, clear-to-end, and the terminal's own
//! scroll-on-newline behavior at the bottom row. The write path exploits
//! natural scrolling: newlines emitted on the last row push committed content
//! (and the soon-to-be-redrawn status block) up, and only then is the footer
//! redrawn in its new position. `bottom_blank_space` tracks vertical slack
//! left behind when the block shrinks, spent before emitting fresh blanks.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::console::write_queue::{self, NestedWrite, WriteQueue};
use crate::console::{Console, OutputFilter, StatusBackend, StatusLine};
use crate::core::connection::{
    Attributes, Connection, Signal, SignalHandler, Size, StdinHandler,
};
use crate::core::text::ansi::{strip_ansi_codes, ColorMemory};
use crate::core::text::wrap::{count_lines, trailing_columns};

const CLEAR_TO_END: &str = "\x1b[J";
const SHUTDOWN_RESET: &str = "\x1b[0m\n";
const STATUS_SEPARATOR: &str = "\n--\n";

pub struct AnsiConsole {
    connection: Arc<dyn Connection>,
    queue: WriteQueue,
    render: Mutex<RenderState>,
    registry: RwLock<BTreeMap<i32, StatusEntry>>,
    input: Mutex<Option<StdinHandler>>,
    signal: Mutex<Option<SignalHandler>>,
    saved_attributes: Mutex<Option<Attributes>>,
    closed: AtomicBool,
    weak: Weak<AnsiConsole>,
}

/// Mutable console state; every field is read and written under one lock.
struct RenderState {
    size: Size,
    /// Slot 0 is the prompt; 1..N are rebalanced status-line positions.
    messages: Vec<Option<String>>,
    /// Rows of the whole status block, separator included. Zero disables all
    /// status bookkeeping on the write path.
    total_status_lines: usize,
    /// Vertical slack from a previously taller block, spent before emitting
    /// new blank lines.
    bottom_blank_space: usize,
    /// Column left behind by the most recent write; nonzero means the next
    /// write may continue a partial line.
    last_write_cursor_x: usize,
    color: ColorMemory,
    filter: Option<OutputFilter>,
}

struct StatusEntry {
    position: AtomicUsize,
    message: Mutex<Option<String>>,
}

impl AnsiConsole {
    /// Enter raw mode on `connection`, wire its callbacks, and return the
    /// installed console.
    pub fn install(connection: Arc<dyn Connection>) -> io::Result<Arc<Self>> {
        let size = connection.size();
        let console = Arc::new_cyclic(|weak| Self {
            connection: Arc::clone(&connection),
            queue: WriteQueue::new(),
            render: Mutex::new(RenderState {
                size,
                messages: Vec::new(),
                total_status_lines: 0,
                bottom_blank_space: 0,
                last_write_cursor_x: 0,
                color: ColorMemory::default(),
                filter: None,
            }),
            registry: RwLock::new(BTreeMap::new()),
            input: Mutex::new(None),
            signal: Mutex::new(None),
            saved_attributes: Mutex::new(None),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });
        console.setup()?;
        Ok(console)
    }

    fn setup(&self) -> io::Result<()> {
        let attributes = self.connection.enter_raw_mode()?;
        *lock(&self.saved_attributes) = Some(attributes);

        let weak = self.weak.clone();
        self.connection.set_stdin_handler(Box::new(move |bytes| {
            if let Some(console) = weak.upgrade() {
                console.dispatch_input(bytes);
            }
        }));
        let weak = self.weak.clone();
        self.connection.set_size_handler(Box::new(move || {
            if let Some(console) = weak.upgrade() {
                let _ = console.handle_resize();
            }
        }));
        let weak = self.weak.clone();
        self.connection.set_signal_handler(Box::new(move |signal| {
            if let Some(console) = weak.upgrade() {
                console.dispatch_signal(signal);
            }
        }));
        let weak = self.weak.clone();
        self.connection.set_close_handler(Box::new(move || {
            if let Some(console) = weak.upgrade() {
                let _ = console.close_console();
            }
        }));
        Ok(())
    }

    fn dispatch_input(&self, bytes: &[u8]) {
        if let Some(handler) = lock(&self.input).as_mut() {
            handler(bytes);
        }
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

    fn handle_resize(&self) -> io::Result<()> {
        {
            let mut render = self.lock_render();
            render.size = self.connection.size();
            let mut buffer = String::new();
            self.render_status(&mut buffer, &mut render);
            self.queue.enqueue(buffer);
        }
        self.queue.drain(self.connection.as_ref())
    }

    fn write_console(&self, s: &str) -> io::Result<()> {
        if write_queue::nested() || self.closed.load(Ordering::Acquire) {
            // Direct passthrough: nested writes must not recurse into the
            // queue, and final shutdown messages still need to reach the
            // terminal after close.
            let _nested = NestedWrite::enter();
            return self.connection.write(s);
        }
        {
            let mut render = self.lock_render();
            let combined = render.color.remember_and_prefix(s);
            if let Some(filter) = render.filter.as_ref() {
                if !filter(&combined) {
                    return Ok(());
                }
            }
            if render.total_status_lines == 0 {
                // Fast path: no status block, nothing to choreograph.
                render.bottom_blank_space = 0;
                self.queue.enqueue(combined);
            } else {
                self.write_with_status(combined, &mut render);
            }
        }
        self.queue.drain(self.connection.as_ref())
    }

    fn write_with_status(&self, s: String, render: &mut RenderState) {
        let height = render.size.rows as usize;
        let width = render.size.cols as usize;
        let mut buffer = String::new();
        clear_status(&mut buffer, render);

        let cursor = render.last_write_cursor_x;
        let stripped = strip_ansi_codes(&s);
        let lines = count_lines(&s, cursor, width);
        let trailing = trailing_columns(&stripped);
        let new_cursor = if lines == 0 { trailing + cursor } else { trailing };

        if cursor > 1 && lines == 0 {
            // Continuation of a partial line in the log area above the block.
            let row =
                height.saturating_sub(render.bottom_blank_space + render.total_status_lines + 1);
            goto_coords(&mut buffer, row, cursor + 1);
            buffer.push_str(&s);
            render.last_write_cursor_x = new_cursor;
            self.queue.enqueue(buffer);
            return;
        }

        goto_row(&mut buffer, height);
        let lines = lines.max(1);
        let original_blank = render.bottom_blank_space;
        let used_blank = original_blank.min(lines);
        render.bottom_blank_space -= used_blank;
        let pushed = if cursor > 1 { lines - 1 } else { lines };
        let append_lines = pushed
            .min(render.total_status_lines)
            .max(1)
            .saturating_sub(used_blank);
        clear_status(&mut buffer, render);
        let row = height
            .saturating_sub(render.total_status_lines + original_blank + usize::from(cursor > 0));
        goto_coords(&mut buffer, row, cursor + 1);
        buffer.push_str(&s);
        goto_coords(&mut buffer, height, 0);
        for _ in 0..append_lines {
            buffer.push('\n');
        }
        render.last_write_cursor_x = new_cursor;
        self.render_status(&mut buffer, render);
        self.queue.enqueue(buffer);
    }

    /// Replace one message slot and reconcile the block height.
    fn set_message_slot(&self, position: usize, message: Option<String>) -> io::Result<()> {
        {
            let mut render = self.lock_render();
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            if render.messages.len() <= position {
                render.messages.resize(position + 1, None);
            }
            render.messages[position] = message;
            let new_total = count_total_status_lines(&render);
            let mut buffer = String::new();
            clear_status(&mut buffer, &render);
            self.apply_status_height(&mut buffer, new_total, &mut render);
        }
        self.queue.drain(self.connection.as_ref())
    }

    /// Grow (pushing newlines, spending blank-space credit first) or shrink
    /// (crediting blank space) to `new_total`, then redraw the block.
    fn apply_status_height(&self, buffer: &mut String, new_total: usize, render: &mut RenderState) {
        if new_total > render.total_status_lines {
            let mut growth = String::new();
            for _ in 0..(new_total - render.total_status_lines) {
                if render.bottom_blank_space > 0 {
                    render.bottom_blank_space -= 1;
                } else {
                    growth.push('\n');
                }
            }
            self.queue.enqueue(growth);
        } else if new_total < render.total_status_lines {
            render.bottom_blank_space += render.total_status_lines - new_total;
        }
        render.total_status_lines = new_total;
        self.render_status(buffer, render);
        self.queue.enqueue(std::mem::take(buffer));
    }

    /// Append the bottom-anchored status block to `buffer`.
    ///
    /// Clears the previous extent and repositions only when the block fits
    /// the screen; callers are responsible for having pushed enough newlines
    /// to preserve the log history they care about.
    fn render_status(&self, buffer: &mut String, render: &mut RenderState) {
        if render.total_status_lines == 0 || self.closed.load(Ordering::Acquire) {
            return;
        }
        let height = render.size.rows as usize;
        if render.total_status_lines < height {
            clear_status(buffer, render);
            goto_row(buffer, height - render.total_status_lines);
        } else {
            // Degenerate geometry: the block fills the screen, no room to
            // clear or reposition. Accept artifacts over a crash.
            render.bottom_blank_space = 0;
        }
        buffer.push_str(STATUS_SEPARATOR);
        for index in (0..render.messages.len()).rev() {
            if let Some(message) = &render.messages[index] {
                buffer.push_str(message);
                if index > 0 && render.messages[..index].iter().any(Option::is_some) {
                    buffer.push('\n');
                }
            }
        }
    }

    /// Renumber every registered line to a contiguous 1-based position by
    /// ascending priority, re-rendering as slots refill.
    fn rebalance(&self, lines: &mut BTreeMap<i32, StatusEntry>) -> io::Result<()> {
        {
            let mut render = self.lock_render();
            render.messages.truncate(1);
            if render.messages.is_empty() {
                render.messages.push(None);
            }
        }
        for (index, entry) in lines.values_mut().enumerate() {
            let position = index + 1;
            entry.position.store(position, Ordering::Release);
            let message = entry
                .message
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            self.set_message_slot(position, message)?;
        }
        Ok(())
    }

    fn close_console(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(attributes) = lock(&self.saved_attributes).take() {
            let _ = self.connection.set_attributes(&attributes);
        }
        self.queue.enqueue(SHUTDOWN_RESET.to_string());
        self.queue.drain(self.connection.as_ref())
    }

    fn lock_render(&self) -> MutexGuard<'_, RenderState> {
        self.render.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, usize, usize) {
        let render = self.lock_render();
        (
            render.total_status_lines,
            render.bottom_blank_space,
            render.last_write_cursor_x,
        )
    }

    #[cfg(test)]
    fn positions(&self) -> Vec<(i32, usize)> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(priority, entry)| (*priority, entry.position.load(Ordering::Acquire)))
            .collect()
    }
}

impl Console for AnsiConsole {
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
            StatusEntry {
                position: AtomicUsize::new(0),
                message: Mutex::new(None),
            },
        );
        let _ = self.rebalance(&mut lines);
        let backend: Weak<dyn StatusBackend> = self.weak.clone();
        StatusLine::new(backend, priority)
    }

    fn set_prompt_message(&self, message: &str) {
        let _ = self.set_message_slot(0, Some(message.to_string()));
    }

    fn set_output_filter(&self, filter: Option<OutputFilter>) {
        self.lock_render().filter = filter;
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
        true
    }

    fn close(&self) -> io::Result<()> {
        self.close_console()
    }
}

impl StatusBackend for AnsiConsole {
    fn status_set_message(&self, priority: i32, message: Option<String>) {
        let lines = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = lines.get(&priority) else {
            return;
        };
        *lock(&entry.message) = message.clone();
        let position = entry.position.load(Ordering::Acquire);
        let _ = self.set_message_slot(position, message);
    }

    fn status_close(&self, priority: i32) {
        let mut lines = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = lines.remove(&priority) else {
            return;
        };
        let position = entry.position.load(Ordering::Acquire);
        let _ = self.set_message_slot(position, None);
        let _ = self.rebalance(&mut lines);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn count_total_status_lines(render: &RenderState) -> usize {
    let width = render.size.cols as usize;
    let mut total = 0;
    for message in render.messages.iter().flatten() {
        total += 1 + count_lines(message, 0, width);
    }
    if total == 0 {
        0
    } else {
        total + 1
    }
}

/// Clear from the start of the previous status extent to end of screen.
fn clear_status(buffer: &mut String, render: &RenderState) {
    let height = render.size.rows as usize;
    goto_row(buffer, (height + 1).saturating_sub(render.total_status_lines));
    buffer.push_str(CLEAR_TO_END);
}

fn goto_row(buffer: &mut String, row: usize) {
    goto_coords(buffer, row, 0);
}

/// 1-based cursor addressing; column 0 means leftmost by this crate's
/// convention (terminals treat 0 and 1 the same there). Rows clamp to 1.
fn goto_coords(buffer: &mut String, row: usize, col: usize) {
    let _ = write!(buffer, "\x1b[{};{}H", row.max(1), col);
}

#[cfg(test)]
mod tests {
    use super::AnsiConsole;
    use crate::console::Console;
    use crate::core::connection::{testing::RecordingConnection, Connection, Signal};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn console_over(
        connection: &Arc<RecordingConnection>,
    ) -> Arc<AnsiConsole> {
        AnsiConsole::install(Arc::clone(connection) as Arc<dyn Connection>)
            .expect("install console")
    }

    #[test]
    fn write_without_status_block_passes_through_verbatim() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);

        console.write("hello\n").unwrap();

        assert_eq!(connection.writes(), vec!["hello\n"]);
    }

    #[test]
    fn single_status_message_renders_separator_block() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);

        let line = console.register_status_line(1000);
        line.set_message("Building...");

        let (total, blank, _) = console.snapshot();
        assert_eq!(total, 2);
        assert_eq!(blank, 0);
        let joined = connection.writes().concat();
        assert!(joined.contains("\n--\nBuilding..."), "block missing: {joined:?}");
    }

    #[test]
    fn fresh_line_write_scrolls_before_redrawing_status() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let line = console.register_status_line(1000);
        line.set_message("Building...");
        connection.take_writes();

        console.write("log line\n").unwrap();

        let chunk = connection.writes().concat();
        assert!(chunk.contains("log line\n"));
        // At least one newline pushed at the bottom row before the redraw.
        assert!(chunk.contains("\x1b[24;0H\n"), "no scroll newline: {chunk:?}");
        assert!(chunk.contains("\n--\nBuilding..."));
        let (_, blank, cursor) = console.snapshot();
        assert_eq!(blank, 0);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn shrinking_status_block_credits_blank_space() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let first = console.register_status_line(1);
        let second = console.register_status_line(2);
        let third = console.register_status_line(3);
        first.set_message("a");
        second.set_message("b");
        third.set_message("c");
        assert_eq!(console.snapshot(), (4, 0, 0));

        first.close();
        assert_eq!(console.snapshot().1, 1);
        second.close();
        assert_eq!(console.snapshot(), (2, 2, 0));

        // The next write spends credit instead of emitting fresh blanks.
        connection.take_writes();
        console.write("x\n").unwrap();
        let chunk = connection.writes().concat();
        assert!(
            !chunk.contains("\x1b[24;0H\n"),
            "credit not spent, fresh blank lines emitted: {chunk:?}"
        );
        assert_eq!(console.snapshot().1, 1);
    }

    #[test]
    fn positions_stay_contiguous_after_register_and_close() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let a = console.register_status_line(50);
        let b = console.register_status_line(10);
        let c = console.register_status_line(30);
        assert_eq!(console.positions(), vec![(10, 1), (30, 2), (50, 3)]);

        c.close();
        assert_eq!(console.positions(), vec![(10, 1), (50, 2)]);
        drop(a);
        drop(b);
    }

    #[test]
    fn priority_collision_probes_to_next_free_integer() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let first = console.register_status_line(5);
        let second = console.register_status_line(5);
        assert_eq!(first.priority(), 5);
        assert_eq!(second.priority(), 6);
    }

    #[test]
    fn dropping_a_handle_closes_its_line() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        {
            let _line = console.register_status_line(7);
            assert_eq!(console.positions().len(), 1);
        }
        assert!(console.positions().is_empty());
    }

    #[test]
    fn color_continuity_prefixes_the_next_write() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let line = console.register_status_line(1000);
        line.set_message("busy");

        console.write("\x1b[31mHello").unwrap();
        connection.take_writes();
        console.write("World").unwrap();

        let chunk = connection.writes().concat();
        assert!(chunk.contains("\x1b[31mWorld"), "color lost: {chunk:?}");
    }

    #[test]
    fn degenerate_geometry_resets_credit_and_does_not_panic() {
        let connection = RecordingConnection::new(3, 80);
        let console = console_over(&connection);
        let lines: Vec<_> = (0..3)
            .map(|i| {
                let line = console.register_status_line(i);
                line.set_message("tall");
                line
            })
            .collect();

        console.write("hello\n").unwrap();
        assert_eq!(console.snapshot().1, 0);
        drop(lines);
    }

    #[test]
    fn writes_after_close_pass_through_raw() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let line = console.register_status_line(1);
        line.set_message("busy");

        console.close().unwrap();
        let writes = connection.take_writes();
        assert!(writes.last().unwrap().contains("\x1b[0m\n"));

        console.write("final words\n").unwrap();
        assert_eq!(connection.writes(), vec!["final words\n"]);
    }

    #[test]
    fn output_filter_suppresses_rejected_chunks() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        console.set_output_filter(Some(Box::new(|chunk| !chunk.contains("secret"))));

        console.write("secret stuff\n").unwrap();
        assert!(connection.writes().is_empty());

        console.write("fine\n").unwrap();
        assert_eq!(connection.writes(), vec!["fine\n"]);

        console.set_output_filter(None);
        console.write("secret again\n").unwrap();
        assert_eq!(connection.writes().len(), 2);
    }

    #[test]
    fn resize_rerenders_the_status_block() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let line = console.register_status_line(1);
        line.set_message("still here");
        connection.take_writes();

        connection.resize(30, 100);

        let chunk = connection.writes().concat();
        assert!(chunk.contains("\n--\nstill here"), "no redraw: {chunk:?}");
        assert!(chunk.contains("\x1b[28;0H"), "not bottom-anchored: {chunk:?}");
        drop(console);
    }

    #[test]
    fn paused_console_retains_output_until_resume() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);

        console.pause_output();
        console.write("held\n").unwrap();
        assert!(connection.writes().is_empty());

        console.resume_output().unwrap();
        assert_eq!(connection.writes(), vec!["held\n"]);
    }

    #[test]
    fn interrupt_without_handler_closes_the_console() {
        let connection = RecordingConnection::new(24, 80);
        let _console = console_over(&connection);

        connection.deliver_signal(Signal::Interrupt);

        let writes = connection.take_writes();
        assert_eq!(writes.last().map(String::as_str), Some("\x1b[0m\n"));
    }

    #[test]
    fn interrupt_with_handler_is_delegated() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        console.set_signal_handler(Some(Box::new(move |signal| {
            if matches!(signal, Signal::Interrupt) {
                flag.store(true, Ordering::SeqCst);
            }
        })));

        connection.deliver_signal(Signal::Interrupt);

        assert!(seen.load(Ordering::SeqCst));
        // Not closed: status rendering still works.
        let line = console.register_status_line(1);
        line.set_message("alive");
        assert!(connection.writes().concat().contains("alive"));
    }

    #[test]
    fn partial_line_continuation_skips_status_redraw() {
        let connection = RecordingConnection::new(24, 80);
        let console = console_over(&connection);
        let line = console.register_status_line(1);
        line.set_message("busy");

        console.write("par").unwrap();
        assert_eq!(console.snapshot().2, 3);
        connection.take_writes();

        console.write("tial").unwrap();
        let chunk = connection.writes().concat();
        assert!(chunk.contains("tial"));
        assert!(!chunk.contains("--"), "unexpected status redraw: {chunk:?}");
        assert_eq!(console.snapshot().2, 7);
    }
}

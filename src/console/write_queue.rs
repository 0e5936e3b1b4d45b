//! Deadlock-safe terminal write queue.
//!
//! Invariant: every chunk reaches `Connection::write` whole and in FIFO
//! order; no producer ever blocks on terminal I/O.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crate::core::connection::Connection;

thread_local! {
    static IN_WRITE: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is already inside a terminal write.
///
/// A connection that logs diagnostics synchronously during `write` would
/// otherwise recurse into the queue and deadlock against the writer lock;
/// nested writes must go to the terminal directly.
pub(crate) fn nested() -> bool {
    IN_WRITE.with(|flag| flag.get())
}

/// Marks the current thread as inside a terminal write until dropped.
pub(crate) struct NestedWrite {
    previous: bool,
}

impl NestedWrite {
    pub(crate) fn enter() -> Self {
        let previous = IN_WRITE.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for NestedWrite {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_WRITE.with(|flag| flag.set(previous));
    }
}

/// Multi-producer FIFO of whole output chunks, drained by whichever thread
/// wins a non-blocking acquisition of the writer lock.
#[derive(Default)]
pub(crate) struct WriteQueue {
    chunks: Mutex<VecDeque<String>>,
    writer: Mutex<()>,
    paused: AtomicBool,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; never blocks on I/O.
    pub(crate) fn enqueue(&self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        self.lock_chunks().push_back(chunk);
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub(crate) fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Flush queued chunks through `connection`.
    ///
    /// Loops: after releasing the writer lock the queue is checked again,
    /// because another producer may have enqueued between the last pop and
    /// the unlock. Failing to acquire the lock means another thread is
    /// draining and will see the new items. A write error propagates after
    /// the lock and the nested-write flag are released; the failed chunk is
    /// dropped, the rest stay queued.
    pub(crate) fn drain(&self, connection: &dyn Connection) -> io::Result<()> {
        loop {
            if self.paused.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.lock_chunks().is_empty() {
                return Ok(());
            }
            let guard = match self.writer.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Ok(()),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            let result = self.write_pending(connection);
            drop(guard);
            result?;
        }
    }

    fn write_pending(&self, connection: &dyn Connection) -> io::Result<()> {
        let _nested = NestedWrite::enter();
        loop {
            let Some(chunk) = self.lock_chunks().pop_front() else {
                return Ok(());
            };
            connection.write(&chunk)?;
        }
    }

    fn lock_chunks(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

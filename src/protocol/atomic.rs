//! Exact-length reads and writes over blocking streams.
//!
//! [`read_full`] and [`write_full`] keep issuing the underlying call until the
//! whole buffer is transferred, the peer goes away, or a non-retryable error
//! occurs. Interrupted and would-block results are retried. They are the only
//! place in the crate where a short transfer is legal; everything above them
//! treats a short count as a framing error.
//!
//! # Cancellation
//!
//! A [`CancelToken`] is shared between the caller of a blocking transfer and
//! whatever observes interrupts (typically a signal handler). The token is
//! reset when a transfer starts and only consulted after an interrupted call,
//! so a transfer always retries at least once before giving up.
use std::{
    io::{self, ErrorKind, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::trace;

/// Interrupt counter shared by clones.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    interrupts: Arc<AtomicUsize>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an interrupt.
    pub fn cancel(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.interrupts.store(0, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst) > 0
    }
}

/// How a transfer ended. Each variant carries the number of bytes moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// The whole buffer was transferred.
    Complete(usize),
    /// The peer closed or reset the connection first.
    Eof(usize),
    /// The token was cancelled while the transfer was being retried.
    Cancelled(usize),
}

impl Transfer {
    pub fn count(self) -> usize {
        match self {
            Transfer::Complete(n) | Transfer::Eof(n) | Transfer::Cancelled(n) => n,
        }
    }
}

/// Fills `buf` from `reader`.
pub fn read_full<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancelToken,
) -> io::Result<Transfer> {
    let n = buf.len();
    transfer(n, cancel, |pos| reader.read(&mut buf[pos..]))
}

/// Writes all of `buf` to `writer`.
pub fn write_full<W: Write + ?Sized>(
    writer: &mut W,
    buf: &[u8],
    cancel: &CancelToken,
) -> io::Result<Transfer> {
    transfer(buf.len(), cancel, |pos| writer.write(&buf[pos..]))
}

fn transfer<F>(n: usize, cancel: &CancelToken, mut step: F) -> io::Result<Transfer>
where
    F: FnMut(usize) -> io::Result<usize>,
{
    cancel.reset();

    let mut pos = 0;
    while pos < n {
        match step(pos) {
            Ok(0) => return Ok(Transfer::Eof(pos)),
            Ok(count) => pos += count,
            Err(e) => match e.kind() {
                ErrorKind::Interrupted => {
                    if cancel.is_cancelled() {
                        trace!("transfer cancelled after {pos} of {n} bytes");
                        return Ok(Transfer::Cancelled(pos));
                    }
                }
                ErrorKind::WouldBlock => {}
                ErrorKind::ConnectionReset => return Ok(Transfer::Eof(pos)),
                _ => return Err(e),
            },
        }
    }
    Ok(Transfer::Complete(pos))
}

//! Byte-stream transports.
//!
//! The connection needs three things from the stream it runs over: a read
//! half used only by the thread currently reading packets, a write half
//! used under the writer lock, and a way to shut the stream down from any
//! thread so that a blocked reader wakes up.
//!
//! The read half can also wait for input without consuming it, so a
//! reading thread with a deadline gives up between packets rather than in
//! the middle of one.
//!
//! Two implementations are provided:
//!
//! - [`std::net::TcpStream`]
//! - [`MemoryStream`], an in-process duplex pipe created with
//!   [`memory_pair`]
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::transport::memory_pair;
//! use std::io::{Read, Write};
//!
//! let (mut client, mut server) = memory_pair();
//! client.write_all(b"SSH-2.0-test\r\n").unwrap();
//!
//! let mut buf = [0u8; 14];
//! server.read_exact(&mut buf).unwrap();
//! assert_eq!(&buf, b"SSH-2.0-test\r\n");
//! ```

use fynx_platform::{FynxError, FynxResult};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Closes a transport; may be called from any thread, more than once.
pub type ShutdownHandle = Box<dyn Fn() + Send + Sync>;

/// Read half of a transport.
pub trait TransportReader: Read + Send {
    /// Waits until a read would not block or `deadline` passes. Returns
    /// false on timeout. Nothing is consumed.
    ///
    /// End of stream counts as readable. The default reports readable at
    /// once, which suits sources that never block.
    fn wait_readable(&mut self, deadline: Option<Instant>) -> io::Result<bool> {
        let _ = deadline;
        Ok(true)
    }
}

impl<T: AsRef<[u8]> + Send> TransportReader for io::Cursor<T> {}

impl TransportReader for TcpStream {
    fn wait_readable(&mut self, deadline: Option<Instant>) -> io::Result<bool> {
        let Some(deadline) = deadline else {
            return Ok(true);
        };
        // A zero read timeout is rejected by the OS
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        let previous = self.read_timeout()?;
        self.set_read_timeout(Some(remaining))?;
        let peeked = match self.peek(&mut [0u8; 1]) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(e),
        };
        self.set_read_timeout(previous)?;
        peeked
    }
}

/// The independent halves of a transport.
pub struct TransportHalves {
    /// Read half
    pub reader: Box<dyn TransportReader>,
    /// Write half
    pub writer: Box<dyn Write + Send>,
    /// Shuts both halves down, unblocking a pending read
    pub shutdown: ShutdownHandle,
}

impl std::fmt::Debug for TransportHalves {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHalves").finish_non_exhaustive()
    }
}

/// A bidirectional byte stream the SSH connection runs over.
pub trait Transport: Send {
    /// Splits the stream into its halves.
    fn split(self: Box<Self>) -> FynxResult<TransportHalves>;
}

impl Transport for TcpStream {
    fn split(self: Box<Self>) -> FynxResult<TransportHalves> {
        let reader = self.try_clone()?;
        let control = self.try_clone()?;
        Ok(TransportHalves {
            reader: Box::new(reader),
            writer: self,
            shutdown: Box::new(move || {
                // Already-closed sockets report ENOTCONN; nothing to do then.
                let _ = control.shutdown(Shutdown::Both);
            }),
        })
    }
}

#[derive(Debug, Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
}

/// One direction of an in-memory pipe.
#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn lock(&self) -> std::sync::MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-memory duplex stream.
///
/// Reads block until data arrives or either end is closed. Clones share
/// the same end, so one thread may read while another writes.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

/// Creates a connected pair of in-memory streams.
pub fn memory_pair() -> (MemoryStream, MemoryStream) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    (
        MemoryStream {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
        },
        MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
        },
    )
}

impl MemoryStream {
    /// Closes both directions. Pending and future reads on either end see
    /// end of stream once buffered data is drained.
    pub fn close(&self) {
        self.incoming.close();
        self.outgoing.close();
    }

    /// Returns true once either end has been closed.
    pub fn is_closed(&self) -> bool {
        self.incoming.lock().closed || self.outgoing.lock().closed
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.incoming.lock();
        loop {
            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                for (dst, src) in buf.iter_mut().zip(state.buffer.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = self
                .incoming
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl TransportReader for MemoryStream {
    fn wait_readable(&mut self, deadline: Option<Instant>) -> io::Result<bool> {
        let Some(deadline) = deadline else {
            return Ok(true);
        };
        let mut state = self.incoming.lock();
        loop {
            if !state.buffer.is_empty() || state.closed {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .incoming
                .readable
                .wait_timeout(state, deadline - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.outgoing.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory stream closed"));
        }
        state.buffer.extend(buf);
        drop(state);
        self.outgoing.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryStream {
    fn split(self: Box<Self>) -> FynxResult<TransportHalves> {
        let control = (*self).clone();
        Ok(TransportHalves {
            reader: Box::new((*self).clone()),
            writer: self,
            shutdown: Box::new(move || control.close()),
        })
    }
}

/// Maps a connect failure onto the error taxonomy.
pub(crate) fn connect_error(e: io::Error) -> FynxError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            FynxError::Timeout(format!("TCP connect timed out: {}", e))
        }
        _ => FynxError::from(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_memory_pair_duplex() {
        let (mut a, mut b) = memory_pair();
        a.write_all(b"ping").unwrap();
        b.write_all(b"pong").unwrap();

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (mut a, b) = memory_pair();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            a.read(&mut buf).unwrap()
        });
        b.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (mut a, b) = memory_pair();
        b.close();
        assert!(a.write_all(b"late").is_err());
        assert!(a.is_closed());
    }

    #[test]
    fn test_wait_readable_deadline() {
        let (mut a, mut b) = memory_pair();
        let soon = Some(Instant::now() + Duration::from_millis(20));
        assert!(!a.wait_readable(soon).unwrap());

        b.write_all(b"x").unwrap();
        assert!(a.wait_readable(soon).unwrap());
        // Nothing was consumed
        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).unwrap(), 1);

        b.close();
        assert!(a.wait_readable(Some(Instant::now())).unwrap());
    }

    #[test]
    fn test_wait_readable_wakes_on_write() {
        let (mut a, mut b) = memory_pair();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            b.write_all(b"late").unwrap();
        });
        assert!(a
            .wait_readable(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap());
        writer.join().unwrap();
    }

    #[test]
    fn test_split_shutdown() {
        let (a, mut b) = memory_pair();
        let halves = Box::new(a).split().unwrap();
        let mut writer = halves.writer;
        writer.write_all(b"x").unwrap();
        (halves.shutdown)();

        // Buffered data is still delivered before end of stream
        let mut buf = [0u8; 2];
        assert_eq!(b.read(&mut buf).unwrap(), 1);
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}

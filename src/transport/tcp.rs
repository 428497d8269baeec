//! Newline-delimited JSON transport over TCP.
//!
//! Each frame is one JSON object followed by `\n`. A reader thread decodes
//! inbound lines and forwards them; the writer side classifies socket
//! errors so callers never have to inspect error text.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, SendFailure, WmError, WmResult};

use super::{ClientFrame, ServerFrame, Transport};

/// Maximum size of one inbound JSON line.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Write timeouts tolerated after part of a frame went out. Past this the
/// peer is treated as gone.
const MAX_MID_FRAME_STALLS: u32 = 3;

/// TCP session carrying JSON frames.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Mutex<TcpStream>,
    // Shut down without the writer lock so `close` can unblock a stuck send.
    control: TcpStream,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Connects to `addr` and starts the reader thread.
    ///
    /// `write_timeout` bounds how long a send may block on a full socket
    /// buffer. A timeout before any byte of the frame went out is a
    /// transient failure; repeated timeouts part way through a frame end
    /// the session.
    ///
    /// # Errors
    ///
    /// `WmError::ConnectFailed` if the socket cannot be opened.
    pub fn connect(
        addr: impl ToSocketAddrs + std::fmt::Display,
        inbound: Sender<ServerFrame>,
        write_timeout: Option<Duration>,
    ) -> WmResult<Self> {
        let connect_err = |e: io::Error| WmError::ConnectFailed {
            addr: addr.to_string(),
            message: e.to_string(),
        };
        let stream = TcpStream::connect(&addr).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        stream.set_write_timeout(write_timeout).map_err(connect_err)?;
        let reader = stream.try_clone().map_err(connect_err)?;
        let control = stream.try_clone().map_err(connect_err)?;

        let connected = Arc::new(AtomicBool::new(true));
        let thread_connected = Arc::clone(&connected);
        thread::Builder::new()
            .name("wmlink-tcp-reader".to_string())
            .spawn(move || reader_loop(reader, inbound, thread_connected))
            .expect("failed to spawn wmlink tcp reader");

        info!(addr = %addr, "Connected to world model");
        Ok(Self {
            stream: Mutex::new(stream),
            control,
            connected,
        })
    }

    fn fail_session(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

impl Transport for TcpTransport {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), SendFailure> {
        if !self.connected() {
            return Err(SendFailure::fatal("not connected"));
        }

        let mut buf = serde_json::to_vec(frame)
            .map_err(|e| SendFailure::permanent(format!("failed to encode frame: {e}")))?;
        buf.push(b'\n');

        let mut stream = self
            .stream
            .lock()
            .map_err(|_| SendFailure::fatal("poisoned lock: tcp stream"))?;

        let mut written = 0;
        let mut stalls = 0;
        while written < buf.len() {
            if !self.connected() {
                return Err(SendFailure::fatal("connection closed while writing"));
            }
            match stream.write(&buf[written..]) {
                Ok(0) => {
                    self.fail_session();
                    return Err(SendFailure::fatal("socket closed while writing"));
                }
                Ok(n) => {
                    written += n;
                    stalls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // Mid-frame: the rest must follow or the stream is garbled.
                Err(e) if written > 0 && is_backpressure(&e) => {
                    stalls += 1;
                    if stalls > MAX_MID_FRAME_STALLS {
                        warn!(written, len = buf.len(), "Peer stopped reading mid-frame; closing session");
                        self.fail_session();
                        return Err(SendFailure::fatal(format!(
                            "peer stopped reading after {written} of {} bytes",
                            buf.len()
                        )));
                    }
                    debug!(written, stalls, "Write stalled mid-frame");
                }
                Err(e) => {
                    let failure = classify_io_error(&e);
                    if failure.kind == FailureKind::Fatal {
                        self.fail_session();
                    }
                    return Err(failure);
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_backpressure(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Maps a socket error onto the failure taxonomy.
#[must_use]
pub fn classify_io_error(err: &io::Error) -> SendFailure {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => SendFailure::transient(err.to_string()),
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => SendFailure::fatal(err.to_string()),
        _ => SendFailure::permanent(err.to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Eof,
    Frame,
    /// A line longer than the limit was skipped; holds its length.
    Oversized(usize),
}

/// Reads one `\n`-terminated line into `buf`, never buffering more than
/// `limit + 1` bytes. Longer lines are discarded up to their newline.
fn read_line_bounded<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<Line> {
    buf.clear();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let n = reader.by_ref().take(cap).read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.len() > limit && buf.last() != Some(&b'\n') {
        buf.clear();
        let skipped = skip_line(reader)?;
        return Ok(Line::Oversized(n + skipped));
    }
    Ok(Line::Frame)
}

/// Consumes input up to and including the next newline.
fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<usize> {
    let mut skipped = 0;
    loop {
        let (used, done) = {
            let available = match reader.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None if available.is_empty() => (0, true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped);
        }
    }
}

fn reader_loop(stream: TcpStream, inbound: Sender<ServerFrame>, connected: Arc<AtomicBool>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        match read_line_bounded(&mut reader, &mut line, MAX_FRAME_BYTES) {
            Ok(Line::Eof) => {
                debug!("World model closed the connection");
                break;
            }
            Ok(Line::Oversized(bytes)) => {
                warn!(bytes, limit = MAX_FRAME_BYTES, "Dropping oversized frame");
            }
            Ok(Line::Frame) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<ServerFrame>(&line) {
                    Ok(frame) => {
                        if inbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Read error on world model connection");
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
    let _ = inbound.send(ServerFrame::Disconnected);
}

//! Serial link to the RN2483/RN2903 transceiver.
//!
//! The `serialport` crate's port handle is blocking, so reads happen on a
//! dedicated OS thread; decoded lines cross back into the async side over
//! an unbounded channel. Writes go the other way over a second channel so
//! the port is only ever touched from this one thread, which keeps the
//! "only the write task writes to the port" invariant trivially true
//! without a mutex.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub const BAUD_RATE: u32 = 57600;

/// Reads of exactly this many bytes are as suspicious as a zero-byte
/// read: both are observed as line noise shortly after a hardware reset,
/// never as genuine transceiver output.
const READ_BUF_SIZE: usize = 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ticks (at the 5s supervisor cadence) before the watchdog logs a
/// warning that a command has gone unanswered for a while.
const WARN_TICKS: u32 = 5;
/// Ticks before the watchdog gives up and exits the process outright.
const FATAL_TICKS: u32 = 100;

#[derive(Debug)]
pub enum RadioError {
    Open(serialport::Error),
    Write(std::io::Error),
}

impl std::fmt::Display for RadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(e) => write!(f, "failed to open serial port: {e}"),
            Self::Write(e) => write!(f, "serial write failed: {e}"),
        }
    }
}

impl std::error::Error for RadioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(e) => Some(e),
            Self::Write(e) => Some(e),
        }
    }
}

/// Tracks how long it's been since a command was last written without a
/// reply. Armed on every write, disarmed by any non-empty line or an
/// explicit reset. Ticked externally by the 5s supervisor cadence.
#[derive(Default)]
pub struct ReplyWatchdog {
    armed: AtomicBool,
    ticks: AtomicU32,
}

impl ReplyWatchdog {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
        self.ticks.store(0, Ordering::SeqCst);
    }

    /// Disarms without judgement — used both when a reply genuinely
    /// arrives and when the caller explicitly resets the cadence.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.ticks.store(0, Ordering::SeqCst);
    }

    /// Advance the watchdog by one 5s tick. Returns `true` if the caller
    /// should terminate the process.
    pub fn tick(&self) -> bool {
        if !self.armed.load(Ordering::SeqCst) {
            return false;
        }
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks == WARN_TICKS {
            warn!(ticks, "no reply from transceiver in a while");
        }
        ticks >= FATAL_TICKS
    }
}

/// Write-side handle to the running serial driver: send commands, force
/// the next read cycle to discard buffered noise, and watch for replies
/// going unanswered. Lines read from the transceiver arrive separately,
/// over the `mpsc::UnboundedReceiver<String>` returned alongside this
/// handle by [`open`] — kept apart so the single task that drains that
/// receiver and feeds each line to the state machine is the only holder
/// of it, matching the "one line processed to completion before the next
/// begins" ordering guarantee.
pub struct SerialWriter {
    pub watchdog: Arc<ReplyWatchdog>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    flush_pending: Arc<AtomicBool>,
}

impl SerialWriter {
    pub fn send_command(&self, command: &str) {
        let mut bytes = command.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        if self.writer.send(bytes).is_err() {
            error!("serial writer thread is gone, command dropped: {command}");
            return;
        }
        self.watchdog.arm();
    }

    /// Requests that any bytes buffered before the next completed read be
    /// discarded, so a hardware reset doesn't leak pre-reset noise into
    /// the first post-reset line.
    pub fn request_flush(&self) {
        self.flush_pending.store(true, Ordering::SeqCst);
    }
}

impl SerialWriter {
    /// A writer with no backing port and nothing draining its channel,
    /// for the rare case the serial device can't be opened at startup.
    /// The state machine still runs against it (commands vanish into the
    /// channel unread); its own reply watchdog will never see a line
    /// arrive and eventually terminates the process for a restart, per
    /// §4.1's documented failure mode.
    pub fn disabled() -> Self {
        let (writer, _rx) = mpsc::unbounded_channel();
        Self {
            watchdog: Arc::new(ReplyWatchdog::default()),
            writer,
            flush_pending: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
impl SerialWriter {
    /// A writer with no backing port, for driving the state machine in
    /// tests. The returned receiver collects every command written,
    /// `\r\n` included, in order.
    pub fn for_test() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (writer, rx) = mpsc::unbounded_channel();
        (
            Self {
                watchdog: Arc::new(ReplyWatchdog::default()),
                writer,
                flush_pending: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }
}

/// Open the serial port and spawn its dedicated reader/writer thread.
/// Sleeps 2s first to let noise on a freshly-opened port settle.
pub async fn open(path: &str) -> Result<(SerialWriter, mpsc::UnboundedReceiver<String>), RadioError> {
    let port = serialport::new(path, BAUD_RATE)
        .timeout(Duration::from_millis(200))
        .open()
        .map_err(RadioError::Open)?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let flush_pending = Arc::new(AtomicBool::new(false));
    let watchdog = Arc::new(ReplyWatchdog::default());

    {
        let flush_pending = flush_pending.clone();
        let watchdog = watchdog.clone();
        std::thread::spawn(move || run_io_thread(port, line_tx, write_rx, flush_pending, watchdog));
    }

    Ok((
        SerialWriter {
            watchdog,
            writer: write_tx,
            flush_pending,
        },
        line_rx,
    ))
}

fn run_io_thread(
    mut port: Box<dyn serialport::SerialPort>,
    line_tx: mpsc::UnboundedSender<String>,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    flush_pending: Arc<AtomicBool>,
    watchdog: Arc<ReplyWatchdog>,
) {
    let mut pending = Vec::new();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        while let Ok(bytes) = write_rx.try_recv() {
            if let Err(e) = port.write_all(&bytes) {
                error!("serial write failed: {e}");
            }
        }

        if flush_pending.swap(false, Ordering::SeqCst) {
            pending.clear();
        }

        match port.read(&mut buf) {
            // Both a zero-byte read and a read that exactly fills the
            // buffer are observed as noise shortly after reset, never as
            // genuine transceiver output.
            Ok(0) | Ok(READ_BUF_SIZE) => {}
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                drain_lines(&mut pending, &line_tx, &watchdog);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => warn!("serial read error: {e}"),
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Split `\r`/`\n`-terminated lines out of `pending`, emitting each
/// completed line and leaving any unterminated tail in place for the next
/// read, matching the original gateway's line-framing loop. Leading
/// non-printable bytes ahead of the first line are skipped rather than
/// forwarded as part of it.
fn drain_lines(pending: &mut Vec<u8>, line_tx: &mpsc::UnboundedSender<String>, watchdog: &ReplyWatchdog) {
    while let Some(pos) = pending.iter().position(|&b| b == b'\r' || b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string();
        if !text.is_empty() {
            debug!(line = %text, "received from radio");
            watchdog.disarm();
            let _ = line_tx.send(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> ReplyWatchdog {
        ReplyWatchdog::default()
    }

    #[test]
    fn drain_lines_splits_on_crlf() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = b"radio_rx 00AABB\r\nmac_tx_ok\r\n".to_vec();
        drain_lines(&mut pending, &tx, &watchdog());
        assert!(pending.is_empty());
        assert_eq!(rx.try_recv().unwrap(), "radio_rx 00AABB");
        assert_eq!(rx.try_recv().unwrap(), "mac_tx_ok");
    }

    #[test]
    fn drain_lines_leaves_partial_tail() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = b"radio_rx 00AA".to_vec();
        drain_lines(&mut pending, &tx, &watchdog());
        assert_eq!(pending, b"radio_rx 00AA");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn watchdog_disarmed_has_no_effect() {
        let wd = watchdog();
        assert!(!wd.tick());
        assert!(!wd.tick());
    }

    #[test]
    fn watchdog_fatal_after_100_ticks() {
        let wd = watchdog();
        wd.arm();
        for _ in 0..99 {
            assert!(!wd.tick());
        }
        assert!(wd.tick());
    }

    #[test]
    fn watchdog_disarm_resets_ticks() {
        let wd = watchdog();
        wd.arm();
        wd.tick();
        wd.tick();
        wd.disarm();
        assert!(!wd.tick());
    }
}

//! Arduino slider box driver
//!
//! Owns the serial link. Incoming bytes are read on a dedicated thread,
//! split into lines and classified before being handed to the async side.
//! Outgoing commands go through a [`DeviceSink`].

pub mod image;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::config::AppConfig;
use crate::protocol::{DeviceLine, HostCommand};

/// Longest line accepted before the buffer is considered garbage
const MAX_LINE_LEN: usize = 4096;

/// First retry delay after a read error
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Retry delay ceiling
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Events held back while the queue is full
const MAX_BACKLOG: usize = 256;

/// Granularity at which sleeping threads notice the stop flag
const STOP_POLL: Duration = Duration::from_millis(50);

/// Line received from the slider box
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub timestamp: Instant,
    pub line: DeviceLine,
}

/// Write side of the device link
pub trait DeviceSink: Send + Sync {
    /// Send one protocol command
    fn send(&self, command: &HostCommand) -> Result<()>;

    /// Run `write` with the link held; no other write interleaves
    fn exclusive(&self, write: &mut dyn FnMut(&mut dyn Write) -> io::Result<()>) -> Result<()>;

    /// Send raw bytes
    fn write_raw(&self, data: &[u8]) -> Result<()> {
        self.exclusive(&mut |port| port.write_all(data))
    }
}

/// [`DeviceSink`] over an open serial port
pub struct SerialSink {
    port_name: String,
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialSink {
    fn new(port_name: &str, port: Box<dyn SerialPort>) -> Self {
        Self {
            port_name: port_name.to_string(),
            port: Mutex::new(port),
        }
    }
}

impl DeviceSink for SerialSink {
    fn send(&self, command: &HostCommand) -> Result<()> {
        self.write_raw(&command.encode())?;
        debug!("→ {}", command);
        Ok(())
    }

    fn exclusive(&self, write: &mut dyn FnMut(&mut dyn Write) -> io::Result<()>) -> Result<()> {
        let mut port = self.port.lock();
        write(&mut *port).with_context(|| format!("Failed to write to {}", self.port_name))?;
        port.flush()
            .with_context(|| format!("Failed to flush {}", self.port_name))?;
        Ok(())
    }
}

/// Serial port visible to the host
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

struct ReaderThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Arduino driver for the serial link
pub struct ArduinoDriver {
    port_name: String,
    baud_rate: u32,
    reset_delay: Duration,
    read_timeout: Duration,

    /// Event sender for incoming lines
    event_tx: mpsc::Sender<DeviceEvent>,

    /// Event receiver, taken once by the main loop
    event_rx: Option<mpsc::Receiver<DeviceEvent>>,

    sink: Option<Arc<SerialSink>>,
    reader: Option<ReaderThread>,
}

impl ArduinoDriver {
    /// Create a driver from configuration (does not open the port)
    pub fn new(config: &AppConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.sync.event_queue);

        Self {
            port_name: config.serial.port.clone(),
            baud_rate: config.serial.baud_rate,
            reset_delay: Duration::from_millis(config.serial.reset_delay_ms),
            read_timeout: Duration::from_millis(config.serial.read_timeout_ms),
            event_tx,
            event_rx: Some(event_rx),
            sink: None,
            reader: None,
        }
    }

    /// List serial ports present on this machine
    pub fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let description = match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => match usb.product {
                        Some(product) => format!("USB {:04x}:{:04x} {}", usb.vid, usb.pid, product),
                        None => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
                    },
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::Unknown => "unknown".to_string(),
                };
                PortInfo {
                    name: p.port_name,
                    description,
                }
            })
            .collect())
    }

    /// Open the port, wait for the board reset and start the reader thread
    pub async fn connect(&mut self) -> Result<Arc<SerialSink>> {
        self.disconnect();

        info!(
            "Connecting to Arduino on {} at {} baud",
            self.port_name, self.baud_rate
        );

        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .with_context(|| format!("Failed to open serial port {}", self.port_name))?;

        let reader_port = port
            .try_clone()
            .context("Failed to clone serial port handle for reader")?;

        // Opening the port toggles DTR and resets most boards
        debug!("Waiting {:?} for board reset", self.reset_delay);
        tokio::time::sleep(self.reset_delay).await;

        let stop = Arc::new(AtomicBool::new(false));
        let event_tx = self.event_tx.clone();
        let thread_stop = stop.clone();
        let port_name = self.port_name.clone();
        let handle = std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || run_reader(reader_port, event_tx, thread_stop, &port_name))
            .context("Failed to spawn serial reader thread")?;

        let sink = Arc::new(SerialSink::new(&self.port_name, port));
        self.sink = Some(sink.clone());
        self.reader = Some(ReaderThread { stop, handle });

        info!("✅ Arduino connected on {}", self.port_name);
        Ok(sink)
    }

    /// Stop the reader and release the port
    pub fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.stop.store(true, Ordering::Relaxed);
            if reader.handle.join().is_err() {
                error!("Serial reader thread panicked");
            }
        }
        if self.sink.take().is_some() {
            info!("Arduino disconnected");
        }
    }

    /// Take the event receiver (for the main loop to consume)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<DeviceEvent>> {
        self.event_rx.take()
    }
}

impl Drop for ArduinoDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn run_reader(
    mut port: Box<dyn SerialPort>,
    event_tx: mpsc::Sender<DeviceEvent>,
    stop: Arc<AtomicBool>,
    port_name: &str,
) {
    let mut chunk = [0u8; 256];
    let mut lines = LineBuffer::new();
    let mut backoff = Backoff::new();
    let mut forwarder = EventForwarder::new(event_tx);

    debug!("Serial reader started on {}", port_name);

    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                backoff.reset();
                for line in lines.push(&chunk[..n]) {
                    if !forwarder.forward(&line) {
                        debug!("Event receiver dropped, stopping serial reader");
                        return;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                if !forwarder.flush() {
                    debug!("Event receiver dropped, stopping serial reader");
                    return;
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Serial read error on {}: {} (retrying in {:?})", port_name, e, delay);
                sleep_unless_stopped(delay, &stop);
            }
        }
    }

    debug!("Serial reader on {} stopped", port_name);
}

/// Queues classified lines for the async side without ever blocking
///
/// Slider-only frames are dropped when the queue is full; the next frame
/// carries the full slider state. Anything else (button fields, control
/// replies) waits in a backlog and goes out in order once there is room.
struct EventForwarder {
    tx: mpsc::Sender<DeviceEvent>,
    backlog: VecDeque<DeviceEvent>,
}

impl EventForwarder {
    fn new(tx: mpsc::Sender<DeviceEvent>) -> Self {
        Self {
            tx,
            backlog: VecDeque::new(),
        }
    }

    /// Classify and queue one line. Returns false once the receiver is gone.
    fn forward(&mut self, line: &str) -> bool {
        let Some(parsed) = DeviceLine::parse(line) else {
            return true;
        };
        trace!("← {}", line);

        let event = DeviceEvent {
            timestamp: Instant::now(),
            line: parsed,
        };

        if !self.flush() {
            return false;
        }
        if !self.backlog.is_empty() {
            self.hold_or_drop(event, line);
            return true;
        }

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.hold_or_drop(event, line);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Push out as much of the backlog as fits. Returns false once the
    /// receiver is gone.
    fn flush(&mut self) -> bool {
        while let Some(event) = self.backlog.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    fn hold_or_drop(&mut self, event: DeviceEvent, line: &str) {
        if !must_deliver(&event.line) {
            warn!("Device event queue full, dropping line: {}", line);
            return;
        }
        if self.backlog.len() >= MAX_BACKLOG {
            if let Some(oldest) = self.backlog.pop_front() {
                warn!("Device event backlog full, dropping {:?}", oldest.line);
            }
        }
        self.backlog.push_back(event);
    }

    #[cfg(test)]
    fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Lines that cannot be replaced by a later frame
fn must_deliver(line: &DeviceLine) -> bool {
    match line {
        DeviceLine::Frame(msg) => !msg.button_states.is_empty(),
        _ => true,
    }
}

fn sleep_unless_stopped(delay: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}

/// Reassembles newline-terminated lines from arbitrary read chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line completed by them
    ///
    /// Line terminators (`\n`, optionally preceded by `\r`) are stripped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }

        if self.pending.len() > MAX_LINE_LEN {
            warn!(
                "Discarding {} bytes without a line terminator",
                self.pending.len()
            );
            self.pending.clear();
        }

        lines
    }

    /// Bytes waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Doubling retry delay, reset on success
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    /// Delay to wait now; the following one doubles up to the ceiling
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ArduinoMessage;

    #[test]
    fn test_line_buffer_reassembles_split_reads() {
        let mut buf = LineBuffer::new();

        assert!(buf.push(b"s0v4").is_empty());
        assert_eq!(buf.pending_len(), 4);
        assert_eq!(buf.push(b"0|b1v1\r\ns1"), vec!["s0v40|b1v1"]);
        assert_eq!(buf.push(b"v9\nPONG\n"), vec!["s1v9", "PONG"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_line_buffer_keeps_blank_lines_and_drops_garbage() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"\n\n"), vec!["", ""]);

        buf.push(&vec![b'x'; MAX_LINE_LEN + 1]);
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.push(b"OK:fine\n"), vec!["OK:fine"]);
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000, 2000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), BACKOFF_INITIAL);
    }

    fn frame(event: Option<DeviceEvent>) -> ArduinoMessage {
        match event.map(|e| e.line) {
            Some(DeviceLine::Frame(msg)) => msg,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forwarder_classifies_and_skips_blank() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut forwarder = EventForwarder::new(tx);

        assert!(forwarder.forward(""));
        assert!(forwarder.forward("s0v10"));
        assert!(forwarder.forward("PONG"));

        assert!(matches!(rx.recv().await.map(|e| e.line), Some(DeviceLine::Frame(_))));
        assert!(matches!(rx.recv().await.map(|e| e.line), Some(DeviceLine::Pong)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_drops_slider_frames_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut forwarder = EventForwarder::new(tx);

        assert!(forwarder.forward("s0v10"));
        assert!(forwarder.forward("s0v20"));
        assert_eq!(forwarder.backlog_len(), 0);
        assert_eq!(frame(rx.recv().await).slider_values.get(&0), Some(&10));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forwarder.forward("s0v30"));
    }

    #[tokio::test]
    async fn test_forwarder_keeps_button_edges_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut forwarder = EventForwarder::new(tx);

        assert!(forwarder.forward("s0v10"));
        assert!(forwarder.forward("s0v11|b1v1"));
        assert!(forwarder.forward("s0v12"));
        assert!(forwarder.forward("s0v13|b1v0"));
        assert_eq!(forwarder.backlog_len(), 2);

        assert_eq!(frame(rx.recv().await).slider_values.get(&0), Some(&10));
        assert!(forwarder.flush());
        assert_eq!(frame(rx.recv().await).button_states.get(&1), Some(&true));
        assert!(forwarder.flush());
        assert_eq!(frame(rx.recv().await).button_states.get(&1), Some(&false));
        assert_eq!(forwarder.backlog_len(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sleep_unless_stopped_returns_early() {
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        sleep_unless_stopped(Duration::from_secs(5), &stop);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

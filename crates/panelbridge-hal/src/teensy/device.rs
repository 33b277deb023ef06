//! USB HID device access and the blocking device session.
//!
//! [`HidBackend`] finds and opens devices; [`HidDevice`] is one open
//! device.  Both are traits so tests can run against
//! [`SimHidBackend`][crate::teensy::sim::SimHidBackend] instead of real
//! hardware.
//!
//! A [`DeviceSession`] owns an open device on a dedicated thread, since HID
//! reads block.  Each iteration of the session thread:
//!
//! 1. writes every report queued by the driver, in order;
//! 2. sends the keepalive frame if it is due;
//! 3. reads one report with a short timeout and forwards it.
//!
//! Writes queued before [`DeviceSession::close`] are flushed, and its final
//! frame written, before the device is released.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use panelbridge_middleware::PollableQueue;
use panelbridge_types::BridgeError;
use tracing::{debug, info, warn};

use super::frame::{KEEPALIVE_FRAME, REPORT_SIZE, pad_report};

/// Read timeout for one poll of the device.
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Keepalive period.  The device expects one at least every 500 ms; the
/// margin covers one read timeout plus queued writes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(450);

/// Which HID interface to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeensyConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage: u16,
    pub usage_page: u16,
}

impl Default for TeensyConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x16c0,
            product_id: 0x0488,
            usage: 0xa739,
            usage_page: 0xff1c,
        }
    }
}

impl std::fmt::Display for TeensyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (usage {:04x}, page {:04x})",
            self.vendor_id, self.product_id, self.usage, self.usage_page
        )
    }
}

/// One open HID device.
pub trait HidDevice: Send {
    /// Read one report, waiting at most `timeout`.  An empty vector means the
    /// timeout elapsed.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, BridgeError>;

    /// Write one full report.
    fn write(&mut self, report: &[u8; REPORT_SIZE]) -> Result<(), BridgeError>;
}

/// Finds and opens HID devices.
pub trait HidBackend: Send + Sync {
    /// Check that a matching device is attached.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] when none is.
    fn probe(&self, config: &TeensyConfig) -> Result<(), BridgeError>;

    fn open(&self, config: &TeensyConfig) -> Result<Box<dyn HidDevice>, BridgeError>;
}

enum SessionCommand {
    Write([u8; REPORT_SIZE]),
    /// Stop after writing the optional final report.
    Close(Option<[u8; REPORT_SIZE]>),
}

/// What the session thread reports back to the driver.
#[derive(Debug)]
pub enum SessionEvent {
    Report(Vec<u8>),
    Failed(BridgeError),
    Closed,
}

/// Driver-side handle on an open device session.
pub struct DeviceSession {
    commands: PollableQueue<SessionCommand>,
    events: PollableQueue<SessionEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceSession {
    /// Open the device and start the session thread.  `first_frame`, when
    /// given, is queued before the thread starts so it precedes the first
    /// keepalive.
    ///
    /// # Errors
    ///
    /// Propagates the backend's open error, [`BridgeError::ProtocolParse`]
    /// for an oversized `first_frame`, or [`BridgeError::Transport`] if the
    /// thread cannot be spawned.
    pub fn open(
        backend: &Arc<dyn HidBackend>,
        config: &TeensyConfig,
        first_frame: Option<&[u8]>,
    ) -> Result<Self, BridgeError> {
        let first = first_frame.map(pad_report).transpose()?;
        let device = backend.open(config)?;
        info!(device = %config, "opened teensy device");

        let commands = PollableQueue::new();
        if let Some(report) = first {
            commands.put(SessionCommand::Write(report))?;
        }
        let events = PollableQueue::new();
        let thread = {
            let commands = commands.clone();
            let events = events.clone();
            thread::Builder::new()
                .name("teensy-session".to_string())
                .spawn(move || run_session(device, commands, events))
                .map_err(|e| BridgeError::Transport(format!("cannot spawn device thread: {e}")))?
        };

        Ok(Self {
            commands,
            events,
            thread: Some(thread),
        })
    }

    /// Queue `frame` for the device, padded to a full report.
    pub fn write(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let report = pad_report(frame)?;
        self.commands.put(SessionCommand::Write(report))
    }

    /// Whether the session thread is still serving the device.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Next event from the session thread.  Cancel-safe.
    pub async fn next_event(&self) -> Option<SessionEvent> {
        self.events.get().await
    }

    /// Flush queued writes, send `final_frame` if given, release the device
    /// and wait for the thread.
    pub async fn close(mut self, final_frame: Option<&[u8]>) {
        let last = match final_frame.map(pad_report).transpose() {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "dropping final teensy frame");
                None
            }
        };
        // Fails only if the thread already ended on its own.
        let _ = self.commands.put(SessionCommand::Close(last));
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("teensy session thread joined"),
                Ok(Err(_)) => warn!("teensy session thread panicked"),
                Err(e) => warn!(error = %e, "failed to join teensy session thread"),
            }
        }
        self.events.close();
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let _ = self.commands.put(SessionCommand::Close(None));
    }
}

fn run_session(
    mut device: Box<dyn HidDevice>,
    commands: PollableQueue<SessionCommand>,
    events: PollableQueue<SessionEvent>,
) {
    let result = session_loop(device.as_mut(), &commands, &events);
    commands.close();
    let event = match result {
        Ok(()) => SessionEvent::Closed,
        Err(e) => {
            warn!(error = %e, "teensy session failed");
            SessionEvent::Failed(e)
        }
    };
    let _ = events.put(event);
    drop(device);
    debug!("teensy device released");
}

fn session_loop(
    device: &mut dyn HidDevice,
    commands: &PollableQueue<SessionCommand>,
    events: &PollableQueue<SessionEvent>,
) -> Result<(), BridgeError> {
    let keepalive = pad_report(&KEEPALIVE_FRAME)?;
    let mut last_keepalive: Option<Instant> = None;

    loop {
        while let Some(command) = commands.try_get() {
            match command {
                SessionCommand::Write(report) => {
                    debug!(bytes = report.len(), "teensy send");
                    device.write(&report)?;
                }
                SessionCommand::Close(last) => {
                    if let Some(report) = last {
                        device.write(&report)?;
                    }
                    return Ok(());
                }
            }
        }

        if last_keepalive.is_none_or(|at| at.elapsed() >= KEEPALIVE_INTERVAL) {
            device.write(&keepalive)?;
            last_keepalive = Some(Instant::now());
        }

        let report = device.read(READ_TIMEOUT)?;
        if !report.is_empty() {
            debug!(bytes = report.len(), "teensy receive");
            if events.put(SessionEvent::Report(report)).is_err() {
                // The driver dropped its handle.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teensy::frame::{SIMULATION_START_FRAME, SIMULATION_STOP_FRAME};
    use crate::teensy::sim::SimHidBackend;
    use tokio::time::timeout;

    fn open(sim: &SimHidBackend) -> DeviceSession {
        let backend: Arc<dyn HidBackend> = Arc::new(sim.clone());
        DeviceSession::open(&backend, &TeensyConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn first_frame_is_written_before_any_keepalive() {
        let sim = SimHidBackend::new();
        let backend: Arc<dyn HidBackend> = Arc::new(sim.clone());
        for _ in 0..20 {
            sim.clear_written();
            let session = DeviceSession::open(
                &backend,
                &TeensyConfig::default(),
                Some(&SIMULATION_START_FRAME[..]),
            )
            .unwrap();
            session.close(None).await;
            let written = sim.written();
            assert!(written[0].starts_with(&SIMULATION_START_FRAME));
        }
    }

    #[tokio::test]
    async fn close_flushes_writes_and_sends_final_frame_last() {
        let sim = SimHidBackend::new();
        let session = open(&sim);
        session.write(&SIMULATION_START_FRAME).unwrap();
        session.close(Some(&SIMULATION_STOP_FRAME[..])).await;

        let written = sim.written();
        assert!(written.iter().any(|r| r.starts_with(&SIMULATION_START_FRAME)));
        assert!(written.last().unwrap().starts_with(&SIMULATION_STOP_FRAME));
        assert!(!sim.is_open());
    }

    #[tokio::test]
    async fn injected_reports_are_forwarded() {
        let sim = SimHidBackend::new();
        let session = open(&sim);
        sim.inject_report(&[4, 6, 1, 0]);

        let event = timeout(Duration::from_secs(1), session.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(SessionEvent::Report(r)) if r == vec![4, 6, 1, 0]));
        session.close(None).await;
    }

    #[tokio::test]
    async fn write_failure_ends_the_session() {
        let sim = SimHidBackend::new();
        sim.fail_writes(true);
        let session = open(&sim);

        let event = timeout(Duration::from_secs(1), session.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(SessionEvent::Failed(BridgeError::Transport(_)))));
        assert!(!session.is_alive());
        assert!(session.write(&SIMULATION_START_FRAME).is_err());
        session.close(None).await;
        assert!(!sim.is_open());
    }
}

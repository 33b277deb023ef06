//! In-process HID backend for running the Teensy driver without hardware.
//!
//! [`SimHidBackend`] stands in for a USB stack with zero or one attached
//! panel.  Tests inject reports as if the panel sent them and inspect every
//! report the bridge wrote, with the time it was written.
//!
//! ```rust
//! use panelbridge_hal::teensy::{HidBackend, SimHidBackend, TeensyConfig};
//!
//! let backend = SimHidBackend::new();
//! backend.probe(&TeensyConfig::default()).expect("sim panel is attached");
//! assert!(SimHidBackend::absent().probe(&TeensyConfig::default()).is_err());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use panelbridge_types::BridgeError;

use super::device::{HidBackend, HidDevice, TeensyConfig};
use super::frame::REPORT_SIZE;

#[derive(Debug, Default)]
struct SimState {
    attached: bool,
    open: bool,
    opens: usize,
    reads: VecDeque<Vec<u8>>,
    written: Vec<(Instant, [u8; REPORT_SIZE])>,
    fail_writes: bool,
}

/// Simulated USB stack with one Teensy panel.  Clones share state.
#[derive(Debug, Clone)]
pub struct SimHidBackend {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimHidBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHidBackend {
    /// A backend with the panel attached.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                attached: true,
                ..SimState::default()
            })),
        }
    }

    /// A backend with nothing plugged in.
    pub fn absent() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a report for the bridge to read, as if the panel sent it.
    pub fn inject_report(&self, bytes: &[u8]) {
        self.lock().reads.push_back(bytes.to_vec());
    }

    /// Every report written so far.
    pub fn written(&self) -> Vec<[u8; REPORT_SIZE]> {
        self.lock().written.iter().map(|(_, r)| *r).collect()
    }

    /// Every report written so far, with the time it was written.
    pub fn written_at(&self) -> Vec<(Instant, [u8; REPORT_SIZE])> {
        self.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.lock().written.clear();
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// How many times the device has been opened.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Make every following write fail, as if the cable were pulled.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl HidBackend for SimHidBackend {
    fn probe(&self, config: &TeensyConfig) -> Result<(), BridgeError> {
        if self.lock().attached {
            Ok(())
        } else {
            Err(BridgeError::DeviceNotFound(config.to_string()))
        }
    }

    fn open(&self, config: &TeensyConfig) -> Result<Box<dyn HidDevice>, BridgeError> {
        let mut state = self.lock();
        if !state.attached {
            return Err(BridgeError::DeviceNotFound(config.to_string()));
        }
        state.open = true;
        state.opens += 1;
        Ok(Box::new(SimHidDevice {
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimHidDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimHidDevice {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HidDevice for SimHidDevice {
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, BridgeError> {
        if let Some(report) = self.lock().reads.pop_front() {
            return Ok(report);
        }
        thread::sleep(timeout);
        Ok(Vec::new())
    }

    fn write(&mut self, report: &[u8; REPORT_SIZE]) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(BridgeError::Transport("simulated HID write failure".to_string()));
        }
        state.written.push((Instant::now(), *report));
        Ok(())
    }
}

impl Drop for SimHidDevice {
    fn drop(&mut self) {
        self.lock().open = false;
    }
}

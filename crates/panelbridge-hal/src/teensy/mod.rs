//! Teensy USB HID panel.
//!
//! - [`frame`] – Binary frame codec.
//! - [`device`] – HID backend traits and the blocking device session.
//! - [`driver`] – [`TeensyPanelDriver`].
//! - [`sim`] – In-process HID backend for tests and headless runs.
//! - `hid` – hidapi backend (cargo feature `hidapi`).

pub mod device;
pub mod driver;
pub mod frame;
#[cfg(feature = "hidapi")]
pub mod hid;
pub mod sim;

pub use device::{DeviceSession, HidBackend, HidDevice, SessionEvent, TeensyConfig};
pub use driver::TeensyPanelDriver;
#[cfg(feature = "hidapi")]
pub use hid::HidApiBackend;
pub use sim::SimHidBackend;

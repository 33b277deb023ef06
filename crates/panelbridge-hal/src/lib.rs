//! `panelbridge-hal` – Panel drivers for cockpit hardware.
//!
//! Each driver implements [`PanelDriver`] and is run by a [`PanelWorker`] on
//! its own task, joined to the exchange by a
//! [`PanelLink`](panelbridge_middleware::PanelLink).
//!
//! # Modules
//!
//! - [`driver`] – The [`PanelDriver`] trait and the [`PanelWorker`] loop.
//! - [`text`] – Parser for the panel text protocol.
//! - [`inet_socket`] – Panels connected over TCP.
//! - [`teensy`] – Teensy boards over USB HID.

pub mod driver;
pub mod inet_socket;
pub mod teensy;
pub mod text;

pub use driver::{PanelDriver, PanelWorker};
pub use inet_socket::InetSocketPanelDriver;
pub use teensy::{SimHidBackend, TeensyConfig, TeensyPanelDriver};
pub use text::parse_panel_line;

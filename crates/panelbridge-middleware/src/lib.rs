//! `panelbridge-middleware` – Packet plumbing between panels and simulators.
//!
//! Every panel driver is joined to the exchange by a [`PanelLink`]: two
//! [`PollableQueue`]s of [`Packet`](panelbridge_types::Packet)s, one per
//! direction.  The exchange fans simulator updates out to every panel and
//! forwards panel requests to the simulator.
//!
//! # Modules
//!
//! - [`queue`] – Thread-safe FIFO with an awaitable readiness signal.
//! - [`link`] – Queue pair plus the exchange-side handle on a panel worker.
//! - [`exchange`] – The [`Exchange`] trait, [`Fanout`] and [`ExchangeRunner`].
//! - [`inet_socket`] – Newline text protocol over TCP.
//! - [`telemachus`] – Kerbal Space Program Telemachus websocket client.
//! - [`shutdown`] – Cooperative shutdown signal.
//! - [`lines`] – Newline framing shared by the text protocols.

pub mod exchange;
pub mod inet_socket;
pub mod lines;
pub mod link;
pub mod queue;
pub mod shutdown;
pub mod telemachus;

pub use exchange::{Exchange, ExchangeRunner, Fanout};
pub use inet_socket::InetSocketExchange;
pub use lines::LineBuffer;
pub use link::{PanelHandle, PanelLink};
pub use queue::PollableQueue;
pub use shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel};
pub use telemachus::KerbalTelemachusExchange;

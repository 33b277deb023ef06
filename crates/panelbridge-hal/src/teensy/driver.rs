//! Panel driver for a Teensy board speaking the binary HID protocol.
//!
//! The device session only exists while the simulation runs:
//!
//! * `SimulationStart` opens the device and sends the start frame.
//! * `SimulationStop` sends the stop frame, closes the device and forgets
//!   every registration.
//!
//! The board registers its datarefs at runtime, assigning each a small id;
//! later write and command frames refer to the id only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use panelbridge_middleware::PollableQueue;
use panelbridge_types::{BridgeError, Dataref, DatarefRegistry, Packet, RawValue};
use tracing::{debug, error, info, warn};

use super::device::{DeviceSession, HidBackend, SessionEvent, TeensyConfig};
use super::frame::{
    SIMULATION_START_FRAME, SIMULATION_STOP_FRAME, TeensyFrame, WireValue, encode_write,
    extract_frames, parse_frame,
};
use crate::driver::PanelDriver;

pub struct TeensyPanelDriver {
    name: String,
    backend: Arc<dyn HidBackend>,
    config: TeensyConfig,
    registry: Arc<DatarefRegistry>,
    registrations: HashMap<u16, String>,
    session: Option<DeviceSession>,
}

impl TeensyPanelDriver {
    /// Create the driver, checking that the device is attached.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] if no matching device exists.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn HidBackend>,
        config: TeensyConfig,
        registry: Arc<DatarefRegistry>,
    ) -> Result<Self, BridgeError> {
        let name = name.into();
        backend.probe(&config)?;
        info!(panel = %name, device = %config, "found teensy panel");
        Ok(Self {
            name,
            backend,
            config,
            registry,
            registrations: HashMap::new(),
            session: None,
        })
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Name registered under `id` in the current session.
    pub fn registration(&self, id: u16) -> Option<&str> {
        self.registrations.get(&id).map(String::as_str)
    }

    fn id_for(&self, name: &str) -> Option<u16> {
        self.registrations
            .iter()
            .find(|(_, registered)| registered.as_str() == name)
            .map(|(id, _)| *id)
    }

    fn name_for(&self, id: u16) -> Result<&str, BridgeError> {
        self.registration(id)
            .ok_or_else(|| BridgeError::NotFound(format!("registration id {id}")))
    }

    fn session(&self) -> Result<&DeviceSession, BridgeError> {
        self.session
            .as_ref()
            .ok_or_else(|| BridgeError::Transport("teensy session is not open".to_string()))
    }

    async fn end_session(&mut self, final_frame: Option<&[u8]>) {
        if let Some(session) = self.session.take() {
            session.close(final_frame).await;
            info!(panel = %self.name, device = %self.config, "closed teensy device");
        }
        self.registrations.clear();
    }

    /// Translate one device frame into the packet it stands for.
    fn frame_to_packet(&mut self, frame: TeensyFrame) -> Result<Packet, BridgeError> {
        match frame {
            TeensyFrame::Register {
                id,
                data_type,
                name,
            } => {
                self.registry.register(&name, data_type);
                let data_type = self.registry.data_type(&name).unwrap_or(data_type);
                info!(panel = %self.name, dataref = %name, data_type = %data_type, id, "panel registered dataref");
                // A name re-registered under a new id retires the old one.
                self.registrations.retain(|_, registered| *registered != name);
                self.registrations.insert(id, name.clone());
                Ok(Packet::DataSubscribeRequest(Dataref::unset(name, data_type)))
            }
            TeensyFrame::Write { id, value } => {
                let name = self.name_for(id)?;
                let raw = match value {
                    WireValue::Integer(v) => RawValue::Integer(i64::from(v)),
                    WireValue::Float(v) => RawValue::Float(f64::from(v)),
                };
                debug!(panel = %self.name, dataref = %name, value = ?value, "panel wrote dataref");
                Ok(Packet::DataWrite(self.registry.factory(name, raw)?))
            }
            TeensyFrame::Command { id, phase } => {
                let name = self.name_for(id)?;
                debug!(panel = %self.name, command = %name, phase = %phase, "panel command");
                Ok(Packet::command(self.registry.factory(name, phase)?, phase))
            }
        }
    }

    fn handle_report(&mut self, report: &[u8], outbound: &PollableQueue<Packet>) {
        for frame in extract_frames(report) {
            let packet = parse_frame(frame).and_then(|f| self.frame_to_packet(f));
            match packet {
                Ok(packet) => {
                    if let Err(e) = outbound.put(packet) {
                        error!(panel = %self.name, error = %e, "outbound queue rejected packet");
                    }
                }
                Err(e) => warn!(panel = %self.name, error = %e, "dropping teensy frame"),
            }
        }
    }
}

#[async_trait]
impl PanelDriver for TeensyPanelDriver {
    type Activity = SessionEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn ready(&mut self) -> SessionEvent {
        match &self.session {
            Some(session) => match session.next_event().await {
                Some(event) => event,
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    async fn handle_activity(
        &mut self,
        activity: SessionEvent,
        outbound: &PollableQueue<Packet>,
    ) -> Result<(), BridgeError> {
        match activity {
            SessionEvent::Report(report) => {
                self.handle_report(&report, outbound);
                Ok(())
            }
            SessionEvent::Failed(e) => {
                self.end_session(None).await;
                Err(e)
            }
            SessionEvent::Closed => {
                self.end_session(None).await;
                Ok(())
            }
        }
    }

    async fn handle_inbound_packet(
        &mut self,
        packet: Packet,
        _outbound: &PollableQueue<Packet>,
    ) -> Result<(), BridgeError> {
        match &packet {
            Packet::SimulationStart => {
                if self.session.as_ref().is_some_and(|s| !s.is_alive()) {
                    // Died on an I/O error whose event is still queued.
                    self.end_session(None).await;
                }
                if let Some(session) = &self.session {
                    return session.write(&SIMULATION_START_FRAME);
                }
                // START is queued ahead of the session's first keepalive.
                self.session = Some(DeviceSession::open(
                    &self.backend,
                    &self.config,
                    Some(&SIMULATION_START_FRAME[..]),
                )?);
                Ok(())
            }
            Packet::SimulationStop => {
                self.end_session(Some(&SIMULATION_STOP_FRAME[..])).await;
                Ok(())
            }
            Packet::DataWrite(dataref) => {
                let id = self
                    .id_for(dataref.name())
                    .ok_or_else(|| BridgeError::NotFound(dataref.name().to_string()))?;
                let frame = encode_write(id, dataref.name(), dataref.require_value()?)?;
                self.session()?.write(&frame)
            }
            Packet::ExchangeAvailable | Packet::ExchangeUnavailable => {
                info!(panel = %self.name, packet = %packet, "exchange availability changed");
                Ok(())
            }
            _ => Err(BridgeError::unsupported_packet(&self.name, &packet)),
        }
    }

    async fn finish(&mut self) {
        self.end_session(None).await;
    }
}

//! Exchange for the Kerbal Space Program Telemachus websocket API.
//!
//! Telemachus speaks JSON over a websocket.  The bridge is the client:
//!
//! | Panel packet            | Frame sent                    |
//! |-------------------------|-------------------------------|
//! | `DataSubscribeRequest`  | `{"+":["<key>"]}`             |
//! | `DataWrite`             | `{"run":["<key>[<value>]"]}`  |
//! | `CommandBegin` / `Once` | `{"run":["<key>"]}`           |
//! | `CommandEnd`            | nothing                       |
//!
//! Inbound frames are JSON objects of `key: value`; each known key becomes a
//! dataref write for the mapped dataref name.
//!
//! Every connection starts with a `{"rate":<ms>}` frame setting how often
//! the server pushes subscribed values.
//!
//! The first connection is made by [`KerbalTelemachusExchange::connect`] and
//! failing it is fatal.  Once running, a lost connection is retried every
//! `reconnect_interval` and the remembered subscriptions are sent again.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use panelbridge_types::{BridgeError, DatarefValue, Packet, RawValue};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::exchange::{Exchange, Fanout};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default server push interval.
pub const DEFAULT_RATE: Duration = Duration::from_millis(200);

/// Dataref name ↔ Telemachus API key.
pub const DATAREF_KEYS: &[(&str, &str)] = &[
    ("sim/cockpit/sas/actuators/toggle", "f.stage"),
    ("sim/cockpit/sas/state", "v.sasValue"),
    ("sim/cockpit/rcs/state", "v.rcsValue"),
];

pub fn key_for_dataref(name: &str) -> Option<&'static str> {
    DATAREF_KEYS
        .iter()
        .find(|(dataref, _)| *dataref == name)
        .map(|(_, key)| *key)
}

pub fn dataref_for_key(key: &str) -> Option<&'static str> {
    DATAREF_KEYS
        .iter()
        .find(|(_, k)| *k == key)
        .map(|(dataref, _)| *dataref)
}

pub fn rate_frame(rate: Duration) -> String {
    json!({ "rate": rate.as_millis() as u64 }).to_string()
}

pub fn subscribe_frame(key: &str) -> String {
    json!({ "+": [key] }).to_string()
}

pub fn write_frame(key: &str, value: DatarefValue) -> String {
    json!({ "run": [format!("{key}[{value}]")] }).to_string()
}

pub fn run_frame(key: &str) -> String {
    json!({ "run": [key] }).to_string()
}

/// Turn one inbound text frame into dataref writes.
///
/// Keys with no mapping are skipped.  Anything other than a JSON object is a
/// [`BridgeError::ProtocolParse`].
pub fn handle_payload(text: &str, fanout: &Fanout) -> Result<(), BridgeError> {
    let json: Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::ProtocolParse(format!("telemachus payload: {e}")))?;
    let Some(fields) = json.as_object() else {
        return Err(BridgeError::ProtocolParse(format!(
            "telemachus payload is not an object: {text}"
        )));
    };

    for (key, value) in fields {
        let Some(name) = dataref_for_key(key) else {
            debug!(key = %key, "ignoring unmapped telemachus key");
            continue;
        };
        let raw = match value {
            Value::Bool(b) => RawValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => RawValue::Integer(i),
                None => RawValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => RawValue::Text(s.as_str()),
            other => {
                warn!(key = %key, value = %other, "unsupported telemachus value");
                continue;
            }
        };
        fanout.send_dataref_write(name, raw);
    }
    Ok(())
}

/// What the websocket exchange woke up for.
#[derive(Debug)]
pub enum TelemachusActivity {
    Frame(Message),
    Lost(Option<String>),
    Reconnect,
}

/// Exchange talking to a Telemachus websocket server.
pub struct KerbalTelemachusExchange {
    url: String,
    ws: Option<WsStream>,
    reconnect_interval: Duration,
    rate: Duration,
    next_attempt: Instant,
    subscriptions: Vec<&'static str>,
}

impl KerbalTelemachusExchange {
    /// Open the websocket to `url` and ask for updates every `rate`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the handshake or the rate frame
    /// fails.
    pub async fn connect(
        url: impl Into<String>,
        reconnect_interval: Duration,
        rate: Duration,
    ) -> Result<Self, BridgeError> {
        let url = url.into();
        let ws = open(&url, rate).await?;
        info!(url = %url, rate = ?rate, "connected to telemachus");
        Ok(Self {
            url,
            ws: Some(ws),
            reconnect_interval,
            rate,
            next_attempt: Instant::now(),
            subscriptions: Vec::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    async fn send_frame(&mut self, frame: String, fanout: &Fanout) -> Result<(), BridgeError> {
        let Some(ws) = self.ws.as_mut() else {
            return Err(BridgeError::Transport(
                "telemachus websocket not connected".to_string(),
            ));
        };
        debug!(frame = %frame, "sending to telemachus");
        if let Err(e) = ws.send(Message::Text(frame.into())).await {
            warn!(error = %e, "write to telemachus failed");
            self.lost(fanout);
            return Err(BridgeError::Transport(format!("telemachus send: {e}")));
        }
        Ok(())
    }

    fn lost(&mut self, fanout: &Fanout) {
        if self.ws.take().is_some() {
            warn!(url = %self.url, retry_in = ?self.reconnect_interval, "telemachus connection lost");
            fanout.broadcast(Packet::SimulationStop);
            fanout.broadcast(Packet::ExchangeUnavailable);
        }
        self.next_attempt = Instant::now() + self.reconnect_interval;
    }

    async fn reconnect(&mut self, fanout: &Fanout) {
        match open(&self.url, self.rate).await {
            Ok(ws) => {
                info!(url = %self.url, "reconnected to telemachus");
                self.ws = Some(ws);
                for key in self.subscriptions.clone() {
                    if self.send_frame(subscribe_frame(key), fanout).await.is_err() {
                        return;
                    }
                }
                fanout.broadcast(Packet::ExchangeAvailable);
                fanout.broadcast(Packet::SimulationStart);
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "telemachus reconnect failed");
                self.next_attempt = Instant::now() + self.reconnect_interval;
            }
        }
    }

    fn key_for(&self, packet: &Packet) -> Result<&'static str, BridgeError> {
        let name = packet.dataref().map(|d| d.name()).unwrap_or_default();
        key_for_dataref(name).ok_or_else(|| BridgeError::NotFound(name.to_string()))
    }
}

async fn open(url: &str, rate: Duration) -> Result<WsStream, BridgeError> {
    let (mut ws, _response) = connect_async(url)
        .await
        .map_err(|e| BridgeError::Transport(format!("telemachus connect to {url}: {e}")))?;
    ws.send(Message::Text(rate_frame(rate).into()))
        .await
        .map_err(|e| BridgeError::Transport(format!("telemachus rate frame to {url}: {e}")))?;
    Ok(ws)
}

#[async_trait]
impl Exchange for KerbalTelemachusExchange {
    type Activity = TelemachusActivity;

    fn name(&self) -> &str {
        "kerbal_telemachus"
    }

    async fn start(&mut self, fanout: &Fanout) -> Result<(), BridgeError> {
        fanout.broadcast(Packet::ExchangeAvailable);
        fanout.broadcast(Packet::SimulationStart);
        Ok(())
    }

    async fn ready(&mut self) -> TelemachusActivity {
        match self.ws.as_mut() {
            Some(ws) => match ws.next().await {
                Some(Ok(msg)) => TelemachusActivity::Frame(msg),
                Some(Err(e)) => TelemachusActivity::Lost(Some(e.to_string())),
                None => TelemachusActivity::Lost(None),
            },
            None => {
                tokio::time::sleep_until(self.next_attempt).await;
                TelemachusActivity::Reconnect
            }
        }
    }

    async fn handle_activity(&mut self, activity: TelemachusActivity, fanout: &Fanout) {
        match activity {
            TelemachusActivity::Frame(Message::Text(text)) => {
                if let Err(e) = handle_payload(text.as_str(), fanout) {
                    error!(error = %e, "bad telemachus payload");
                }
            }
            TelemachusActivity::Frame(Message::Close(frame)) => {
                debug!(frame = ?frame, "telemachus closed the websocket");
                self.lost(fanout);
            }
            TelemachusActivity::Frame(_) => {}
            TelemachusActivity::Lost(reason) => {
                if let Some(reason) = reason {
                    warn!(error = %reason, "telemachus read failed");
                }
                self.lost(fanout);
            }
            TelemachusActivity::Reconnect => self.reconnect(fanout).await,
        }
    }

    async fn handle_panel_packet(
        &mut self,
        packet: Packet,
        fanout: &Fanout,
    ) -> Result<(), BridgeError> {
        let frame = match &packet {
            Packet::DataSubscribeRequest(_) => {
                let key = self.key_for(&packet)?;
                if !self.subscriptions.contains(&key) {
                    self.subscriptions.push(key);
                }
                if !self.is_connected() {
                    debug!(key, "subscription held until telemachus reconnects");
                    return Ok(());
                }
                subscribe_frame(key)
            }
            Packet::DataWrite(dataref) => {
                let key = self.key_for(&packet)?;
                write_frame(key, dataref.require_value()?)
            }
            Packet::CommandBegin(_) | Packet::CommandOnce(_) => run_frame(self.key_for(&packet)?),
            Packet::CommandEnd(dataref) => {
                debug!(dataref = %dataref.name(), "command end has no telemachus equivalent");
                return Ok(());
            }
            _ => return Err(BridgeError::unsupported_packet(self.name(), &packet)),
        };
        self.send_frame(frame, fanout).await
    }

    async fn finish(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close(None).await {
                debug!(error = %e, "telemachus close error");
            }
        }
        info!(url = %self.url, "telemachus connection closed");
    }
}

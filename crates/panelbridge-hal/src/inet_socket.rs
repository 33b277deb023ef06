//! TCP text panel driver.
//!
//! Panels connect to a listening socket and speak the line protocol parsed
//! by [`parse_panel_line`].  Any number of panels may be connected at once;
//! each gets a reader task that frames its bytes into lines and feeds them,
//! tagged with the connection id, into one [`PollableQueue`] the driver
//! waits on.  Writes are broadcast from the driver task to every peer.
//!
//! A bad line is logged and dropped without touching its connection.  A peer
//! whose write fails, or stalls past [`PEER_WRITE_TIMEOUT`], is dropped
//! without affecting the others.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use panelbridge_middleware::{LineBuffer, PollableQueue};
use panelbridge_types::{BridgeError, DatarefRegistry, Packet};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::PanelDriver;
use crate::text::parse_panel_line;

/// A peer that takes longer than this to accept one line is dropped.
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Something one connection's reader task reported.
#[derive(Debug)]
pub enum ConnectionEvent {
    Line { id: u64, line: String },
    Closed { id: u64, error: Option<io::Error> },
}

/// What the TCP panel driver woke up for.
#[derive(Debug)]
pub enum InetPanelActivity {
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    Connection(ConnectionEvent),
}

struct Peer {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

pub struct InetSocketPanelDriver {
    name: String,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    registry: Arc<DatarefRegistry>,
    events: PollableQueue<ConnectionEvent>,
    peers: BTreeMap<u64, Peer>,
    next_id: u64,
}

impl InetSocketPanelDriver {
    /// Bind the panel listener.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the address cannot be bound.
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        registry: Arc<DatarefRegistry>,
    ) -> Result<Self, BridgeError> {
        let name = name.into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("panel bind error on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!(panel = %name, addr = %local_addr, "socket panel driver listening");
        Ok(Self {
            name,
            listener: Some(listener),
            local_addr,
            registry,
            events: PollableQueue::new(),
            peers: BTreeMap::new(),
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    fn attach(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_lines(id, read_half, self.events.clone()));
        self.peers.insert(
            id,
            Peer {
                addr,
                writer,
                reader,
            },
        );
        info!(panel = %self.name, peer = %addr, "socket panel driver received new connection");
    }

    fn detach(&mut self, id: u64) {
        if let Some(peer) = self.peers.remove(&id) {
            peer.reader.abort();
            info!(panel = %self.name, peer = %peer.addr, "socket panel connection hung up");
        }
    }

    /// Send `line` to every peer, dropping the ones whose write fails.
    async fn broadcast(&mut self, line: &str) {
        let framed = format!("{line}\n");
        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            let sent = write_with_timeout(&mut peer.writer, framed.as_bytes(), PEER_WRITE_TIMEOUT);
            if let Err(e) = sent.await {
                warn!(panel = %self.name, peer = %peer.addr, error = %e, "write to panel failed");
                failed.push(*id);
            }
        }
        for id in failed {
            self.detach(id);
        }
    }

    fn handle_line(&self, id: u64, line: &str, outbound: &PollableQueue<Packet>) {
        let peer = self.peers.get(&id).map(|p| p.addr.to_string()).unwrap_or_default();
        debug!(panel = %self.name, peer = %peer, line, "panel line received");
        match parse_panel_line(line, &self.registry) {
            Ok(packet) => {
                if let Err(e) = outbound.put(packet) {
                    error!(panel = %self.name, error = %e, "outbound queue rejected packet");
                }
            }
            Err(e) => {
                warn!(panel = %self.name, peer = %peer, line, error = %e, "dropping panel line");
            }
        }
    }
}

async fn write_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    limit: Duration,
) -> Result<(), BridgeError> {
    match tokio::time::timeout(limit, writer.write_all(bytes)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BridgeError::Transport(format!(
            "peer did not accept a write within {limit:?}"
        ))),
    }
}

/// Reader task for one connection.
async fn read_lines(id: u64, mut reader: OwnedReadHalf, events: PollableQueue<ConnectionEvent>) {
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 4096];
    let error = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    if events.put(ConnectionEvent::Line { id, line }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => break Some(e),
        }
    };
    let _ = events.put(ConnectionEvent::Closed { id, error });
}

async fn accept(listener: Option<&TcpListener>) -> InetPanelActivity {
    match listener {
        Some(listener) => match listener.accept().await {
            Ok((stream, addr)) => InetPanelActivity::Accepted(stream, addr),
            Err(e) => InetPanelActivity::AcceptFailed(e),
        },
        None => std::future::pending().await,
    }
}

#[async_trait]
impl PanelDriver for InetSocketPanelDriver {
    type Activity = InetPanelActivity;

    fn name(&self) -> &str {
        &self.name
    }

    async fn ready(&mut self) -> InetPanelActivity {
        tokio::select! {
            biased;
            Some(event) = self.events.get() => InetPanelActivity::Connection(event),
            activity = accept(self.listener.as_ref()) => activity,
        }
    }

    async fn handle_activity(
        &mut self,
        activity: InetPanelActivity,
        outbound: &PollableQueue<Packet>,
    ) -> Result<(), BridgeError> {
        match activity {
            InetPanelActivity::Accepted(stream, addr) => self.attach(stream, addr),
            InetPanelActivity::AcceptFailed(e) => {
                return Err(BridgeError::Transport(format!("panel accept error: {e}")));
            }
            InetPanelActivity::Connection(ConnectionEvent::Line { id, line }) => {
                self.handle_line(id, &line, outbound);
            }
            InetPanelActivity::Connection(ConnectionEvent::Closed { id, error }) => {
                if let Some(e) = error {
                    warn!(panel = %self.name, error = %e, "panel connection read failed");
                }
                self.detach(id);
            }
        }
        Ok(())
    }

    async fn handle_inbound_packet(
        &mut self,
        packet: Packet,
        _outbound: &PollableQueue<Packet>,
    ) -> Result<(), BridgeError> {
        let line = match &packet {
            Packet::SimulationStart => "simulation start".to_string(),
            Packet::SimulationStop => "simulation stop".to_string(),
            Packet::DataWrite(dataref) => {
                format!("{} {}", dataref.name(), dataref.require_value()?)
            }
            Packet::ExchangeAvailable | Packet::ExchangeUnavailable => {
                info!(panel = %self.name, packet = %packet, "exchange availability changed");
                return Ok(());
            }
            _ => return Err(BridgeError::unsupported_packet(&self.name, &packet)),
        };
        self.broadcast(&line).await;
        Ok(())
    }

    async fn finish(&mut self) {
        let ids: Vec<u64> = self.peers.keys().copied().collect();
        for id in ids {
            if let Some(mut peer) = self.peers.remove(&id) {
                peer.reader.abort();
                let _ = peer.writer.shutdown().await;
            }
        }
        self.events.close();
        self.listener = None;
        info!(panel = %self.name, addr = %self.local_addr, "socket panel driver closed");
    }
}

//! Line-oriented TCP exchange.
//!
//! The bridge listens; a single simulator plugin connects.  While no
//! simulator is attached the exchange only waits on `accept`, so a second
//! connection attempt queues in the kernel backlog until the first one
//! goes away.
//!
//! | Direction          | Line                          |
//! |--------------------|-------------------------------|
//! | simulator → bridge | `update <name>=<v>,<name>=<v>` |
//! | bridge → simulator | `register <name> <type>`      |
//! | bridge → simulator | `update <name> <value>`       |
//! | bridge → simulator | `command <name> <phase>`      |
//!
//! Subscriptions made while no simulator is attached are remembered and
//! replayed as soon as one connects.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use panelbridge_types::{BridgeError, Dataref, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::exchange::{Exchange, Fanout};
use crate::lines::LineBuffer;

const READ_CHUNK: usize = 4096;

/// What the TCP exchange woke up for.
#[derive(Debug)]
pub enum InetExchangeActivity {
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    Lines(Vec<String>),
    HungUp,
    ReadFailed(io::Error),
}

struct SimConnection {
    stream: TcpStream,
    peer: SocketAddr,
    lines: LineBuffer,
}

/// Exchange speaking the newline text protocol over a TCP listener.
pub struct InetSocketExchange {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    connection: Option<SimConnection>,
    subscriptions: Vec<Dataref>,
}

impl InetSocketExchange {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("exchange bind error on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "exchange listening for simulator");
        Ok(Self {
            listener: Some(listener),
            local_addr,
            connection: None,
            subscriptions: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Datarefs that will be replayed to the next simulator.
    pub fn subscriptions(&self) -> &[Dataref] {
        &self.subscriptions
    }

    async fn attach(&mut self, stream: TcpStream, peer: SocketAddr, fanout: &Fanout) {
        info!(peer = %peer, "simulator connected");
        self.connection = Some(SimConnection {
            stream,
            peer,
            lines: LineBuffer::new(),
        });

        let replay: Vec<String> = self.subscriptions.iter().map(register_line).collect();
        for line in replay {
            if self.send_line(&line, fanout).await.is_err() {
                return;
            }
        }
        if !self.subscriptions.is_empty() {
            debug!(count = self.subscriptions.len(), "replayed subscriptions to simulator");
        }

        fanout.broadcast(Packet::ExchangeAvailable);
        fanout.broadcast(Packet::SimulationStart);
    }

    fn detach(&mut self, fanout: &Fanout) {
        if let Some(conn) = self.connection.take() {
            info!(peer = %conn.peer, "simulator disconnected");
            fanout.broadcast(Packet::SimulationStop);
            fanout.broadcast(Packet::ExchangeUnavailable);
        }
    }

    async fn send_line(&mut self, line: &str, fanout: &Fanout) -> Result<(), BridgeError> {
        let Some(conn) = self.connection.as_mut() else {
            return Err(BridgeError::Transport("no simulator connected".to_string()));
        };
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        match conn.stream.write_all(framed.as_bytes()).await {
            Ok(()) => {
                debug!(peer = %conn.peer, line, "sent to simulator");
                Ok(())
            }
            Err(e) => {
                let peer = conn.peer;
                warn!(peer = %peer, error = %e, "write to simulator failed");
                self.detach(fanout);
                Err(BridgeError::Transport(format!("write to {peer}: {e}")))
            }
        }
    }

    fn remember(&mut self, dataref: &Dataref) {
        if !self.subscriptions.iter().any(|s| s.name() == dataref.name()) {
            self.subscriptions.push(dataref.clone());
        }
    }
}

/// Parse one simulator line and broadcast the writes it carries.
///
/// Malformed pairs are reported after every well-formed pair on the same line
/// has been delivered.
pub fn handle_simulator_line(line: &str, fanout: &Fanout) -> Result<(), BridgeError> {
    let Some(rest) = line.strip_prefix("update ") else {
        debug!(line, "ignoring unrecognised simulator line");
        return Ok(());
    };

    let mut malformed = Vec::new();
    for pair in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                fanout.send_dataref_write(name.trim(), value.trim());
            }
            _ => malformed.push(pair),
        }
    }

    if malformed.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::ProtocolParse(format!(
            "malformed update pair(s): {}",
            malformed.join(", ")
        )))
    }
}

fn register_line(dataref: &Dataref) -> String {
    format!("register {} {}", dataref.name(), dataref.data_type())
}

#[async_trait]
impl Exchange for InetSocketExchange {
    type Activity = InetExchangeActivity;

    fn name(&self) -> &str {
        "inet_socket"
    }

    async fn ready(&mut self) -> InetExchangeActivity {
        match (&mut self.connection, &self.listener) {
            (Some(conn), _) => {
                let mut buf = [0u8; READ_CHUNK];
                match conn.stream.read(&mut buf).await {
                    Ok(0) => InetExchangeActivity::HungUp,
                    Ok(n) => InetExchangeActivity::Lines(conn.lines.push(&buf[..n])),
                    Err(e) => InetExchangeActivity::ReadFailed(e),
                }
            }
            (None, Some(listener)) => match listener.accept().await {
                Ok((stream, peer)) => InetExchangeActivity::Accepted(stream, peer),
                Err(e) => InetExchangeActivity::AcceptFailed(e),
            },
            (None, None) => std::future::pending().await,
        }
    }

    async fn handle_activity(&mut self, activity: InetExchangeActivity, fanout: &Fanout) {
        match activity {
            InetExchangeActivity::Accepted(stream, peer) => self.attach(stream, peer, fanout).await,
            InetExchangeActivity::AcceptFailed(e) => {
                error!(error = %e, "simulator accept error");
            }
            InetExchangeActivity::Lines(lines) => {
                for line in lines {
                    debug!(line = %line, "received from simulator");
                    if let Err(e) = handle_simulator_line(&line, fanout) {
                        error!(line = %line, error = %e, "bad simulator line");
                    }
                }
            }
            InetExchangeActivity::HungUp => self.detach(fanout),
            InetExchangeActivity::ReadFailed(e) => {
                warn!(error = %e, "read from simulator failed");
                self.detach(fanout);
            }
        }
    }

    async fn handle_panel_packet(
        &mut self,
        packet: Packet,
        fanout: &Fanout,
    ) -> Result<(), BridgeError> {
        let line = match &packet {
            Packet::DataSubscribeRequest(dataref) => {
                self.remember(dataref);
                if !self.is_connected() {
                    debug!(dataref = %dataref.name(), "subscription held until a simulator connects");
                    return Ok(());
                }
                register_line(dataref)
            }
            Packet::DataWrite(dataref) => {
                format!("update {} {}", dataref.name(), dataref.require_value()?)
            }
            Packet::CommandBegin(_) | Packet::CommandEnd(_) | Packet::CommandOnce(_) => {
                let Some((dataref, phase)) = packet.command_parts() else {
                    return Err(BridgeError::unsupported_packet(self.name(), &packet));
                };
                format!("command {} {}", dataref.name(), phase)
            }
            _ => return Err(BridgeError::unsupported_packet(self.name(), &packet)),
        };
        self.send_line(&line, fanout).await
    }

    async fn finish(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.stream.shutdown().await {
                debug!(peer = %conn.peer, error = %e, "simulator socket shutdown error");
            }
        }
        self.listener = None;
        info!(addr = %self.local_addr, "exchange socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeRunner;
    use crate::link::{PanelHandle, PanelLink};
    use crate::queue::PollableQueue;
    use crate::shutdown::shutdown_channel;
    use panelbridge_types::{CommandPhase, DatarefRegistry, DatarefType, LifecycleState};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::watch;

    fn fanout_with(inbound: &PollableQueue<Packet>) -> (Arc<DatarefRegistry>, Fanout) {
        let registry = Arc::new(DatarefRegistry::new());
        let mut fanout = Fanout::new(Arc::clone(&registry));
        fanout.add_panel(inbound.clone());
        (registry, fanout)
    }

    #[test]
    fn update_line_broadcasts_one_write_per_pair() {
        let inbound = PollableQueue::new();
        let (registry, fanout) = fanout_with(&inbound);
        registry.register("a", DatarefType::Integer);
        registry.register("b", DatarefType::Float);

        handle_simulator_line("update a=1,b=2.5", &fanout).unwrap();

        assert_eq!(inbound.try_get(), Some(Packet::DataWrite(Dataref::integer("a", 1))));
        assert_eq!(inbound.try_get(), Some(Packet::DataWrite(Dataref::float("b", 2.5))));
        assert!(inbound.is_empty());
    }

    #[test]
    fn malformed_pair_is_reported_after_good_pairs() {
        let inbound = PollableQueue::new();
        let (registry, fanout) = fanout_with(&inbound);
        registry.register("a", DatarefType::Integer);

        let err = handle_simulator_line("update oops,a=7", &fanout).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolParse(_)));
        assert_eq!(inbound.try_get(), Some(Packet::DataWrite(Dataref::integer("a", 7))));
    }

    #[test]
    fn unregistered_names_and_other_lines_are_ignored() {
        let inbound = PollableQueue::new();
        let (_registry, fanout) = fanout_with(&inbound);
        handle_simulator_line("update nobody=1", &fanout).unwrap();
        handle_simulator_line("hello there", &fanout).unwrap();
        assert!(inbound.is_empty());
    }

    /// A panel stand-in that just exposes its queues.
    fn idle_panel() -> (PanelHandle, PanelLink) {
        let link = PanelLink::new();
        let (_state_tx, state_rx) = watch::channel(LifecycleState::Running);
        let worker = link.clone();
        let task = tokio::spawn(async move {
            while let Some(packet) = worker.inbound.get().await {
                if matches!(packet, Packet::Shutdown) {
                    break;
                }
            }
            Ok(())
        });
        (PanelHandle::new("probe", link.clone(), state_rx, task), link)
    }

    async fn next_packet(queue: &PollableQueue<Packet>) -> Packet {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(p) = queue.try_get() {
                    return p;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for packet")
    }

    #[tokio::test]
    async fn simulator_session_over_tcp() {
        let registry = Arc::new(DatarefRegistry::new());
        registry.register("gear", DatarefType::Integer);

        let exchange = InetSocketExchange::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = exchange.local_addr();

        let mut runner = ExchangeRunner::new(exchange, Arc::clone(&registry));
        let (panel, link) = idle_panel();
        runner.add_panel(panel);

        // Subscription before the simulator connects is held and replayed.
        link.outbound
            .put(Packet::DataSubscribeRequest(Dataref::unset("gear", DatarefType::Integer)))
            .unwrap();

        let (trigger, signal) = shutdown_channel();
        let run = tokio::spawn(runner.run(signal));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sim = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = sim.into_split();
        let mut reader = BufReader::new(read_half).lines();

        let first = tokio::time::timeout(Duration::from_secs(2), reader.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_deref(), Some("register gear integer"));

        link.outbound
            .put(Packet::DataWrite(Dataref::integer("gear", 1)))
            .unwrap();
        link.outbound
            .put(Packet::command(Dataref::command("flaps", CommandPhase::Begin), CommandPhase::Begin))
            .unwrap();

        let second = reader.next_line().await.unwrap();
        assert_eq!(second.as_deref(), Some("update gear 1"));
        let third = reader.next_line().await.unwrap();
        assert_eq!(third.as_deref(), Some("command flaps begin"));

        write_half.write_all(b"update gear=0\n").await.unwrap();
        drop(write_half);
        drop(reader);

        trigger.trigger();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn attach_and_detach_broadcast_availability() {
        let inbound = PollableQueue::new();
        let (registry, fanout) = fanout_with(&inbound);
        registry.register("gear", DatarefType::Integer);
        let mut exchange = InetSocketExchange::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = exchange.local_addr();

        let client = tokio::spawn(async move {
            let mut sim = TcpStream::connect(addr).await.unwrap();
            sim.write_all(b"update gear=1\n").await.unwrap();
            sim
        });

        let accepted = exchange.ready().await;
        exchange.handle_activity(accepted, &fanout).await;
        assert!(exchange.is_connected());
        assert_eq!(next_packet(&inbound).await, Packet::ExchangeAvailable);
        assert_eq!(next_packet(&inbound).await, Packet::SimulationStart);

        let sim = client.await.unwrap();
        let activity = exchange.ready().await;
        exchange.handle_activity(activity, &fanout).await;
        assert_eq!(
            next_packet(&inbound).await,
            Packet::DataWrite(Dataref::integer("gear", 1))
        );

        drop(sim);
        let activity = exchange.ready().await;
        exchange.handle_activity(activity, &fanout).await;
        assert!(!exchange.is_connected());
        assert_eq!(next_packet(&inbound).await, Packet::SimulationStop);
        assert_eq!(next_packet(&inbound).await, Packet::ExchangeUnavailable);
    }

    #[tokio::test]
    async fn write_without_simulator_is_a_transport_error() {
        let inbound = PollableQueue::new();
        let (_registry, fanout) = fanout_with(&inbound);
        let mut exchange = InetSocketExchange::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let err = exchange
            .handle_panel_packet(Packet::DataWrite(Dataref::integer("gear", 1)), &fanout)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));

        let err = exchange
            .handle_panel_packet(Packet::SimulationStart, &fanout)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedPacket { .. }));
    }
}

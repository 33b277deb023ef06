//! The abstract exchange and its event loop.
//!
//! An [`Exchange`] owns the simulator connection.  The [`ExchangeRunner`]
//! drives it: one `tokio::select!` waits on the shutdown signal, on every
//! panel's outbound queue and on the exchange's own simulator readiness.
//!
//! * A packet from any panel is handed to
//!   [`Exchange::handle_panel_packet`], which translates it to the
//!   simulator's wire format.
//! * Simulator traffic is handed to [`Exchange::handle_activity`], which
//!   broadcasts the resulting packets to every panel through the [`Fanout`].
//!
//! Queue-sourced packets are drained before the next simulator read.  A
//! failure while handling one packet is logged and the loop carries on.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::select_all;
use panelbridge_types::{BridgeError, DatarefRegistry, LifecycleState, Packet, RawValue};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::link::PanelHandle;
use crate::queue::PollableQueue;
use crate::shutdown::ShutdownSignal;

/// Simulator-facing half of the bridge.
///
/// # Contract
///
/// * `ready` waits for the next piece of simulator-side activity.  It is
///   raced against the panel queues inside `select!`, so it must be
///   cancel-safe: dropping the future must not lose data.
/// * `handle_activity` reacts to that activity, usually by broadcasting
///   packets through the [`Fanout`].
/// * `handle_panel_packet` translates one panel packet into simulator wire
///   format and sends it.
#[async_trait]
pub trait Exchange: Send {
    /// What `ready` resolves to.
    type Activity: Send;

    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Called once before the loop starts.  An error here is fatal.
    async fn start(&mut self, _fanout: &Fanout) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn ready(&mut self) -> Self::Activity;

    async fn handle_activity(&mut self, activity: Self::Activity, fanout: &Fanout);

    async fn handle_panel_packet(
        &mut self,
        packet: Packet,
        fanout: &Fanout,
    ) -> Result<(), BridgeError>;

    /// Release the simulator transport.  Called after every panel stopped.
    async fn finish(&mut self) {}
}

/// Broadcast side of the exchange: every panel's inbound queue plus the
/// shared dataref registry.
#[derive(Clone, Debug)]
pub struct Fanout {
    inbound: Vec<PollableQueue<Packet>>,
    registry: Arc<DatarefRegistry>,
}

impl Fanout {
    pub fn new(registry: Arc<DatarefRegistry>) -> Self {
        Self {
            inbound: Vec::new(),
            registry,
        }
    }

    pub fn add_panel(&mut self, inbound: PollableQueue<Packet>) {
        self.inbound.push(inbound);
    }

    pub fn registry(&self) -> &DatarefRegistry {
        &self.registry
    }

    /// Put `packet` on every panel's inbound queue.
    ///
    /// No per-subscriber filtering happens here; each panel decides what it
    /// cares about.
    pub fn broadcast(&self, packet: Packet) {
        debug!(packet = %packet, panels = self.inbound.len(), "sending packet to panel drivers");
        for queue in &self.inbound {
            if let Err(e) = queue.put(packet.clone()) {
                debug!(packet = %packet, error = %e, "panel queue closed, packet dropped");
            }
        }
    }

    /// Build a dataref write through the registry and broadcast it.
    ///
    /// Writes for unregistered names or unsupported types are discarded with
    /// a warning.  Returns whether the write was broadcast.
    pub fn send_dataref_write<'a>(&self, name: &str, raw: impl Into<RawValue<'a>>) -> bool {
        match self.registry.factory(name, raw) {
            Ok(dataref) => {
                self.broadcast(Packet::DataWrite(dataref));
                true
            }
            Err(BridgeError::UnknownDataref(_)) => {
                warn!(dataref = name, "discarding unregistered dataref write");
                false
            }
            Err(e @ BridgeError::UnsupportedType { .. }) => {
                warn!(dataref = name, error = %e, "discarding dataref write because of unsupported type");
                false
            }
            Err(e) => {
                warn!(dataref = name, error = %e, "discarding malformed dataref write");
                false
            }
        }
    }
}

/// Runs an [`Exchange`] together with the panels it serves.
pub struct ExchangeRunner<E: Exchange> {
    exchange: E,
    panels: Vec<PanelHandle>,
    fanout: Fanout,
    state: watch::Sender<LifecycleState>,
}

impl<E: Exchange> ExchangeRunner<E> {
    pub fn new(exchange: E, registry: Arc<DatarefRegistry>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            exchange,
            panels: Vec::new(),
            fanout: Fanout::new(registry),
            state,
        }
    }

    /// Attach a running panel worker.
    pub fn add_panel(&mut self, handle: PanelHandle) {
        self.fanout.add_panel(handle.link().inbound.clone());
        self.panels.push(handle);
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    pub fn panels(&self) -> &[PanelHandle] {
        &self.panels
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    /// Observe the loop's lifecycle state.
    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` fires, then stop every panel and release the
    /// simulator transport.
    ///
    /// # Errors
    ///
    /// Only a failing [`Exchange::start`] is returned; the panels are still
    /// shut down first.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<(), BridgeError> {
        self.state.send_replace(LifecycleState::Running);
        info!(exchange = %self.exchange.name(), panels = self.panels.len(), "exchange running");

        if let Err(e) = self.exchange.start(&self.fanout).await {
            error!(exchange = %self.exchange.name(), error = %e, "exchange failed to start");
            self.shutdown().await;
            return Err(e);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!(exchange = %self.exchange.name(), "shutdown requested");
                    break;
                }
                next = next_panel_packet(&self.panels) => {
                    if let Some((index, packet)) = next {
                        self.dispatch(index, packet).await;
                        self.drain_panels().await;
                    }
                }
                activity = self.exchange.ready() => {
                    self.exchange.handle_activity(activity, &self.fanout).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn dispatch(&mut self, index: usize, packet: Packet) {
        let panel = self.panels.get(index).map(|p| p.name().to_string()).unwrap_or_default();
        debug!(panel = %panel, packet = %packet, "exchange handling panel packet");
        let kind = packet.kind();
        if let Err(e) = self.exchange.handle_panel_packet(packet, &self.fanout).await {
            error!(
                exchange = %self.exchange.name(),
                panel = %panel,
                packet = kind,
                error = %e,
                "exchange failed to handle panel packet"
            );
        }
    }

    async fn drain_panels(&mut self) {
        loop {
            let mut drained_any = false;
            for index in 0..self.panels.len() {
                let next = self.panels[index].link().outbound.try_get();
                if let Some(packet) = next {
                    drained_any = true;
                    self.dispatch(index, packet).await;
                }
            }
            if !drained_any {
                break;
            }
        }
    }

    async fn shutdown(&mut self) {
        self.state.send_replace(LifecycleState::ShuttingDown);
        info!(exchange = %self.exchange.name(), "shutting down panel drivers");
        self.fanout.broadcast(Packet::Shutdown);
        for panel in self.panels.drain(..) {
            panel.join().await;
        }
        debug!("panel drivers shut down successfully");
        self.exchange.finish().await;
        self.state.send_replace(LifecycleState::Stopped);
        info!(exchange = %self.exchange.name(), "shutdown successful");
    }
}

/// Wait for the next packet on any open panel outbound queue.
///
/// Pending forever when no panel queue is open, so a loop without panels
/// still serves the simulator and the shutdown signal.
async fn next_panel_packet(panels: &[PanelHandle]) -> Option<(usize, Packet)> {
    let gets: Vec<_> = panels
        .iter()
        .enumerate()
        .filter(|(_, panel)| !panel.link().outbound.is_closed())
        .map(|(index, panel)| {
            let outbound = &panel.link().outbound;
            Box::pin(async move { (index, outbound.get().await) })
        })
        .collect();
    if gets.is_empty() {
        return std::future::pending().await;
    }
    let ((index, packet), _, _) = select_all(gets).await;
    packet.map(|packet| (index, packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PanelLink;
    use crate::shutdown::shutdown_channel;
    use panelbridge_types::{Dataref, DatarefType};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Exchange whose simulator is an mpsc channel of raw `(name, value)`
    /// updates, recording every panel packet it is handed.
    struct RecordingExchange {
        sim_rx: mpsc::UnboundedReceiver<(String, String)>,
        seen: mpsc::UnboundedSender<Packet>,
        finished: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Exchange for RecordingExchange {
        type Activity = Option<(String, String)>;

        fn name(&self) -> &str {
            "recording"
        }

        async fn ready(&mut self) -> Self::Activity {
            self.sim_rx.recv().await
        }

        async fn handle_activity(&mut self, activity: Self::Activity, fanout: &Fanout) {
            match activity {
                Some((name, value)) => {
                    fanout.send_dataref_write(&name, value.as_str());
                }
                None => std::future::pending::<()>().await,
            }
        }

        async fn handle_panel_packet(
            &mut self,
            packet: Packet,
            _fanout: &Fanout,
        ) -> Result<(), BridgeError> {
            if matches!(packet, Packet::SimulationStop) {
                return Err(BridgeError::unsupported_packet("recording", &packet));
            }
            let _ = self.seen.send(packet);
            Ok(())
        }

        async fn finish(&mut self) {
            let _ = self.finished.send(());
        }
    }

    /// A stand-in panel worker: forwards everything it receives to a channel
    /// and stops on Shutdown.
    fn spawn_fake_panel(name: &str) -> (PanelHandle, mpsc::UnboundedReceiver<Packet>) {
        let link = PanelLink::new();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Running);
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_link = link.clone();
        let task = tokio::spawn(async move {
            while let Some(packet) = worker_link.inbound.get().await {
                let stop = matches!(packet, Packet::Shutdown);
                let _ = tx.send(packet);
                if stop {
                    break;
                }
            }
            state_tx.send_replace(LifecycleState::Stopped);
            worker_link.close();
            Ok(())
        });
        (PanelHandle::new(name, link, state_rx, task), rx)
    }

    struct Harness {
        registry: Arc<DatarefRegistry>,
        sim_tx: mpsc::UnboundedSender<(String, String)>,
        seen_rx: mpsc::UnboundedReceiver<Packet>,
        finished_rx: mpsc::UnboundedReceiver<()>,
        runner: ExchangeRunner<RecordingExchange>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(DatarefRegistry::new());
        let (sim_tx, sim_rx) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let exchange = RecordingExchange {
            sim_rx,
            seen: seen_tx,
            finished: finished_tx,
        };
        let runner = ExchangeRunner::new(exchange, Arc::clone(&registry));
        Harness {
            registry,
            sim_tx,
            seen_rx,
            finished_rx,
            runner,
        }
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn panel_packets_reach_the_exchange_in_order() {
        let mut h = harness();
        let (panel, _panel_rx) = spawn_fake_panel("a");
        let outbound = panel.link().outbound.clone();
        h.runner.add_panel(panel);

        let (trigger, signal) = shutdown_channel();
        let run = tokio::spawn(h.runner.run(signal));

        outbound.put(Packet::DataWrite(Dataref::integer("gear", 1))).unwrap();
        outbound.put(Packet::DataWrite(Dataref::integer("gear", 0))).unwrap();

        assert_eq!(recv(&mut h.seen_rx).await, Packet::DataWrite(Dataref::integer("gear", 1)));
        assert_eq!(recv(&mut h.seen_rx).await, Packet::DataWrite(Dataref::integer("gear", 0)));

        trigger.trigger();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_packet_does_not_stop_the_loop() {
        let mut h = harness();
        let (panel, _panel_rx) = spawn_fake_panel("a");
        let outbound = panel.link().outbound.clone();
        h.runner.add_panel(panel);

        let (trigger, signal) = shutdown_channel();
        let run = tokio::spawn(h.runner.run(signal));

        outbound.put(Packet::SimulationStop).unwrap();
        outbound.put(Packet::SimulationStart).unwrap();
        assert_eq!(recv(&mut h.seen_rx).await, Packet::SimulationStart);

        trigger.trigger();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn simulator_writes_fan_out_to_every_panel() {
        let mut h = harness();
        h.registry.register("alt", DatarefType::Float);
        let (panel_a, mut rx_a) = spawn_fake_panel("a");
        let (panel_b, mut rx_b) = spawn_fake_panel("b");
        h.runner.add_panel(panel_a);
        h.runner.add_panel(panel_b);

        let (trigger, signal) = shutdown_channel();
        let run = tokio::spawn(h.runner.run(signal));

        // Unregistered names are discarded; the registered one goes out.
        h.sim_tx.send(("unknown".into(), "1".into())).unwrap();
        h.sim_tx.send(("alt".into(), "1500.5".into())).unwrap();

        let expected = Packet::DataWrite(Dataref::float("alt", 1500.5));
        assert_eq!(recv(&mut rx_a).await, expected);
        assert_eq!(recv(&mut rx_b).await, expected);

        trigger.trigger();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_reaches_panels_and_finishes_exchange() {
        let mut h = harness();
        let (panel, mut panel_rx) = spawn_fake_panel("a");
        h.runner.add_panel(panel);
        let mut state = h.runner.state_watch();

        let (trigger, signal) = shutdown_channel();
        let run = tokio::spawn(h.runner.run(signal));
        state
            .wait_for(|s| *s == LifecycleState::Running)
            .await
            .unwrap();

        trigger.trigger();
        assert_eq!(recv(&mut panel_rx).await, Packet::Shutdown);
        recv(&mut h.finished_rx).await;
        run.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }

    #[test]
    fn send_dataref_write_reports_discards() {
        let registry = Arc::new(DatarefRegistry::new());
        registry.register("stage", DatarefType::Command);
        let mut fanout = Fanout::new(Arc::clone(&registry));
        let inbound = PollableQueue::new();
        fanout.add_panel(inbound.clone());

        assert!(!fanout.send_dataref_write("missing", "1"));
        assert!(!fanout.send_dataref_write("stage", 4.5_f64));
        assert!(inbound.is_empty());

        registry.register("gear", DatarefType::Integer);
        assert!(fanout.send_dataref_write("gear", "1"));
        assert_eq!(
            inbound.try_get(),
            Some(Packet::DataWrite(Dataref::integer("gear", 1)))
        );
    }
}

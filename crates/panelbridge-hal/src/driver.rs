//! The abstract panel driver and the worker loop that runs it.
//!
//! A [`PanelDriver`] owns the hardware-facing endpoint of one panel.  The
//! [`PanelWorker`] runs it on its own task and multiplexes, in one
//! `tokio::select!`:
//!
//! 1. the inbound queue (exchange → driver), always drained first;
//! 2. the driver's transport readiness ([`PanelDriver::ready`]).
//!
//! | State          | Entered when                                   |
//! |----------------|------------------------------------------------|
//! | `Idle`         | worker constructed                             |
//! | `Running`      | `run` starts                                   |
//! | `ShuttingDown` | a `Shutdown` packet is taken off the inbound queue |
//! | `Stopped`      | transport released, queues closed              |

use async_trait::async_trait;
use panelbridge_middleware::{PanelHandle, PanelLink, PollableQueue};
use panelbridge_types::{BridgeError, LifecycleState, Packet};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span};

/// Hardware-facing half of the bridge.
///
/// `ready` is raced against the inbound queue and must be cancel-safe.
/// Errors returned by the handlers are logged by the worker and never stop
/// it.
#[async_trait]
pub trait PanelDriver: Send + 'static {
    type Activity: Send;

    fn name(&self) -> &str;

    /// Called once when the worker starts.  An error here stops the worker.
    async fn start(&mut self, _outbound: &PollableQueue<Packet>) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn ready(&mut self) -> Self::Activity;

    async fn handle_activity(
        &mut self,
        activity: Self::Activity,
        outbound: &PollableQueue<Packet>,
    ) -> Result<(), BridgeError>;

    async fn handle_inbound_packet(
        &mut self,
        packet: Packet,
        outbound: &PollableQueue<Packet>,
    ) -> Result<(), BridgeError>;

    /// Release every transport resource.  Called once before the worker exits.
    async fn finish(&mut self) {}
}

/// Runs one [`PanelDriver`] until it receives `Shutdown`.
pub struct PanelWorker<D: PanelDriver> {
    driver: D,
    link: PanelLink,
    state: watch::Sender<LifecycleState>,
}

impl<D: PanelDriver> PanelWorker<D> {
    pub fn new(driver: D) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            driver,
            link: PanelLink::new(),
            state,
        }
    }

    pub fn link(&self) -> &PanelLink {
        &self.link
    }

    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Spawn the worker on the runtime, inside a `panel` span.
    pub fn spawn(self) -> PanelHandle {
        let name = self.driver.name().to_string();
        let link = self.link.clone();
        let state = self.state_watch();
        let span = info_span!("panel", panel = %name);
        let task = tokio::spawn(self.run().instrument(span));
        PanelHandle::new(name, link, state, task)
    }

    /// Drive the panel until a `Shutdown` packet arrives or the inbound
    /// queue is closed.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        self.state.send_replace(LifecycleState::Running);
        info!(panel = %self.driver.name(), "panel driver running");

        let started = self.driver.start(&self.link.outbound).await;
        if let Err(e) = started {
            error!(panel = %self.driver.name(), error = %e, "panel driver failed to start");
            self.stop().await;
            return Err(e);
        }

        loop {
            tokio::select! {
                biased;
                packet = self.link.inbound.get() => {
                    let Some(packet) = packet else {
                        debug!(panel = %self.driver.name(), "inbound queue closed");
                        break;
                    };
                    if !self.dispatch(packet).await || !self.drain_inbound().await {
                        break;
                    }
                }
                activity = self.driver.ready() => {
                    let handled = self.driver.handle_activity(activity, &self.link.outbound).await;
                    if let Err(e) = handled {
                        error!(panel = %self.driver.name(), error = %e, "panel transport error");
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Handle one inbound packet.  Returns `false` once shutdown was asked for.
    async fn dispatch(&mut self, packet: Packet) -> bool {
        if matches!(packet, Packet::Shutdown) {
            info!(panel = %self.driver.name(), "shutdown packet received");
            return false;
        }
        debug!(panel = %self.driver.name(), packet = %packet, "panel driver received packet");
        let kind = packet.kind();
        if let Err(e) = self.driver.handle_inbound_packet(packet, &self.link.outbound).await {
            error!(panel = %self.driver.name(), packet = kind, error = %e, "panel driver failed to handle packet");
        }
        true
    }

    async fn drain_inbound(&mut self) -> bool {
        while let Some(packet) = self.link.inbound.try_get() {
            if !self.dispatch(packet).await {
                return false;
            }
        }
        true
    }

    async fn stop(&mut self) {
        self.state.send_replace(LifecycleState::ShuttingDown);
        self.driver.finish().await;
        self.link.close();
        self.state.send_replace(LifecycleState::Stopped);
        info!(panel = %self.driver.name(), "panel driver stopped");
    }
}

//! Queue pair joining one panel driver to the exchange.

use panelbridge_types::{BridgeError, LifecycleState, Packet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::queue::PollableQueue;

/// The two queues shared by a panel driver and the exchange.
///
/// * `inbound` – exchange → driver.
/// * `outbound` – driver → exchange.
#[derive(Clone, Debug, Default)]
pub struct PanelLink {
    pub inbound: PollableQueue<Packet>,
    pub outbound: PollableQueue<Packet>,
}

impl PanelLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close both directions.  Used by a worker once it has stopped.
    pub fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

/// Exchange-side handle on a running panel worker.
pub struct PanelHandle {
    name: String,
    link: PanelLink,
    state: watch::Receiver<LifecycleState>,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl PanelHandle {
    pub fn new(
        name: impl Into<String>,
        link: PanelLink,
        state: watch::Receiver<LifecycleState>,
        task: JoinHandle<Result<(), BridgeError>>,
    ) -> Self {
        Self {
            name: name.into(),
            link,
            state,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> &PanelLink {
        &self.link
    }

    /// Latest lifecycle state reported by the worker.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait for the worker to finish, logging how it ended.
    pub async fn join(self) {
        match self.task.await {
            Ok(Ok(())) => debug!(panel = %self.name, "panel worker finished"),
            Ok(Err(e)) => error!(panel = %self.name, error = %e, "panel worker failed"),
            Err(e) => error!(panel = %self.name, error = %e, "panel worker panicked or was cancelled"),
        }
    }
}

//! Builds the panel drivers and the exchange named by a [`Config`].
//!
//! Every transport is opened before any worker starts, so a bad bind
//! address, an unreachable Telemachus server or a missing Teensy aborts
//! startup instead of leaving a half-running bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use panelbridge_hal::teensy::HidBackend;
use panelbridge_hal::{InetSocketPanelDriver, PanelWorker, TeensyConfig, TeensyPanelDriver};
use panelbridge_middleware::{
    ExchangeRunner, InetSocketExchange, KerbalTelemachusExchange, PanelHandle, ShutdownSignal,
};
use panelbridge_types::{BridgeError, DatarefRegistry, LifecycleState};
use tokio::sync::watch;
use tracing::info;

use crate::config::{Config, ExchangeConfig, PanelConfig};

/// A panel driver whose transport is open but whose worker is not running.
enum BuiltPanel {
    InetSocket(InetSocketPanelDriver),
    Teensy(TeensyPanelDriver),
}

impl BuiltPanel {
    fn spawn(self) -> PanelHandle {
        match self {
            BuiltPanel::InetSocket(driver) => PanelWorker::new(driver).spawn(),
            BuiltPanel::Teensy(driver) => PanelWorker::new(driver).spawn(),
        }
    }
}

enum Runner {
    InetSocket(ExchangeRunner<InetSocketExchange>),
    Telemachus(ExchangeRunner<KerbalTelemachusExchange>),
}

/// A fully wired bridge, ready to run.
pub struct Bridge {
    runner: Runner,
    panel_addrs: Vec<(String, SocketAddr)>,
}

impl Bridge {
    /// Address the simulator should connect to, for the socket exchange.
    pub fn exchange_addr(&self) -> Option<SocketAddr> {
        match &self.runner {
            Runner::InetSocket(runner) => Some(runner.exchange().local_addr()),
            Runner::Telemachus(_) => None,
        }
    }

    /// Listening address of every socket panel, by panel name.
    pub fn panel_addrs(&self) -> &[(String, SocketAddr)] {
        &self.panel_addrs
    }

    pub fn panel_count(&self) -> usize {
        match &self.runner {
            Runner::InetSocket(runner) => runner.panels().len(),
            Runner::Telemachus(runner) => runner.panels().len(),
        }
    }

    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        match &self.runner {
            Runner::InetSocket(runner) => runner.state_watch(),
            Runner::Telemachus(runner) => runner.state_watch(),
        }
    }

    /// Run the exchange loop until `shutdown` fires and every panel stopped.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), BridgeError> {
        match self.runner {
            Runner::InetSocket(runner) => runner.run(shutdown).await,
            Runner::Telemachus(runner) => runner.run(shutdown).await,
        }
    }
}

/// Turns a [`Config`] into a [`Bridge`].
pub struct Wiring {
    config: Config,
    registry: Arc<DatarefRegistry>,
    hid_backend: Option<Arc<dyn HidBackend>>,
}

impl Wiring {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(DatarefRegistry::new()),
            hid_backend: None,
        }
    }

    /// Use `backend` for every Teensy panel instead of the host USB stack.
    pub fn with_hid_backend(mut self, backend: Arc<dyn HidBackend>) -> Self {
        self.hid_backend = Some(backend);
        self
    }

    /// Open every transport, then start the panel workers.
    ///
    /// # Errors
    ///
    /// The first transport that fails to open; nothing is left running.
    pub async fn build(mut self) -> Result<Bridge, BridgeError> {
        let mut built = Vec::with_capacity(self.config.panels.len());
        let mut panel_addrs = Vec::new();
        for panel in &self.config.panels {
            let name = panel.name().to_string();
            match panel {
                PanelConfig::InetSocket { bind, .. } => {
                    let driver =
                        InetSocketPanelDriver::bind(&name, *bind, Arc::clone(&self.registry))
                            .await?;
                    panel_addrs.push((name, driver.local_addr()));
                    built.push(BuiltPanel::InetSocket(driver));
                }
                PanelConfig::Teensy {
                    vid,
                    pid,
                    usage,
                    usage_page,
                    ..
                } => {
                    let config = TeensyConfig {
                        vendor_id: *vid,
                        product_id: *pid,
                        usage: *usage,
                        usage_page: *usage_page,
                    };
                    let backend = match &self.hid_backend {
                        Some(backend) => Arc::clone(backend),
                        None => {
                            let backend = host_hid_backend()?;
                            self.hid_backend = Some(Arc::clone(&backend));
                            backend
                        }
                    };
                    let driver =
                        TeensyPanelDriver::new(name, backend, config, Arc::clone(&self.registry))?;
                    built.push(BuiltPanel::Teensy(driver));
                }
            }
        }

        let runner = match &self.config.exchange {
            ExchangeConfig::InetSocket { bind } => {
                let exchange = InetSocketExchange::bind(*bind).await?;
                let mut runner = ExchangeRunner::new(exchange, Arc::clone(&self.registry));
                for panel in built {
                    runner.add_panel(panel.spawn());
                }
                Runner::InetSocket(runner)
            }
            ExchangeConfig::Telemachus {
                url,
                reconnect_secs,
                rate_ms,
            } => {
                let exchange = KerbalTelemachusExchange::connect(
                    url,
                    Duration::from_secs(*reconnect_secs),
                    Duration::from_millis(*rate_ms),
                )
                .await?;
                let mut runner = ExchangeRunner::new(exchange, Arc::clone(&self.registry));
                for panel in built {
                    runner.add_panel(panel.spawn());
                }
                Runner::Telemachus(runner)
            }
        };

        let bridge = Bridge {
            runner,
            panel_addrs,
        };
        info!(panels = bridge.panel_count(), "bridge wired");
        Ok(bridge)
    }
}

#[cfg(feature = "hidapi")]
fn host_hid_backend() -> Result<Arc<dyn HidBackend>, BridgeError> {
    Ok(Arc::new(panelbridge_hal::teensy::HidApiBackend::new()?))
}

#[cfg(not(feature = "hidapi"))]
fn host_hid_backend() -> Result<Arc<dyn HidBackend>, BridgeError> {
    Err(BridgeError::Config(
        "teensy panels need the `hidapi` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelbridge_hal::SimHidBackend;
    use panelbridge_hal::teensy::frame::{
        PACKET_REGISTER, SIMULATION_START_FRAME, TAG_INTEGER,
    };
    use panelbridge_middleware::shutdown_channel;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(3);

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn inet_config(panels: Vec<PanelConfig>) -> Config {
        Config {
            exchange: ExchangeConfig::InetSocket { bind: local() },
            panels,
        }
    }

    fn teensy_panel() -> PanelConfig {
        let defaults = TeensyConfig::default();
        PanelConfig::Teensy {
            name: None,
            vid: defaults.vendor_id,
            pid: defaults.product_id,
            usage: defaults.usage,
            usage_page: defaults.usage_page,
        }
    }

    async fn read_until(reader: &mut BufReader<OwnedReadHalf>, wanted: &str) {
        let found = timeout(WAIT, async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await.unwrap();
                assert!(n > 0, "connection closed before {wanted:?}");
                if line.trim_end() == wanted {
                    return;
                }
            }
        })
        .await;
        assert!(found.is_ok(), "timed out waiting for {wanted:?}");
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let ok = timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(ok.is_ok(), "condition not reached");
    }

    #[tokio::test]
    async fn socket_panel_and_socket_simulator_exchange_traffic() {
        let config = inet_config(vec![PanelConfig::InetSocket {
            name: Some("overhead".to_string()),
            bind: local(),
        }]);
        let bridge = Wiring::new(config).build().await.unwrap();
        let exchange_addr = bridge.exchange_addr().unwrap();
        let (panel_name, panel_addr) = bridge.panel_addrs()[0].clone();
        assert_eq!(panel_name, "overhead");

        let mut state = bridge.state_watch();
        let (trigger, signal) = shutdown_channel();
        let running = tokio::spawn(bridge.run(signal));

        let (panel_read, mut panel_write) = TcpStream::connect(panel_addr).await.unwrap().into_split();
        let mut panel_read = BufReader::new(panel_read);
        panel_write.write_all(b"register gear integer\n").await.unwrap();

        let (sim_read, mut sim_write) = TcpStream::connect(exchange_addr).await.unwrap().into_split();
        let mut sim_read = BufReader::new(sim_read);
        read_until(&mut sim_read, "register gear integer").await;

        sim_write.write_all(b"update gear=1\n").await.unwrap();
        read_until(&mut panel_read, "gear 1").await;

        panel_write.write_all(b"write gear 0\n").await.unwrap();
        read_until(&mut sim_read, "update gear 0").await;

        trigger.trigger();
        let result = timeout(WAIT, running).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(*state.borrow_and_update(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn teensy_panel_follows_simulator_session() {
        let backend = SimHidBackend::new();
        let bridge = Wiring::new(inet_config(vec![teensy_panel()]))
            .with_hid_backend(Arc::new(backend.clone()))
            .build()
            .await
            .unwrap();
        assert_eq!(bridge.panel_count(), 1);
        assert!(bridge.panel_addrs().is_empty());
        let exchange_addr = bridge.exchange_addr().unwrap();

        let (trigger, signal) = shutdown_channel();
        let running = tokio::spawn(bridge.run(signal));
        assert!(!backend.is_open());

        let (sim_read, mut sim_write) = TcpStream::connect(exchange_addr).await.unwrap().into_split();
        let mut sim_read = BufReader::new(sim_read);
        wait_for(|| {
            backend
                .written()
                .iter()
                .any(|r| r.starts_with(&SIMULATION_START_FRAME))
        })
        .await;

        let mut register = vec![0, PACKET_REGISTER, 7, 0, TAG_INTEGER, 0];
        register.extend_from_slice(b"gear");
        register[0] = register.len() as u8;
        backend.inject_report(&register);
        read_until(&mut sim_read, "register gear integer").await;

        sim_write.write_all(b"update gear=1\n").await.unwrap();
        let expected = [10u8, 0x02, 7, 0, TAG_INTEGER, 0, 1, 0, 0, 0];
        wait_for(|| backend.written().iter().any(|r| r.starts_with(&expected))).await;

        trigger.trigger();
        let result = timeout(WAIT, running).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!backend.is_open());
    }

    #[tokio::test]
    async fn missing_teensy_aborts_startup() {
        let result = Wiring::new(inet_config(vec![teensy_panel()]))
            .with_hid_backend(Arc::new(SimHidBackend::absent()))
            .build()
            .await;
        assert!(matches!(result, Err(BridgeError::DeviceNotFound(_))));
    }

    #[cfg(not(feature = "hidapi"))]
    #[tokio::test]
    async fn teensy_without_usb_support_is_a_config_error() {
        let result = Wiring::new(inet_config(vec![teensy_panel()])).build().await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_telemachus_aborts_startup() {
        let vacant = tokio::net::TcpListener::bind(local()).await.unwrap();
        let addr = vacant.local_addr().unwrap();
        drop(vacant);

        let config = Config {
            exchange: ExchangeConfig::Telemachus {
                url: format!("ws://{addr}/datalink"),
                reconnect_secs: 5,
                rate_ms: 200,
            },
            panels: vec![PanelConfig::InetSocket {
                name: None,
                bind: local(),
            }],
        };
        let result = Wiring::new(config).build().await;
        assert!(matches!(result, Err(BridgeError::Transport(_))));
    }

    #[tokio::test]
    async fn occupied_exchange_port_aborts_startup() {
        let taken = tokio::net::TcpListener::bind(local()).await.unwrap();
        let config = Config {
            exchange: ExchangeConfig::InetSocket {
                bind: taken.local_addr().unwrap(),
            },
            panels: Vec::new(),
        };
        let result = Wiring::new(config).build().await;
        assert!(matches!(result, Err(BridgeError::Transport(_))));
    }
}

//! Bluetooth Service Module
//!
//! Runs the [`LinkSession`] on one tokio task. Caller commands, transport
//! callbacks and the operation watchdog are all funnelled into that task,
//! so the session state has a single writer no matter which thread the
//! platform stack calls back on.

use crate::domain::models::{
    CharacteristicId, DescriptorId, DeviceIdentity, LinkState, ScannedDevice, SessionEvent,
};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::protocol::Rgb;
use crate::infrastructure::bluetooth::scanner::DiscoveryScanner;
use crate::infrastructure::bluetooth::session::{LinkSession, SessionError};
use crate::infrastructure::bluetooth::transport::{BleAdapter, GattService, LinkEvent, ScanFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How often the in-flight operation is checked against its timeout
const WATCHDOG_TICK: Duration = Duration::from_millis(250);

/// Poll interval of [`LinkHandle::wait_idle`]
const IDLE_POLL: Duration = Duration::from_millis(20);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands understood by the link task
enum LinkCommand {
    Connect {
        address: String,
        name: Option<String>,
        reply: Reply<()>,
    },
    Disconnect(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
    CanConnect(oneshot::Sender<bool>),
    State(oneshot::Sender<LinkState>),
    Device(oneshot::Sender<Option<DeviceIdentity>>),
    Services(oneshot::Sender<Vec<GattService>>),
    Read {
        target: CharacteristicId,
        reply: Reply<()>,
    },
    Write {
        target: CharacteristicId,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    ReadDescriptor {
        target: DescriptorId,
        reply: Reply<()>,
    },
    WriteDescriptor {
        target: DescriptorId,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    ReadRssi(Reply<()>),
    EnableNotifications {
        target: CharacteristicId,
        reply: Reply<()>,
    },
    EnableUartNotifications(Reply<()>),
    SendData {
        target: CharacteristicId,
        payload: Vec<u8>,
        with_checksum: bool,
        reply: Reply<()>,
    },
    SendText {
        text: String,
        reply: Reply<()>,
    },
    SendColor {
        color: Rgb,
        reply: Reply<()>,
    },
    PendingOperations(oneshot::Sender<usize>),
    ClearQueue(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Owner of the session task
pub struct LinkService {
    session: LinkSession,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    transport_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkService {
    /// Spawn the link task. Session events are delivered, in order, on
    /// the returned receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        adapter: Option<Arc<dyn BleAdapter>>,
        settings: LinkSettings,
    ) -> (LinkHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let service = Self {
            session: LinkSession::new(adapter, settings, transport_tx, event_tx),
            commands,
            transport_rx,
        };
        tokio::spawn(service.run());

        (LinkHandle { tx: cmd_tx }, event_rx)
    }

    async fn run(mut self) {
        info!("Link service started");
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                Some(event) = self.transport_rx.recv() => {
                    self.session.handle_event(event);
                }
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Shutdown(reply)) => {
                        self.session.clear_queue();
                        self.session.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("All link handles dropped");
                        self.session.close();
                        break;
                    }
                },
                _ = watchdog.tick() => {
                    self.session.check_timeouts(Instant::now());
                }
            }
        }
        info!("Link service stopped");
    }

    fn handle_command(&mut self, cmd: LinkCommand) {
        let session = &mut self.session;
        match cmd {
            LinkCommand::Connect {
                address,
                name,
                reply,
            } => {
                let _ = reply.send(session.connect(&address, name));
            }
            LinkCommand::Disconnect(reply) => {
                session.disconnect();
                let _ = reply.send(());
            }
            LinkCommand::Close(reply) => {
                session.close();
                let _ = reply.send(());
            }
            LinkCommand::CanConnect(reply) => {
                let _ = reply.send(session.can_connect());
            }
            LinkCommand::State(reply) => {
                let _ = reply.send(session.state());
            }
            LinkCommand::Device(reply) => {
                let _ = reply.send(session.device().cloned());
            }
            LinkCommand::Services(reply) => {
                let _ = reply.send(session.services().cloned().collect());
            }
            LinkCommand::Read { target, reply } => {
                let _ = reply.send(session.read_characteristic(target));
            }
            LinkCommand::Write {
                target,
                payload,
                reply,
            } => {
                let _ = reply.send(session.write_characteristic(target, &payload));
            }
            LinkCommand::ReadDescriptor { target, reply } => {
                let _ = reply.send(session.read_descriptor(target));
            }
            LinkCommand::WriteDescriptor {
                target,
                payload,
                reply,
            } => {
                let _ = reply.send(session.write_descriptor(target, &payload));
            }
            LinkCommand::ReadRssi(reply) => {
                let _ = reply.send(session.read_remote_rssi());
            }
            LinkCommand::EnableNotifications { target, reply } => {
                let _ = reply.send(session.enable_notifications(target));
            }
            LinkCommand::EnableUartNotifications(reply) => {
                let _ = reply.send(session.enable_uart_notifications());
            }
            LinkCommand::SendData {
                target,
                payload,
                with_checksum,
                reply,
            } => {
                let result = if with_checksum {
                    session.send_data_with_checksum(target, &payload)
                } else {
                    session.send_data(target, &payload)
                };
                let _ = reply.send(result);
            }
            LinkCommand::SendText { text, reply } => {
                let _ = reply.send(session.send_text(&text));
            }
            LinkCommand::SendColor { color, reply } => {
                let _ = reply.send(session.send_color(color));
            }
            LinkCommand::PendingOperations(reply) => {
                let _ = reply.send(session.pending_operations());
            }
            LinkCommand::ClearQueue(reply) => {
                session.clear_queue();
                let _ = reply.send(());
            }
            // Handled by the run loop
            LinkCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable async front end to the link task.
///
/// Every call returns once the task has accepted or rejected the
/// request. The outcome of transport work arrives later as a
/// [`SessionEvent`].
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> LinkCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)
    }

    /// Connect to a device by address
    pub async fn connect(&self, address: &str, name: Option<String>) -> Result<(), SessionError> {
        let address = address.to_string();
        self.request(|reply| LinkCommand::Connect {
            address,
            name,
            reply,
        })
        .await?
    }

    /// Disconnect from the current device
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(LinkCommand::Disconnect).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(LinkCommand::Close).await
    }

    pub async fn can_connect(&self) -> Result<bool, SessionError> {
        self.request(LinkCommand::CanConnect).await
    }

    pub async fn state(&self) -> Result<LinkState, SessionError> {
        self.request(LinkCommand::State).await
    }

    pub async fn device(&self) -> Result<Option<DeviceIdentity>, SessionError> {
        self.request(LinkCommand::Device).await
    }

    pub async fn services(&self) -> Result<Vec<GattService>, SessionError> {
        self.request(LinkCommand::Services).await
    }

    pub async fn read_characteristic(&self, target: CharacteristicId) -> Result<(), SessionError> {
        self.request(|reply| LinkCommand::Read { target, reply })
            .await?
    }

    pub async fn write_characteristic(
        &self,
        target: CharacteristicId,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let payload = payload.to_vec();
        self.request(|reply| LinkCommand::Write {
            target,
            payload,
            reply,
        })
        .await?
    }

    pub async fn read_descriptor(&self, target: DescriptorId) -> Result<(), SessionError> {
        self.request(|reply| LinkCommand::ReadDescriptor { target, reply })
            .await?
    }

    pub async fn write_descriptor(
        &self,
        target: DescriptorId,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let payload = payload.to_vec();
        self.request(|reply| LinkCommand::WriteDescriptor {
            target,
            payload,
            reply,
        })
        .await?
    }

    pub async fn read_remote_rssi(&self) -> Result<(), SessionError> {
        self.request(LinkCommand::ReadRssi).await?
    }

    pub async fn enable_notifications(&self, target: CharacteristicId) -> Result<(), SessionError> {
        self.request(|reply| LinkCommand::EnableNotifications { target, reply })
            .await?
    }

    /// Subscribe to replies on the configured UART RX characteristic
    pub async fn enable_uart_notifications(&self) -> Result<(), SessionError> {
        self.request(LinkCommand::EnableUartNotifications).await?
    }

    pub async fn send_data(&self, target: CharacteristicId, data: &[u8]) -> Result<(), SessionError> {
        self.send(target, data, false).await
    }

    pub async fn send_data_with_checksum(
        &self,
        target: CharacteristicId,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.send(target, data, true).await
    }

    async fn send(
        &self,
        target: CharacteristicId,
        data: &[u8],
        with_checksum: bool,
    ) -> Result<(), SessionError> {
        let payload = data.to_vec();
        self.request(|reply| LinkCommand::SendData {
            target,
            payload,
            with_checksum,
            reply,
        })
        .await?
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let text = text.to_string();
        self.request(|reply| LinkCommand::SendText { text, reply })
            .await?
    }

    pub async fn send_color(&self, color: Rgb) -> Result<(), SessionError> {
        self.request(|reply| LinkCommand::SendColor { color, reply })
            .await?
    }

    /// Operations queued or in flight
    pub async fn pending_operations(&self) -> Result<usize, SessionError> {
        self.request(LinkCommand::PendingOperations).await
    }

    /// Wait until every queued operation has completed, failed or timed out.
    pub async fn wait_idle(&self) -> Result<(), SessionError> {
        while self.pending_operations().await? > 0 {
            tokio::time::sleep(IDLE_POLL).await;
        }
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<(), SessionError> {
        self.request(LinkCommand::ClearQueue).await
    }

    /// Drop pending work, close the link and stop the task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(LinkCommand::Shutdown).await
    }
}

/// Scan until a device advertising `name` shows up and connect to it.
///
/// Devices seen while the session is busy are skipped, so a burst of
/// advertisements never turns into overlapping connection attempts. The
/// scan is stopped before connecting. Runs until the scan ends; wrap it
/// in a timeout for a bounded search.
pub async fn connect_first_named(
    handle: &LinkHandle,
    scanner: &mut DiscoveryScanner,
    filter: ScanFilter,
    name: &str,
) -> Result<ScannedDevice, SessionError> {
    let mut found = scanner.start(filter);
    while let Some(device) = found.recv().await {
        if device.name.as_deref() != Some(name) {
            debug!("Skipping {} ({})", device.display_name(), device.address);
            continue;
        }
        if !handle.can_connect().await? {
            debug!("Session busy, ignoring {}", device.address);
            continue;
        }
        info!(
            "Found {} at {} ({} dBm)",
            device.display_name(),
            device.address,
            device.signal_strength
        );
        scanner.stop();
        handle
            .connect(&device.address, device.name.clone())
            .await?;
        return Ok(device);
    }
    Err(SessionError::NoMatchingDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::UART_TX;
    use crate::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedPeripheral};

    const ADDR: &str = "C0:FF:EE:00:00:01";

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_commands_and_callbacks_share_one_task() {
        let adapter =
            SimulatedAdapter::new().with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR));
        let (handle, mut events) =
            LinkService::spawn(Some(Arc::new(adapter.clone())), LinkSettings::default());

        handle.connect(ADDR, None).await.unwrap();
        assert_eq!(next_event(&mut events).await, SessionEvent::Connecting);
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ServicesDiscovered { .. }
        ));
        assert_eq!(handle.state().await.unwrap(), LinkState::Connected);

        handle.send_data(UART_TX, &[7u8; 50]).await.unwrap();
        handle.wait_idle().await.unwrap();
        assert_eq!(adapter.writes().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_ends_the_task() {
        let adapter =
            SimulatedAdapter::new().with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR));
        let (handle, mut events) =
            LinkService::spawn(Some(Arc::new(adapter)), LinkSettings::default());

        handle.connect(ADDR, None).await.unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(handle.state().await, Err(SessionError::ServiceStopped));
        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(SessionEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_without_adapter() {
        let (handle, _events) = LinkService::spawn(None, LinkSettings::default());
        assert_eq!(
            handle.connect(ADDR, None).await,
            Err(SessionError::NoAdapter)
        );
        assert!(handle.can_connect().await.unwrap());
    }
}

//! Link Session Manager
//!
//! Owns the connection state machine, the device identity and the
//! service cache for a single peripheral. State changes only when the
//! transport reports them; caller intents merely request a transition.
//!
//! The session is not thread-safe by itself. It is meant to be driven
//! from one task (see [`LinkService`](super::service::LinkService)),
//! which feeds it both caller commands and transport events.

use crate::domain::models::{
    AttributeValue, CharacteristicId, DescriptorId, DeviceIdentity, GattStatus, LinkState,
    OperationKind, SessionEvent,
};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::executor::{GattExecutor, QueuedOperation};
use crate::infrastructure::bluetooth::protocol::{
    self, ProtocolError, Rgb, CLIENT_CONFIG_DESCRIPTOR, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, EventSink, GattLink, GattService, LinkEvent, TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Bluetooth adapter not initialized")]
    NoAdapter,

    #[error("Invalid device address: '{0}'")]
    InvalidAddress(String),

    #[error("A connection attempt is already in progress")]
    ConnectionInProgress,

    #[error("Could not resume the existing connection: {0}")]
    ReuseFailed(TransportError),

    #[error("Not connected")]
    NotConnected,

    #[error("Service {0} not discovered")]
    ServiceNotDiscovered(Uuid),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("No matching device found")]
    NoMatchingDevice,

    #[error("Link service stopped")]
    ServiceStopped,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One peripheral link and everything known about it.
pub struct LinkSession {
    adapter: Option<Arc<dyn BleAdapter>>,
    settings: LinkSettings,
    uart_tx: CharacteristicId,
    uart_rx: CharacteristicId,
    link: Option<Box<dyn GattLink>>,
    link_address: Option<String>,
    generation: u64,
    state: LinkState,
    device: Option<DeviceIdentity>,
    services: HashMap<Uuid, GattService>,
    executor: GattExecutor,
    transport_tx: mpsc::UnboundedSender<LinkEvent>,
    listener: mpsc::UnboundedSender<SessionEvent>,
}

impl LinkSession {
    /// `transport_tx` is the sending half of the channel whose events
    /// must be fed back through [`handle_event`](Self::handle_event).
    pub fn new(
        adapter: Option<Arc<dyn BleAdapter>>,
        settings: LinkSettings,
        transport_tx: mpsc::UnboundedSender<LinkEvent>,
        listener: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        if adapter.as_ref().map_or(true, |a| !a.is_enabled()) {
            warn!("Unable to obtain an enabled Bluetooth adapter");
        }
        let (uart_tx, uart_rx) = uart_targets(&settings);
        Self {
            adapter,
            executor: GattExecutor::new(settings.operation_timeout()),
            settings,
            uart_tx,
            uart_rx,
            link: None,
            link_address: None,
            generation: 0,
            state: LinkState::Disconnected,
            device: None,
            services: HashMap::new(),
            transport_tx,
            listener,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Admission guard for discovery-driven connects
    pub fn can_connect(&self) -> bool {
        self.state == LinkState::Disconnected
    }

    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    pub fn device_name(&self) -> &str {
        self.device
            .as_ref()
            .and_then(|d| d.name.as_deref())
            .unwrap_or("<Unknown>")
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&GattService> {
        self.services.get(uuid)
    }

    pub fn services(&self) -> impl Iterator<Item = &GattService> {
        self.services.values()
    }

    pub fn pending_operations(&self) -> usize {
        self.executor.pending_len() + usize::from(self.executor.in_flight().is_some())
    }

    /// Request a connection to `address`.
    ///
    /// Returns once the request is accepted; progress is reported through
    /// [`SessionEvent`]s.
    pub fn connect(&mut self, address: &str, name: Option<String>) -> Result<(), SessionError> {
        let Some(adapter) = self.adapter.clone() else {
            warn!("connect: Bluetooth adapter not initialized");
            return Err(SessionError::NoAdapter);
        };
        let address = address.trim();
        if address.is_empty() {
            warn!("connect: unspecified address");
            return Err(SessionError::InvalidAddress(address.to_string()));
        }
        if self.state == LinkState::Connecting {
            return Err(SessionError::ConnectionInProgress);
        }

        if self.settings.reuse_existing_connection {
            let same_device = self
                .link_address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(address));
            if let (true, Some(link)) = (same_device, self.link.as_mut()) {
                debug!("Trying to use an existing link for connection");
                link.reconnect().map_err(SessionError::ReuseFailed)?;
                self.device = Some(DeviceIdentity {
                    address: address.to_string(),
                    name,
                });
                self.transition(LinkState::Connecting);
                return Ok(());
            }
        } else if self.settings.force_close_before_new_connection {
            self.close();
        }

        // The current link keeps its generation until the new one is accepted
        let generation = self.generation + 1;
        let sink = EventSink::new(generation, self.transport_tx.clone());
        debug!(address, "Trying to create a new connection");
        let link = adapter.connect(address, self.settings.gatt_auto_connect, sink)?;
        self.generation = generation;

        // A link that was not force-closed is replaced; its late events
        // carry the old generation and are dropped.
        if let Some(mut stale) = self.link.replace(link) {
            stale.disconnect();
            stale.close();
        }
        self.link_address = Some(address.to_string());
        self.device = Some(DeviceIdentity {
            address: address.to_string(),
            name,
        });
        self.services.clear();
        self.executor.reset();
        self.transition(LinkState::Connecting);
        Ok(())
    }

    /// Request a disconnect. The identity is forgotten right away; the
    /// state follows once the transport confirms.
    pub fn disconnect(&mut self) {
        self.device = None;
        match self.link.as_mut() {
            Some(link) => link.disconnect(),
            None => warn!("disconnect: no active link"),
        }
    }

    /// Release the transport handle. Idempotent.
    pub fn close(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        link.close();
        info!("Link to {} closed", link.address());
        self.link_address = None;
        self.device = None;
        self.services.clear();
        self.executor.reset();
        // A closed handle never reports its own disconnect
        if self.state != LinkState::Disconnected {
            self.transition(LinkState::Disconnected);
        }
    }

    /// Drop queued operations that have not been dispatched yet
    pub fn clear_queue(&mut self) {
        self.executor.clear();
    }

    pub fn read_characteristic(&mut self, target: CharacteristicId) -> Result<(), SessionError> {
        self.resolve(&target)?;
        self.submit(QueuedOperation::Read { target })
    }

    pub fn write_characteristic(
        &mut self,
        target: CharacteristicId,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        self.resolve(&target)?;
        self.submit(QueuedOperation::Write {
            target,
            payload: bytes.to_vec(),
        })
    }

    pub fn read_descriptor(&mut self, target: DescriptorId) -> Result<(), SessionError> {
        self.resolve(&target.characteristic)?;
        self.submit(QueuedOperation::ReadDescriptor { target })
    }

    pub fn write_descriptor(
        &mut self,
        target: DescriptorId,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        self.resolve(&target.characteristic)?;
        self.submit(QueuedOperation::WriteDescriptor {
            target,
            payload: bytes.to_vec(),
        })
    }

    pub fn read_remote_rssi(&mut self) -> Result<(), SessionError> {
        if self.link.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.submit(QueuedOperation::ReadRssi)
    }

    /// Subscribe to notifications by writing the client configuration descriptor
    pub fn enable_notifications(&mut self, target: CharacteristicId) -> Result<(), SessionError> {
        self.write_descriptor(
            target.descriptor(CLIENT_CONFIG_DESCRIPTOR),
            &ENABLE_NOTIFICATION_VALUE,
        )
    }

    /// Subscribe to replies on the UART RX characteristic
    pub fn enable_uart_notifications(&mut self) -> Result<(), SessionError> {
        let target = self.uart_rx;
        self.enable_notifications(target)
    }

    /// Queue `data` as consecutive writes of at most `max_chunk_size` bytes.
    pub fn send_data(&mut self, target: CharacteristicId, data: &[u8]) -> Result<(), SessionError> {
        self.resolve(&target)?;
        let chunks = protocol::chunk(data, self.settings.max_chunk_size)?;
        debug!("Send {} bytes in {} chunks", data.len(), chunks.len());
        for chunk in chunks {
            self.executor.enqueue(QueuedOperation::Write {
                target,
                payload: chunk.to_vec(),
            });
        }
        self.pump();
        Ok(())
    }

    /// Same as [`send_data`](Self::send_data) with the checksum footer appended.
    pub fn send_data_with_checksum(
        &mut self,
        target: CharacteristicId,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let frame = protocol::append_checksum(data);
        debug!("Send to UART: {:02X?}", frame);
        self.send_data(target, &frame)
    }

    /// UTF-8 text over the UART TX characteristic
    pub fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        let target = self.uart_tx;
        self.send_data(target, protocol::encode_text(text))
    }

    pub fn send_color(&mut self, color: Rgb) -> Result<(), SessionError> {
        info!("Send colour {} to {}", color, self.device_name());
        let target = self.uart_tx;
        self.send_data_with_checksum(target, &protocol::color_payload(color))
    }

    /// Apply one transport callback.
    pub fn handle_event(&mut self, event: LinkEvent) {
        if event.generation != self.generation || self.link.is_none() {
            debug!("Dropping event from a released link: {:?}", event.event);
            return;
        }

        match event.event {
            TransportEvent::ConnectionStateChanged(LinkState::Connected) => {
                self.transition(LinkState::Connected);
                if let Some(link) = self.link.as_mut() {
                    // Completion arrives as ServicesDiscovered
                    if let Err(e) = link.discover_services() {
                        warn!("Service discovery could not start: {}", e);
                    }
                }
            }
            TransportEvent::ConnectionStateChanged(LinkState::Disconnected) => {
                self.services.clear();
                self.executor.reset();
                self.transition(LinkState::Disconnected);
            }
            TransportEvent::ConnectionStateChanged(LinkState::Connecting) => {
                self.transition(LinkState::Connecting);
            }
            _ if self.state == LinkState::Disconnected => {
                debug!("Ignoring {:?} while disconnected", event.event);
            }
            TransportEvent::ServicesDiscovered { status } => {
                if let Some(link) = self.link.as_ref() {
                    self.services = link
                        .services()
                        .into_iter()
                        .map(|service| (service.uuid, service))
                        .collect();
                }
                if !status.is_success() {
                    debug!("onServicesDiscovered status: {}", status);
                }
                info!("Discovered {} services", self.services.len());
                self.publish(SessionEvent::ServicesDiscovered { status });
            }
            TransportEvent::CharacteristicRead {
                target,
                value,
                status,
            } => {
                self.complete(OperationKind::Read, status);
                self.publish(SessionEvent::DataAvailable(
                    AttributeValue::Characteristic { id: target, value },
                ));
            }
            TransportEvent::CharacteristicWrite { status, .. } => {
                self.complete(OperationKind::Write, status);
            }
            TransportEvent::CharacteristicChanged { target, value } => {
                self.publish(SessionEvent::DataAvailable(
                    AttributeValue::Characteristic { id: target, value },
                ));
            }
            TransportEvent::DescriptorRead {
                target,
                value,
                status,
            } => {
                self.complete(OperationKind::ReadDescriptor, status);
                self.publish(SessionEvent::DataAvailable(AttributeValue::Descriptor {
                    id: target,
                    value,
                }));
            }
            TransportEvent::DescriptorWrite { status, .. } => {
                self.complete(OperationKind::WriteDescriptor, status);
            }
            TransportEvent::RemoteRssi { rssi, status } => {
                self.complete(OperationKind::ReadRssi, status);
                self.publish(SessionEvent::RemoteRssi(rssi));
            }
        }
    }

    /// Abandon an in-flight operation that has outlived the watchdog.
    pub fn check_timeouts(&mut self, now: Instant) {
        if let Some(kind) = self.executor.expire(now) {
            warn!("{:?} timed out waiting for the transport", kind);
            self.publish(SessionEvent::OperationTimedOut { kind });
            self.pump();
        }
    }

    fn complete(&mut self, kind: OperationKind, status: GattStatus) {
        if !self.executor.complete(kind) {
            return;
        }
        if !status.is_success() {
            warn!("{:?} completed with status {}", kind, status);
            self.publish(SessionEvent::OperationFailed { kind, status });
        }
        self.pump();
    }

    fn submit(&mut self, operation: QueuedOperation) -> Result<(), SessionError> {
        self.executor.enqueue(operation);
        self.pump();
        Ok(())
    }

    /// Dispatch the next queued operation, if the link is idle.
    fn pump(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        for failure in self.executor.execute(link.as_mut()) {
            let _ = self.listener.send(SessionEvent::OperationFailed {
                kind: failure.kind,
                status: GattStatus::FAILURE,
            });
        }
    }

    fn resolve(&self, target: &CharacteristicId) -> Result<(), SessionError> {
        if self.link.is_none() {
            warn!("GATT operation attempted without a connection");
            return Err(SessionError::NotConnected);
        }
        let service = self.services.get(&target.service).ok_or_else(|| {
            warn!("Service {} not discovered. Unable to send data", target.service);
            SessionError::ServiceNotDiscovered(target.service)
        })?;
        if service.characteristic(&target.characteristic).is_none() {
            return Err(SessionError::CharacteristicNotFound {
                service: target.service,
                characteristic: target.characteristic,
            });
        }
        Ok(())
    }

    fn transition(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        debug!("Link state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.publish(state.into());
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.listener.send(event);
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
    }
}

/// TX and RX characteristics of the configured UART service
fn uart_targets(settings: &LinkSettings) -> (CharacteristicId, CharacteristicId) {
    let configured = || -> Result<_, ProtocolError> {
        let service = protocol::parse_uuid(&settings.uart_service_uuid)?;
        let tx = protocol::parse_uuid(&settings.uart_tx_char_uuid)?;
        let rx = protocol::parse_uuid(&settings.uart_rx_char_uuid)?;
        Ok((
            CharacteristicId::new(service, tx),
            CharacteristicId::new(service, rx),
        ))
    };
    configured().unwrap_or_else(|e| {
        warn!("{}; falling back to the default UART service", e);
        (protocol::UART_TX, protocol::UART_RX)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{UART_RX, UART_TX};
    use crate::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedPeripheral};

    const ADDR: &str = "C0:FF:EE:00:00:01";

    struct Harness {
        session: LinkSession,
        adapter: SimulatedAdapter,
        transport_rx: mpsc::UnboundedReceiver<LinkEvent>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Harness {
        fn new(adapter: SimulatedAdapter, settings: LinkSettings) -> Self {
            let (transport_tx, transport_rx) = mpsc::unbounded_channel();
            let (listener, events) = mpsc::unbounded_channel();
            let session = LinkSession::new(
                Some(Arc::new(adapter.clone())),
                settings,
                transport_tx,
                listener,
            );
            Self {
                session,
                adapter,
                transport_rx,
                events,
            }
        }

        fn uart() -> Self {
            let adapter =
                SimulatedAdapter::new().with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR));
            Self::new(adapter, LinkSettings::default())
        }

        /// Deliver every queued transport callback, as the service task would
        fn drain(&mut self) {
            while let Ok(event) = self.transport_rx.try_recv() {
                self.session.handle_event(event);
            }
        }

        fn events(&mut self) -> Vec<SessionEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn connected(mut self) -> Self {
            self.session.connect(ADDR, None).unwrap();
            self.drain();
            self.events();
            self
        }
    }

    #[test]
    fn test_connect_discovers_services() {
        let mut h = Harness::uart();
        h.session
            .connect(ADDR, Some("Adafruit Bluefruit LE".to_string()))
            .unwrap();
        assert_eq!(h.session.state(), LinkState::Connecting);
        assert!(!h.session.can_connect());

        h.drain();
        assert_eq!(
            h.events(),
            vec![
                SessionEvent::Connecting,
                SessionEvent::Connected,
                SessionEvent::ServicesDiscovered {
                    status: GattStatus::SUCCESS
                },
            ]
        );
        assert!(h.session.service(&UART_TX.service).is_some());
        assert_eq!(h.session.device_name(), "Adafruit Bluefruit LE");
    }

    #[test]
    fn test_connect_admission_errors() {
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        let (listener, _events) = mpsc::unbounded_channel();
        let mut no_adapter = LinkSession::new(None, LinkSettings::default(), transport_tx, listener);
        assert_eq!(no_adapter.connect(ADDR, None), Err(SessionError::NoAdapter));

        let mut h = Harness::uart();
        assert!(matches!(
            h.session.connect("  ", None),
            Err(SessionError::InvalidAddress(_))
        ));
        assert!(matches!(
            h.session.connect("11:22:33:44:55:66", None),
            Err(SessionError::Transport(TransportError::DeviceNotFound(_)))
        ));
        assert_eq!(h.session.state(), LinkState::Disconnected);
        assert!(h.events().is_empty());

        h.session.connect(ADDR, None).unwrap();
        assert_eq!(
            h.session.connect(ADDR, None),
            Err(SessionError::ConnectionInProgress)
        );
    }

    #[test]
    fn test_disconnect_while_connecting_ends_disconnected() {
        let adapter = SimulatedAdapter::new()
            .with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR))
            .with_manual_connection();
        let mut h = Harness::new(adapter, LinkSettings::default());

        h.session.connect(ADDR, None).unwrap();
        h.session.disconnect();
        assert!(h.session.device().is_none());
        assert!(!h.session.can_connect());

        h.drain();
        assert_eq!(
            h.events(),
            vec![SessionEvent::Connecting, SessionEvent::Disconnected]
        );
        assert!(h.session.can_connect());
    }

    #[test]
    fn test_can_connect_only_after_disconnected() {
        let mut h = Harness::uart().connected();
        assert!(!h.session.can_connect());

        h.session.disconnect();
        assert!(!h.session.can_connect());
        h.drain();
        assert!(h.session.can_connect());
        assert_eq!(h.events(), vec![SessionEvent::Disconnected]);
    }

    #[test]
    fn test_write_rejected_before_services() {
        let mut h = Harness::uart();
        assert_eq!(
            h.session.write_characteristic(UART_TX, b"hi"),
            Err(SessionError::NotConnected)
        );

        h.session.connect(ADDR, None).unwrap();
        assert_eq!(
            h.session.write_characteristic(UART_TX, b"hi"),
            Err(SessionError::ServiceNotDiscovered(UART_TX.service))
        );

        h.drain();
        let unknown = CharacteristicId::new(UART_TX.service, Uuid::from_u128(42));
        assert!(matches!(
            h.session.write_characteristic(unknown, b"hi"),
            Err(SessionError::CharacteristicNotFound { .. })
        ));
        assert!(h.session.write_characteristic(UART_TX, b"hi").is_ok());
    }

    #[test]
    fn test_send_color_chunks_in_order() {
        let mut h = Harness::uart().connected();
        let text = "the quick brown fox jumps over the lazy dog";
        h.session.send_text(text).unwrap();
        h.session.send_color(Rgb::new(0, 0, 0)).unwrap();

        // Only the head is outstanding until its completion is processed
        assert_eq!(h.adapter.writes().len(), 1);
        assert_eq!(h.session.pending_operations(), 4);

        h.drain();
        let writes: Vec<Vec<u8>> = h.adapter.writes().into_iter().map(|(_, v)| v).collect();
        assert_eq!(writes.len(), 4);
        assert!(writes.iter().all(|w| w.len() <= 20));
        assert_eq!(writes[..3].concat(), text.as_bytes());
        assert_eq!(writes[3], vec![0x21, 0x43, 0x00, 0x00, 0x00, 0x9B]);
        assert_eq!(h.session.pending_operations(), 0);
    }

    #[test]
    fn test_reads_complete_in_order() {
        let mut h = Harness::uart().connected();
        h.session.read_characteristic(UART_RX).unwrap();
        h.session.read_remote_rssi().unwrap();
        h.drain();

        let events = h.events();
        assert!(matches!(events[0], SessionEvent::DataAvailable(_)));
        assert_eq!(events[1], SessionEvent::RemoteRssi(-60));
    }

    #[test]
    fn test_services_discovered_failure_is_tolerated() {
        let peripheral = SimulatedPeripheral::bluefruit_uart(ADDR)
            .with_discovery_status(GattStatus::FAILURE);
        let adapter = SimulatedAdapter::new().with_peripheral(peripheral);
        let mut h = Harness::new(adapter, LinkSettings::default());

        h.session.connect(ADDR, None).unwrap();
        h.drain();
        assert!(h.events().contains(&SessionEvent::ServicesDiscovered {
            status: GattStatus::FAILURE
        }));
        assert!(h.session.send_text("ok").is_ok());
    }

    #[test]
    fn test_notifications_are_data_available() {
        let mut h = Harness::uart().connected();
        h.session.enable_notifications(UART_RX).unwrap();
        h.adapter.notify(UART_RX, b"ack");
        h.drain();

        assert_eq!(
            h.events(),
            vec![SessionEvent::DataAvailable(AttributeValue::Characteristic {
                id: UART_RX,
                value: b"ack".to_vec(),
            })]
        );
    }

    #[test]
    fn test_close_is_idempotent_and_terminal() {
        let mut h = Harness::uart().connected();
        h.session.close();
        h.session.close();

        assert_eq!(h.events(), vec![SessionEvent::Disconnected]);
        assert!(h.session.can_connect());
        assert!(h.session.device().is_none());
        assert_eq!(
            h.session.send_text("x"),
            Err(SessionError::NotConnected)
        );
    }

    #[test]
    fn test_force_close_drops_stale_events() {
        let mut h = Harness::uart().connected();
        h.adapter.drop_connection();
        // The stale disconnect is still queued when we reconnect
        h.session.connect(ADDR, None).unwrap();
        h.drain();

        assert_eq!(
            h.events(),
            vec![
                SessionEvent::Disconnected,
                SessionEvent::Connecting,
                SessionEvent::Connected,
                SessionEvent::ServicesDiscovered {
                    status: GattStatus::SUCCESS
                },
            ]
        );
        assert_eq!(h.session.state(), LinkState::Connected);
        assert_eq!(h.adapter.connect_count(), 2);
    }

    #[test]
    fn test_reuse_existing_connection() {
        let adapter =
            SimulatedAdapter::new().with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR));
        let settings = LinkSettings {
            reuse_existing_connection: true,
            ..Default::default()
        };
        let mut h = Harness::new(adapter, settings).connected();

        h.session.disconnect();
        h.drain();
        h.session.connect(&ADDR.to_lowercase(), None).unwrap();
        h.drain();

        assert_eq!(h.session.state(), LinkState::Connected);
        assert!(h.session.device().is_some());
        // Resumed on the same handle rather than a new transport connect
        assert_eq!(h.adapter.connect_count(), 2);
        assert_eq!(h.session.generation, 1);
    }

    #[test]
    fn test_clear_queue_discards_pending_writes() {
        let adapter = SimulatedAdapter::new()
            .with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR))
            .with_manual_connection();
        let mut h = Harness::new(adapter, LinkSettings::default());
        h.session.connect(ADDR, None).unwrap();
        h.adapter.complete_connection();
        h.drain();

        h.session.send_data(UART_TX, &[0u8; 60]).unwrap();
        assert_eq!(h.session.pending_operations(), 3);
        h.session.clear_queue();
        assert_eq!(h.session.pending_operations(), 1);

        h.drain();
        assert_eq!(h.adapter.writes().len(), 1);
        assert_eq!(h.session.pending_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_releases_stalled_queue() {
        let adapter = SimulatedAdapter::new()
            .with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR))
            .with_silent_operations();
        let mut h = Harness::new(adapter, LinkSettings::default());
        h.session.connect(ADDR, None).unwrap();
        h.drain();
        // Discovery is silent too, so fake its completion
        let generation = h.session.generation;
        h.session.handle_event(LinkEvent {
            generation,
            event: TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
            },
        });
        h.events();

        h.session.send_data(UART_TX, &[1u8; 30]).unwrap();
        assert_eq!(h.adapter.writes().len(), 1);

        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        h.session.check_timeouts(Instant::now());

        assert_eq!(
            h.events(),
            vec![SessionEvent::OperationTimedOut {
                kind: OperationKind::Write
            }]
        );
        assert_eq!(h.adapter.writes().len(), 2);
    }

    #[test]
    fn test_refused_connect_keeps_current_link() {
        let adapter =
            SimulatedAdapter::new().with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR));
        let settings = LinkSettings {
            force_close_before_new_connection: false,
            ..Default::default()
        };
        let mut h = Harness::new(adapter, settings).connected();

        assert!(matches!(
            h.session.connect("11:22:33:44:55:66", None),
            Err(SessionError::Transport(TransportError::DeviceNotFound(_)))
        ));
        assert_eq!(h.session.state(), LinkState::Connected);

        // The surviving link must still be heard
        h.adapter.drop_connection();
        h.drain();
        assert_eq!(h.session.state(), LinkState::Disconnected);
        assert_eq!(h.events(), vec![SessionEvent::Disconnected]);
    }

    #[test]
    fn test_repeated_disconnect_reports_once() {
        let mut h = Harness::uart().connected();
        h.adapter.drop_connection();
        h.drain();
        h.session.disconnect();
        h.drain();

        assert_eq!(h.events(), vec![SessionEvent::Disconnected]);
    }

    #[test]
    fn test_uart_notifications_follow_settings() {
        let mut h = Harness::uart().connected();
        h.session.enable_uart_notifications().unwrap();
        h.session
            .read_descriptor(UART_RX.descriptor(CLIENT_CONFIG_DESCRIPTOR))
            .unwrap();
        h.drain();
        assert_eq!(
            h.events(),
            vec![SessionEvent::DataAvailable(AttributeValue::Descriptor {
                id: UART_RX.descriptor(CLIENT_CONFIG_DESCRIPTOR),
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            })]
        );

        let adapter =
            SimulatedAdapter::new().with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR));
        let settings = LinkSettings {
            uart_rx_char_uuid: "6e400009-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            ..Default::default()
        };
        let mut h = Harness::new(adapter, settings).connected();
        assert_eq!(
            h.session.enable_uart_notifications(),
            Err(SessionError::CharacteristicNotFound {
                service: UART_TX.service,
                characteristic: Uuid::from_u128(0x6e400009_b5a3_f393_e0a9_e50e24dcca9e),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_after_timeout_is_not_reused() {
        let adapter = SimulatedAdapter::new()
            .with_peripheral(SimulatedPeripheral::bluefruit_uart(ADDR))
            .with_silent_operations();
        let mut h = Harness::new(adapter, LinkSettings::default());
        h.session.connect(ADDR, None).unwrap();
        h.drain();
        let generation = h.session.generation;
        let late_write = || LinkEvent {
            generation,
            event: TransportEvent::CharacteristicWrite {
                target: UART_TX,
                status: GattStatus::SUCCESS,
            },
        };
        h.session.handle_event(LinkEvent {
            generation,
            event: TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
            },
        });

        h.session.send_data(UART_TX, &[1u8; 60]).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        h.session.check_timeouts(Instant::now());
        assert_eq!(h.adapter.writes().len(), 2);

        // Answer to the abandoned first chunk; the second is still outstanding
        h.session.handle_event(late_write());
        assert_eq!(h.adapter.writes().len(), 2);
        assert_eq!(h.session.pending_operations(), 2);

        h.session.handle_event(late_write());
        assert_eq!(h.adapter.writes().len(), 3);
    }
}

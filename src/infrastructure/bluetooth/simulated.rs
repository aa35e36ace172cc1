//! Simulated BLE stack
//!
//! In-process stand-in for the platform adapter: a fixed set of
//! advertising peripherals whose links answer every request through the
//! same asynchronous event path a real stack uses.

use crate::domain::models::{CharacteristicId, DescriptorId, GattStatus, LinkState};
use crate::infrastructure::bluetooth::protocol::{
    CLIENT_CONFIG_DESCRIPTOR, UART_RX_CHAR, UART_SERVICE, UART_TX_CHAR,
};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, BleAdapter, EventSink, GattCharacteristic, GattLink, GattService, ScanSink,
    TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Room left for the local name in a 31-byte advertising payload
const MAX_AD_NAME_LEN: usize = 29;

/// A peripheral the simulated radio can see
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<GattService>,
    pub discovery_status: GattStatus,
}

impl SimulatedPeripheral {
    pub fn new(address: &str, name: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: -60,
            services: Vec::new(),
            discovery_status: GattStatus::SUCCESS,
        }
    }

    /// Bluefruit board exposing the UART service
    pub fn bluefruit_uart(address: &str) -> Self {
        Self::new(address, Some("Adafruit Bluefruit LE")).with_service(uart_service())
    }

    pub fn with_service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_discovery_status(mut self, status: GattStatus) -> Self {
        self.discovery_status = status;
        self
    }

    fn advertisement(&self) -> Advertisement {
        // Flags + Complete Local Name AD structures
        let mut raw_record = vec![0x02, 0x01, 0x06];
        if let Some(name) = &self.name {
            let name = &name.as_bytes()[..name.len().min(MAX_AD_NAME_LEN)];
            raw_record.push(name.len() as u8 + 1);
            raw_record.push(0x09);
            raw_record.extend_from_slice(name);
        }
        Advertisement {
            address: self.address.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            service_uuids: self.services.iter().map(|s| s.uuid).collect(),
            raw_record,
        }
    }
}

/// UART service with a writable TX and a notifying RX characteristic
pub fn uart_service() -> GattService {
    GattService::new(UART_SERVICE)
        .with_characteristic(GattCharacteristic::new(UART_TX_CHAR))
        .with_characteristic(
            GattCharacteristic::new(UART_RX_CHAR).with_descriptor(CLIENT_CONFIG_DESCRIPTOR),
        )
}

#[derive(Debug, Default)]
struct SimState {
    enabled: bool,
    peripherals: Vec<SimulatedPeripheral>,
    scan_sink: Option<ScanSink>,
    scan_starts: usize,
    scan_stops: usize,
    connects: usize,
    active_link: Option<EventSink>,
    manual_connection: bool,
    silent_operations: bool,
    writes: Vec<(CharacteristicId, Vec<u8>)>,
    values: HashMap<CharacteristicId, Vec<u8>>,
    descriptors: HashMap<DescriptorId, Vec<u8>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated radio. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                enabled: true,
                ..Default::default()
            })),
        }
    }

    pub fn with_peripheral(self, peripheral: SimulatedPeripheral) -> Self {
        lock(&self.state).peripherals.push(peripheral);
        self
    }

    /// Radio switched off
    pub fn disabled(self) -> Self {
        lock(&self.state).enabled = false;
        self
    }

    /// Connection attempts stay pending until [`complete_connection`](Self::complete_connection)
    pub fn with_manual_connection(self) -> Self {
        lock(&self.state).manual_connection = true;
        self
    }

    /// Requests are accepted but never answered
    pub fn with_silent_operations(self) -> Self {
        lock(&self.state).silent_operations = true;
        self
    }

    /// Deliver the pending "connected" callback on the active link
    pub fn complete_connection(&self) {
        if let Some(sink) = lock(&self.state).active_link.clone() {
            sink.emit(TransportEvent::ConnectionStateChanged(LinkState::Connected));
        }
    }

    /// The peripheral drops the link on its own
    pub fn drop_connection(&self) {
        if let Some(sink) = lock(&self.state).active_link.clone() {
            sink.emit(TransportEvent::ConnectionStateChanged(
                LinkState::Disconnected,
            ));
        }
    }

    /// Push a notification from the peripheral
    pub fn notify(&self, target: CharacteristicId, value: &[u8]) {
        if let Some(sink) = lock(&self.state).active_link.clone() {
            sink.emit(TransportEvent::CharacteristicChanged {
                target,
                value: value.to_vec(),
            });
        }
    }

    /// Re-broadcast every advertisement to the running scan
    pub fn advertise(&self) {
        let state = lock(&self.state);
        if let Some(sink) = &state.scan_sink {
            for peripheral in &state.peripherals {
                sink.deliver(peripheral.advertisement());
            }
        }
    }

    /// Every accepted characteristic write, in dispatch order
    pub fn writes(&self) -> Vec<(CharacteristicId, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    pub fn scan_starts(&self) -> usize {
        lock(&self.state).scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        lock(&self.state).scan_stops
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan_sink.is_some()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }
}

impl BleAdapter for SimulatedAdapter {
    fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    fn connect(
        &self,
        address: &str,
        _auto_connect: bool,
        sink: EventSink,
    ) -> Result<Box<dyn GattLink>, TransportError> {
        let mut state = lock(&self.state);
        if !state.enabled {
            return Err(TransportError::BluetoothDisabled);
        }
        let peripheral = state
            .peripherals
            .iter()
            .find(|p| p.address.eq_ignore_ascii_case(address))
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;

        info!("Simulated connect to {}", peripheral.address);
        state.connects += 1;
        state.active_link = Some(sink.clone());
        if !state.manual_connection {
            sink.emit(TransportEvent::ConnectionStateChanged(LinkState::Connected));
        }

        Ok(Box::new(SimulatedLink {
            peripheral,
            sink,
            shared: self.state.clone(),
            closed: false,
        }))
    }

    fn start_scan(&self, sink: ScanSink) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.enabled {
            return Err(TransportError::BluetoothDisabled);
        }
        state.scan_starts += 1;
        for peripheral in &state.peripherals {
            sink.deliver(peripheral.advertisement());
        }
        state.scan_sink = Some(sink);
        Ok(())
    }

    fn stop_scan(&self) {
        let mut state = lock(&self.state);
        if state.scan_sink.take().is_some() {
            state.scan_stops += 1;
        }
    }
}

struct SimulatedLink {
    peripheral: SimulatedPeripheral,
    sink: EventSink,
    shared: Arc<Mutex<SimState>>,
    closed: bool,
}

impl SimulatedLink {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::LinkClosed)
        } else {
            Ok(())
        }
    }

    /// Emit a completion unless the radio is configured to stay silent
    fn answer(&self, event: TransportEvent) {
        if !lock(&self.shared).silent_operations {
            self.sink.emit(event);
        }
    }

    fn knows(&self, target: &CharacteristicId) -> bool {
        self.peripheral
            .services
            .iter()
            .find(|s| s.uuid == target.service)
            .and_then(|s| s.characteristic(&target.characteristic))
            .is_some()
    }
}

impl GattLink for SimulatedLink {
    fn address(&self) -> &str {
        &self.peripheral.address
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.shared);
        state.connects += 1;
        state.active_link = Some(self.sink.clone());
        if !state.manual_connection {
            self.sink
                .emit(TransportEvent::ConnectionStateChanged(LinkState::Connected));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.closed {
            self.sink.emit(TransportEvent::ConnectionStateChanged(
                LinkState::Disconnected,
            ));
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.shared);
        let ours = state
            .active_link
            .as_ref()
            .is_some_and(|s| s.generation() == self.sink.generation());
        if ours {
            state.active_link = None;
        }
        debug!("Simulated link to {} closed", self.peripheral.address);
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.answer(TransportEvent::ServicesDiscovered {
            status: self.peripheral.discovery_status,
        });
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        self.peripheral.services.clone()
    }

    fn read_characteristic(&mut self, target: &CharacteristicId) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (value, status) = if self.knows(target) {
            let value = lock(&self.shared)
                .values
                .get(target)
                .cloned()
                .unwrap_or_default();
            (value, GattStatus::SUCCESS)
        } else {
            (Vec::new(), GattStatus::FAILURE)
        };
        self.answer(TransportEvent::CharacteristicRead {
            target: *target,
            value,
            status,
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        target: &CharacteristicId,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let status = if self.knows(target) {
            let mut state = lock(&self.shared);
            state.writes.push((*target, value.to_vec()));
            state.values.insert(*target, value.to_vec());
            GattStatus::SUCCESS
        } else {
            GattStatus::WRITE_NOT_PERMITTED
        };
        self.answer(TransportEvent::CharacteristicWrite {
            target: *target,
            status,
        });
        Ok(())
    }

    fn read_descriptor(&mut self, target: &DescriptorId) -> Result<(), TransportError> {
        self.ensure_open()?;
        let value = lock(&self.shared)
            .descriptors
            .get(target)
            .cloned()
            .unwrap_or_default();
        self.answer(TransportEvent::DescriptorRead {
            target: *target,
            value,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        target: &DescriptorId,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.shared)
            .descriptors
            .insert(*target, value.to_vec());
        self.answer(TransportEvent::DescriptorWrite {
            target: *target,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn read_remote_rssi(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.answer(TransportEvent::RemoteRssi {
            rssi: self.peripheral.rssi,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }
}

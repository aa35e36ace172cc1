//! Transport Adapter contract
//!
//! The platform BLE stack is opaque. Requests are accepted or refused
//! synchronously; their outcome arrives later as a [`TransportEvent`] on
//! the [`EventSink`] handed over at connect time.

use crate::domain::models::{
    CharacteristicId, DescriptorId, GattStatus, LinkState, ScannedDevice,
};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("Bluetooth is disabled")]
    BluetoothDisabled,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Link already closed")]
    LinkClosed,
}

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A primary service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: GattCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Completion and state callbacks raised by a link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionStateChanged(LinkState),
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        target: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWrite {
        target: CharacteristicId,
        status: GattStatus,
    },
    /// Unsolicited notification; never completes a queued operation
    CharacteristicChanged {
        target: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorRead {
        target: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWrite {
        target: DescriptorId,
        status: GattStatus,
    },
    RemoteRssi {
        rssi: i16,
        status: GattStatus,
    },
}

/// A transport event tagged with the link generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Callback channel for one link.
///
/// Safe to clone and to use from any thread; events are delivered in
/// the order they were emitted.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(LinkEvent {
            generation: self.generation,
            event,
        });
    }
}

/// Raw advertisement as reported by the platform scanner
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    pub raw_record: Vec<u8>,
}

impl From<Advertisement> for ScannedDevice {
    fn from(adv: Advertisement) -> Self {
        ScannedDevice {
            name: adv.name,
            address: adv.address,
            signal_strength: adv.rssi,
            service_uuids: adv.service_uuids,
            raw_record: adv.raw_record,
        }
    }
}

/// Which advertisements are passed on to the discovery handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
    pub name: Option<String>,
    /// If true, every advertisement matches
    pub show_all: bool,
}

impl ScanFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        if self.show_all {
            return true;
        }
        let service_ok = self
            .service_uuid
            .map_or(true, |uuid| adv.service_uuids.contains(&uuid));
        let name_ok = self
            .name
            .as_deref()
            .map_or(true, |name| adv.name.as_deref() == Some(name));
        service_ok && name_ok
    }
}

/// Advertisement callback handed to [`BleAdapter::start_scan`].
///
/// Filters and forwards advertisements onto the ordered channel read by
/// the discovery consumer, whatever thread the platform calls from.
#[derive(Debug, Clone)]
pub struct ScanSink {
    filter: ScanFilter,
    tx: mpsc::UnboundedSender<ScannedDevice>,
}

impl ScanSink {
    pub fn new(filter: ScanFilter, tx: mpsc::UnboundedSender<ScannedDevice>) -> Self {
        Self { filter, tx }
    }

    pub fn deliver(&self, adv: Advertisement) {
        if self.filter.matches(&adv) {
            let _ = self.tx.send(adv.into());
        } else {
            tracing::trace!(
                "Ignoring advertisement from {} ({})",
                adv.address,
                adv.name.as_deref().unwrap_or("<unknown>")
            );
        }
    }
}

/// Entry point to the platform BLE stack.
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is powered and usable
    fn is_enabled(&self) -> bool;

    /// Open a new link. Connection progress is reported on `sink`.
    fn connect(
        &self,
        address: &str,
        auto_connect: bool,
        sink: EventSink,
    ) -> Result<Box<dyn GattLink>, TransportError>;

    fn start_scan(&self, sink: ScanSink) -> Result<(), TransportError>;

    fn stop_scan(&self);
}

/// Handle to one native GATT client connection.
///
/// The transport supports a single outstanding operation; serializing
/// requests is the caller's job.
pub trait GattLink: Send {
    fn address(&self) -> &str;

    /// Reconnect this existing handle to its device
    fn reconnect(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    /// Release native resources. No further events are delivered.
    fn close(&mut self);

    fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Service table from the last discovery
    fn services(&self) -> Vec<GattService>;

    fn read_characteristic(&mut self, target: &CharacteristicId) -> Result<(), TransportError>;

    fn write_characteristic(
        &mut self,
        target: &CharacteristicId,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn read_descriptor(&mut self, target: &DescriptorId) -> Result<(), TransportError>;

    fn write_descriptor(&mut self, target: &DescriptorId, value: &[u8])
        -> Result<(), TransportError>;

    fn read_remote_rssi(&mut self) -> Result<(), TransportError>;
}

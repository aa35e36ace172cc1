use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Connection state of the single peripheral link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Address and advertised name of the peripheral the session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: Option<String>,
}

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDevice {
    pub name: Option<String>,
    pub address: String,
    pub signal_strength: i16,
    pub service_uuids: Vec<Uuid>,
    pub raw_record: Vec<u8>,
}

impl ScannedDevice {
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown",
        }
    }
}

/// Status code reported by the transport alongside a completion.
///
/// Only `0` means success; every other value is carried through for
/// logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x0000);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x0003);
    pub const FAILURE: GattStatus = GattStatus(0x0101);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// Address of a characteristic within a discovered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorId {
        DescriptorId {
            characteristic: *self,
            descriptor,
        }
    }
}

/// Address of a descriptor attached to a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub descriptor: Uuid,
}

/// Value delivered by a read or a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Characteristic { id: CharacteristicId, value: Vec<u8> },
    Descriptor { id: DescriptorId, value: Vec<u8> },
}

impl AttributeValue {
    pub fn value(&self) -> &[u8] {
        match self {
            Self::Characteristic { value, .. } | Self::Descriptor { value, .. } => value,
        }
    }
}

/// Kind of a queued GATT operation, used to match completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    ReadDescriptor,
    WriteDescriptor,
    ReadRssi,
}

/// High level notifications published by the link session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting,
    Connected,
    Disconnected,
    /// Service discovery finished. A non-success status is reported here
    /// but the (possibly partial) service table is still cached.
    ServicesDiscovered { status: GattStatus },
    DataAvailable(AttributeValue),
    RemoteRssi(i16),
    OperationFailed {
        kind: OperationKind,
        status: GattStatus,
    },
    OperationTimedOut { kind: OperationKind },
}

impl From<LinkState> for SessionEvent {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Disconnected => SessionEvent::Disconnected,
            LinkState::Connecting => SessionEvent::Connecting,
            LinkState::Connected => SessionEvent::Connected,
        }
    }
}

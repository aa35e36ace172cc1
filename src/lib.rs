//! BLE link session manager for NeoPixel peripherals.
//!
//! Presents a single half-duplex BLE link as an ordered request/response
//! channel: connection lifecycle, a serialized GATT operation queue, a
//! self-restarting discovery scanner and the chunked UART command protocol.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{LinkState, SessionEvent};
pub use infrastructure::bluetooth::{LinkHandle, LinkService};

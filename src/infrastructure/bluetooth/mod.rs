//! Bluetooth Module
//!
//! Drives a single BLE link to a NeoPixel peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 LinkHandle  (cloneable)                  │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ commands
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │         LinkService task  (single writer)                │
//! │   select! { transport events, commands, watchdog }       │
//! └──────┬─────────────────────┬─────────────────────────────┘
//!        │                     │
//!        ▼                     ▼
//! ┌─────────────┐       ┌──────────────┐       ┌────────────┐
//! │ LinkSession │──────▶│ GattExecutor │       │  Protocol  │
//! │ - state     │       │ - FIFO       │       │ - chunking │
//! │ - services  │       │ - one in     │       │ - checksum │
//! │ - identity  │       │   flight     │       │ - !C color │
//! └──────┬──────┘       └──────┬───────┘       └────────────┘
//!        │                     │
//!        ▼                     ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │      BleAdapter / GattLink  (platform or simulated)      │
//! └──────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ start / stop
//!                     ┌────────┴─────────┐
//!                     │ DiscoveryScanner │
//!                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Adapter traits and the callback events they raise
//! - [`executor`] - One-at-a-time GATT operation queue
//! - [`session`] - Connection state machine and service cache
//! - [`service`] - Task that owns the session, and its async handle
//! - [`scanner`] - Advertisement scanning with periodic restart
//! - [`protocol`] - UART UUIDs, chunking and the colour command
//! - [`simulated`] - In-process peripheral implementing the adapter

pub mod executor;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transport;

pub use scanner::DiscoveryScanner;
pub use service::{connect_first_named, LinkHandle, LinkService};
pub use session::{LinkSession, SessionError};
pub use transport::{BleAdapter, GattLink, ScanFilter, TransportError};

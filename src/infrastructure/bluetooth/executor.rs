//! GATT Operation Executor
//!
//! The link accepts exactly one outstanding operation. Requests are
//! queued FIFO and the head is dispatched only once the previous
//! operation has completed, failed to dispatch, or timed out.

use crate::domain::models::{CharacteristicId, DescriptorId, OperationKind};
use crate::infrastructure::bluetooth::transport::{GattLink, TransportError};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedOperation {
    Read {
        target: CharacteristicId,
    },
    Write {
        target: CharacteristicId,
        payload: Vec<u8>,
    },
    ReadDescriptor {
        target: DescriptorId,
    },
    WriteDescriptor {
        target: DescriptorId,
        payload: Vec<u8>,
    },
    ReadRssi,
}

impl QueuedOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Read { .. } => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
            Self::ReadDescriptor { .. } => OperationKind::ReadDescriptor,
            Self::WriteDescriptor { .. } => OperationKind::WriteDescriptor,
            Self::ReadRssi => OperationKind::ReadRssi,
        }
    }

    fn dispatch(&self, link: &mut dyn GattLink) -> Result<(), TransportError> {
        match self {
            Self::Read { target } => link.read_characteristic(target),
            Self::Write { target, payload } => {
                debug!("Write {:02X?} to {}", payload, target.characteristic);
                link.write_characteristic(target, payload)
            }
            Self::ReadDescriptor { target } => link.read_descriptor(target),
            Self::WriteDescriptor { target, payload } => link.write_descriptor(target, payload),
            Self::ReadRssi => link.read_remote_rssi(),
        }
    }
}

/// An operation the transport refused to accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub kind: OperationKind,
    pub error: TransportError,
}

#[derive(Debug)]
struct InFlight {
    operation: QueuedOperation,
    dispatched_at: Instant,
}

/// FIFO sequencer for GATT operations on one link.
///
/// Does not retry. Callers feed completions back through
/// [`GattExecutor::complete`] and then call [`GattExecutor::execute`]
/// to release the next operation.
#[derive(Debug)]
pub struct GattExecutor {
    pending: VecDeque<QueuedOperation>,
    in_flight: Option<InFlight>,
    /// Timed-out operations whose completion may still arrive
    abandoned: Vec<OperationKind>,
    timeout: Option<Duration>,
}

impl GattExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            abandoned: Vec::new(),
            timeout,
        }
    }

    /// Append to the tail. Nothing is dispatched until [`execute`](Self::execute).
    pub fn enqueue(&mut self, operation: QueuedOperation) {
        trace!("Queued {:?}", operation.kind());
        self.pending.push_back(operation);
    }

    /// Dispatch the head if nothing is outstanding.
    ///
    /// Operations the transport refuses are dropped and returned so the
    /// caller can report them; the following operation is tried next.
    pub fn execute(&mut self, link: &mut dyn GattLink) -> Vec<DispatchFailure> {
        let mut failures = Vec::new();
        while self.in_flight.is_none() {
            let Some(operation) = self.pending.pop_front() else {
                break;
            };
            match operation.dispatch(link) {
                Ok(()) => {
                    self.in_flight = Some(InFlight {
                        operation,
                        dispatched_at: Instant::now(),
                    });
                }
                Err(error) => {
                    warn!("Dispatch of {:?} refused: {}", operation.kind(), error);
                    failures.push(DispatchFailure {
                        kind: operation.kind(),
                        error,
                    });
                }
            }
        }
        failures
    }

    /// Retire the in-flight operation if `kind` matches it.
    ///
    /// Returns false for completions nobody is waiting for (for example
    /// after [`reset`](Self::reset)); those are ignored.
    ///
    /// The first completion of a kind that timed out earlier is taken to
    /// belong to the abandoned operation and is swallowed as well.
    pub fn complete(&mut self, kind: OperationKind) -> bool {
        if let Some(index) = self.abandoned.iter().position(|k| *k == kind) {
            self.abandoned.remove(index);
            debug!("Late completion for abandoned {:?}, ignoring", kind);
            return false;
        }
        match self.in_flight.as_ref().map(|f| f.operation.kind()) {
            Some(outstanding) if outstanding == kind => {
                self.in_flight = None;
                true
            }
            Some(outstanding) => {
                warn!(
                    "Completion for {:?} while {:?} is in flight, ignoring",
                    kind, outstanding
                );
                false
            }
            None => {
                debug!("Completion for {:?} with nothing in flight, ignoring", kind);
                false
            }
        }
    }

    /// Abandon the in-flight operation if it has outlived the timeout.
    pub fn expire(&mut self, now: Instant) -> Option<OperationKind> {
        let timeout = self.timeout?;
        let in_flight = self.in_flight.as_ref()?;
        if now.saturating_duration_since(in_flight.dispatched_at) < timeout {
            return None;
        }
        let kind = in_flight.operation.kind();
        self.in_flight = None;
        self.abandoned.push(kind);
        Some(kind)
    }

    /// Drop pending operations.
    ///
    /// An operation already handed to the transport stays marked in
    /// flight so its late completion is consumed instead of overlapping
    /// with the next dispatch.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} pending operations", self.pending.len());
        }
        self.pending.clear();
    }

    /// Drop everything, including the in-flight marker. Used once the
    /// link is gone and no further completions can arrive.
    pub fn reset(&mut self) {
        self.clear();
        self.in_flight = None;
        self.abandoned.clear();
    }

    pub fn in_flight(&self) -> Option<&QueuedOperation> {
        self.in_flight.as_ref().map(|f| &f.operation)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }
}

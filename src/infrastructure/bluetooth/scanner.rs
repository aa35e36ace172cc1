//! BLE Scanner Module
//!
//! Time-boxed advertisement scanning. Long-running scans get throttled by
//! platform stacks, so an active scan is stopped and restarted once per
//! scan period for as long as the caller keeps it running.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::transport::{BleAdapter, ScanFilter, ScanSink};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Default)]
struct ScanState {
    active: bool,
    /// Bumped by every start and stop; a restart check only acts on the
    /// scan it was scheduled for
    generation: u64,
    sink: Option<ScanSink>,
    restart_task: Option<JoinHandle<()>>,
    restarts: usize,
}

fn lock(state: &Mutex<ScanState>) -> MutexGuard<'_, ScanState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// BLE scanner with automatic restart
pub struct DiscoveryScanner {
    adapter: Arc<dyn BleAdapter>,
    period: Duration,
    state: Arc<Mutex<ScanState>>,
}

impl DiscoveryScanner {
    /// A zero `period` disables the restart cycle.
    pub fn new(adapter: Arc<dyn BleAdapter>, period: Duration) -> Self {
        Self {
            adapter,
            period,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    /// Start scanning for BLE devices
    ///
    /// Matching advertisements arrive on the returned receiver in the
    /// order the adapter reported them. If the radio is unavailable the
    /// scanner stays inactive and the receiver is already closed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, filter: ScanFilter) -> mpsc::UnboundedReceiver<ScannedDevice> {
        // Stop any existing scan
        self.stop();

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.adapter.is_enabled() {
            warn!("Bluetooth is disabled, not scanning");
            return rx;
        }

        let sink = ScanSink::new(filter, tx);
        let mut state = lock(&self.state);
        if let Err(e) = self.adapter.start_scan(sink.clone()) {
            warn!("Unable to start BLE scan: {}", e);
            return rx;
        }
        info!("Starting BLE scan");

        state.active = true;
        state.generation += 1;
        state.sink = Some(sink);
        state.restarts = 0;
        if !self.period.is_zero() {
            state.restart_task = Some(self.spawn_restart_cycle(state.generation));
        }
        rx
    }

    /// Stop scanning. Safe to call when not scanning.
    ///
    /// Once this returns no pending restart can bring the scan back.
    pub fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(task) = state.restart_task.take() {
            task.abort();
        }
        if !state.active {
            return;
        }
        info!("Stopping BLE scan...");
        state.active = false;
        state.sink = None;
        self.adapter.stop_scan();
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).active
    }

    /// Restart cycles completed by the current scan
    pub fn restart_count(&self) -> usize {
        lock(&self.state).restarts
    }

    fn spawn_restart_cycle(&self, generation: u64) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let period = self.period;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !restart(adapter.as_ref(), &state, generation) {
                    break;
                }
            }
        })
    }
}

/// One restart check. Returns false once the cycle should end.
fn restart(adapter: &dyn BleAdapter, state: &Mutex<ScanState>, generation: u64) -> bool {
    let mut state = lock(state);
    if !state.active || state.generation != generation {
        return false;
    }
    let Some(sink) = state.sink.clone() else {
        return false;
    };

    adapter.stop_scan();
    if let Err(e) = adapter.start_scan(sink) {
        warn!("Scan restart failed: {}", e);
        state.active = false;
        state.sink = None;
        return false;
    }
    state.restarts += 1;
    debug!("Scan window refreshed ({} restarts)", state.restarts);
    true
}

impl Drop for DiscoveryScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::UART_SERVICE;
    use crate::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedPeripheral};

    fn adapter() -> SimulatedAdapter {
        SimulatedAdapter::new()
            .with_peripheral(SimulatedPeripheral::bluefruit_uart("C0:FF:EE:00:00:01"))
            .with_peripheral(SimulatedPeripheral::new("AA:BB:CC:00:00:02", Some("Heart Rate")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cycle_keeps_scanning() {
        let adapter = adapter();
        let mut scanner = DiscoveryScanner::new(Arc::new(adapter.clone()), Duration::from_secs(20));
        let mut rx = scanner.start(ScanFilter {
            service_uuid: Some(UART_SERVICE),
            ..Default::default()
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.display_name(), "Adafruit Bluefruit LE");

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(scanner.is_scanning());
        assert_eq!(scanner.restart_count(), 2);
        assert_eq!(adapter.scan_starts(), 3);
        assert_eq!(adapter.scan_stops(), 2);

        // Every refreshed window reports the device again, filtered
        let repeats: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(repeats.len(), 2);
        assert!(repeats.iter().all(|d| d.address == first.address));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_restart() {
        let adapter = adapter();
        let mut scanner = DiscoveryScanner::new(Arc::new(adapter.clone()), Duration::from_secs(20));
        let mut rx = scanner.start(ScanFilter::default());

        scanner.stop();
        scanner.stop();
        assert!(!scanner.is_scanning());
        assert!(!adapter.is_scanning());
        assert_eq!(adapter.scan_stops(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(adapter.scan_starts(), 1);
        assert_eq!(scanner.restart_count(), 0);

        // Buffered results drain, then the channel is closed
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_adapter_does_not_scan() {
        let adapter = adapter().disabled();
        let mut scanner = DiscoveryScanner::new(Arc::new(adapter.clone()), Duration::from_secs(20));
        let mut rx = scanner.start(ScanFilter::default());

        assert!(!scanner.is_scanning());
        assert!(rx.recv().await.is_none());
        assert_eq!(adapter.scan_starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_never_restarts() {
        let adapter = adapter();
        let mut scanner = DiscoveryScanner::new(Arc::new(adapter.clone()), Duration::ZERO);
        let mut rx = scanner.start(ScanFilter::default());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(scanner.is_scanning());
        assert_eq!(adapter.scan_starts(), 1);

        // Late advertisements still reach the running scan, in order
        adapter.advertise();
        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| d.address)
            .collect();
        assert_eq!(
            seen,
            vec![
                "C0:FF:EE:00:00:01",
                "AA:BB:CC:00:00:02",
                "C0:FF:EE:00:00:01",
                "AA:BB:CC:00:00:02"
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_stops_scan() {
        let adapter = adapter();
        {
            let mut scanner =
                DiscoveryScanner::new(Arc::new(adapter.clone()), Duration::from_secs(20));
            let _rx = scanner.start(ScanFilter::default());
            assert!(adapter.is_scanning());
        }
        assert!(!adapter.is_scanning());
    }
}

//! Registration liveness
//!
//! Two signals decide whether the registration is considered alive: a
//! refresh timer that must be re-armed before it fires, and the cadence of
//! the server's OPTIONS pings.

use super::handler::RegistrationHandler;
use crate::config::KeepaliveConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Current registration status and who to tell when it changes
pub struct StatusReporter {
    registered: AtomicBool,
    handler: Option<Arc<dyn RegistrationHandler>>,
}

impl StatusReporter {
    pub fn new(handler: Option<Arc<dyn RegistrationHandler>>) -> Self {
        Self {
            registered: AtomicBool::new(false),
            handler,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Record `registered` and notify the handler
    pub async fn report(&self, registered: bool) {
        let previous = self.registered.swap(registered, Ordering::SeqCst);
        if previous != registered {
            info!("Registration status: {}", if registered { "up" } else { "down" });
        }
        if let Some(handler) = &self.handler {
            handler.on_registration(registered).await;
        }
    }
}

/// Outcome of one inbound OPTIONS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsVerdict {
    /// Same instant as the previous ping
    Duplicate,
    /// Closer than the threshold; running count of consecutive short gaps
    Burst(u32),
    /// Too many short gaps in a row; the peer is misbehaving
    Flood,
    /// Normal spacing
    Healthy,
}

/// Tracks the gap between consecutive OPTIONS pings
#[derive(Debug)]
pub struct OptionsGuard {
    last: Instant,
    burst: u32,
    threshold: Duration,
    limit: u32,
}

impl OptionsGuard {
    pub fn new(start: Instant, threshold: Duration, limit: u32) -> Self {
        Self {
            last: start,
            burst: 0,
            threshold,
            limit,
        }
    }

    pub fn observe(&mut self, now: Instant) -> OptionsVerdict {
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;

        if elapsed.is_zero() {
            OptionsVerdict::Duplicate
        } else if elapsed < self.threshold {
            self.burst += 1;
            if self.burst > self.limit {
                self.burst = 0;
                OptionsVerdict::Flood
            } else {
                OptionsVerdict::Burst(self.burst)
            }
        } else {
            self.burst = 0;
            OptionsVerdict::Healthy
        }
    }
}

/// Refresh timer plus OPTIONS guard
pub struct KeepaliveMonitor {
    enabled: bool,
    refresh_interval: Duration,
    guard: Mutex<OptionsGuard>,
    timer: Mutex<Option<JoinHandle<()>>>,
    status: Arc<StatusReporter>,
}

impl KeepaliveMonitor {
    pub fn new(config: &KeepaliveConfig, status: Arc<StatusReporter>) -> Self {
        Self {
            enabled: config.enabled,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            guard: Mutex::new(OptionsGuard::new(
                Instant::now(),
                Duration::from_secs(config.options_threshold_secs),
                config.burst_limit,
            )),
            timer: Mutex::new(None),
            status,
        }
    }

    /// (Re)start the refresh timer. If it is not re-armed or cancelled within
    /// the refresh interval the registration is reported down.
    pub fn arm(&self) {
        if !self.enabled {
            return;
        }

        let status = self.status.clone();
        let interval = self.refresh_interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            warn!("No liveness evidence for {:?}, registration considered down", interval);
            status.report(false).await;
        });

        if let Some(previous) = self.timer.lock().replace(task) {
            previous.abort();
        }
        debug!("Refresh timer armed for {:?}", interval);
    }

    pub fn cancel(&self) {
        if let Some(task) = self.timer.lock().take() {
            task.abort();
            debug!("Refresh timer cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Account for one inbound OPTIONS
    pub async fn on_options(&self) -> OptionsVerdict {
        if !self.enabled {
            return OptionsVerdict::Healthy;
        }

        let verdict = self.guard.lock().observe(Instant::now());
        match verdict {
            OptionsVerdict::Flood => {
                warn!("OPTIONS flood from server, registration considered down");
                self.status.report(false).await;
            }
            OptionsVerdict::Healthy => self.arm(),
            OptionsVerdict::Burst(count) => debug!("Short OPTIONS gap ({} in a row)", count),
            OptionsVerdict::Duplicate => {}
        }
        verdict
    }
}

impl Drop for KeepaliveMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config() -> KeepaliveConfig {
        KeepaliveConfig::default()
    }

    fn monitor() -> (KeepaliveMonitor, Arc<StatusReporter>, mpsc::UnboundedReceiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(StatusReporter::new(Some(Arc::new(tx))));
        (KeepaliveMonitor::new(&config(), status.clone()), status, rx)
    }

    #[test]
    fn test_guard_counts_short_gaps() {
        let start = Instant::now();
        let mut guard = OptionsGuard::new(start, Duration::from_secs(15), 4);

        for i in 1..=4 {
            let verdict = guard.observe(start + Duration::from_secs(5 * i));
            assert_eq!(verdict, OptionsVerdict::Burst(i as u32));
        }
        assert_eq!(guard.observe(start + Duration::from_secs(25)), OptionsVerdict::Flood);
        // Counter was reset by the flood
        assert_eq!(guard.observe(start + Duration::from_secs(30)), OptionsVerdict::Burst(1));
        assert_eq!(guard.observe(start + Duration::from_secs(50)), OptionsVerdict::Healthy);
        assert_eq!(guard.observe(start + Duration::from_secs(50)), OptionsVerdict::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_when_not_rearmed() {
        let (monitor, status, mut rx) = monitor();
        status.report(true).await;
        assert_eq!(rx.recv().await, Some(true));

        monitor.arm();
        assert!(monitor.is_armed());

        tokio::time::sleep(Duration::from_secs(126)).await;
        assert_eq!(rx.recv().await, Some(false));
        assert!(!status.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_postpones_expiry() {
        let (monitor, _status, mut rx) = monitor();
        monitor.arm();
        tokio::time::sleep(Duration::from_secs(100)).await;
        monitor.arm();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(rx.try_recv().is_err());

        monitor.cancel();
        assert!(!monitor.is_armed());
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_flood_reports_down() {
        let (monitor, _status, mut rx) = monitor();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(5)).await;
            assert!(matches!(monitor.on_options().await, OptionsVerdict::Burst(_)));
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(monitor.on_options().await, OptionsVerdict::Flood);
        assert_eq!(rx.recv().await, Some(false));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(monitor.on_options().await, OptionsVerdict::Healthy);
        assert!(monitor.is_armed());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_monitor_does_nothing() {
        let status = Arc::new(StatusReporter::new(None));
        let mut config = config();
        config.enabled = false;
        let monitor = KeepaliveMonitor::new(&config, status);
        monitor.arm();
        assert!(!monitor.is_armed());
        assert_eq!(monitor.on_options().await, OptionsVerdict::Healthy);
    }
}

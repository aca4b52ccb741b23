//! Poll dispatcher.
//!
//! While the connection is open, every polling interval the dispatcher queues an UPDATE for
//! each widget and evaluates the interlocks. It stops rescheduling itself as soon as it sees
//! the connection closed.

use crate::dashboard::Dashboard;
use crate::worker::WidgetCommand;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Fans an UPDATE out to every widget and runs the interlocks once per interval.
#[derive(Debug)]
pub struct PollDispatcher {
    interval: Duration,
    next_tick: Option<Instant>,
    cycles: u64,
}

impl PollDispatcher {
    /// Stopped dispatcher polling every `interval` once started.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_tick: None,
            cycles: 0,
        }
    }

    /// Schedule the first cycle at `now`.
    pub fn start(&mut self, now: Instant) {
        debug!("Polling every {:?}", self.interval);
        self.next_tick = Some(now);
    }

    /// Cancel the next cycle.
    pub fn stop(&mut self) {
        self.next_tick = None;
    }

    /// Whether a cycle is scheduled.
    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    /// Whether the next cycle is due at `now`.
    pub fn due(&self, now: Instant) -> bool {
        matches!(self.next_tick, Some(at) if now >= at)
    }

    /// Cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one poll cycle. Returns false, and stops, when the connection is closed.
    pub fn tick(&mut self, now: Instant, dashboard: &mut Dashboard) -> bool {
        if !dashboard.is_connected() {
            debug!("Connection closed; polling stopped");
            self.next_tick = None;
            return false;
        }

        let queued = dashboard.enqueue_all(WidgetCommand::Update);
        dashboard.run_interlocks();

        self.cycles += 1;
        self.next_tick = Some(now + self.interval);
        trace!(cycle = self.cycles, queued, "Poll cycle");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionController;
    use crate::devices::mock::MockDevice;
    use crate::widget::WidgetSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn stops_when_disconnected() {
        let mut dash = Dashboard::new("Test");
        let mut poller = PollDispatcher::new(Duration::from_millis(10));
        let now = Instant::now();
        poller.start(now);
        assert!(poller.due(now));
        assert!(!poller.tick(now, &mut dash));
        assert!(!poller.is_running());
        assert_eq!(poller.cycles(), 0);
    }

    #[test]
    fn runs_interlocks_each_cycle() {
        let mut dash = Dashboard::new("Test");
        dash.add_widget(WidgetSpec::new("A", Box::new(MockDevice::new())))
            .unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        dash.add_interlock("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dash.launch().unwrap();

        let mut controller = ConnectionController::new(Duration::from_millis(10));
        let t0 = Instant::now();
        controller.open(&mut dash, t0).unwrap();

        let mut poller = PollDispatcher::new(Duration::from_millis(10));
        poller.start(t0);
        assert!(poller.tick(t0, &mut dash));
        assert!(!poller.due(t0 + Duration::from_millis(5)));
        assert!(poller.due(t0 + Duration::from_millis(10)));
        assert!(poller.tick(t0 + Duration::from_millis(10), &mut dash));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        controller.close(&mut dash);
        assert!(!poller.tick(t0 + Duration::from_millis(20), &mut dash));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}

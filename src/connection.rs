//! Connection lifecycle.
//!
//! The controller walks the dashboard through Disconnected → Opening → Open → Closing and is
//! the only writer of the connection signal. Opening queues a HANDSHAKE for every widget and
//! then waits one full stride of poll cycles before polling starts, giving slow devices time to
//! answer.

use crate::dashboard::Dashboard;
use crate::error::{AppResult, PanelError};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Phase of the dashboard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No widget is connected or connecting
    Disconnected,
    /// Handshakes queued; polling waits for the settle deadline
    Opening,
    /// Polling
    Open,
    /// Close in progress
    Closing,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Disconnected => "Disconnected",
            ConnectionPhase::Opening => "Opening",
            ConnectionPhase::Open => "Open",
            ConnectionPhase::Closing => "Closing",
        };
        f.write_str(s)
    }
}

/// Drives the open/close state machine.
#[derive(Debug)]
pub struct ConnectionController {
    phase: ConnectionPhase,
    polling_interval: Duration,
    settle_at: Option<Instant>,
}

impl ConnectionController {
    /// `polling_interval` times the largest update stride is the settle delay after opening.
    pub fn new(polling_interval: Duration) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            polling_interval,
            settle_at: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// When polling will start, while opening.
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_at
    }

    /// Open every widget's connection.
    ///
    /// Returns the instant at which polling should begin.
    pub fn open(&mut self, dashboard: &mut Dashboard, now: Instant) -> AppResult<Instant> {
        match self.phase {
            ConnectionPhase::Disconnected => {}
            ConnectionPhase::Opening | ConnectionPhase::Open => {
                debug!("Connection is already {}", self.phase);
                return Ok(self.settle_at.unwrap_or(now));
            }
            ConnectionPhase::Closing => {
                return Err(PanelError::Configuration(
                    "cannot open while the connection is closing".to_string(),
                ))
            }
        }
        if !dashboard.is_launched() {
            return Err(PanelError::NotLaunched);
        }

        self.phase = ConnectionPhase::Opening;
        dashboard.publish_connection(true);
        let queued = dashboard.begin_handshakes();

        let settle_at = now + self.polling_interval * dashboard.max_update_stride();
        self.settle_at = Some(settle_at);
        info!(
            "Opening connections to {} widgets; polling starts in {:?}",
            queued,
            settle_at - now
        );
        Ok(settle_at)
    }

    /// Finish opening once the settle delay has passed. Returns true on the transition.
    pub fn settle(&mut self, now: Instant) -> bool {
        match (self.phase, self.settle_at) {
            (ConnectionPhase::Opening, Some(at)) if now >= at => {
                self.phase = ConnectionPhase::Open;
                self.settle_at = None;
                info!("All connections opened");
                true
            }
            _ => false,
        }
    }

    /// Close every widget's connection. A no-op when already disconnected.
    pub fn close(&mut self, dashboard: &mut Dashboard) {
        if self.phase == ConnectionPhase::Disconnected {
            debug!("Connection is already closed");
            return;
        }
        self.phase = ConnectionPhase::Closing;
        self.settle_at = None;
        dashboard.publish_connection(false);
        dashboard.close_all();
        self.phase = ConnectionPhase::Disconnected;
        info!("All connections closed");
    }
}

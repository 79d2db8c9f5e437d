use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Subscriber session states of the Connection Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Serialize)]
pub struct LinkHealth {
    pub uptime_seconds: u64,
    pub session_phase: SessionPhase,
    pub connected: bool,
    pub reconnects: u32,
    pub dropped_messages: u64,
}

/// Link state shared between the Connection Manager task and the Ingestion
/// Loop. `connected` is advisory: the Connection Manager sets it on transport
/// transitions, the Ingestion Loop overrides it through the staleness rule.
#[derive(Clone)]
pub struct ConnectionStatus {
    start_time: Instant,
    connected: Arc<AtomicBool>,
    phase: Arc<Mutex<SessionPhase>>,
    reconnects: Arc<AtomicU32>,
    dropped: Arc<AtomicU64>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connected: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(Mutex::new(SessionPhase::Disconnected)),
            reconnects: Arc::new(AtomicU32::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn get_health(&self) -> LinkHealth {
        LinkHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            session_phase: self.phase(),
            connected: self.is_connected(),
            reconnects: self.reconnects(),
            dropped_messages: self.dropped(),
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

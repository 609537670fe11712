//! Coordination primitives for multi-device runs.
//!
//! A Spike hub can only take commands while no program is running, so
//! real-time coordination rides on completion signals (console prints)
//! rather than on mid-program commands. The queue here is the meeting
//! point: device callbacks push signals in, the orchestration loop
//! awaits them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Completion signal from one device back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Device name the signal came from.
    pub source: String,
    /// Index of the action that just completed.
    pub action_index: usize,
    /// Optional payload carried with the signal.
    pub payload: Option<String>,
}

impl Signal {
    pub fn new(source: impl Into<String>, action_index: usize) -> Self {
        Self {
            source: source.into(),
            action_index,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

const QUEUE_CAPACITY: usize = 64;

/// Bounded signal queue. Producers never block: a full queue drops the
/// newest signal, because a stalled consumer must not back-pressure a
/// device notification path.
pub struct SignalQueue {
    tx: mpsc::Sender<Signal>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Signal>>,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Non-blocking push, callable from sync callbacks.
    pub fn put(&self, signal: Signal) {
        if self.tx.try_send(signal).is_err() {
            debug!("signal queue full, dropping signal");
        }
    }

    /// Await the next signal; `None` when the timeout elapses.
    pub async fn wait(&self, timeout: Duration) -> Option<Signal> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Drop all pending signals.
    pub async fn clear(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }
}

/// How a set of actions across devices is coordinated.
pub enum Pattern {
    /// Every device starts at once; no coordination. Lowest latency.
    Parallel,
    /// Fixed timing: per-device lanes with staggered starts and a fixed
    /// gap between actions. No runtime signals.
    Choreographed { gap_ms: u64 },
    /// Each action waits for a completion signal before the next one
    /// fires. Slowest but tracks real completion.
    SignalBased {
        queue: Arc<SignalQueue>,
        timeout: Duration,
    },
}

impl Pattern {
    pub fn signal_based(queue: Arc<SignalQueue>) -> Self {
        Pattern::SignalBased {
            queue,
            timeout: Duration::from_secs(5),
        }
    }
}

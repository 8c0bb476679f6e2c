//! Benchmark counters and the periodic reporter.
//!
//! Counters are written by the reactor thread and read (and reset) by the
//! reporter thread, so every field is an atomic. The reporter never touches
//! connections or buffers.

use chrono::Local;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Counters shared between a session and its reporter.
#[derive(Debug, Default)]
pub struct Stats {
    sent: AtomicU64,
    received: AtomicU64,
    messages: AtomicU64,
    unmatched: AtomicU64,
    active_connections: AtomicU64,
}

/// Point-in-time view of `Stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub sent: u64,
    pub received: u64,
    pub messages: u64,
    pub unmatched: u64,
    pub active_connections: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A payload was fully written by the client.
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A digest was received by the client.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload was digested by the server.
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// An echoed digest matched nothing outstanding.
    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        // Never wraps below zero even if a close is reported twice.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Read all counters without resetting.
    #[cfg(test)]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Read all counters and reset the per-interval ones.
    ///
    /// `active_connections` is a gauge and is left as is.
    pub fn take(&self) -> Snapshot {
        Snapshot {
            sent: self.sent.swap(0, Ordering::Relaxed),
            received: self.received.swap(0, Ordering::Relaxed),
            messages: self.messages.swap(0, Ordering::Relaxed),
            unmatched: self.unmatched.swap(0, Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

/// Which summary line the reporter prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Client,
    Server,
}

impl ReportKind {
    /// Format one summary line (without the timestamp).
    pub fn summary(self, snapshot: &Snapshot, interval: Duration) -> String {
        match self {
            ReportKind::Client => format!(
                "Sent count: {}, Received count: {}, Unmatched: {}",
                snapshot.sent, snapshot.received, snapshot.unmatched
            ),
            ReportKind::Server => {
                let secs = interval.as_secs_f64().max(f64::EPSILON);
                format!(
                    "Throughput: {:.2} messages/s, Number of active clients: {}",
                    snapshot.messages as f64 / secs,
                    snapshot.active_connections
                )
            }
        }
    }
}

/// Background thread printing a summary every interval.
///
/// Dropping the handle stops the thread.
pub struct Reporter {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    pub fn spawn(
        kind: ReportKind,
        stats: Arc<Stats>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("reporter".to_string())
            .spawn(move || {
                println!("Starting reports.");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let snapshot = stats.take();
                            println!(
                                "[{}] {}",
                                Local::now().format("%H:%M:%S"),
                                kind.summary(&snapshot, interval)
                            );
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                println!("Stopping reports.");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the reporter and wait for its thread.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("Reporter stopped");
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Single-owner routing for a collaborator's diagnostic log output.
//!
//! A session implementation typically exposes exactly one log hook. Instead of
//! a process-wide global, the hook is a [`LogSinkSlot`] owned by the
//! collaborator: the first claimant wins and keeps the slot until its
//! [`LogSinkLease`] is released or dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{Level, Span};

use crate::TelemetryError;

/// Receives collaborator log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

struct Owner {
    claim: u64,
    name: String,
    sink: Arc<dyn LogSink>,
}

#[derive(Default)]
pub struct LogSinkSlot {
    owner: Mutex<Option<Owner>>,
    next_claim: AtomicU64,
}

impl LogSinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Fails with [`TelemetryError::SlotTaken`] while another
    /// lease is live.
    pub fn claim(
        self: &Arc<Self>,
        name: impl Into<String>,
        sink: Arc<dyn LogSink>,
    ) -> Result<LogSinkLease, TelemetryError> {
        let mut owner = self.owner.lock();
        if let Some(current) = owner.as_ref() {
            return Err(TelemetryError::SlotTaken {
                owner: current.name.clone(),
            });
        }
        let claim = self.next_claim.fetch_add(1, Ordering::Relaxed);
        *owner = Some(Owner {
            claim,
            name: name.into(),
            sink,
        });
        Ok(LogSinkLease {
            slot: Arc::clone(self),
            claim,
            released: false,
        })
    }

    /// Route a line to the current owner. Dropped when unowned.
    pub fn emit(&self, level: Level, message: &str) {
        let sink = self.owner.lock().as_ref().map(|o| Arc::clone(&o.sink));
        if let Some(sink) = sink {
            sink.log(level, message);
        }
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().as_ref().map(|o| o.name.clone())
    }

    fn release(&self, claim: u64) {
        let mut owner = self.owner.lock();
        if owner.as_ref().is_some_and(|o| o.claim == claim) {
            *owner = None;
        }
    }
}

/// Ownership of a [`LogSinkSlot`]. Releases on drop.
pub struct LogSinkLease {
    slot: Arc<LogSinkSlot>,
    claim: u64,
    released: bool,
}

impl LogSinkLease {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.slot.release(self.claim);
        }
    }
}

impl Drop for LogSinkLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Forwards collaborator lines into `tracing` under an injected span.
pub struct TracingLogSink {
    span: Span,
}

impl TracingLogSink {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, level: Level, message: &str) {
        let _entered = self.span.enter();
        match level {
            Level::ERROR => tracing::error!(target: "warden::collaborator", "{message}"),
            Level::WARN => tracing::warn!(target: "warden::collaborator", "{message}"),
            Level::INFO => tracing::info!(target: "warden::collaborator", "{message}"),
            Level::DEBUG => tracing::debug!(target: "warden::collaborator", "{message}"),
            _ => tracing::trace!(target: "warden::collaborator", "{message}"),
        }
    }
}

//! Service acknowledgement board.
//!
//! The supervisor records when it asked a service to launch or stop; the
//! service records when it became ready or stopped. Both sides go through the
//! same JSON document, one entry per service.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::store::{StateStore, WriteOutcome};

/// Acknowledgement timestamps for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAck {
    /// Supervisor asked the service to launch.
    pub launch_request_ts: Option<DateTime<Utc>>,
    /// Service reported ready.
    pub ready_ts: Option<DateTime<Utc>>,
    /// Supervisor asked the service to stop.
    pub stop_request_ts: Option<DateTime<Utc>>,
    /// Service confirmed it stopped.
    pub stopped_ack_ts: Option<DateTime<Utc>>,
    /// Last error the service reported.
    pub last_error: Option<String>,
}

/// Which acknowledgement a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// `launch_request_ts`.
    LaunchRequest,
    /// `ready_ts`.
    Ready,
    /// `stop_request_ts`.
    StopRequest,
    /// `stopped_ack_ts`.
    Stopped,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LaunchRequest => "launch_request",
            Self::Ready => "ready",
            Self::StopRequest => "stop_request",
            Self::Stopped => "stopped",
        })
    }
}

impl ServiceAck {
    /// Timestamp held for `kind`.
    pub fn get(&self, kind: AckKind) -> Option<DateTime<Utc>> {
        match kind {
            AckKind::LaunchRequest => self.launch_request_ts,
            AckKind::Ready => self.ready_ts,
            AckKind::StopRequest => self.stop_request_ts,
            AckKind::Stopped => self.stopped_ack_ts,
        }
    }

    fn set(&mut self, kind: AckKind, at: DateTime<Utc>) {
        let slot = match kind {
            AckKind::LaunchRequest => &mut self.launch_request_ts,
            AckKind::Ready => &mut self.ready_ts,
            AckKind::StopRequest => &mut self.stop_request_ts,
            AckKind::Stopped => &mut self.stopped_ack_ts,
        };
        *slot = Some(at);
    }
}

/// Outcome of [`AckBoard::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWait {
    /// The acknowledgement arrived.
    Acknowledged {
        /// Its timestamp.
        at: DateTime<Utc>,
    },
    /// The timeout elapsed first.
    TimedOut {
        /// How long was waited.
        waited: Duration,
    },
}

/// Per-service acknowledgement document.
#[derive(Clone)]
pub struct AckBoard {
    store: Arc<StateStore>,
    path: PathBuf,
    clock: SharedClock,
}

impl fmt::Debug for AckBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckBoard").field("path", &self.path).finish_non_exhaustive()
    }
}

impl AckBoard {
    /// Board persisted at `path`.
    pub fn new(store: Arc<StateStore>, path: PathBuf, clock: SharedClock) -> Self {
        Self { store, path, clock }
    }

    /// Every service entry.
    pub fn load(&self) -> BTreeMap<String, ServiceAck> {
        self.store.read_uncached(&self.path).unwrap_or_default()
    }

    /// Entry for `service`, empty if absent.
    pub fn get(&self, service: &str) -> ServiceAck {
        self.load().remove(service).unwrap_or_default()
    }

    /// Stamp `kind` for `service` with the current time.
    pub fn mark(&self, service: &str, kind: AckKind) -> WriteOutcome {
        let now = self.clock.now();
        self.update(service, |ack| ack.set(kind, now))
    }

    /// Record the last error reported by `service`.
    pub fn mark_error(&self, service: &str, error: impl Into<String>) -> WriteOutcome {
        let error = error.into();
        self.update(service, |ack| ack.last_error = Some(error))
    }

    fn update(&self, service: &str, f: impl FnOnce(&mut ServiceAck)) -> WriteOutcome {
        let mut board = self.load();
        f(board.entry(service.to_owned()).or_default());
        let outcome = self.store.write(&self.path, &board);
        if !outcome.ok {
            warn!(
                service,
                error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "failed to update service acknowledgement"
            );
        }
        outcome
    }

    /// Poll until `service` acknowledges `kind` at or after `since`, or `timeout` elapses.
    pub async fn wait_for(
        &self,
        service: &str,
        kind: AckKind,
        since: DateTime<Utc>,
        timeout: Duration,
        poll: Duration,
    ) -> AckWait {
        let started = tokio::time::Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or(started);
        loop {
            if let Some(at) = self.get(service).get(kind).filter(|at| *at >= since) {
                debug!(service, kind = %kind, "acknowledged");
                return AckWait::Acknowledged { at };
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return AckWait::TimedOut {
                    waited: now.saturating_duration_since(started),
                };
            }
            tokio::time::sleep(poll.min(deadline.saturating_duration_since(now))).await;
        }
    }
}

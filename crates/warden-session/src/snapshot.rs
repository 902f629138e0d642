//! Immutable connection snapshots and the deferred session they wrap.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;
use warden_core::{ConnectionStatus, RegistrationToken};

use crate::handle::{EventSink, SessionFactory, SessionHandle, Watcher};
use crate::watches::WatchCache;

/// Value of a snapshot's next-state promise.
#[derive(Clone)]
pub enum Successor {
    Pending,
    Next(Arc<Snapshot>),
    /// The manager shut down.
    Terminated,
}

/// A session handle that is only constructed on first use.
pub(crate) struct DeferredSession {
    token: RegistrationToken,
    addresses: String,
    session_timeout: Duration,
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn EventSink>,
    handle: OnceLock<Option<Arc<dyn SessionHandle>>>,
    watches: WatchCache,
    disposed: AtomicBool,
}

impl DeferredSession {
    pub(crate) fn new(
        token: RegistrationToken,
        addresses: String,
        session_timeout: Duration,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn EventSink>,
        watches: WatchCache,
    ) -> Self {
        Self {
            token,
            addresses,
            session_timeout,
            factory,
            sink,
            handle: OnceLock::new(),
            watches,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn token(&self) -> &RegistrationToken {
        &self.token
    }

    pub(crate) fn watches(&self) -> &WatchCache {
        &self.watches
    }

    /// Construct the handle if that has not been tried yet. A failed
    /// construction is logged and stays failed for this session.
    pub(crate) fn materialize(&self) -> Option<Arc<dyn SessionHandle>> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let handle = self
            .handle
            .get_or_init(|| {
                match self.factory.connect(
                    &self.addresses,
                    self.session_timeout,
                    Arc::clone(&self.sink),
                ) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(token = %self.token, error = %e, "session construction failed");
                        None
                    }
                }
            })
            .clone();
        // Lost a race with dispose(); nobody else will close it.
        if self.disposed.load(Ordering::Acquire) {
            if let Some(h) = &handle {
                h.close();
            }
            return None;
        }
        handle
    }

    /// The handle, if it has been constructed.
    pub(crate) fn handle(&self) -> Option<Arc<dyn SessionHandle>> {
        self.handle.get().cloned().flatten()
    }

    /// Close the handle and hand back the user watchers still armed. Only the first
    /// call does anything.
    pub(crate) fn dispose(&self) -> Vec<Arc<dyn Watcher>> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        if let Some(handle) = self.handle() {
            handle.close();
        }
        self.watches.retire()
    }
}

/// One immutable view of the connection.
pub struct Snapshot {
    status: ConnectionStatus,
    session: Option<Arc<DeferredSession>>,
    suspension: Option<Duration>,
    created_at: DateTime<Utc>,
    created: Instant,
    successor: watch::Sender<Successor>,
}

impl Snapshot {
    fn build(
        status: ConnectionStatus,
        session: Option<Arc<DeferredSession>>,
        suspension: Option<Duration>,
    ) -> Arc<Self> {
        let (successor, _) = watch::channel(Successor::Pending);
        Arc::new(Self {
            status,
            session,
            suspension,
            created_at: Utc::now(),
            created: Instant::now(),
            successor,
        })
    }

    pub(crate) fn initial() -> Arc<Self> {
        Self::build(ConnectionStatus::Disconnected, None, None)
    }

    pub(crate) fn suspended(delay: Duration) -> Arc<Self> {
        Self::build(ConnectionStatus::Disconnected, None, Some(delay))
    }

    pub(crate) fn disconnected(session: Arc<DeferredSession>) -> Arc<Self> {
        Self::build(ConnectionStatus::Disconnected, Some(session), None)
    }

    pub(crate) fn died() -> Arc<Self> {
        Self::build(ConnectionStatus::Died, None, None)
    }

    /// Same session, new status.
    pub(crate) fn with_status(&self, status: ConnectionStatus) -> Arc<Self> {
        Self::build(status, self.session.clone(), None)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    pub fn suspension(&self) -> Option<Duration> {
        self.suspension
    }

    pub fn token(&self) -> Option<&RegistrationToken> {
        self.session.as_deref().map(DeferredSession::token)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub(crate) fn session(&self) -> Option<&Arc<DeferredSession>> {
        self.session.as_ref()
    }

    /// The constructed handle, if any.
    pub fn handle(&self) -> Option<Arc<dyn SessionHandle>> {
        self.session.as_ref().and_then(|s| s.handle())
    }

    /// Whether both snapshots wrap the same session.
    pub(crate) fn same_session(&self, other: &Snapshot) -> bool {
        match (&self.session, &other.session) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Assign the successor. Only the first assignment takes effect.
    pub(crate) fn fulfill(&self, next: Successor) -> bool {
        self.successor.send_if_modified(|slot| {
            if matches!(slot, Successor::Pending) {
                *slot = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn peek_successor(&self) -> Successor {
        self.successor.borrow().clone()
    }

    /// Wait for the successor. `None` means the manager shut down.
    pub async fn next(&self) -> Option<Arc<Snapshot>> {
        let mut rx = self.successor.subscribe();
        let successor = match rx.wait_for(|s| !matches!(s, Successor::Pending)).await {
            Ok(value) => value.clone(),
            Err(_) => return None,
        };
        match successor {
            Successor::Next(next) => Some(next),
            Successor::Pending | Successor::Terminated => None,
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("status", &self.status)
            .field("token", &self.token())
            .field("suspension", &self.suspension)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_is_disconnected_without_session() {
        let s = Snapshot::initial();
        assert_eq!(s.status(), ConnectionStatus::Disconnected);
        assert!(!s.is_connected());
        assert!(!s.is_suspended());
        assert!(s.token().is_none());
        assert!(s.handle().is_none());
    }

    #[test]
    fn suspended_carries_countdown() {
        let s = Snapshot::suspended(Duration::from_millis(250));
        assert!(s.is_suspended());
        assert!(!s.is_connected());
        assert_eq!(s.suspension(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn fulfil_assigns_once() {
        let s = Snapshot::initial();
        let first = Snapshot::suspended(Duration::from_secs(1));
        assert!(s.fulfill(Successor::Next(first.clone())));
        assert!(!s.fulfill(Successor::Terminated));
        match s.peek_successor() {
            Successor::Next(n) => assert!(Arc::ptr_eq(&n, &first)),
            _ => panic!("expected first successor"),
        }
    }

    #[tokio::test]
    async fn waiters_see_successor() {
        let s = Snapshot::initial();
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.next().await })
        };
        tokio::task::yield_now().await;
        let next = Snapshot::died();
        s.fulfill(Successor::Next(next.clone()));
        let seen = waiter.await.unwrap().expect("successor");
        assert!(Arc::ptr_eq(&seen, &next));
    }

    #[tokio::test]
    async fn already_fulfilled_resolves_immediately() {
        let s = Snapshot::initial();
        s.fulfill(Successor::Terminated);
        assert!(s.next().await.is_none());
    }
}

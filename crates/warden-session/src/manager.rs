//! Connection lifecycle manager.
//!
//! Owns exactly one logical session at a time. Every change of connection
//! state is a new immutable [`Snapshot`] swapped in under a compare-and-swap;
//! the swap fulfils the old snapshot's next-state promise and publishes the new
//! status in the same critical section, so subscribers observe transitions in
//! swap order.
//!
//! Session state changes and forced reconnects are serialized through a
//! control queue drained by one background task. Watch notifications are
//! delivered by a second task so user watchers never run on collaborator
//! threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Span};
use warden_core::model::{WatchEvent, WatchEventKind};
use warden_core::{ConnectionStatus, RegistrationToken, SessionState};
use warden_settings::WardenSettings;
use warden_telemetry::{LogSinkLease, TracingLogSink};

use crate::backoff::{Backoff, BackoffConfig};
use crate::broadcast::{Broadcaster, StatusObserver, StatusStream, Subscription};
use crate::handle::{EventSink, SessionFactory, SessionHandle, Watcher};
use crate::snapshot::{DeferredSession, Snapshot, Successor};
use crate::watches::{WatchCache, WatchRouter};

/// Resolves the current server address list. `None` or an empty string means
/// no replica is known.
pub trait AddressProvider: Send + Sync {
    fn resolve(&self) -> Option<String>;
}

impl<F> AddressProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn resolve(&self) -> Option<String> {
        self()
    }
}

/// A fixed address list.
#[derive(Clone, Debug)]
pub struct StaticAddresses(pub String);

impl AddressProvider for StaticAddresses {
    fn resolve(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub session_timeout: Duration,
    /// How long a fresh or disconnected handle may take to connect before it
    /// is replaced.
    pub connect_timeout: Duration,
    pub watch_cache_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            watch_cache_capacity: 1024,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_settings(settings: &WardenSettings) -> Self {
        Self {
            session_timeout: settings.connection.session_timeout(),
            connect_timeout: settings.connection.connect_timeout(),
            watch_cache_capacity: settings.connection.watch_cache_capacity,
            backoff: BackoffConfig::from(&settings.backoff),
        }
    }
}

enum Control {
    State {
        token: RegistrationToken,
        state: SessionState,
    },
    Reconnect {
        expected: Arc<Snapshot>,
    },
    Stop,
}

struct Delivery {
    watcher: Arc<dyn Watcher>,
    event: WatchEvent,
}

/// Sink handed to one session handle; tags its events with the session token.
struct ManagerSink {
    token: RegistrationToken,
    control: mpsc::UnboundedSender<Control>,
}

impl EventSink for ManagerSink {
    fn on_state(&self, state: SessionState) {
        let _ = self.control.send(Control::State {
            token: self.token.clone(),
            state,
        });
    }
}

pub struct ManagerBuilder {
    factory: Arc<dyn SessionFactory>,
    addresses: Arc<dyn AddressProvider>,
    config: ManagerConfig,
    name: String,
    span: Option<Span>,
    jitter_seed: Option<u64>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used when claiming the collaborator's log sink.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Span all manager events are recorded under.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Start the manager. Must be called within a Tokio runtime.
    pub fn build(self) -> ConnectionManager {
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("connection_manager", name = %self.name));
        let backoff = match self.jitter_seed {
            Some(seed) => Backoff::with_seed(self.config.backoff.clone(), seed),
            None => Backoff::new(self.config.backoff.clone()),
        };

        let log_lease = self.factory.log_slot().and_then(|slot| {
            match slot.claim(self.name.clone(), Arc::new(TracingLogSink::new(span.clone()))) {
                Ok(lease) => Some(lease),
                Err(e) => {
                    debug!(parent: &span, error = %e, "collaborator log sink keeps its owner");
                    None
                }
            }
        });

        let runtime = Handle::current();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let initial = Snapshot::initial();

        let inner = Arc::new_cyclic(|this| Inner {
            name: self.name,
            config: self.config,
            factory: self.factory,
            addresses: self.addresses,
            backoff,
            current: RwLock::new(Arc::clone(&initial)),
            transition: Mutex::new(()),
            broadcaster: Broadcaster::new(),
            reconnecting: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            control: control_tx,
            deliveries: delivery_tx,
            runtime: runtime.clone(),
            span: span.clone(),
            log_lease: Mutex::new(log_lease),
            this: this.clone(),
        });

        inner.broadcaster.publish(initial.status());
        runtime.spawn(run_control(Arc::downgrade(&inner), control_rx));
        runtime.spawn(run_dispatch(delivery_rx, span));
        let _ = inner.control.send(Control::Reconnect { expected: initial });

        ConnectionManager { inner }
    }
}

/// Owns one logical session and replaces it as the connection churns.
///
/// Dropping the manager shuts it down.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn builder(
        factory: Arc<dyn SessionFactory>,
        addresses: Arc<dyn AddressProvider>,
    ) -> ManagerBuilder {
        ManagerBuilder {
            factory,
            addresses,
            config: ManagerConfig::default(),
            name: "connection-manager".to_string(),
            span: None,
            jitter_seed: None,
        }
    }

    pub fn new(
        factory: Arc<dyn SessionFactory>,
        addresses: Arc<dyn AddressProvider>,
        config: ManagerConfig,
    ) -> Self {
        Self::builder(factory, addresses).config(config).build()
    }

    /// Wait until a connected handle is available or `deadline` passes.
    ///
    /// Returns `None` on deadline or shutdown; never a handle whose snapshot
    /// has already been superseded at the time it is checked.
    pub async fn acquire_usable_session(&self, deadline: Instant) -> Option<Arc<dyn SessionHandle>> {
        self.inner
            .acquire(deadline)
            .await
            .and_then(|snapshot| snapshot.handle())
    }

    pub(crate) async fn acquire_snapshot(&self, deadline: Instant) -> Option<Arc<Snapshot>> {
        self.inner.acquire(deadline).await
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.inner.current().status()
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.inner.current()
    }

    /// Subscribe to status transitions. The last published status is replayed
    /// immediately. Observers run inside the transition critical section and
    /// must not call back into the manager's `shutdown`.
    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) -> Subscription {
        self.inner.broadcaster.subscribe(observer)
    }

    pub fn status_stream(&self) -> StatusStream {
        StatusStream::subscribe(&self.inner.broadcaster)
    }

    /// Install the terminal state and release the session. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn backoff_depth(&self) -> i32 {
        self.inner.backoff.depth()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

struct Inner {
    name: String,
    config: ManagerConfig,
    factory: Arc<dyn SessionFactory>,
    addresses: Arc<dyn AddressProvider>,
    backoff: Backoff,
    /// Assigned only by `install`.
    current: RwLock<Arc<Snapshot>>,
    /// Serializes swap, promise fulfilment and publication.
    transition: Mutex<()>,
    broadcaster: Arc<Broadcaster>,
    reconnecting: AtomicBool,
    shut_down: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    runtime: Handle,
    span: Span,
    log_lease: Mutex<Option<LogSinkLease>>,
    this: Weak<Inner>,
}

impl Inner {
    fn current(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    fn is_current(&self, snapshot: &Arc<Snapshot>) -> bool {
        Arc::ptr_eq(&*self.current.read(), snapshot)
    }

    async fn acquire(self: &Arc<Self>, deadline: Instant) -> Option<Arc<Snapshot>> {
        let mut snapshot = self.current();
        loop {
            match snapshot.peek_successor() {
                Successor::Next(next) => {
                    snapshot = next;
                    continue;
                }
                Successor::Terminated => return None,
                Successor::Pending => {}
            }
            if snapshot.status().is_terminal() {
                return None;
            }
            if snapshot.is_connected() {
                if snapshot.handle().is_some() {
                    return Some(snapshot);
                }
            } else {
                self.kick(&snapshot);
            }

            match tokio::time::timeout_at(deadline, snapshot.next()).await {
                Ok(Some(next)) => snapshot = next,
                Ok(None) => return None,
                Err(_) => {
                    debug!(
                        parent: &self.span,
                        status = %snapshot.status(),
                        "no usable session before deadline"
                    );
                    return None;
                }
            }
        }
    }

    /// Nudge a non-connected snapshot along when no timer will.
    fn kick(self: &Arc<Self>, snapshot: &Arc<Snapshot>) {
        let overdue = match (snapshot.suspension(), snapshot.session()) {
            (Some(countdown), _) => snapshot.age() >= countdown,
            (None, Some(session)) => {
                if snapshot.status() == ConnectionStatus::Expired {
                    true
                } else {
                    session.materialize();
                    snapshot.age() >= self.config.connect_timeout
                }
            }
            (None, None) => true,
        };
        if overdue {
            self.try_reconnect(snapshot);
        }
    }

    fn try_reconnect(self: &Arc<Self>, expected: &Arc<Snapshot>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.reconnect(expected);
        self.reconnecting.store(false, Ordering::Release);
    }

    fn reconnect(self: &Arc<Self>, expected: &Arc<Snapshot>) {
        if self.shut_down.load(Ordering::Acquire) || !self.is_current(expected) {
            return;
        }

        let addresses = match self.addresses.resolve() {
            Some(a) if !a.trim().is_empty() => a,
            _ => {
                let depth = self.backoff.increase();
                warn!(parent: &self.span, depth, "no server addresses resolved; reconnect abandoned");
                return;
            }
        };

        let delay = self.backoff.next_delay();
        let next = if !delay.is_zero() && !expected.is_suspended() {
            info!(
                parent: &self.span,
                delay_ms = delay.as_millis() as u64,
                depth = self.backoff.depth(),
                "suspending reconnection"
            );
            Snapshot::suspended(delay)
        } else {
            Snapshot::disconnected(self.new_session(addresses))
        };

        if !self.install(expected, next) {
            debug!(parent: &self.span, "reconnect lost the race; discarded");
        }
    }

    fn new_session(&self, addresses: String) -> Arc<DeferredSession> {
        let token = RegistrationToken::new();
        let sink: Arc<dyn EventSink> = Arc::new(ManagerSink {
            token: token.clone(),
            control: self.control.clone(),
        });
        let router: Weak<dyn WatchRouter> = self.this.clone();
        let watches = WatchCache::new(token.clone(), self.config.watch_cache_capacity, router);
        Arc::new(DeferredSession::new(
            token,
            addresses,
            self.config.session_timeout,
            Arc::clone(&self.factory),
            sink,
            watches,
        ))
    }

    /// Swap `next` in if `expected` is still current.
    fn install(self: &Arc<Self>, expected: &Arc<Snapshot>, next: Arc<Snapshot>) -> bool {
        {
            let _transition = self.transition.lock();
            {
                let mut current = self.current.write();
                if !Arc::ptr_eq(&*current, expected) {
                    return false;
                }
                *current = Arc::clone(&next);
            }
            if next.status().is_terminal() {
                expected.fulfill(Successor::Terminated);
                self.broadcaster.publish_distinct(next.status());
                self.broadcaster.complete();
            } else {
                expected.fulfill(Successor::Next(Arc::clone(&next)));
                self.broadcaster.publish_distinct(next.status());
            }
        }

        let token = next.token().map(|t| t.as_str().to_string());
        if expected.status() != next.status() {
            info!(
                parent: &self.span,
                previous = %expected.status(),
                status = %next.status(),
                token = token.as_deref().unwrap_or("-"),
                "connection state changed"
            );
        } else {
            debug!(
                parent: &self.span,
                status = %next.status(),
                token = token.as_deref().unwrap_or("-"),
                suspended = next.is_suspended(),
                "snapshot replaced"
            );
        }

        self.after_transition(expected, &next);
        true
    }

    fn after_transition(self: &Arc<Self>, previous: &Arc<Snapshot>, next: &Arc<Snapshot>) {
        if let Some(session) = previous.session() {
            if !previous.same_session(next) {
                self.retire(session);
            }
        }

        match next.status() {
            ConnectionStatus::Died => {}
            ConnectionStatus::Connected | ConnectionStatus::ConnectedReadOnly => {
                self.backoff.reset();
            }
            ConnectionStatus::Expired => {
                let _ = self.control.send(Control::Reconnect {
                    expected: Arc::clone(next),
                });
            }
            ConnectionStatus::Disconnected => self.schedule_retry(next),
        }
    }

    fn schedule_retry(self: &Arc<Self>, snapshot: &Arc<Snapshot>) {
        let weak = Arc::downgrade(self);
        let snapshot = Arc::clone(snapshot);

        if let Some(countdown) = snapshot.suspension() {
            self.runtime.spawn(async move {
                tokio::time::sleep(countdown).await;
                if let Some(inner) = weak.upgrade() {
                    inner.reconnect(&snapshot);
                }
            });
            return;
        }

        let Some(session) = snapshot.session().cloned() else {
            return;
        };
        let connect_timeout = self.config.connect_timeout;
        self.runtime.spawn(async move {
            if !weak.upgrade().is_some_and(|inner| inner.is_current(&snapshot)) {
                return;
            }
            session.materialize();
            tokio::time::sleep(connect_timeout).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_current(&snapshot) {
                let depth = inner.backoff.increase();
                warn!(
                    parent: &inner.span,
                    token = %session.token(),
                    timeout_ms = connect_timeout.as_millis() as u64,
                    depth,
                    "session did not connect in time; replacing"
                );
                inner.reconnect(&snapshot);
            }
        });
    }

    /// Close a superseded session and tell its still-armed watchers they will
    /// not fire.
    fn retire(&self, session: &Arc<DeferredSession>) {
        let watchers = session.dispose();
        debug!(
            parent: &self.span,
            token = %session.token(),
            watchers = watchers.len(),
            "session retired"
        );
        for watcher in watchers {
            let _ = self.deliveries.send(Delivery {
                watcher,
                event: WatchEvent::new(WatchEventKind::ClientDisconnected, ""),
            });
        }
    }

    fn on_session_state(self: &Arc<Self>, token: &RegistrationToken, state: SessionState) {
        let status = ConnectionStatus::from(state);
        loop {
            let current = self.current();
            if current.token() != Some(token) {
                debug!(parent: &self.span, %token, ?state, "state change from superseded session dropped");
                return;
            }
            if current.status() == status {
                return;
            }
            if self.install(&current, current.with_status(status)) {
                return;
            }
        }
    }

    fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let current = self.current();
            if current.status().is_terminal() || self.install(&current, Snapshot::died()) {
                break;
            }
        }
        let _ = self.control.send(Control::Stop);
        if let Some(lease) = self.log_lease.lock().take() {
            lease.release();
        }
        info!(parent: &self.span, "connection manager shut down");
    }
}

impl WatchRouter for Inner {
    fn route(&self, token: &RegistrationToken, watcher: &Arc<dyn Watcher>, event: WatchEvent) {
        if self.current().token() != Some(token) {
            debug!(
                parent: &self.span,
                %token,
                path = %event.path,
                "watch event from superseded session dropped"
            );
            return;
        }
        let _ = self.deliveries.send(Delivery {
            watcher: Arc::clone(watcher),
            event,
        });
    }
}

async fn run_control(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Control>) {
    while let Some(command) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match command {
            Control::State { token, state } => inner.on_session_state(&token, state),
            Control::Reconnect { expected } => inner.reconnect(&expected),
            Control::Stop => break,
        }
    }
}

async fn run_dispatch(mut rx: mpsc::UnboundedReceiver<Delivery>, span: Span) {
    while let Some(Delivery { watcher, event }) = rx.recv().await {
        let path = event.path.clone();
        let kind = event.kind;
        if catch_unwind(AssertUnwindSafe(|| watcher.process(event))).is_err() {
            warn!(parent: &span, path = %path, ?kind, "watcher panicked");
        }
    }
}

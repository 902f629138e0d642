//! Contracts for the session collaborator: the handle, its factory, the
//! state-event sink it reports through, and watchers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use warden_core::model::{Acl, CreateMode, Stat, WatchEvent};
use warden_core::{SessionError, SessionState};
use warden_telemetry::LogSinkSlot;

/// One logical session with the coordination service.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn session_id(&self) -> i64;
    fn password(&self) -> Vec<u8>;
    fn state(&self) -> SessionState;

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<String, SessionError>;

    async fn delete(&self, path: &str, version: i32) -> Result<(), SessionError>;

    async fn exists(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Option<Stat>, SessionError>;

    async fn get_data(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<(Vec<u8>, Stat), SessionError>;

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat, SessionError>;

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>, SessionError>;

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), SessionError>;

    async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> Result<Stat, SessionError>;

    /// Release the session. Idempotent and infallible.
    fn close(&self);
}

/// Receives raw state changes from a session handle.
pub trait EventSink: Send + Sync {
    fn on_state(&self, state: SessionState);
}

/// Receives watch notifications. Identity is the `Arc` allocation, so the same
/// `Arc<dyn Watcher>` registered twice on a path is one registration.
pub trait Watcher: Send + Sync {
    fn process(&self, event: WatchEvent);
}

impl<F> Watcher for F
where
    F: Fn(WatchEvent) + Send + Sync,
{
    fn process(&self, event: WatchEvent) {
        self(event)
    }
}

/// Creates session handles. Construction must not block on the handshake;
/// progress is reported through the sink.
pub trait SessionFactory: Send + Sync {
    fn connect(
        &self,
        addresses: &str,
        session_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn SessionHandle>, SessionError>;

    /// The collaborator's diagnostic log hook, if it has one.
    fn log_slot(&self) -> Option<Arc<LogSinkSlot>> {
        None
    }
}

/// Identity key of a watcher allocation.
pub(crate) fn watcher_key(watcher: &Arc<dyn Watcher>) -> usize {
    Arc::as_ptr(watcher) as *const () as usize
}

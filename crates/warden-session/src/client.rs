//! Coordination operations over whatever session the manager currently holds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use warden_core::errors::result_code;
use warden_core::model::{Acl, CreateMode, Stat, DEFAULT_MAX_DATA_LEN};
use warden_core::path::validate_path;
use warden_core::{OpError, SessionError};
use warden_settings::WardenSettings;

use crate::handle::{SessionHandle, Watcher};
use crate::manager::ConnectionManager;
use crate::snapshot::Snapshot;
use crate::watches::{WatchKind, WatchRegistration};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Bound on both acquiring a session and the call itself.
    pub operation_timeout: Duration,
    pub max_data_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            max_data_len: DEFAULT_MAX_DATA_LEN,
        }
    }
}

impl ClientConfig {
    pub fn from_settings(settings: &WardenSettings) -> Self {
        Self {
            operation_timeout: settings.connection.operation_timeout(),
            max_data_len: settings.connection.max_data_len,
        }
    }
}

struct Active {
    snapshot: Arc<Snapshot>,
    handle: Arc<dyn SessionHandle>,
}

impl Active {
    /// Route a user watcher through this session's identity cache and record
    /// the arming.
    fn watch(
        &self,
        watcher: Option<Arc<dyn Watcher>>,
        kind: WatchKind,
        path: &str,
    ) -> Option<PendingWatch> {
        let watcher = watcher?;
        let session = self.snapshot.session()?;
        let registration = session.watches().wrap(&watcher);
        let fresh = registration.arm(kind, path);
        Some(PendingWatch {
            registration,
            kind,
            fresh,
        })
    }
}

/// A watch recorded as armed before the call that arms it.
struct PendingWatch {
    registration: Arc<WatchRegistration>,
    kind: WatchKind,
    fresh: bool,
}

impl PendingWatch {
    fn watcher(&self) -> Arc<dyn Watcher> {
        self.registration.clone()
    }

    /// The call failed, so the collaborator did not keep this arming.
    fn settle<T>(pending: Option<Self>, path: &str, result: &Result<T, OpError>) {
        if let (Some(p), Err(_)) = (pending, result) {
            if p.fresh {
                p.registration.disarm(p.kind, path);
            }
        }
    }
}

/// Typed coordination operations.
///
/// Each call validates its arguments, waits up to `operation_timeout` for a
/// connected session, then runs the call under the same timeout.
pub struct Client {
    manager: Arc<ConnectionManager>,
    config: ClientConfig,
}

impl Client {
    pub fn new(manager: Arc<ConnectionManager>, config: ClientConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<String, OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, mode.is_sequential())?;
            self.check_data(data)?;
            check_acl(acl)?;
            let active = self.active().await?;
            self.bounded(path, active.handle.create(path, data, acl, mode))
                .await
        }
        .await;
        trace_op("create", path, &result);
        result
    }

    pub async fn delete(&self, path: &str, version: i32) -> Result<(), OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            let active = self.active().await?;
            self.bounded(path, active.handle.delete(path, version)).await
        }
        .await;
        trace_op("delete", path, &result);
        result
    }

    pub async fn exists(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Option<Stat>, OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            let active = self.active().await?;
            let pending = active.watch(watcher, WatchKind::Data, path);
            let watcher = pending.as_ref().map(PendingWatch::watcher);
            let result = self
                .bounded(path, active.handle.exists(path, watcher))
                .await;
            PendingWatch::settle(pending, path, &result);
            result
        }
        .await;
        trace_op("exists", path, &result);
        result
    }

    pub async fn get_data(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<(Vec<u8>, Stat), OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            let active = self.active().await?;
            let pending = active.watch(watcher, WatchKind::Data, path);
            let watcher = pending.as_ref().map(PendingWatch::watcher);
            let result = self
                .bounded(path, active.handle.get_data(path, watcher))
                .await;
            PendingWatch::settle(pending, path, &result);
            result
        }
        .await;
        trace_op("get_data", path, &result);
        result
    }

    pub async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat, OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            self.check_data(data)?;
            let active = self.active().await?;
            self.bounded(path, active.handle.set_data(path, data, version))
                .await
        }
        .await;
        trace_op("set_data", path, &result);
        result
    }

    pub async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>, OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            let active = self.active().await?;
            let pending = active.watch(watcher, WatchKind::Children, path);
            let watcher = pending.as_ref().map(PendingWatch::watcher);
            let result = self
                .bounded(path, active.handle.get_children(path, watcher))
                .await;
            PendingWatch::settle(pending, path, &result);
            result
        }
        .await;
        trace_op("get_children", path, &result);
        result
    }

    pub async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            let active = self.active().await?;
            self.bounded(path, active.handle.get_acl(path)).await
        }
        .await;
        trace_op("get_acl", path, &result);
        result
    }

    pub async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> Result<Stat, OpError> {
        let result = async {
            self.ensure_alive()?;
            validate_path(path, false)?;
            check_acl(acl)?;
            let active = self.active().await?;
            self.bounded(path, active.handle.set_acl(path, acl, version))
                .await
        }
        .await;
        trace_op("set_acl", path, &result);
        result
    }

    fn ensure_alive(&self) -> Result<(), OpError> {
        if self.manager.is_shut_down() {
            return Err(OpError::Died);
        }
        Ok(())
    }

    fn check_data(&self, data: &[u8]) -> Result<(), OpError> {
        if data.len() > self.config.max_data_len {
            return Err(OpError::BadArguments(format!(
                "payload of {} bytes exceeds the {} byte limit",
                data.len(),
                self.config.max_data_len
            )));
        }
        Ok(())
    }

    async fn active(&self) -> Result<Active, OpError> {
        let deadline = Instant::now() + self.config.operation_timeout;
        let snapshot = self.manager.acquire_snapshot(deadline).await;
        match snapshot.and_then(|s| s.handle().map(|h| (s, h))) {
            Some((snapshot, handle)) => Ok(Active { snapshot, handle }),
            None if self.manager.is_shut_down() => Err(OpError::Died),
            None => Err(OpError::NotConnected(self.config.operation_timeout)),
        }
    }

    async fn bounded<T>(
        &self,
        path: &str,
        call: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, OpError> {
        let timeout = self.config.operation_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(match OpError::from_session(path, e) {
                OpError::Timeout(_) => OpError::Timeout(timeout),
                other => other,
            }),
            Err(_) => Err(OpError::Timeout(timeout)),
        }
    }
}

fn check_acl(acl: &[Acl]) -> Result<(), OpError> {
    if acl.is_empty() {
        return Err(OpError::BadArguments("ACL must not be empty".into()));
    }
    Ok(())
}

fn trace_op<T>(op: &'static str, path: &str, result: &Result<T, OpError>) {
    match result {
        Ok(_) => debug!(op, path, code = %result_code(result), "operation completed"),
        Err(e) => debug!(op, path, code = %result_code(result), error = %e, "operation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ManagerConfig, StaticAddresses};
    use crate::memory::MemoryEnsemble;
    use parking_lot::Mutex;
    use warden_core::model::{WatchEvent, WatchEventKind};
    use warden_core::ResultCode;

    fn client(ensemble: &MemoryEnsemble, timeout: Duration) -> Client {
        let manager = ConnectionManager::builder(
            Arc::new(ensemble.clone()),
            Arc::new(StaticAddresses("mem:1".into())),
        )
        .config(ManagerConfig {
            connect_timeout: Duration::from_secs(2),
            ..ManagerConfig::default()
        })
        .jitter_seed(5)
        .build();
        Client::new(
            Arc::new(manager),
            ClientConfig {
                operation_timeout: timeout,
                max_data_len: 16,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_through_the_manager() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble, Duration::from_secs(1));
        let acl = Acl::open_unsafe();

        assert_eq!(
            client.create("/cfg", b"v1", &acl, CreateMode::Persistent).await.unwrap(),
            "/cfg"
        );
        let stat = client.set_data("/cfg", b"v2", 0).await.unwrap();
        assert_eq!(stat.version, 1);
        let (data, _) = client.get_data("/cfg", None).await.unwrap();
        assert_eq!(data, b"v2");
        assert_eq!(client.get_children("/", None).await.unwrap(), vec!["cfg"]);
        assert_eq!(client.get_acl("/cfg").await.unwrap().0, acl);
        client.set_acl("/cfg", &acl, 0).await.unwrap();
        client.delete("/cfg", -1).await.unwrap();
        assert!(client.exists("/cfg", None).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn collaborator_failures_are_typed() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble, Duration::from_secs(1));
        let acl = Acl::open_unsafe();

        let err = client.get_data("/nope", None).await.unwrap_err();
        assert!(matches!(err, OpError::NodeNotFound { ref path } if path == "/nope"));

        client.create("/n", b"", &acl, CreateMode::Persistent).await.unwrap();
        let err = client
            .create("/n", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::NodeAlreadyExists);
        let err = client.set_data("/n", b"", 7).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::VersionsMismatch);

        client.create("/n/c", b"", &acl, CreateMode::Persistent).await.unwrap();
        let err = client.delete("/n", -1).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::NodeHasChildren);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_arguments_never_reach_the_collaborator() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let client = client(&ensemble, Duration::from_secs(1));
        let acl = Acl::open_unsafe();

        for path in ["", "relative", "/trailing/", "/a//b", "/a/./b", "/nul\u{0}"] {
            let err = client.exists(path, None).await.unwrap_err();
            assert_eq!(err.code(), ResultCode::BadArguments, "{path:?}");
        }
        let err = client
            .create("/big", &[0u8; 17], &acl, CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::BadArguments);
        let err = client
            .create("/x", b"", &[], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::BadArguments);
        assert_eq!(ensemble.sessions_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_after_operation_timeout() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let client = client(&ensemble, Duration::from_millis(500));

        let started = Instant::now();
        let err = client.exists("/", None).await.unwrap_err();
        assert!(matches!(err, OpError::NotConnected(d) if d == Duration::from_millis(500)));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble, Duration::from_millis(200));
        client.exists("/", None).await.unwrap();

        ensemble.set_latency(Duration::from_secs(1));
        let err = client.get_data("/", None).await.unwrap_err();
        assert!(matches!(err, OpError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_rejects_writes() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_read_only(true);
        let client = client(&ensemble, Duration::from_secs(1));

        assert!(client.exists("/", None).await.is_ok());
        let err = client
            .create("/w", b"", &Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::NotReadonlyOperation);
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_client_answers_died() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble, Duration::from_secs(1));
        client.exists("/", None).await.unwrap();
        client.manager().shutdown();

        let err = client.get_children("/", None).await.unwrap_err();
        assert!(matches!(err, OpError::Died));
        let err = client.exists("bad path", None).await.unwrap_err();
        assert!(matches!(err, OpError::Died));
    }

    #[tokio::test(start_paused = true)]
    async fn same_watcher_fires_once() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble, Duration::from_secs(1));
        let acl = Acl::open_unsafe();
        client.create("/w", b"", &acl, CreateMode::Persistent).await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let watcher: Arc<dyn Watcher> = Arc::new(move |e: WatchEvent| sink.lock().push(e));
        for _ in 0..5 {
            client.get_data("/w", Some(watcher.clone())).await.unwrap();
        }
        client.set_data("/w", b"x", -1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *events.lock(),
            vec![WatchEvent::new(WatchEventKind::DataChanged, "/w")]
        );
    }
}

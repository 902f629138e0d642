//! In-process coordination service.
//!
//! [`MemoryEnsemble`] implements [`SessionFactory`] over a shared node tree so
//! the lifecycle manager and client can be exercised without a server. Fault
//! controls drive session state the way a real ensemble would: connection
//! loss, reconnection, expiry, read-only mode, slow responses.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::Level;
use warden_core::model::{Acl, CreateMode, Perms, Stat, WatchEvent, WatchEventKind};
use warden_core::path::parent;
use warden_core::{ConnectionStatus, SessionError, SessionState};
use warden_telemetry::LogSinkSlot;

use crate::handle::{watcher_key, EventSink, SessionFactory, SessionHandle, Watcher};

const FIRST_SESSION_ID: i64 = 0x0100_0000_0000;

struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
}

struct Armed {
    session: i64,
    watcher: Arc<dyn Watcher>,
}

type Fired = Vec<(Arc<dyn Watcher>, WatchEvent)>;

struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    data_watches: HashMap<String, Vec<Armed>>,
    child_watches: HashMap<String, Vec<Armed>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                acl: Acl::open_unsafe(),
                stat: Stat::default(),
            },
        );
        Self {
            nodes,
            zxid: 0,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn node(&self, path: &str) -> Result<&Node, SessionError> {
        self.nodes.get(path).ok_or(SessionError::NoNode)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn create(
        &mut self,
        session: i64,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
        fired: &mut Fired,
    ) -> Result<String, SessionError> {
        if acl.is_empty() {
            return Err(SessionError::InvalidAcl);
        }
        let parent_path = parent(path).ok_or(SessionError::NodeExists)?.to_string();
        let parent_node = self.node(&parent_path)?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(SessionError::NoChildrenForEphemerals);
        }
        if !allows(&parent_node.acl, Perms::CREATE) {
            return Err(SessionError::NoAuth);
        }
        let actual = if mode.is_sequential() {
            format!("{path}{:010}", parent_node.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(SessionError::NodeExists);
        }

        let zxid = self.next_zxid();
        let now = now_millis();
        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                acl: acl.to_vec(),
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    pzxid: zxid,
                    ctime: now,
                    mtime: now,
                    ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
                    data_length: data.len() as i32,
                    ..Stat::default()
                },
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent_path) {
            p.stat.cversion += 1;
            p.stat.num_children += 1;
            p.stat.pzxid = zxid;
        }

        self.trigger_data(&actual, WatchEventKind::Created, fired);
        self.trigger_children(&parent_path, WatchEventKind::ChildrenChanged, fired);
        Ok(actual)
    }

    fn delete(&mut self, path: &str, version: i32, fired: &mut Fired) -> Result<(), SessionError> {
        let parent_path = parent(path)
            .ok_or_else(|| SessionError::BadArguments("the root node cannot be deleted".into()))?
            .to_string();
        let node = self.node(path)?;
        if version != -1 && version != node.stat.version {
            return Err(SessionError::BadVersion);
        }
        if node.stat.num_children > 0 {
            return Err(SessionError::NotEmpty);
        }
        if !allows(&self.node(&parent_path)?.acl, Perms::DELETE) {
            return Err(SessionError::NoAuth);
        }
        self.remove(path, &parent_path, fired);
        Ok(())
    }

    fn remove(&mut self, path: &str, parent_path: &str, fired: &mut Fired) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        let zxid = self.next_zxid();
        if let Some(p) = self.nodes.get_mut(parent_path) {
            p.stat.cversion += 1;
            p.stat.num_children -= 1;
            p.stat.pzxid = zxid;
        }
        self.trigger_data(path, WatchEventKind::Deleted, fired);
        self.trigger_children(path, WatchEventKind::Deleted, fired);
        self.trigger_children(parent_path, WatchEventKind::ChildrenChanged, fired);
    }

    fn set_data(
        &mut self,
        path: &str,
        data: &[u8],
        version: i32,
        fired: &mut Fired,
    ) -> Result<Stat, SessionError> {
        let node = self.node(path)?;
        if !allows(&node.acl, Perms::WRITE) {
            return Err(SessionError::NoAuth);
        }
        if version != -1 && version != node.stat.version {
            return Err(SessionError::BadVersion);
        }
        let zxid = self.next_zxid();
        let stat = {
            let node = self.nodes.get_mut(path).ok_or(SessionError::NoNode)?;
            node.data = data.to_vec();
            node.stat.version += 1;
            node.stat.mzxid = zxid;
            node.stat.mtime = now_millis();
            node.stat.data_length = data.len() as i32;
            node.stat.clone()
        };
        self.trigger_data(path, WatchEventKind::DataChanged, fired);
        Ok(stat)
    }

    fn set_acl(&mut self, path: &str, acl: &[Acl], version: i32) -> Result<Stat, SessionError> {
        if acl.is_empty() {
            return Err(SessionError::InvalidAcl);
        }
        let node = self.nodes.get_mut(path).ok_or(SessionError::NoNode)?;
        if !allows(&node.acl, Perms::ADMIN) {
            return Err(SessionError::NoAuth);
        }
        if version != -1 && version != node.stat.aversion {
            return Err(SessionError::BadVersion);
        }
        node.acl = acl.to_vec();
        node.stat.aversion += 1;
        Ok(node.stat.clone())
    }

    fn trigger_data(&mut self, path: &str, kind: WatchEventKind, fired: &mut Fired) {
        if let Some(armed) = self.data_watches.remove(path) {
            fired.extend(armed.into_iter().map(|a| (a.watcher, WatchEvent::new(kind, path))));
        }
    }

    fn trigger_children(&mut self, path: &str, kind: WatchEventKind, fired: &mut Fired) {
        if let Some(armed) = self.child_watches.remove(path) {
            fired.extend(armed.into_iter().map(|a| (a.watcher, WatchEvent::new(kind, path))));
        }
    }

    /// Drop a session's watches and ephemeral nodes.
    fn purge_session(&mut self, session: i64, fired: &mut Fired) {
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for armed in watches.values_mut() {
                armed.retain(|a| a.session != session);
            }
            watches.retain(|_, armed| !armed.is_empty());
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session)
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            if let Some(parent_path) = parent(&path).map(str::to_string) {
                self.remove(&path, &parent_path, fired);
            }
        }
    }
}

/// Arm a one-shot watch. The same watcher object on the same path and
/// session is armed once.
fn arm(
    watches: &mut HashMap<String, Vec<Armed>>,
    path: &str,
    session: i64,
    watcher: Arc<dyn Watcher>,
) {
    let armed = watches.entry(path.to_string()).or_default();
    let key = watcher_key(&watcher);
    if !armed
        .iter()
        .any(|a| a.session == session && watcher_key(&a.watcher) == key)
    {
        armed.push(Armed { session, watcher });
    }
}

fn allows(acl: &[Acl], perm: Perms) -> bool {
    acl.iter()
        .any(|a| a.id.scheme == "world" && a.id.id == "anyone" && a.perms.contains(perm))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn fire(fired: Fired) {
    for (watcher, event) in fired {
        watcher.process(event);
    }
}

struct Shared {
    tree: Mutex<Tree>,
    sessions: Mutex<HashMap<i64, Weak<MemorySession>>>,
    available: AtomicBool,
    read_only: AtomicBool,
    latency: Mutex<Duration>,
    next_session: AtomicI64,
    created: AtomicUsize,
    log_slot: Arc<LogSinkSlot>,
}

impl Shared {
    fn live(&self) -> Vec<Arc<MemorySession>> {
        self.sessions.lock().values().filter_map(Weak::upgrade).collect()
    }

    fn connected_state(&self) -> SessionState {
        if self.read_only.load(Ordering::Acquire) {
            SessionState::ConnectedReadOnly
        } else {
            SessionState::SyncConnected
        }
    }

    fn log(&self, level: Level, message: String) {
        self.log_slot.emit(level, &message);
    }
}

/// A shared in-memory node tree that hands out sessions.
#[derive(Clone)]
pub struct MemoryEnsemble {
    shared: Arc<Shared>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::new()),
                sessions: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                read_only: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                next_session: AtomicI64::new(FIRST_SESSION_ID),
                created: AtomicUsize::new(0),
                log_slot: Arc::new(LogSinkSlot::new()),
            }),
        }
    }

    /// Make the ensemble reachable or not. Going unavailable disconnects every
    /// live session; coming back reconnects them.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
        self.shared
            .log(Level::INFO, format!("ensemble available: {available}"));
        if available {
            self.reconnect_all();
        } else {
            self.disconnect_all();
        }
    }

    /// Serve subsequent connections (and current ones) read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::Release);
        let state = self.shared.connected_state();
        for session in self.shared.live() {
            if ConnectionStatus::from(session.current_state()).is_connected() {
                session.transition(state);
            }
        }
    }

    /// Delay every operation response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    pub fn disconnect_all(&self) {
        for session in self.shared.live() {
            session.transition(SessionState::Disconnected);
        }
    }

    pub fn reconnect_all(&self) {
        if !self.shared.available.load(Ordering::Acquire) {
            return;
        }
        let state = self.shared.connected_state();
        for session in self.shared.live() {
            if session.current_state() == SessionState::Disconnected {
                session.transition(state);
            }
        }
    }

    pub fn expire_all(&self) {
        for session in self.shared.live() {
            session.expire();
        }
    }

    pub fn expire(&self, session_id: i64) -> bool {
        let session = self
            .shared
            .sessions
            .lock()
            .get(&session_id)
            .and_then(Weak::upgrade);
        match session {
            Some(session) => {
                session.expire();
                true
            }
            None => false,
        }
    }

    /// Sessions ever created by this ensemble.
    pub fn sessions_created(&self) -> usize {
        self.shared.created.load(Ordering::Acquire)
    }

    /// Sessions neither closed nor expired.
    pub fn live_sessions(&self) -> usize {
        self.shared.live().len()
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(path)
    }

    pub fn log_slot(&self) -> Arc<LogSinkSlot> {
        Arc::clone(&self.shared.log_slot)
    }
}

impl SessionFactory for MemoryEnsemble {
    fn connect(
        &self,
        addresses: &str,
        _session_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn SessionHandle>, SessionError> {
        if addresses.trim().is_empty() {
            return Err(SessionError::BadArguments("empty address list".into()));
        }
        let id = self.shared.next_session.fetch_add(1, Ordering::AcqRel);
        let session = Arc::new(MemorySession {
            id,
            password: id.to_be_bytes().iter().rev().copied().collect(),
            shared: Arc::clone(&self.shared),
            state: Mutex::new(SessionState::Disconnected),
            sink: Mutex::new(Some(sink)),
            closed: AtomicBool::new(false),
        });
        self.shared
            .sessions
            .lock()
            .insert(id, Arc::downgrade(&session));
        self.shared.created.fetch_add(1, Ordering::AcqRel);
        self.shared
            .log(Level::DEBUG, format!("session 0x{id:x} opened against {addresses}"));

        if self.shared.available.load(Ordering::Acquire) {
            session.transition(self.shared.connected_state());
        }
        Ok(session)
    }

    fn log_slot(&self) -> Option<Arc<LogSinkSlot>> {
        Some(Arc::clone(&self.shared.log_slot))
    }
}

pub struct MemorySession {
    id: i64,
    password: Vec<u8>,
    shared: Arc<Shared>,
    state: Mutex<SessionState>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn current_state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState) {
        let sink = {
            let mut state = self.state.lock();
            if *state == next || matches!(*state, SessionState::Expired) {
                return;
            }
            *state = next;
            self.sink.lock().clone()
        };
        self.shared
            .log(Level::INFO, format!("session 0x{:x} is now {next:?}", self.id));
        if let Some(sink) = sink {
            sink.on_state(next);
        }
    }

    fn expire(&self) {
        self.detach();
        self.transition(SessionState::Expired);
    }

    /// Remove from the ensemble, dropping ephemerals and watches.
    fn detach(&self) {
        if self.shared.sessions.lock().remove(&self.id).is_none() {
            return;
        }
        let mut fired = Vec::new();
        self.shared.tree.lock().purge_session(self.id, &mut fired);
        fire(fired);
    }

    fn check(&self, write: bool) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        match self.current_state() {
            SessionState::SyncConnected => Ok(()),
            SessionState::ConnectedReadOnly if write => Err(SessionError::NotReadOnly),
            SessionState::ConnectedReadOnly => Ok(()),
            SessionState::Disconnected => Err(SessionError::ConnectionLoss),
            SessionState::Expired => Err(SessionError::SessionExpired),
            SessionState::AuthFailed => Err(SessionError::NoAuth),
        }
    }

    async fn respond(&self) {
        let latency = *self.shared.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SessionHandle for MemorySession {
    fn session_id(&self) -> i64 {
        self.id
    }

    fn password(&self) -> Vec<u8> {
        self.password.clone()
    }

    fn state(&self) -> SessionState {
        self.current_state()
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<String, SessionError> {
        self.respond().await;
        self.check(true)?;
        let mut fired = Vec::new();
        let result = self
            .shared
            .tree
            .lock()
            .create(self.id, path, data, acl, mode, &mut fired);
        fire(fired);
        result
    }

    async fn delete(&self, path: &str, version: i32) -> Result<(), SessionError> {
        self.respond().await;
        self.check(true)?;
        let mut fired = Vec::new();
        let result = self.shared.tree.lock().delete(path, version, &mut fired);
        fire(fired);
        result
    }

    async fn exists(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Option<Stat>, SessionError> {
        self.respond().await;
        self.check(false)?;
        let mut tree = self.shared.tree.lock();
        if let Some(watcher) = watcher {
            arm(&mut tree.data_watches, path, self.id, watcher);
        }
        Ok(tree.nodes.get(path).map(|n| n.stat.clone()))
    }

    async fn get_data(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<(Vec<u8>, Stat), SessionError> {
        self.respond().await;
        self.check(false)?;
        let mut tree = self.shared.tree.lock();
        let node = tree.node(path)?;
        if !allows(&node.acl, Perms::READ) {
            return Err(SessionError::NoAuth);
        }
        let result = (node.data.clone(), node.stat.clone());
        if let Some(watcher) = watcher {
            arm(&mut tree.data_watches, path, self.id, watcher);
        }
        Ok(result)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat, SessionError> {
        self.respond().await;
        self.check(true)?;
        let mut fired = Vec::new();
        let result = self
            .shared
            .tree
            .lock()
            .set_data(path, data, version, &mut fired);
        fire(fired);
        result
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>, SessionError> {
        self.respond().await;
        self.check(false)?;
        let mut tree = self.shared.tree.lock();
        if !allows(&tree.node(path)?.acl, Perms::READ) {
            return Err(SessionError::NoAuth);
        }
        let children = tree.children(path);
        if let Some(watcher) = watcher {
            arm(&mut tree.child_watches, path, self.id, watcher);
        }
        Ok(children)
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), SessionError> {
        self.respond().await;
        self.check(false)?;
        let tree = self.shared.tree.lock();
        let node = tree.node(path)?;
        Ok((node.acl.clone(), node.stat.clone()))
    }

    async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> Result<Stat, SessionError> {
        self.respond().await;
        self.check(true)?;
        self.shared.tree.lock().set_acl(path, acl, version)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach();
        self.sink.lock().take();
        self.shared
            .log(Level::DEBUG, format!("session 0x{:x} closed", self.id));
    }
}

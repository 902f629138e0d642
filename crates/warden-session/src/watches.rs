//! Per-session watcher identity cache.
//!
//! The collaborator deduplicates watch registrations by object identity, so
//! handing it a fresh wrapper on every call would arm the same user watcher
//! several times. Each session keeps one wrapper per user watcher allocation:
//! a bounded LRU for recently used wrappers, plus a table pinning every wrapper
//! the collaborator still holds armed, whether or not the LRU has evicted it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use warden_core::model::{WatchEvent, WatchEventKind};
use warden_core::RegistrationToken;

use crate::handle::{watcher_key, Watcher};

/// Decides whether an event from a registration still belongs to the current
/// session and, if so, queues it for delivery.
pub(crate) trait WatchRouter: Send + Sync {
    fn route(&self, token: &RegistrationToken, watcher: &Arc<dyn Watcher>, event: WatchEvent);
}

/// Which collaborator table a watch sits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum WatchKind {
    /// Armed by `exists` or `get_data`.
    Data,
    /// Armed by `get_children`.
    Children,
}

impl WatchKind {
    /// The watches a fired event consumes.
    fn consumed_by(kind: WatchEventKind) -> &'static [WatchKind] {
        match kind {
            WatchEventKind::Created | WatchEventKind::DataChanged => &[WatchKind::Data],
            WatchEventKind::ChildrenChanged => &[WatchKind::Children],
            WatchEventKind::Deleted => &[WatchKind::Data, WatchKind::Children],
            WatchEventKind::ClientDisconnected => &[],
        }
    }
}

/// Registrations the collaborator currently holds armed, keyed by watcher.
type ArmedTable = Mutex<HashMap<usize, Arc<WatchRegistration>>>;

/// The object handed to the collaborator in place of a user watcher.
pub struct WatchRegistration {
    key: usize,
    token: RegistrationToken,
    watcher: Arc<dyn Watcher>,
    router: Weak<dyn WatchRouter>,
    armed: Mutex<HashSet<(WatchKind, String)>>,
    table: Weak<ArmedTable>,
}

impl WatchRegistration {
    pub fn token(&self) -> &RegistrationToken {
        &self.token
    }

    pub fn is_armed(&self) -> bool {
        !self.armed.lock().is_empty()
    }

    /// Record that this registration is about to be armed on `path`. Returns
    /// false if it already was.
    pub(crate) fn arm(self: &Arc<Self>, kind: WatchKind, path: &str) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = table.lock();
        let fresh = self.armed.lock().insert((kind, path.to_string()));
        table.insert(self.key, Arc::clone(self));
        fresh
    }

    /// Forget an arming the collaborator did not keep.
    pub(crate) fn disarm(&self, kind: WatchKind, path: &str) {
        self.settle(|armed| {
            armed.remove(&(kind, path.to_string()));
        });
    }

    /// Apply `f` to the armed set and unpin once nothing is armed.
    fn settle<R>(&self, f: impl FnOnce(&mut HashSet<(WatchKind, String)>) -> R) -> R {
        match self.table.upgrade() {
            Some(table) => {
                let mut table = table.lock();
                let mut armed = self.armed.lock();
                let out = f(&mut armed);
                if armed.is_empty()
                    && table
                        .get(&self.key)
                        .is_some_and(|r| std::ptr::eq(Arc::as_ptr(r), self))
                {
                    table.remove(&self.key);
                }
                out
            }
            None => f(&mut self.armed.lock()),
        }
    }
}

impl Watcher for WatchRegistration {
    fn process(&self, event: WatchEvent) {
        let consumed = WatchKind::consumed_by(event.kind);
        let was_armed = self.settle(|armed| {
            consumed
                .iter()
                .fold(false, |hit, kind| armed.remove(&(*kind, event.path.clone())) || hit)
        });
        // A second table firing for the same deletion, or a fire after retire.
        if !was_armed && event.kind != WatchEventKind::ClientDisconnected {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.route(&self.token, &self.watcher, event);
        }
    }
}

pub struct WatchCache {
    token: RegistrationToken,
    router: Weak<dyn WatchRouter>,
    recent: Cache<usize, Arc<WatchRegistration>>,
    armed: Arc<ArmedTable>,
}

impl WatchCache {
    pub(crate) fn new(
        token: RegistrationToken,
        capacity: usize,
        router: Weak<dyn WatchRouter>,
    ) -> Self {
        let recent = Cache::builder()
            .max_capacity(capacity.max(1) as u64)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            token,
            router,
            recent,
            armed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the registration for this watcher allocation. A registration
    /// that is still armed is reused even after the LRU has dropped it.
    pub fn wrap(&self, watcher: &Arc<dyn Watcher>) -> Arc<WatchRegistration> {
        let key = watcher_key(watcher);
        self.recent.get_with(key, || {
            if let Some(live) = self.armed.lock().get(&key) {
                return Arc::clone(live);
            }
            Arc::new(WatchRegistration {
                key,
                token: self.token.clone(),
                watcher: Arc::clone(watcher),
                router: self.router.clone(),
                armed: Mutex::new(HashSet::new()),
                table: Arc::downgrade(&self.armed),
            })
        })
    }

    /// Entries in the LRU once pending evictions have been applied.
    pub fn len(&self) -> usize {
        self.recent.run_pending_tasks();
        self.recent.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn armed_len(&self) -> usize {
        self.armed.lock().len()
    }

    /// Empty the cache and return the user watchers that were still armed.
    /// Their registrations stop delivering.
    pub(crate) fn retire(&self) -> Vec<Arc<dyn Watcher>> {
        self.recent.invalidate_all();
        let armed: Vec<Arc<WatchRegistration>> =
            self.armed.lock().drain().map(|(_, r)| r).collect();
        armed
            .into_iter()
            .map(|r| {
                r.armed.lock().clear();
                Arc::clone(&r.watcher)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        routed: Mutex<Vec<(RegistrationToken, WatchEvent)>>,
    }

    impl WatchRouter for Collect {
        fn route(&self, token: &RegistrationToken, _: &Arc<dyn Watcher>, event: WatchEvent) {
            self.routed.lock().push((token.clone(), event));
        }
    }

    fn cache(capacity: usize, router: &Arc<Collect>) -> WatchCache {
        let weak: Weak<Collect> = Arc::downgrade(router);
        WatchCache::new(RegistrationToken::new(), capacity, weak)
    }

    fn noop() -> Arc<dyn Watcher> {
        Arc::new(|_: WatchEvent| {})
    }

    #[test]
    fn same_watcher_same_registration() {
        let router = Arc::new(Collect::default());
        let cache = cache(8, &router);
        let w = noop();
        let a = cache.wrap(&w);
        let b = cache.wrap(&Arc::clone(&w));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_watchers_distinct_registrations() {
        let router = Arc::new(Collect::default());
        let cache = cache(8, &router);
        let a = cache.wrap(&noop());
        let b = cache.wrap(&noop());
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lru_stays_within_capacity() {
        let router = Arc::new(Collect::default());
        let cache = cache(2, &router);
        let watchers: Vec<_> = (0..6).map(|_| noop()).collect();
        for w in &watchers {
            cache.wrap(w);
        }
        assert!(cache.len() <= 2);
    }

    #[test]
    fn armed_registration_survives_eviction() {
        let router = Arc::new(Collect::default());
        let cache = cache(1, &router);
        let (a, b) = (noop(), noop());

        let first = cache.wrap(&a);
        assert!(first.arm(WatchKind::Data, "/x"));
        let pinned = Arc::as_ptr(&first);
        drop(first);
        let other = cache.wrap(&b);
        other.arm(WatchKind::Data, "/y");
        assert_eq!(cache.len(), 1);

        let again = cache.wrap(&a);
        assert!(std::ptr::eq(Arc::as_ptr(&again), pinned));
        assert!(!again.arm(WatchKind::Data, "/x"));
        assert_eq!(cache.armed_len(), 2);
        again.process(WatchEvent::new(WatchEventKind::Created, "/x"));
        assert_eq!(router.routed.lock().len(), 1);
    }

    #[test]
    fn registration_routes_with_its_token() {
        let router = Arc::new(Collect::default());
        let cache = cache(4, &router);
        let reg = cache.wrap(&noop());
        reg.arm(WatchKind::Data, "/a");
        reg.process(WatchEvent::new(WatchEventKind::Created, "/a"));
        let routed = router.routed.lock();
        assert_eq!(routed.len(), 1);
        assert_eq!(&routed[0].0, reg.token());
        assert_eq!(routed[0].1.path, "/a");
    }

    #[test]
    fn firing_disarms_and_unpins() {
        let router = Arc::new(Collect::default());
        let cache = cache(4, &router);
        let reg = cache.wrap(&noop());
        reg.arm(WatchKind::Data, "/a");
        reg.arm(WatchKind::Children, "/a");
        assert_eq!(cache.armed_len(), 1);

        // both tables fire for one deletion; the user hears it once
        reg.process(WatchEvent::new(WatchEventKind::Deleted, "/a"));
        reg.process(WatchEvent::new(WatchEventKind::Deleted, "/a"));
        assert_eq!(router.routed.lock().len(), 1);
        assert!(!reg.is_armed());
        assert_eq!(cache.armed_len(), 0);
    }

    #[test]
    fn children_event_leaves_data_watch_armed() {
        let router = Arc::new(Collect::default());
        let cache = cache(4, &router);
        let reg = cache.wrap(&noop());
        reg.arm(WatchKind::Data, "/a");
        reg.arm(WatchKind::Children, "/a");
        reg.process(WatchEvent::new(WatchEventKind::ChildrenChanged, "/a"));
        assert!(reg.is_armed());
        reg.process(WatchEvent::new(WatchEventKind::DataChanged, "/a"));
        assert!(!reg.is_armed());
        assert_eq!(router.routed.lock().len(), 2);
    }

    #[test]
    fn disarm_forgets_a_rejected_arming() {
        let router = Arc::new(Collect::default());
        let cache = cache(4, &router);
        let reg = cache.wrap(&noop());
        reg.arm(WatchKind::Data, "/missing");
        reg.disarm(WatchKind::Data, "/missing");
        assert_eq!(cache.armed_len(), 0);
        reg.process(WatchEvent::new(WatchEventKind::Created, "/missing"));
        assert!(router.routed.lock().is_empty());
    }

    #[test]
    fn registration_is_inert_once_router_is_gone() {
        let router = Arc::new(Collect::default());
        let cache = cache(4, &router);
        let reg = cache.wrap(&noop());
        reg.arm(WatchKind::Data, "/a");
        drop(router);
        reg.process(WatchEvent::new(WatchEventKind::Deleted, "/a"));
        assert!(!reg.is_armed());
    }

    #[test]
    fn retire_returns_only_armed_watchers() {
        let router = Arc::new(Collect::default());
        let cache = cache(4, &router);
        let (pending, fired, idle) = (noop(), noop(), noop());
        cache.wrap(&pending).arm(WatchKind::Data, "/p");
        let reg = cache.wrap(&fired);
        reg.arm(WatchKind::Data, "/f");
        reg.process(WatchEvent::new(WatchEventKind::Created, "/f"));
        cache.wrap(&idle);

        let retired = cache.retire();
        assert_eq!(retired.len(), 1);
        assert!(Arc::ptr_eq(&retired[0], &pending));
        assert!(cache.is_empty());
        assert_eq!(cache.armed_len(), 0);
        assert!(cache.retire().is_empty());
    }
}

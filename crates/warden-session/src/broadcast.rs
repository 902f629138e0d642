//! Replaying multicast of connection status.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;
use warden_core::{ConnectionStatus, SubscriptionId};

/// Receives status transitions.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, status: ConnectionStatus);

    /// Terminal signal; no further statuses follow.
    fn on_completed(&self) {}
}

impl<F> StatusObserver for F
where
    F: Fn(ConnectionStatus) + Send + Sync,
{
    fn on_status(&self, status: ConnectionStatus) {
        self(status)
    }
}

struct Registered {
    id: SubscriptionId,
    observer: Arc<dyn StatusObserver>,
}

#[derive(Default)]
struct State {
    observers: Vec<Registered>,
    last: Option<ConnectionStatus>,
    completed: bool,
}

/// Delivers every published value to all observers in subscription order,
/// replaying the last value to late subscribers.
///
/// Observers are invoked while the internal lock is held, so they must not
/// subscribe or publish from within a callback.
#[derive(Default)]
pub struct Broadcaster {
    state: Mutex<State>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, value: ConnectionStatus) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.last = Some(value);
        for r in &state.observers {
            deliver(r, |o| o.on_status(value));
        }
    }

    /// Publish only if `value` differs from the last published value.
    pub fn publish_distinct(&self, value: ConnectionStatus) -> bool {
        let mut state = self.state.lock();
        if state.completed || state.last == Some(value) {
            return false;
        }
        state.last = Some(value);
        for r in &state.observers {
            deliver(r, |o| o.on_status(value));
        }
        true
    }

    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn StatusObserver>) -> Subscription {
        let id = SubscriptionId::new();
        let mut state = self.state.lock();
        let registered = Registered {
            id: id.clone(),
            observer,
        };
        if state.completed {
            deliver(&registered, |o| o.on_completed());
            return Subscription {
                id,
                broadcaster: Weak::new(),
            };
        }
        if let Some(last) = state.last {
            deliver(&registered, |o| o.on_status(last));
        }
        state.observers.push(registered);
        Subscription {
            id,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Signal completion to all observers and drop them. Idempotent.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        for r in state.observers.drain(..) {
            deliver(&r, |o| o.on_completed());
        }
    }

    pub fn last(&self) -> Option<ConnectionStatus> {
        self.state.lock().last
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    fn unsubscribe(&self, id: &SubscriptionId) {
        self.state.lock().observers.retain(|r| &r.id != id);
    }
}

fn deliver(registered: &Registered, f: impl FnOnce(&dyn StatusObserver)) {
    let observer = registered.observer.as_ref();
    if catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
        warn!(subscription = %registered.id, "status observer panicked");
    }
}

/// Live subscription. Unsubscribes on drop.
pub struct Subscription {
    id: SubscriptionId,
    broadcaster: Weak<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(&self.id);
        }
    }
}

enum Notification {
    Status(ConnectionStatus),
    Completed,
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<Notification>,
}

impl StatusObserver for ChannelObserver {
    fn on_status(&self, status: ConnectionStatus) {
        let _ = self.tx.send(Notification::Status(status));
    }

    fn on_completed(&self) {
        let _ = self.tx.send(Notification::Completed);
    }
}

/// Channel-backed view of a subscription. Ends after the terminal signal.
pub struct StatusStream {
    rx: UnboundedReceiverStream<Notification>,
    done: bool,
    _subscription: Subscription,
}

impl StatusStream {
    pub(crate) fn subscribe(broadcaster: &Arc<Broadcaster>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = broadcaster.subscribe(Arc::new(ChannelObserver { tx }));
        Self {
            rx: UnboundedReceiverStream::new(rx),
            done: false,
            _subscription: subscription,
        }
    }

    /// Next status without waiting, if one is queued.
    pub fn try_next(&mut self) -> Option<ConnectionStatus> {
        if self.done {
            return None;
        }
        match self.rx.as_mut().try_recv() {
            Ok(Notification::Status(s)) => Some(s),
            Ok(Notification::Completed) => {
                self.done = true;
                None
            }
            Err(_) => None,
        }
    }
}

impl Stream for StatusStream {
    type Item = ConnectionStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(Notification::Status(s))) => Poll::Ready(Some(s)),
            Poll::Ready(Some(Notification::Completed)) | Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use ConnectionStatus::*;

    #[derive(Default)]
    struct Record {
        seen: Mutex<Vec<ConnectionStatus>>,
        completed: Mutex<bool>,
    }

    impl StatusObserver for Record {
        fn on_status(&self, status: ConnectionStatus) {
            self.seen.lock().push(status);
        }

        fn on_completed(&self) {
            *self.completed.lock() = true;
        }
    }

    #[test]
    fn delivers_in_order() {
        let b = Broadcaster::new();
        let rec = Arc::new(Record::default());
        let _sub = b.subscribe(rec.clone());
        b.publish(Disconnected);
        b.publish(Connected);
        b.publish(Connected);
        assert_eq!(*rec.seen.lock(), vec![Disconnected, Connected, Connected]);
    }

    #[test]
    fn publish_distinct_skips_repeats() {
        let b = Broadcaster::new();
        let rec = Arc::new(Record::default());
        let _sub = b.subscribe(rec.clone());
        assert!(b.publish_distinct(Connected));
        assert!(!b.publish_distinct(Connected));
        assert!(b.publish_distinct(Disconnected));
        assert_eq!(*rec.seen.lock(), vec![Connected, Disconnected]);
    }

    #[test]
    fn late_subscriber_gets_last_value() {
        let b = Broadcaster::new();
        b.publish(Disconnected);
        b.publish(Connected);
        let rec = Arc::new(Record::default());
        let _sub = b.subscribe(rec.clone());
        assert_eq!(*rec.seen.lock(), vec![Connected]);
    }

    #[test]
    fn subscriber_before_any_publish_gets_nothing_replayed() {
        let b = Broadcaster::new();
        let rec = Arc::new(Record::default());
        let _sub = b.subscribe(rec.clone());
        assert!(rec.seen.lock().is_empty());
    }

    #[test]
    fn panicking_observer_does_not_starve_others() {
        let b = Broadcaster::new();
        let _bad = b.subscribe(Arc::new(|_: ConnectionStatus| panic!("observer bug")));
        let rec = Arc::new(Record::default());
        let _sub = b.subscribe(rec.clone());
        b.publish(Expired);
        assert_eq!(*rec.seen.lock(), vec![Expired]);
    }

    #[test]
    fn complete_is_terminal() {
        let b = Broadcaster::new();
        let rec = Arc::new(Record::default());
        let _sub = b.subscribe(rec.clone());
        b.publish(Connected);
        b.complete();
        b.complete();
        b.publish(Disconnected);
        assert!(*rec.completed.lock());
        assert_eq!(*rec.seen.lock(), vec![Connected]);
        assert_eq!(b.observer_count(), 0);

        let late = Arc::new(Record::default());
        let _late_sub = b.subscribe(late.clone());
        assert!(late.seen.lock().is_empty());
        assert!(*late.completed.lock());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let b = Broadcaster::new();
        let rec = Arc::new(Record::default());
        let sub = b.subscribe(rec.clone());
        b.publish(Connected);
        sub.unsubscribe();
        b.publish(Disconnected);
        assert_eq!(*rec.seen.lock(), vec![Connected]);
        assert_eq!(b.observer_count(), 0);
    }

    #[tokio::test]
    async fn stream_ends_on_completion() {
        let b = Broadcaster::new();
        b.publish(Disconnected);
        let mut stream = StatusStream::subscribe(&b);
        b.publish(Connected);
        b.complete();
        let all: Vec<_> = (&mut stream).collect().await;
        assert_eq!(all, vec![Disconnected, Connected]);
        assert_eq!(stream.try_next(), None);
    }
}

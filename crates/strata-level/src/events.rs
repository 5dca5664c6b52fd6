use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A tile was durably saved by code outside of the tile caches.
#[derive(Clone, Debug)]
pub struct SaveEvent<P> {
    pub pos: P,
    pub bytes: Arc<[u8]>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

type Listener<P> = Arc<dyn Fn(&SaveEvent<P>) + Send + Sync>;

/// Delivers [`SaveEvent`]s to explicitly registered listeners, in subscription order.
pub struct SaveEventBus<P> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener<P>)>>,
}

impl<P> Default for SaveEventBus<P> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<P> SaveEventBus<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&SaveEvent<P>) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id);
        listeners.len() != before
    }

    pub fn num_subscribers(&self) -> usize {
        self.listeners.read().len()
    }

    /// Listeners run on the calling thread. They may subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event: SaveEvent<P>) {
        let listeners: Vec<Listener<P>> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn unsubscribed_listeners_stop_receiving() {
        let bus = SaveEventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let a = bus.subscribe(move |e| sink.lock().push(("a", e.pos)));
        let sink = seen.clone();
        bus.subscribe(move |e| sink.lock().push(("b", e.pos)));

        bus.publish(SaveEvent { pos: 1, bytes: Arc::from(&b"x"[..]) });
        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        bus.publish(SaveEvent { pos: 2, bytes: Arc::from(&b"y"[..]) });

        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("b", 2)]);
        assert_eq!(bus.num_subscribers(), 1);
    }
}

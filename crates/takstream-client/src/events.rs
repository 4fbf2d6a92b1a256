//! Publish/subscribe surface of a connection.
//!
//! Listeners are plain closures registered per [`Signal`]. They run on the
//! connection's dispatch task, in registration order, one after another.
//! There is no isolation between them: a listener that panics takes the
//! dispatch task down with it, and a slow listener delays every event behind
//! it.
//!
//! An `Error` emitted while nobody listens for it is only logged at `warn`.
//! Callers that need to react to transport failures must subscribe.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use takstream_cot::Event;
use takstream_core::TakStreamError;
use tracing::warn;

/// Names of the events a connection emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// TLS handshake finished; the server has not proven liveness yet
    SecureConnect,
    /// Liveness reply received
    Ping,
    /// Application CoT message received
    Cot,
    /// The transport went idle
    Timeout,
    /// Transport, write or handshake failure
    Error,
    /// The transport closed
    End,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::SecureConnect => write!(f, "secureConnect"),
            Signal::Ping => write!(f, "ping"),
            Signal::Cot => write!(f, "cot"),
            Signal::Timeout => write!(f, "timeout"),
            Signal::Error => write!(f, "error"),
            Signal::End => write!(f, "end"),
        }
    }
}

/// An emitted event with its payload.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    SecureConnect,
    Ping,
    Cot(Arc<Event>),
    Timeout,
    Error(Arc<TakStreamError>),
    End,
}

impl StreamEvent {
    pub fn signal(&self) -> Signal {
        match self {
            StreamEvent::SecureConnect => Signal::SecureConnect,
            StreamEvent::Ping => Signal::Ping,
            StreamEvent::Cot(_) => Signal::Cot,
            StreamEvent::Timeout => Signal::Timeout,
            StreamEvent::Error(_) => Signal::Error,
            StreamEvent::End => Signal::End,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    signal: Signal,
    listener: Listener,
}

/// Ordered listener registry.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Registration>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `signal`.
    pub fn on<F>(&self, signal: Signal, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            signal,
            listener: Arc::new(listener),
        });
        id
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Number of listeners registered for `signal`.
    pub fn listener_count(&self, signal: Signal) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|registration| registration.signal == signal)
            .count()
    }

    /// Calls every listener for the event's signal and returns how many ran.
    ///
    /// The registry lock is released before the first call, so listeners may
    /// subscribe, unsubscribe or write to the connection.
    pub fn emit(&self, event: &StreamEvent) -> usize {
        let signal = event.signal();
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|registration| registration.signal == signal)
            .map(|registration| Arc::clone(&registration.listener))
            .collect();

        if listeners.is_empty() {
            if let StreamEvent::Error(error) = event {
                warn!(error = %error, "Error emitted with no error listener");
            }
            return 0;
        }

        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let calls = Arc::clone(&calls);
            bus.on(Signal::Ping, move |_| calls.lock().push(n));
        }

        assert_eq!(bus.emit(&StreamEvent::Ping), 3);
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_matching_signal_runs() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        bus.on(Signal::End, move |_| *counter.lock() += 1);

        assert_eq!(bus.emit(&StreamEvent::Ping), 0);
        assert_eq!(bus.emit(&StreamEvent::End), 1);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let id = bus.on(Signal::Timeout, |_| {});
        bus.on(Signal::Timeout, |_| {});

        assert_eq!(bus.listener_count(Signal::Timeout), 2);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.emit(&StreamEvent::Timeout), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.on(Signal::Ping, move |_| {
            inner.on(Signal::Ping, |_| {});
        });

        assert_eq!(bus.emit(&StreamEvent::Ping), 1);
        assert_eq!(bus.listener_count(Signal::Ping), 2);
    }

    #[test]
    fn test_unheard_error_is_not_fatal() {
        let bus = EventBus::new();
        let error = Arc::new(TakStreamError::from(takstream_core::ConnectionError::NotConnected));
        assert_eq!(bus.emit(&StreamEvent::Error(error)), 0);
    }
}

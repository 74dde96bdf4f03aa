//! Publish/subscribe bus with one-shot waits
//!
//! Two kinds of subscription share a bus:
//!
//! - persistent listeners, invoked on every emission of their event kind in
//!   registration order;
//! - one-shot waits, created by [`EventBus::wait_for`], which resolve with
//!   the first emission their predicate accepts.
//!
//! Waits take precedence: an emission is offered to the pending waits of
//! its kind first (oldest first) and the first matching wait consumes it.
//! Only emissions no wait claims reach the listeners. This is what makes
//! "send a command, then wait for the reply" race-free against a general
//! handler for the same event.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An event that can travel over an [`EventBus`]
pub trait BusEvent: Send + 'static {
    /// Key listeners and waits subscribe to
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Why a one-shot wait ended without an event
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("timed out waiting for event")]
    Timeout,
    #[error("event bus closed")]
    Closed,
    #[error("wait predicate failed")]
    Predicate(#[source] BoxError),
}

/// Where an emission ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Consumed by a pending wait; listeners were not invoked
    Waiter,
    /// Delivered to this many persistent listeners
    Listeners(usize),
}

/// Handle for removing a persistent listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Predicate<E> = Box<dyn FnMut(&E) -> Result<bool, BoxError> + Send>;

struct PendingWait<E> {
    id: u64,
    predicate: Predicate<E>,
    resolve: oneshot::Sender<Result<E, WaitError>>,
}

struct Registry<E: BusEvent> {
    listeners: HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>,
    waits: HashMap<E::Kind, Vec<PendingWait<E>>>,
    closed: bool,
}

struct Shared<E: BusEvent> {
    registry: Mutex<Registry<E>>,
    next_id: AtomicU64,
}

impl<E: BusEvent> Shared<E> {
    /// Remove a pending wait. Returns false if it was already resolved.
    fn remove_wait(&self, kind: E::Kind, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(waits) = registry.waits.get_mut(&kind) else {
            return false;
        };
        let Some(index) = waits.iter().position(|w| w.id == id) else {
            return false;
        };
        waits.remove(index);
        true
    }
}

/// Generic event bus
///
/// Cloning is cheap; clones share the same subscriptions.
pub struct EventBus<E: BusEvent> {
    shared: Arc<Shared<E>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("EventBus")
            .field("listener_kinds", &registry.listeners.len())
            .field("wait_kinds", &registry.waits.len())
            .field("closed", &registry.closed)
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    listeners: HashMap::new(),
                    waits: HashMap::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a persistent listener for `kind`.
    ///
    /// Listeners run synchronously on the emitting task. Anything slow
    /// should be spawned off rather than done inline.
    pub fn subscribe<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id());
        self.shared
            .registry
            .lock()
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self.shared.registry.lock();
        for listeners in registry.listeners.values_mut() {
            if let Some(index) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(index);
                return true;
            }
        }
        false
    }

    /// Wait for the first `kind` emission accepted by `predicate`.
    ///
    /// The wait is registered immediately, before the returned future is
    /// first polled, so an action started after this call cannot race past
    /// it. The predicate runs under the bus lock and must not call back
    /// into the same bus.
    pub fn wait_for<F>(
        &self,
        kind: E::Kind,
        mut predicate: F,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<E, WaitError>> + Send + 'static
    where
        F: FnMut(&E) -> bool + Send + 'static,
    {
        self.register_wait(kind, Box::new(move |event| Ok(predicate(event))), timeout)
    }

    /// Like [`wait_for`](Self::wait_for), with a fallible predicate.
    ///
    /// A predicate error resolves this wait with [`WaitError::Predicate`];
    /// the emission then carries on to later waits and listeners.
    pub fn try_wait_for<F, Err>(
        &self,
        kind: E::Kind,
        mut predicate: F,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<E, WaitError>> + Send + 'static
    where
        F: FnMut(&E) -> Result<bool, Err> + Send + 'static,
        Err: Into<BoxError>,
    {
        self.register_wait(
            kind,
            Box::new(move |event| predicate(event).map_err(Into::into)),
            timeout,
        )
    }

    fn register_wait(
        &self,
        kind: E::Kind,
        predicate: Predicate<E>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<E, WaitError>> + Send + 'static {
        let id = self.next_id();
        let (resolve, mut receiver) = oneshot::channel();

        let registered = {
            let mut registry = self.shared.registry.lock();
            if registry.closed {
                false
            } else {
                registry.waits.entry(kind).or_default().push(PendingWait {
                    id,
                    predicate,
                    resolve,
                });
                true
            }
        };

        let guard = WaitGuard {
            shared: Arc::downgrade(&self.shared),
            kind,
            id,
        };

        async move {
            if !registered {
                return Err(WaitError::Closed);
            }

            let Some(timeout) = timeout else {
                let outcome = (&mut receiver).await;
                drop(guard);
                return outcome.unwrap_or(Err(WaitError::Closed));
            };

            match tokio::time::timeout(timeout, &mut receiver).await {
                Ok(outcome) => outcome.unwrap_or(Err(WaitError::Closed)),
                // Removal under the bus lock decides the race: if the wait is
                // gone, an emission already resolved it and the value is in
                // the channel.
                Err(_) if guard.cancel() => Err(WaitError::Timeout),
                Err(_) => receiver.try_recv().unwrap_or(Err(WaitError::Closed)),
            }
        }
    }

    /// Emit an event.
    ///
    /// Pending waits for the event's kind are checked oldest first; the
    /// first match consumes the event. Otherwise every persistent listener
    /// for the kind is invoked in registration order.
    pub fn emit(&self, event: E) -> Delivery {
        let kind = event.kind();

        let listeners: Vec<Listener<E>> = {
            let mut registry = self.shared.registry.lock();
            if let Some(waits) = registry.waits.get_mut(&kind) {
                let mut index = 0;
                while index < waits.len() {
                    if waits[index].resolve.is_closed() {
                        waits.remove(index);
                        continue;
                    }
                    match (waits[index].predicate)(&event) {
                        Ok(true) => {
                            let wait = waits.remove(index);
                            let _ = wait.resolve.send(Ok(event));
                            return Delivery::Waiter;
                        }
                        Ok(false) => index += 1,
                        Err(source) => {
                            let wait = waits.remove(index);
                            let _ = wait.resolve.send(Err(WaitError::Predicate(source)));
                        }
                    }
                }
            }
            registry
                .listeners
                .get(&kind)
                .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in &listeners {
            listener(&event);
        }
        Delivery::Listeners(listeners.len())
    }

    /// Tear the bus down.
    ///
    /// Every pending wait resolves with [`WaitError::Closed`], listeners are
    /// dropped, and later waits fail immediately.
    pub fn close(&self) {
        let waits = {
            let mut registry = self.shared.registry.lock();
            registry.closed = true;
            registry.listeners.clear();
            std::mem::take(&mut registry.waits)
        };
        for wait in waits.into_values().flatten() {
            let _ = wait.resolve.send(Err(WaitError::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry.lock().closed
    }

    pub fn pending_waits(&self, kind: E::Kind) -> usize {
        self.shared
            .registry
            .lock()
            .waits
            .get(&kind)
            .map_or(0, |waits| waits.iter().filter(|w| !w.resolve.is_closed()).count())
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.shared
            .registry
            .lock()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Removes a wait from the bus when its future is dropped early.
struct WaitGuard<E: BusEvent> {
    shared: Weak<Shared<E>>,
    kind: E::Kind,
    id: u64,
}

impl<E: BusEvent> WaitGuard<E> {
    fn cancel(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.remove_wait(self.kind, self.id))
    }
}

impl<E: BusEvent> Drop for WaitGuard<E> {
    fn drop(&mut self) {
        self.cancel();
    }
}

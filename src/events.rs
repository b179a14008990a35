//! Named, namespaced event notification with deferred delivery.
//!
//! Listeners are registered per event name. A plain name (`"load"`) appends
//! to that event's anonymous list; a namespaced name (`"load.legend"`)
//! occupies a single slot that later registrations under the same namespace
//! replace.
//!
//! [`EventBus::trigger`] never calls a listener from inside the call itself.
//! Each delivery is recorded as pending and runs on a later turn of the
//! runtime; [`EventBus::off`] can cancel it up to that point. Pending
//! deliveries and sticky (coalesced) triggers can be handed to another bus
//! with [`EventBus::take_over_events`], after which they run against the
//! new owner.

use crate::constants::{DEFAULT_STICKY_DELAY, NAMESPACE_SEPARATOR};
use crate::utils::lock;
use log::{debug, error};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What a listener sees when it runs.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// The bus that owns the delivery when it runs
    pub target: EventBus,
    pub event: String,
    pub namespace: Option<String>,
    pub args: Vec<Value>,
}

impl EventContext {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }
}

/// A registered callback. Two listeners are equal when they are clones of the same registration.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&EventContext) + Send + Sync>);

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    fn call(&self, context: &EventContext) {
        (self.0)(context)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.0) as *const (), Arc::as_ptr(&other.0) as *const ())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Completion of a trigger: resolves once every scheduled delivery has run or been cancelled.
///
/// Dropping it does not cancel anything.
pub struct Dispatch {
    completion: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Dispatch {
    fn deliveries(event: String, handles: Vec<JoinHandle<()>>) -> Self {
        Self {
            completion: Box::pin(async move {
                for handle in handles {
                    if let Err(e) = handle.await {
                        if e.is_panic() {
                            error!("A listener for '{}' panicked", event);
                        }
                    }
                }
            }),
        }
    }

    fn waiter(receiver: oneshot::Receiver<()>) -> Self {
        Self {
            completion: Box::pin(async move {
                let _ = receiver.await;
            }),
        }
    }
}

impl IntoFuture for Dispatch {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        self.completion
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dispatch")
    }
}

#[derive(Default)]
struct Handlers {
    anonymous: Vec<Listener>,
    named: BTreeMap<String, Listener>,
}

struct PendingDelivery {
    owner: EventBus,
    listener: Listener,
    args: Vec<Value>,
    /// Empty for anonymous listeners
    namespace: String,
}

/// One scheduled delivery; emptied when it runs or is cancelled.
struct PendingSlot(Mutex<Option<PendingDelivery>>);

impl PendingSlot {
    fn take(&self) -> Option<PendingDelivery> {
        lock(&self.0).take()
    }

    fn is_live(&self) -> bool {
        lock(&self.0).is_some()
    }

    fn cancel_if<P>(&self, predicate: P) -> bool
    where
        P: Fn(&PendingDelivery) -> bool,
    {
        let mut slot = lock(&self.0);
        if slot.as_ref().is_some_and(predicate) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn retarget(&self, owner: &EventBus) {
        if let Some(delivery) = lock(&self.0).as_mut() {
            delivery.owner = owner.clone();
        }
    }
}

struct StickyTrigger {
    owner: EventBus,
    args: Map<String, Value>,
    generation: u64,
    fired: bool,
    timer: Option<JoinHandle<()>>,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<String, Handlers>,
    pending: HashMap<String, Vec<Arc<PendingSlot>>>,
    sticky: HashMap<String, Arc<Mutex<StickyTrigger>>>,
}

impl BusState {
    fn prune(&mut self, event: &str) {
        if let Some(slots) = self.pending.get_mut(event) {
            slots.retain(|slot| slot.is_live());
            if slots.is_empty() {
                self.pending.remove(event);
            }
        }
    }
}

/// Per-instance listener registry.
#[derive(Clone)]
pub struct EventBus {
    id: Uuid,
    state: Arc<Mutex<BusState>>,
    sticky_delay: Duration,
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(NAMESPACE_SEPARATOR) {
        Some((event, namespace)) if !namespace.is_empty() => (event, Some(namespace)),
        Some((event, _)) => (event, None),
        None => (name, None),
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_sticky_delay(DEFAULT_STICKY_DELAY)
    }

    /// A bus whose sticky triggers coalesce over `delay` unless told otherwise
    pub fn with_sticky_delay(delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(BusState::default())),
            sticky_delay: delay,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register `listener` for `name` (`"event"` or `"event.namespace"`).
    pub fn on(&self, name: &str, listener: Listener) {
        let (event, namespace) = split_name(name);
        let mut state = lock(&self.state);
        let handlers = state.handlers.entry(event.to_string()).or_default();
        match namespace {
            None => handlers.anonymous.push(listener),
            Some(namespace) => {
                handlers.named.insert(namespace.to_string(), listener);
            }
        }
    }

    /// Remove listeners and cancel their pending deliveries.
    ///
    /// Without a namespace, `listener` selects which anonymous listeners go
    /// (all of them when `None`). With a namespace, that namespace's listener
    /// goes and `listener` is ignored.
    pub fn off(&self, name: &str, listener: Option<&Listener>) {
        let (event, namespace) = split_name(name);
        let mut state = lock(&self.state);

        if let Some(handlers) = state.handlers.get_mut(event) {
            match (namespace, listener) {
                (Some(namespace), _) => {
                    handlers.named.remove(namespace);
                }
                (None, Some(listener)) => handlers.anonymous.retain(|registered| registered != listener),
                (None, None) => handlers.anonymous.clear(),
            }
        }

        let cancelled = state
            .pending
            .get(event)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|slot| {
                        slot.cancel_if(|delivery| match (namespace, listener) {
                            (Some(namespace), _) => delivery.namespace == namespace,
                            (None, Some(listener)) => delivery.namespace.is_empty() && &delivery.listener == listener,
                            (None, None) => delivery.namespace.is_empty(),
                        })
                    })
                    .count()
            })
            .unwrap_or(0);
        if cancelled > 0 {
            debug!("Cancelled {} pending deliveries of '{}'", cancelled, name);
        }
        state.prune(event);
    }

    /// Schedule every listener of `event` for deferred delivery.
    pub fn trigger(&self, event: &str, args: Vec<Value>) -> Dispatch {
        let mut scheduled = Vec::new();
        {
            let mut state = lock(&self.state);
            state.prune(event);

            let listeners: Vec<(Listener, String)> = match state.handlers.get(event) {
                Some(handlers) => handlers
                    .anonymous
                    .iter()
                    .map(|listener| (listener.clone(), String::new()))
                    .chain(
                        handlers
                            .named
                            .iter()
                            .map(|(namespace, listener)| (listener.clone(), namespace.clone())),
                    )
                    .collect(),
                None => Vec::new(),
            };

            if !listeners.is_empty() {
                let slots = state.pending.entry(event.to_string()).or_default();
                for (listener, namespace) in listeners {
                    let slot = Arc::new(PendingSlot(Mutex::new(Some(PendingDelivery {
                        owner: self.clone(),
                        listener,
                        args: args.clone(),
                        namespace,
                    }))));
                    slots.push(slot.clone());
                    scheduled.push(slot);
                }
            }
        }

        let handles = scheduled
            .into_iter()
            .map(|slot| tokio::spawn(deliver(slot, event.to_string())))
            .collect();
        Dispatch::deliveries(event.to_string(), handles)
    }

    /// Merge `args` into the pending sticky trigger for `event` and restart its
    /// timer; when the timer elapses, one `trigger` fires with everything merged.
    ///
    /// `delay` defaults to the bus's sticky delay. The returned dispatch
    /// completes once that coalesced trigger has been delivered.
    pub fn sticky_trigger(&self, event: &str, args: Map<String, Value>, delay: Option<Duration>) -> Dispatch {
        let delay = delay.unwrap_or(self.sticky_delay);
        let (sender, receiver) = oneshot::channel();

        let record = {
            let mut state = lock(&self.state);
            match state.sticky.get(event) {
                Some(record) if !lock(record).fired => record.clone(),
                _ => {
                    let record = Arc::new(Mutex::new(StickyTrigger {
                        owner: self.clone(),
                        args: Map::new(),
                        generation: 0,
                        fired: false,
                        timer: None,
                        waiters: Vec::new(),
                    }));
                    state.sticky.insert(event.to_string(), record.clone());
                    record
                }
            }
        };

        let mut sticky = lock(&record);
        sticky.args.extend(args);
        sticky.generation += 1;
        sticky.waiters.push(sender);
        if let Some(timer) = sticky.timer.take() {
            timer.abort();
        }
        sticky.timer = Some(tokio::spawn(fire_sticky(
            record.clone(),
            event.to_string(),
            sticky.generation,
            delay,
        )));
        drop(sticky);

        Dispatch::waiter(receiver)
    }

    /// Move every registration, pending delivery and sticky trigger of
    /// `other` onto this bus. Deliveries already scheduled by `other` run
    /// exactly once, against this bus.
    pub fn take_over_events(&self, other: &EventBus) {
        if self.id == other.id {
            return;
        }

        let (handlers, pending, sticky) = {
            let mut theirs = lock(&other.state);
            (
                std::mem::take(&mut theirs.handlers),
                std::mem::take(&mut theirs.pending),
                std::mem::take(&mut theirs.sticky),
            )
        };

        for slot in pending.values().flatten() {
            slot.retarget(self);
        }
        for record in sticky.values() {
            lock(record).owner = self.clone();
        }

        let mut state = lock(&self.state);
        for (event, theirs) in handlers {
            let mine = state.handlers.entry(event).or_default();
            mine.anonymous.extend(theirs.anonymous);
            mine.named.extend(theirs.named);
        }
        for (event, slots) in pending {
            state.pending.entry(event.clone()).or_default().extend(slots);
            state.prune(&event);
        }
        for (event, record) in sticky {
            // A record we don't keep in our map still fires once on its own timer.
            state.sticky.entry(event).or_insert(record);
        }
        debug!("Bus {} took over events from {}", self.id, other.id);
    }

    /// Number of listeners registered for `event`, anonymous and namespaced
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.state)
            .handlers
            .get(event)
            .map(|handlers| handlers.anonymous.len() + handlers.named.len())
            .unwrap_or(0)
    }

    /// Number of deliveries of `event` that have neither run nor been cancelled
    pub fn pending_count(&self, event: &str) -> usize {
        lock(&self.state)
            .pending
            .get(event)
            .map(|slots| slots.iter().filter(|slot| slot.is_live()).count())
            .unwrap_or(0)
    }

    /// Whether a sticky trigger for `event` is still waiting to fire
    pub fn has_sticky(&self, event: &str) -> bool {
        lock(&self.state)
            .sticky
            .get(event)
            .is_some_and(|record| !lock(record).fired)
    }

    fn remove_sticky(&self, event: &str, record: &Arc<Mutex<StickyTrigger>>) {
        let mut state = lock(&self.state);
        if state.sticky.get(event).is_some_and(|current| Arc::ptr_eq(current, record)) {
            state.sticky.remove(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("id", &self.id).finish_non_exhaustive()
    }
}

async fn deliver(slot: Arc<PendingSlot>, event: String) {
    tokio::task::yield_now().await;
    match slot.take() {
        Some(delivery) => {
            lock(&delivery.owner.state).prune(&event);
            let context = EventContext {
                target: delivery.owner,
                event,
                namespace: (!delivery.namespace.is_empty()).then_some(delivery.namespace),
                args: delivery.args,
            };
            delivery.listener.call(&context);
        }
        None => debug!("Listener for '{}' was removed before its delivery ran", event),
    }
}

async fn fire_sticky(record: Arc<Mutex<StickyTrigger>>, event: String, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let (owner, args, waiters) = {
        let mut sticky = lock(&record);
        if sticky.fired || sticky.generation != generation {
            return;
        }
        sticky.fired = true;
        sticky.timer = None;
        (
            sticky.owner.clone(),
            std::mem::take(&mut sticky.args),
            std::mem::take(&mut sticky.waiters),
        )
    };

    owner.remove_sticky(&event, &record);
    owner.trigger(&event, vec![Value::Object(args)]).await;
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

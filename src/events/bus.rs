use crate::config::{EventBusConfig, OverflowPolicy};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::run_guarded;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

type Args = Arc<dyn Any + Send + Sync>;
type Invoker = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<()> + Send + Sync>;

/// Identity of something that emits events on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmitterId(u64);

impl fmt::Display for EmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emitter#{}", self.0)
    }
}

/// Handle returned by [`EventBus::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registration key: who emits, and what argument shape the handler takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    emitter: EmitterId,
    shape: TypeId,
}

impl Key {
    fn of<E: 'static>(emitter: EmitterId) -> Self {
        Self {
            emitter,
            shape: TypeId::of::<E>(),
        }
    }
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<Key, Vec<(SubscriptionId, Invoker)>>,
    passthrough: HashMap<Key, Vec<EmitterId>>,
}

struct Action {
    invoker: Invoker,
    args: Args,
    shape: &'static str,
}

/// Counters exposed by [`EventBus::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

struct Shared {
    registry: RwLock<Registry>,
    queue: Mutex<VecDeque<Action>>,
    exec: Mutex<()>,
    wake: Condvar,
    cancel: CancellationToken,
    config: EventBusConfig,
    next_emitter: AtomicU64,
    next_subscription: AtomicU64,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Decoupled publish/subscribe with a single ordered delivery queue.
///
/// Subscribers register under `(emitter, E)` where `E` is the argument type
/// their callback takes; multi-argument events are tuples. `emit` only
/// enqueues. Invocations run one at a time, in enqueue order, either on the
/// consumer thread started by [`start`](Self::start) or through an explicit
/// [`drain`](Self::drain). Cloning the bus yields another handle to the same
/// instance; separate `EventBus::new` calls never see each other's events.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::default()),
                queue: Mutex::new(VecDeque::new()),
                exec: Mutex::new(()),
                wake: Condvar::new(),
                cancel: CancellationToken::new(),
                config,
                next_emitter: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
                enqueued: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a fresh emitter identity on this bus
    pub fn emitter(&self) -> EmitterId {
        EmitterId(self.shared.next_emitter.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe `handler` to every `E` emitted by `emitter`
    pub fn register<E, F>(&self, emitter: EmitterId, handler: F) -> Result<SubscriptionId>
    where
        E: Send + Sync + 'static,
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let invoker: Invoker = Arc::new(move |args: &(dyn Any + Send + Sync)| {
            match args.downcast_ref::<E>() {
                Some(event) => handler(event),
                None => Err(ProtocolError::Custom(format!(
                    "event shape mismatch for {}",
                    std::any::type_name::<E>()
                ))),
            }
        });

        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut registry = self
            .shared
            .registry
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_EVENT_REGISTRY_LOCK.into()))?;
        registry
            .subscriptions
            .entry(Key::of::<E>(emitter))
            .or_default()
            .push((id, invoker));
        trace!(%emitter, shape = std::any::type_name::<E>(), "Subscriber registered");
        Ok(id)
    }

    /// Remove a single subscription
    pub fn unregister(&self, subscription: SubscriptionId) -> bool {
        let mut registry = self.write_registry();
        let mut removed = false;
        registry.subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(id, _)| *id != subscription);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Re-emit every future `E` from `emitter` as if `target` emitted it
    pub fn passthrough<E: Send + Sync + 'static>(&self, emitter: EmitterId, target: EmitterId) -> Result<()> {
        let mut registry = self
            .shared
            .registry
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_EVENT_REGISTRY_LOCK.into()))?;
        let targets = registry
            .passthrough
            .entry(Key::of::<E>(emitter))
            .or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
        Ok(())
    }

    /// Drop every subscription keyed on `emitter`.
    ///
    /// Passthrough routes are kept. Invocations already queued still run.
    pub fn deregister_emitter(&self, emitter: EmitterId) -> usize {
        let mut registry = self.write_registry();
        let before: usize = registry.subscriptions.values().map(Vec::len).sum();
        registry.subscriptions.retain(|key, _| key.emitter != emitter);
        let after: usize = registry.subscriptions.values().map(Vec::len).sum();
        debug!(%emitter, removed = before - after, "Emitter deregistered");
        before - after
    }

    /// Drop every passthrough route from or to `emitter`
    pub fn remove_passthroughs(&self, emitter: EmitterId) -> usize {
        let mut registry = self.write_registry();
        let mut removed = 0;
        registry.passthrough.retain(|key, targets| {
            if key.emitter == emitter {
                removed += targets.len();
                return false;
            }
            let before = targets.len();
            targets.retain(|target| *target != emitter);
            removed += before - targets.len();
            !targets.is_empty()
        });
        debug!(%emitter, removed, "Passthrough routes removed");
        removed
    }

    /// Number of passthrough routes currently installed
    pub fn passthrough_routes(&self) -> usize {
        self.shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .passthrough
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Queue one invocation per current subscriber of `(emitter, E)`,
    /// following passthrough routes. Returns the number queued.
    pub fn emit<E: Send + Sync + 'static>(&self, emitter: EmitterId, event: E) -> usize {
        if self.shared.cancel.is_cancelled() {
            debug!(%emitter, shape = std::any::type_name::<E>(), "Emit after shutdown ignored");
            return 0;
        }

        let args: Args = Arc::new(event);
        let shape = std::any::type_name::<E>();
        let invokers = self.collect_invokers(Key::of::<E>(emitter));
        if invokers.is_empty() {
            return 0;
        }

        let mut queued = 0;
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            for invoker in invokers {
                if queue.len() >= self.shared.config.queue_capacity {
                    match self.shared.config.overflow {
                        OverflowPolicy::DropNewest => {
                            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(%emitter, shape, "Event queue full, dropping emission");
                            continue;
                        }
                        OverflowPolicy::DropOldest => {
                            if let Some(evicted) = queue.pop_front() {
                                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(shape = evicted.shape, "Event queue full, evicting oldest");
                            }
                        }
                    }
                }
                queue.push_back(Action {
                    invoker,
                    args: Arc::clone(&args),
                    shape,
                });
                queued += 1;
            }
        }

        if queued > 0 {
            self.shared.enqueued.fetch_add(queued as u64, Ordering::Relaxed);
            self.shared.wake.notify_one();
        }
        queued
    }

    /// Direct subscribers of `origin` plus those reached through passthrough
    fn collect_invokers(&self, origin: Key) -> Vec<Invoker> {
        let registry = self
            .shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![origin.emitter];
        while let Some(emitter) = stack.pop() {
            if !visited.insert(emitter) {
                continue;
            }
            let key = Key {
                emitter,
                shape: origin.shape,
            };
            if let Some(targets) = registry.passthrough.get(&key) {
                stack.extend(targets.iter().rev().copied());
            }
            if let Some(subs) = registry.subscriptions.get(&key) {
                out.extend(subs.iter().map(|(_, inv)| Arc::clone(inv)));
            }
        }
        out
    }

    /// Run queued invocations on the calling thread until the queue is empty.
    ///
    /// Serialized with the consumer thread, so invocations never overlap.
    pub fn drain(&self) -> usize {
        let _exec = self.shared.exec.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ran = 0;
        loop {
            let next = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(action) = next else {
                break;
            };
            let outcome = run_guarded(action.shape, || (action.invoker)(action.args.as_ref()));
            match outcome {
                Ok(()) => {
                    self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.shared.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(shape = action.shape, error = %e, "Event subscriber failed");
                }
            }
            ran += 1;
        }
        ran
    }

    /// Spawn the consumer loop on its own thread.
    ///
    /// Subscribers may block without stalling any async runtime. The loop
    /// ends on [`shutdown`](Self::shutdown).
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<JoinHandle<()>> {
        if self.shared.cancel.is_cancelled() {
            return Err(ProtocolError::EventBusClosed);
        }

        let bus = self.clone();
        thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || {
                debug!("Event bus consumer started");
                while bus.wait_for_work() {
                    bus.drain();
                }
                debug!("Event bus consumer stopped");
            })
            .map_err(|e| ProtocolError::Runtime(format!("{}: {e}", constants::ERR_EVENT_CONSUMER_SPAWN)))
    }

    /// Block until something is queued. False once the bus is shut down.
    fn wait_for_work(&self) -> bool {
        let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.shared.cancel.is_cancelled() {
                return false;
            }
            if !queue.is_empty() {
                return true;
            }
            queue = self
                .shared
                .wake
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the consumer loop and refuse further emissions.
    ///
    /// Invocations still queued stay queued; call [`drain`](Self::drain) to run them.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        // Taken so a consumer between its check and its wait cannot miss the wakeup
        let _queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.wake.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Invocations waiting in the queue
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

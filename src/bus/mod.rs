//! In-process frame fan-out.
//!
//! The bus is the single delivery path between the transport and every
//! aggregator:
//!
//! ```text
//! ┌────────────┐  deliver(frame)  ┌────────────┐
//! │ Connection │ ───────────────► │ MessageBus │──► listener 0 (counter "orders")
//! └────────────┘                  └────────────┘──► listener 1 (counter "shipments")
//!                                                └─► listener 2 (inventory)
//! ```
//!
//! Every frame is handed to every active listener synchronously, in
//! registration order, before `deliver` returns. Deliveries are serialized, so
//! all listeners observe one total order. A listener only sees frames delivered
//! after it was registered; there is no history.
//!
//! # Example
//!
//! ```
//! use stockfeed::bus::MessageBus;
//!
//! let bus = MessageBus::default();
//! let sub = bus.add_listener(|frame| {
//!     println!("got {frame}");
//!     Ok(())
//! });
//! bus.deliver("orders:1:placed")?;
//! sub.cancel();
//! # Ok::<(), stockfeed::Error>(())
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Outcome of a single listener invocation.
pub type ListenerResult = anyhow::Result<()>;

type ListenerFn = dyn FnMut(&str) -> ListenerResult + Send;

/// What a failing listener does to the rest of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryPolicy {
    /// Failures (errors and panics) are logged and recorded in the
    /// [`DeliveryReport`]; later listeners still get the frame.
    #[default]
    Isolate,
    /// The first error aborts the frame for every listener registered after
    /// the failing one and is returned from [`MessageBus::deliver`]. Panics
    /// unwind through the caller.
    FailFast,
}

impl FromStr for DeliveryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "isolate" => Ok(Self::Isolate),
            "fail-fast" => Ok(Self::FailFast),
            other => Err(Error::Config(format!(
                "unknown delivery policy {other:?} (expected isolate or fail-fast)"
            ))),
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Isolate => "isolate",
            Self::FailFast => "fail-fast",
        })
    }
}

/// A listener that failed under [`DeliveryPolicy::Isolate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub listener: u64,
    pub reason: String,
}

/// Summary of one [`MessageBus::deliver`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// 1-based position of the frame in the bus's total order.
    pub sequence: u64,
    /// Listeners that returned `Ok`.
    pub delivered: usize,
    pub failed: Vec<ListenerFailure>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Entry {
    id: u64,
    active: AtomicBool,
    callback: Mutex<Box<ListenerFn>>,
}

struct Shared {
    policy: DeliveryPolicy,
    next_id: AtomicU64,
    sequence: AtomicU64,
    listeners: Mutex<Vec<Arc<Entry>>>,
    // Held for the whole of `deliver` to keep one total order.
    delivery: Mutex<()>,
}

/// Cloneable handle to a frame bus.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<Shared>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DeliveryPolicy::default())
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("policy", &self.shared.policy)
            .field("listeners", &self.listener_count())
            .field("frames_delivered", &self.frames_delivered())
            .finish()
    }
}

static GLOBAL: OnceLock<MessageBus> = OnceLock::new();

impl MessageBus {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                next_id: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                delivery: Mutex::new(()),
            }),
        }
    }

    /// Process-wide bus, built on first use with the default policy.
    ///
    /// Construction happens exactly once even under concurrent first calls.
    /// The bus does not open a transport by itself; the host attaches one
    /// [`Connection`](crate::transport::Connection) to it.
    pub fn global() -> &'static MessageBus {
        GLOBAL.get_or_init(MessageBus::default)
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.shared.policy
    }

    /// Registers `listener` for every frame delivered from now on.
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&str) -> ListenerResult + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            callback: Mutex::new(Box::new(listener)),
        });
        let count = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.push(Arc::clone(&entry));
            listeners.len()
        };
        debug!("listener {id} registered ({count} active)");
        Subscription {
            id,
            entry: Arc::downgrade(&entry),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Hands `frame` to every active listener in registration order.
    ///
    /// Listeners must not call `deliver` on the same bus.
    pub fn deliver(&self, frame: &str) -> Result<DeliveryReport> {
        let _serial = lock(&self.shared.delivery);
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("frame #{sequence}: {frame}");

        // Snapshot so listeners may register or cancel during delivery.
        let snapshot: Vec<Arc<Entry>> = lock(&self.shared.listeners).clone();
        let mut report = DeliveryReport {
            sequence,
            ..DeliveryReport::default()
        };

        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            match self.shared.policy {
                DeliveryPolicy::FailFast => {
                    let mut callback = lock(&entry.callback);
                    if let Err(source) = (*callback)(frame) {
                        warn!("listener {} failed on frame #{sequence}: {source:#}", entry.id);
                        return Err(Error::ListenerFailed {
                            listener: entry.id,
                            source,
                        });
                    }
                    report.delivered += 1;
                }
                DeliveryPolicy::Isolate => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        let mut callback = lock(&entry.callback);
                        (*callback)(frame)
                    }));
                    let reason = match outcome {
                        Ok(Ok(())) => {
                            report.delivered += 1;
                            continue;
                        }
                        Ok(Err(err)) => format!("{err:#}"),
                        Err(payload) => format!("panicked: {}", panic_message(&*payload)),
                    };
                    warn!("listener {} failed on frame #{sequence}: {reason}", entry.id);
                    report.failed.push(ListenerFailure {
                        listener: entry.id,
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    /// Frames handed to `deliver` so far, including aborted ones.
    pub fn frames_delivered(&self) -> u64 {
        self.shared.sequence.load(Ordering::Relaxed)
    }
}

/// Registration handle returned by [`MessageBus::add_listener`].
///
/// Dropping the handle detaches it: the listener stays registered for the
/// life of the bus. Call [`cancel`](Subscription::cancel) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    entry: Weak<Entry>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.entry
            .upgrade()
            .is_some_and(|entry| entry.active.load(Ordering::Acquire))
    }

    /// Stops delivery to this listener. A delivery already in flight on
    /// another thread may still reach it once.
    pub fn cancel(self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.active.store(false, Ordering::Release);
        }
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners).retain(|entry| entry.id != self.id);
            debug!("listener {} cancelled", self.id);
        }
    }
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A listener panic under Isolate poisons its own mutex; the data is still
    // usable for the next frame.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

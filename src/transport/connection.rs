//! The process's one live connection.
//!
//! A [`Connection`] is opened explicitly against a bus, reports its health on
//! a watch channel, and is torn down with [`Connection::close`]. Only one may
//! be open per process at a time; the slot is released on close or drop.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use log::{error, info, warn};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::{pump, Connector, WsConnector};
use crate::bus::{panic_message, MessageBus};
use crate::config::{FeedConfig, ReconnectPolicy};
use crate::error::{Error, Result};

static LIVE_CONNECTION: AtomicBool = AtomicBool::new(false);

/// A session must stay up this long before the backoff starts over.
pub const STABLE_SESSION: Duration = Duration::from_secs(10);

/// Health of the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the transport; `attempt` counts consecutive tries.
    Connecting { attempt: u32 },
    Connected,
    /// The transport failed or the remote closed. With
    /// [`ReconnectPolicy::Never`] this is final.
    Disconnected { reason: String },
    /// Shut down by the host.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected { reason } => write!(f, "disconnected: {reason}"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

struct ProcessSlot;

impl ProcessSlot {
    fn acquire() -> Result<Self> {
        LIVE_CONNECTION
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ProcessSlot)
            .map_err(|_| Error::ConnectionAlreadyOpen)
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        LIVE_CONNECTION.store(false, Ordering::Release);
    }
}

/// Handle to the task pumping frames from a [`Connector`] into a bus.
///
/// Dropping the handle aborts the task and frees the process slot;
/// [`close`](Self::close) stops it gracefully and waits for it.
pub struct Connection {
    target: String,
    health: watch::Receiver<ConnectionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    _slot: ProcessSlot,
}

impl Connection {
    /// Opens a WebSocket connection to `config.endpoint`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionAlreadyOpen`: another connection is live
    /// - `Error::InvalidEndpoint`: the endpoint is not a ws/wss URL
    pub fn connect(bus: &MessageBus, config: &FeedConfig) -> Result<Self> {
        let connector = WsConnector::from_config(config)?;
        Self::open(bus, connector, config.reconnect)
    }

    /// Starts pumping frames from `connector` into `bus`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<C: Connector>(bus: &MessageBus, connector: C, policy: ReconnectPolicy) -> Result<Self> {
        let slot = ProcessSlot::acquire()?;
        let target = connector.describe();
        let (state_tx, health) = watch::channel(ConnectionState::Connecting { attempt: 1 });
        let (shutdown, shutdown_rx) = oneshot::channel();
        let bus = bus.clone();
        let task_target = target.clone();

        let task = tokio::spawn(async move {
            // A fail-fast listener panic unwinds out of `deliver`; report it
            // instead of leaving the last state behind.
            let session = AssertUnwindSafe(run(bus, connector, policy, &state_tx)).catch_unwind();
            tokio::select! {
                outcome = session => {
                    if let Err(payload) = outcome {
                        let reason = format!("listener panicked: {}", panic_message(&*payload));
                        error!("{task_target}: {reason}");
                        state_tx.send_replace(ConnectionState::Disconnected { reason });
                    }
                }
                _ = shutdown_rx => {
                    state_tx.send_replace(ConnectionState::Closed);
                }
            }
        });

        Ok(Self {
            target,
            health,
            shutdown: Some(shutdown),
            task,
            _slot: slot,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.health.borrow().clone()
    }

    /// True once the task has stopped for good: reconnects were given up, a
    /// listener panicked, or the connection was closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Receiver that observes every state change.
    pub fn health(&self) -> watch::Receiver<ConnectionState> {
        self.health.clone()
    }

    /// Stops the task, waits for it and frees the process slot.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!("connection task for {} ended abnormally: {err}", self.target);
        }
        info!("Connection to {} closed", self.target);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("state", &*self.health.borrow())
            .finish()
    }
}

async fn run<C: Connector>(
    bus: MessageBus,
    mut connector: C,
    policy: ReconnectPolicy,
    state: &watch::Sender<ConnectionState>,
) {
    let target = connector.describe();
    let mut failures = 0u32;
    loop {
        state.send_replace(ConnectionState::Connecting {
            attempt: failures + 1,
        });
        let reason = match connector.connect().await {
            Ok(frames) => {
                info!("Connected to {target}. Processing messages...");
                state.send_replace(ConnectionState::Connected);
                let started = Instant::now();
                let outcome = pump(&bus, frames).await;
                // Accept-then-drop servers must still see the delay grow.
                if started.elapsed() >= STABLE_SESSION {
                    failures = 0;
                }
                match outcome {
                    Ok(delivered) => format!("stream ended after {delivered} frames"),
                    Err(err) => err.to_string(),
                }
            }
            Err(err) => err.to_string(),
        };
        failures = failures.saturating_add(1);
        state.send_replace(ConnectionState::Disconnected {
            reason: reason.clone(),
        });

        match policy.delay(failures) {
            Some(delay) => {
                warn!("{target}: {reason}. Retrying in {delay:?}...");
                sleep(delay).await;
            }
            None => {
                error!("{target}: {reason}. Not reconnecting");
                return;
            }
        }
    }
}

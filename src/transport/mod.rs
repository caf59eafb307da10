//! Inbound frame transport.
//!
//! A [`Connector`] produces a stream of text frames; [`pump`] drains such a
//! stream into a [`MessageBus`], one frame at a time, and a [`Connection`]
//! owns the task that does this for the process.
//!
//! ```text
//! Connector::connect() ──► FrameStream ──► pump() ──► MessageBus::deliver()
//!        ▲                                   │
//!        └──── ReconnectPolicy::delay() ◄────┘ (stream error / close)
//! ```

pub mod connection;
pub mod ws;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use log::error;

use crate::bus::MessageBus;
use crate::error::{Error, Result};

pub use connection::{Connection, ConnectionState};
pub use ws::WsConnector;

/// Text frames in arrival order. An `Err` item means the transport failed;
/// the end of the stream means the remote closed.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Opens the underlying transport. Called again on every reconnect.
pub trait Connector: Send + 'static {
    fn connect(&mut self) -> BoxFuture<'_, Result<FrameStream>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Delivers every frame of `frames` to `bus` until the stream ends.
///
/// Returns the number of frames delivered. A listener failure under
/// fail-fast delivery is logged and does not stop the stream.
///
/// # Errors
///
/// `Error::ConnectionLost` when the stream yields an error.
pub async fn pump<S>(bus: &MessageBus, mut frames: S) -> Result<u64>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    let mut delivered = 0u64;
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::ConnectionLost(reason)) => return Err(Error::ConnectionLost(reason)),
            Err(err) => return Err(Error::ConnectionLost(err.to_string())),
        };
        if let Err(err) = bus.deliver(&frame) {
            error!("delivery of frame {frame:?} aborted: {err}");
        }
        delivered += 1;
    }
    Ok(delivered)
}

use futures_util::future::BoxFuture;
use futures_util::{stream, StreamExt};
use log::{debug, info};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Connector, FrameStream};
use crate::config::FeedConfig;
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for the topic stream.
///
/// Only inbound text messages become frames. Pings are answered, binary
/// messages are skipped, a close message ends the stream.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint).map_err(|err| Error::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        Ok(Self { url })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        Self::new(&config.endpoint)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&mut self) -> BoxFuture<'_, Result<FrameStream>> {
        Box::pin(async move {
            info!("Connecting to {}", self.url);
            let (ws_stream, _) = connect_async(self.url.clone())
                .await
                .map_err(|err| Error::ConnectionLost(format!("connect {}: {err}", self.url)))?;
            Ok(text_frames(ws_stream))
        })
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

fn text_frames(ws_stream: WsStream) -> FrameStream {
    stream::unfold(Some(ws_stream), |state| async move {
        let mut ws_stream = state?;
        loop {
            match ws_stream.next().await? {
                Ok(Message::Text(text)) => return Some((Ok(text), Some(ws_stream))),
                // tungstenite queues the pong and flushes it on the next read.
                Ok(Message::Ping(ping)) => {
                    debug!("ping ({} bytes)", ping.len());
                }
                Ok(Message::Binary(bytes)) => {
                    debug!("skipping {}-byte binary message", bytes.len());
                }
                Ok(Message::Close(frame)) => {
                    debug!("remote closed: {frame:?}");
                    return None;
                }
                Ok(_) => {}
                // Yield the error once, then end.
                Err(err) => return Some((Err(Error::ConnectionLost(err.to_string())), None)),
            }
        }
    })
    .boxed()
}

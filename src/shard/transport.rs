//! Streaming transport seam
//!
//! A shard only needs a way to open a WebSocket to a URL and get back a
//! sink for outgoing messages and a stream of incoming ones. Production
//! uses tokio-tungstenite; tests plug in an in-memory pair.

use futures::future::BoxFuture;
use futures::{Sink, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Outgoing half of a connection
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Incoming half of a connection
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Opens streaming connections to the gateway
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(WsSink, WsStream), WsError>>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(WsSink, WsStream), WsError>> {
        Box::pin(async move {
            let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
            let (sink, stream) = socket.split();
            Ok((Box::pin(sink) as WsSink, Box::pin(stream) as WsStream))
        })
    }
}

//! Duplex relay between an external client and a running backend.
//!
//! One session bridges a single upgraded client connection to the backend's
//! control channel. The inbound direction (client to backend) passes through
//! the rate limiter; the outbound direction is forwarded verbatim. Message
//! payloads are opaque frames.

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message as BackendMessage, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::mcp::RATE_LIMIT_NOTICE;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::registry::ManagedServer;

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// RFC 6455 close code for an unexpected server condition.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// An opaque relay payload. Control frames are handled by the transports and
/// never cross the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Bridges upgraded client connections to backend control channels.
pub struct RelaySession {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    connect_timeout: Duration,
}

impl RelaySession {
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<Metrics>, connect_timeout: Duration) -> Self {
        Self {
            limiter,
            metrics,
            connect_timeout,
        }
    }

    /// Run one relay session to completion. The caller has already validated
    /// that the server is running.
    pub async fn run(&self, server: &ManagedServer, client: WebSocket) {
        let url = server.backend_ws_url();

        let backend = match connect_backend(&url, self.connect_timeout).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(server_id = %server.id, backend = %url, error = %err, "backend connection failed");
                notify_backend_failed(client).await;
                return;
            }
        };

        info!(server_id = %server.id, backend = %url, "relay session established");
        self.metrics.relay_sessions_active.inc();

        let (client_sink, client_stream) = client.split();
        let (backend_sink, backend_stream) = backend.split();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let inbound = pump_inbound(
            server.id,
            &self.limiter,
            &self.metrics,
            client_frames(client_stream),
            backend_frame_sink(backend_sink),
            notice_tx,
        );
        let outbound = pump_outbound(
            &self.metrics,
            backend_frames(backend_stream),
            client_frame_sink(client_sink),
            notice_rx,
        );

        // Either pump ending tears the session down: the select drops the
        // other pump with its connection half, unblocking any pending read.
        tokio::select! {
            _ = inbound => debug!(server_id = %server.id, "client-to-backend pump ended"),
            _ = outbound => debug!(server_id = %server.id, "backend-to-client pump ended"),
        }

        self.metrics.relay_sessions_active.dec();
        info!(server_id = %server.id, "relay session closed");
    }
}

/// Dial the backend control channel with a bounded connect timeout.
async fn connect_backend(url: &str, connect_timeout: Duration) -> Result<BackendStream> {
    match timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(err)) => Err(GatewayError::BackendUnreachable(err.to_string())),
        Err(_) => Err(GatewayError::BackendUnreachable(format!(
            "connect timed out after {:?}",
            connect_timeout
        ))),
    }
}

/// Signal closure to the external side after a failed backend dial.
async fn notify_backend_failed(mut client: WebSocket) {
    let _ = client
        .send(ClientMessage::Close(Some(CloseFrame {
            code: CLOSE_INTERNAL_ERROR,
            reason: "backend connection failed".into(),
        })))
        .await;
}

/// Client-to-backend pump. Each admitted frame is forwarded in order; denied
/// frames are dropped and a rate-limit notice is queued for the client.
async fn pump_inbound<S, K>(
    server_id: Uuid,
    limiter: &RateLimiter,
    metrics: &Metrics,
    mut from_client: S,
    mut to_backend: K,
    notices: mpsc::UnboundedSender<Frame>,
) where
    S: Stream<Item = Frame> + Unpin,
    K: Sink<Frame> + Unpin,
{
    while let Some(frame) = from_client.next().await {
        if !limiter.allow(server_id) {
            metrics.rate_limit_rejections.inc();
            if notices
                .send(Frame::Text(RATE_LIMIT_NOTICE.to_string()))
                .is_err()
            {
                break;
            }
            continue;
        }

        if to_backend.send(frame).await.is_err() {
            break;
        }
        metrics.relay_messages.with_label_values(&["inbound"]).inc();
    }
}

/// Backend-to-client pump. Forwards every backend frame verbatim and
/// interleaves rate-limit notices produced by the inbound pump.
async fn pump_outbound<S, K>(
    metrics: &Metrics,
    mut from_backend: S,
    mut to_client: K,
    mut notices: mpsc::UnboundedReceiver<Frame>,
) where
    S: Stream<Item = Frame> + Unpin,
    K: Sink<Frame> + Unpin,
{
    loop {
        tokio::select! {
            frame = from_backend.next() => match frame {
                Some(frame) => {
                    if to_client.send(frame).await.is_err() {
                        break;
                    }
                    metrics.relay_messages.with_label_values(&["outbound"]).inc();
                }
                None => break,
            },
            notice = notices.recv() => match notice {
                Some(notice) => {
                    if to_client.send(notice).await.is_err() {
                        break;
                    }
                }
                // The inbound pump is gone; the session is tearing down.
                None => break,
            },
        }
    }
}

fn client_frames(stream: SplitStream<WebSocket>) -> impl Stream<Item = Frame> + Unpin {
    stream
        .scan((), |_, msg| {
            let step = match msg {
                Ok(ClientMessage::Text(text)) => Some(Some(Frame::Text(text))),
                Ok(ClientMessage::Binary(data)) => Some(Some(Frame::Binary(data))),
                Ok(ClientMessage::Ping(_)) | Ok(ClientMessage::Pong(_)) => Some(None),
                Ok(ClientMessage::Close(_)) | Err(_) => None,
            };
            future::ready(step)
        })
        .filter_map(future::ready)
}

fn client_frame_sink(
    sink: SplitSink<WebSocket, ClientMessage>,
) -> impl Sink<Frame, Error = axum::Error> + Unpin {
    sink.with(|frame: Frame| {
        future::ready(Ok::<ClientMessage, axum::Error>(match frame {
            Frame::Text(text) => ClientMessage::Text(text),
            Frame::Binary(data) => ClientMessage::Binary(data),
        }))
    })
}

fn backend_frames(stream: SplitStream<BackendStream>) -> impl Stream<Item = Frame> + Unpin {
    stream
        .scan((), |_, msg| {
            let step = match msg {
                Ok(BackendMessage::Text(text)) => Some(Some(Frame::Text(text))),
                Ok(BackendMessage::Binary(data)) => Some(Some(Frame::Binary(data))),
                Ok(BackendMessage::Close(_)) | Err(_) => None,
                Ok(_) => Some(None),
            };
            future::ready(step)
        })
        .filter_map(future::ready)
}

fn backend_frame_sink(
    sink: SplitSink<BackendStream, BackendMessage>,
) -> impl Sink<Frame, Error = tungstenite::Error> + Unpin {
    sink.with(|frame: Frame| {
        future::ready(Ok::<BackendMessage, tungstenite::Error>(match frame {
            Frame::Text(text) => BackendMessage::Text(text),
            Frame::Binary(data) => BackendMessage::Binary(data),
        }))
    })
}

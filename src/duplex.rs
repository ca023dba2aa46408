//! Duplex WebSocket channel to a streaming endpoint
//!
//! One persistent connection per session. The socket is split into a write
//! half fed from an unbounded command queue and a read half that turns every
//! frame into [`ChannelEvent`]s. Sends are fire-and-forget and only go out
//! while the channel is open. How messages map to text frames is up to the
//! [`WireProtocol`] the channel is opened with.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{LiveError, Result};

/// Text framing of one session dialect
pub trait WireProtocol: Send + Sync + 'static {
    type Outbound: Send + 'static;
    type Inbound: Send + 'static;

    fn encode(message: &Self::Outbound) -> Result<String>;

    /// A frame may carry several messages.
    fn decode(frame: &str) -> Result<Vec<Self::Inbound>>;
}

/// Lifecycle of the underlying socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Events observed on the channel, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<M> {
    Open,
    Message(M),
    Error(String),
    /// Close reason reported by the peer, if any
    Close(Option<String>),
}

#[derive(Debug)]
enum WriterCommand {
    Frame(String),
    Close,
}

/// Handle to one connection. Cheap to clone.
pub struct DuplexChannel<P: WireProtocol> {
    state: Arc<AtomicU8>,
    commands: mpsc::UnboundedSender<WriterCommand>,
    protocol: PhantomData<fn() -> P>,
}

impl<P: WireProtocol> Clone for DuplexChannel<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            commands: self.commands.clone(),
            protocol: PhantomData,
        }
    }
}

impl<P: WireProtocol> fmt::Debug for DuplexChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("state", &self.state())
            .finish()
    }
}

impl<P: WireProtocol> DuplexChannel<P> {
    /// Start connecting to `url` in the background.
    ///
    /// The returned receiver yields `Open` once the handshake finishes, then
    /// server messages, and always ends with a single `Close`.
    pub fn connect(url: url::Url) -> (Self, mpsc::UnboundedReceiver<ChannelEvent<P::Inbound>>) {
        let state = Arc::new(AtomicU8::new(ChannelState::Connecting as u8));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // never log the query, it carries the token
        info!("Connecting to {}{}", url.origin().ascii_serialization(), url.path());

        tokio::spawn(run_connection::<P>(
            url.to_string(),
            Arc::clone(&state),
            command_rx,
            event_tx,
        ));

        let channel = Self {
            state,
            commands,
            protocol: PhantomData,
        };
        (channel, event_rx)
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a message for sending. Returns false if it was dropped because
    /// the channel is not open.
    pub fn send(&self, message: &P::Outbound) -> bool {
        if !self.is_open() {
            debug!("Channel not open, dropping outbound message");
            return false;
        }
        match P::encode(message) {
            Ok(text) => self.commands.send(WriterCommand::Frame(text)).is_ok(),
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                false
            }
        }
    }

    /// Begin closing the connection. Calling this again has no effect.
    pub fn close(&self) {
        let previous = self.state.fetch_max(ChannelState::Closing as u8, Ordering::SeqCst);
        if previous < ChannelState::Closing as u8 {
            debug!("Closing channel");
            let _ = self.commands.send(WriterCommand::Close);
        }
    }
}

async fn run_connection<P: WireProtocol>(
    url: String,
    state: Arc<AtomicU8>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    events: mpsc::UnboundedSender<ChannelEvent<P::Inbound>>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, resp)) => {
            debug!("WebSocket handshake status: {}", resp.status());
            ws_stream
        }
        Err(e) => {
            let err = LiveError::from(e);
            error!("Failed to connect: {}", err);
            state.store(ChannelState::Closed as u8, Ordering::SeqCst);
            let _ = events.send(ChannelEvent::Error(err.to_string()));
            let _ = events.send(ChannelEvent::Close(None));
            return;
        }
    };

    let (mut sink, mut stream) = ws_stream.split();

    // close() may have been called while the handshake was running
    let opened = state
        .compare_exchange(
            ChannelState::Connecting as u8,
            ChannelState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    if opened {
        info!("✅ Channel open");
        let _ = events.send(ChannelEvent::Open);
    } else {
        let _ = sink.send(Message::Close(None)).await;
    }

    let mut writer_done = !opened;
    let mut close_reason: Option<String> = None;

    loop {
        tokio::select! {
            command = commands.recv(), if !writer_done => {
                match command {
                    Some(WriterCommand::Frame(text)) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            let err = LiveError::from(e);
                            error!("Failed to send frame: {}", err);
                            let _ = events.send(ChannelEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    // explicit close, or every handle dropped
                    Some(WriterCommand::Close) | None => {
                        writer_done = true;
                        state.store(ChannelState::Closing as u8, Ordering::SeqCst);
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not sent: {}", e);
                            break;
                        }
                    }
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame::<P>(text.as_str(), &events);
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => dispatch_frame::<P>(text, &events),
                        Err(_) => warn!("Dropping non UTF-8 binary frame ({} bytes)", bytes.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Channel closed by peer: {:?}", frame);
                        close_reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|reason| !reason.is_empty());
                        break;
                    }
                    Some(Ok(_)) => {
                        // ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        let err = LiveError::from(e);
                        error!("{}", err);
                        let _ = events.send(ChannelEvent::Error(err.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.store(ChannelState::Closed as u8, Ordering::SeqCst);
    let _ = events.send(ChannelEvent::Close(close_reason));
    info!("Channel task finished");
}

fn dispatch_frame<P: WireProtocol>(text: &str, events: &mpsc::UnboundedSender<ChannelEvent<P::Inbound>>) {
    match P::decode(text) {
        Ok(messages) => {
            for message in messages {
                let _ = events.send(ChannelEvent::Message(message));
            }
        }
        Err(e) => warn!("Dropping malformed frame: {} ({} bytes)", e, text.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gemini::{ClientMessage, GeminiLive, RealtimeInput, ServerMessage, Setup};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    type LiveChannel = DuplexChannel<GeminiLive>;

    fn url_for(addr: std::net::SocketAddr) -> url::Url {
        GatewayConfig {
            live_url: format!("ws://{}/live_api", addr),
            ..GatewayConfig::with_token("tok")
        }
        .live_request_url()
        .unwrap()
    }

    #[tokio::test]
    async fn test_loopback_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_uri = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&seen_uri);

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                *seen.lock().unwrap() = req.uri().to_string();
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
            assert_eq!(value["setup"]["model"], "m");

            ws.send(Message::text(r#"{"setupComplete":{}}"#)).await.unwrap();
            ws.send(Message::text("not json")).await.unwrap();
            ws.send(Message::binary(br#"{"goAway":{"timeLeft":"1s"}}"#.to_vec()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let (channel, mut events) = LiveChannel::connect(url_for(addr));
        // nothing has run yet on this runtime, the handshake is pending
        assert!(!channel.send(&ClientMessage::RealtimeInput(RealtimeInput::default())));

        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        assert!(channel.is_open());
        assert!(channel.send(&ClientMessage::Setup(Setup {
            model: "m".to_string(),
            ..Default::default()
        })));

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }
        server.await.unwrap();

        assert!(matches!(received[0], ChannelEvent::Message(ServerMessage::SetupComplete(_))));
        assert!(matches!(&received[1], ChannelEvent::Message(ServerMessage::GoAway(g)) if g.time_left.as_deref() == Some("1s")));
        assert!(matches!(received.last(), Some(ChannelEvent::Close(_))));
        assert_eq!(received.len(), 3);

        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.send(&ClientMessage::RealtimeInput(RealtimeInput::default())));
        assert_eq!(*seen_uri.lock().unwrap(), "/live_api?api-token=tok");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // drain until the client's close handshake completes
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (channel, mut events) = LiveChannel::connect(url_for(addr));
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        channel.close();
        channel.close();
        assert!(!channel.is_open());

        let mut closes = 0;
        while let Some(event) = events.recv().await {
            if let ChannelEvent::Close(_) = event {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_then_close() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let (channel, mut events) = LiveChannel::connect(url_for(addr));

        match events.recv().await {
            Some(ChannelEvent::Error(message)) => assert!(message.starts_with("WebSocket error")),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(events.recv().await, Some(ChannelEvent::Close(None)));
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}

//! Session runner - connects the channel, media and caller commands to a session controller

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::duplex::{ChannelEvent, DuplexChannel, WireProtocol};
use crate::error::{LiveError, Result};
use crate::media_event::MediaEvent;
use crate::media_in::CaptureSource;
use crate::session::SessionState;

/// Inbound message type of a driver's protocol
pub type InboundOf<D> = <<D as SessionDriver>::Protocol as WireProtocol>::Inbound;
/// Outbound message type of a driver's protocol
pub type OutboundOf<D> = <<D as SessionDriver>::Protocol as WireProtocol>::Outbound;

/// A synchronous session state machine the runner can drive.
///
/// Every input may queue outbound messages; the runner drains and sends them
/// after each call.
pub trait SessionDriver: Send + 'static {
    type Protocol: WireProtocol;

    /// Handshake URL for this session, token included.
    fn request_url(&self, gateway: &GatewayConfig) -> Result<url::Url>;

    fn state(&self) -> SessionState;

    fn on_channel_event(&mut self, event: ChannelEvent<InboundOf<Self>>);

    fn on_media(&mut self, media: MediaEvent);

    fn send_text(&mut self, text: &str) -> Result<()>;

    fn end_audio_stream(&mut self) -> Result<()>;

    fn drain_outbound(&mut self) -> Vec<OutboundOf<Self>>;
}

enum Command {
    SendText(String, oneshot::Sender<Result<()>>),
    EndAudioStream,
}

/// Handle to a running session
pub struct LiveSession<D: SessionDriver> {
    channel: DuplexChannel<D::Protocol>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<D>,
}

impl<D: SessionDriver> LiveSession<D> {
    /// Connect and drive `driver` on a background task.
    ///
    /// The capture sources are started once the server acknowledges setup and
    /// stopped when the session ends. Their encoded output is expected on
    /// `media_rx`.
    pub fn start(
        gateway: &GatewayConfig,
        driver: D,
        media_rx: mpsc::UnboundedReceiver<MediaEvent>,
        captures: Vec<Box<dyn CaptureSource>>,
    ) -> Result<Self> {
        let url = driver.request_url(gateway)?;
        let (channel, channel_events) = DuplexChannel::connect(url);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(
            driver,
            channel.clone(),
            channel_events,
            media_rx,
            command_rx,
            captures,
        ));

        Ok(Self {
            channel,
            commands,
            task,
        })
    }

    /// Send a user text turn. Fails unless the session is streaming.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::SendText(text.into(), reply_tx))
            .map_err(|_| LiveError::ChannelClosed)?;
        reply_rx.await.map_err(|_| LiveError::ChannelClosed)?
    }

    pub fn end_audio_stream(&self) {
        let _ = self.commands.send(Command::EndAudioStream);
    }

    pub fn close(&self) {
        self.channel.close();
    }

    /// Wait for the session to finish and get the controller back.
    pub async fn join(self) -> Result<D> {
        self.task.await.map_err(|e| {
            error!("Session task failed: {}", e);
            LiveError::ChannelClosed
        })
    }
}

async fn run<D: SessionDriver>(
    mut driver: D,
    channel: DuplexChannel<D::Protocol>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent<InboundOf<D>>>,
    mut media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut captures: Vec<Box<dyn CaptureSource>>,
) -> D {
    let mut media_open = true;
    let mut commands_open = true;
    let mut capturing = false;

    info!("Live session started");

    loop {
        tokio::select! {
            event = channel_events.recv() => {
                let Some(event) = event else { break };
                let is_close = matches!(event, ChannelEvent::Close(_));

                driver.on_channel_event(event);
                flush(&mut driver, &channel);

                match driver.state() {
                    SessionState::Streaming if !capturing => {
                        capturing = true;
                        for source in captures.iter_mut() {
                            if let Err(e) = source.start() {
                                error!("Failed to start capture source: {:#}", e);
                            }
                        }
                    }
                    SessionState::Errored => channel.close(),
                    _ => {}
                }

                if is_close {
                    break;
                }
            }

            media = media_rx.recv(), if media_open => match media {
                Some(media) => {
                    driver.on_media(media);
                    flush(&mut driver, &channel);
                }
                None => {
                    debug!("All media sources finished");
                    media_open = false;
                }
            },

            command = commands.recv(), if commands_open => match command {
                Some(Command::SendText(text, reply)) => {
                    let result = driver.send_text(&text);
                    flush(&mut driver, &channel);
                    let _ = reply.send(result);
                }
                Some(Command::EndAudioStream) => {
                    if let Err(e) = driver.end_audio_stream() {
                        warn!("Cannot end audio stream: {}", e);
                    }
                    flush(&mut driver, &channel);
                }
                None => commands_open = false,
            },
        }
    }

    for source in captures.iter_mut() {
        source.stop();
    }
    info!("Live session finished in state {:?}", driver.state());
    driver
}

fn flush<D: SessionDriver>(driver: &mut D, channel: &DuplexChannel<D::Protocol>) {
    for message in driver.drain_outbound() {
        if !channel.send(&message) {
            debug!("Outbound message dropped, channel not open");
        }
    }
}

//! rsglive command line
//!
//! `rsglive live` and `rsglive realtime` replay a WAV file as the microphone
//! and write the model's audio reply to another WAV file. `rsglive snap3d`
//! generates a 3D asset from a prompt and reports each stage as it arrives.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rsglive::config::{AggregatorConfig, PlaybackConfig, PollerConfig, ResponseModality};
use rsglive::media_event::MediaEvent;
use rsglive::media_in::{spawn_audio_aggregator, CaptureSource, WavCaptureSource};
use rsglive::playback::{PlaybackReconstructor, WavFileOutput};
use rsglive::snap3d::{
    AsyncTaskPoller, HttpResourceLoader, HttpTaskTransport, SubmitRequest, TaskEvent,
};
use rsglive::{
    GatewayConfig, LiveSession, RealtimeConfig, RealtimeController, SessionConfig,
    SessionController, SessionDriver, SessionEvent,
};

#[derive(Debug, Parser)]
#[command(name = "rsglive", about = "Remote service gateway streaming client")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Stream a WAV file to a Gemini Live session
    Live(LiveArgs),
    /// Stream a WAV file to an OpenAI Realtime session
    Realtime(RealtimeArgs),
    /// Generate a 3D asset from a text prompt
    Snap3d(Snap3dArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Modality {
    Text,
    Audio,
}

impl From<Modality> for ResponseModality {
    fn from(modality: Modality) -> Self {
        match modality {
            Modality::Text => ResponseModality::Text,
            Modality::Audio => ResponseModality::Audio,
        }
    }
}

#[derive(Debug, clap::Args)]
struct LiveArgs {
    /// WAV file replayed as microphone input
    #[arg(long)]
    input: Option<PathBuf>,
    /// Where to write the model's audio
    #[arg(long, default_value = "reply.wav")]
    output: PathBuf,
    /// Text turn sent once the session is ready
    #[arg(long)]
    text: Option<String>,
    #[arg(long, value_enum, default_value_t = Modality::Audio)]
    modality: Modality,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Close the session after this many completed turns
    #[arg(long, default_value_t = 1)]
    turns: u32,
}

#[derive(Debug, clap::Args)]
struct RealtimeArgs {
    #[command(flatten)]
    live: LiveArgs,
    #[arg(long)]
    voice: Option<String>,
}

#[derive(Debug, clap::Args)]
struct Snap3dArgs {
    prompt: String,
    #[arg(long)]
    no_refine: bool,
    #[arg(long)]
    vertex_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let gateway = GatewayConfig::from_env().context("Gateway configuration")?;

    match cli.cmd {
        Cmd::Live(args) => run_live(gateway, args).await,
        Cmd::Realtime(args) => run_realtime(gateway, args).await,
        Cmd::Snap3d(args) => run_snap3d(gateway, args).await,
    }
}

async fn run_live(gateway: GatewayConfig, args: LiveArgs) -> Result<()> {
    let mut config = SessionConfig {
        system_instruction: args.system.clone(),
        response_modality: args.modality.into(),
        ..Default::default()
    };
    if let Some(model) = args.model.clone() {
        config.model = model;
    }

    let (playback, output_path) = open_playback(&args)?;
    let (controller, mut events) = SessionController::new(config.clone(), playback);
    let (media_rx, captures) = capture_input(args.input.as_ref(), config.input_sample_rate);

    let session = LiveSession::start(&gateway, controller, media_rx, captures)?;
    drive(&session, &mut events, &args).await;

    let controller = session.join().await?;
    finish_playback(controller.into_playback(), output_path)
}

async fn run_realtime(gateway: GatewayConfig, args: RealtimeArgs) -> Result<()> {
    let live = args.live;
    let mut config = RealtimeConfig {
        instructions: live.system.clone(),
        response_modality: live.modality.into(),
        ..Default::default()
    };
    if let Some(model) = live.model.clone() {
        config.model = model;
    }
    if let Some(voice) = args.voice {
        config.voice = voice;
    }

    let (playback, output_path) = open_playback(&live)?;
    let (controller, mut events) = RealtimeController::new(config.clone(), playback);
    let (media_rx, captures) = capture_input(live.input.as_ref(), config.input_sample_rate);

    let session = LiveSession::start(&gateway, controller, media_rx, captures)?;
    drive(&session, &mut events, &live).await;

    let controller = session.join().await?;
    finish_playback(controller.into_playback(), output_path)
}

fn open_playback(args: &LiveArgs) -> Result<(PlaybackReconstructor<WavFileOutput>, PathBuf)> {
    let playback_config = PlaybackConfig::default();
    let output = WavFileOutput::create(&args.output, playback_config.sample_rate)?;
    Ok((PlaybackReconstructor::new(output, playback_config), args.output.clone()))
}

/// Replay `input` as the microphone, if given.
fn capture_input(
    input: Option<&PathBuf>,
    sample_rate: u32,
) -> (mpsc::UnboundedReceiver<MediaEvent>, Vec<Box<dyn CaptureSource>>) {
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let mut captures: Vec<Box<dyn CaptureSource>> = Vec::new();
    if let Some(input) = input {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let aggregator = AggregatorConfig {
            sample_rate,
            ..Default::default()
        };
        spawn_audio_aggregator(frame_rx, media_tx, aggregator);
        captures.push(Box::new(WavCaptureSource::new(input, sample_rate, frame_tx)));
    }
    (media_rx, captures)
}

async fn drive<D: SessionDriver>(
    session: &LiveSession<D>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    args: &LiveArgs,
) {
    let mut turns = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::SetupComplete => {
                        info!("Session ready");
                        if let Some(text) = &args.text {
                            if let Err(e) = session.send_text(text.clone()).await {
                                error!("Failed to send text: {}", e);
                            }
                        }
                    }
                    SessionEvent::TranscriptComplete(text) => println!("🤖 {}", text),
                    SessionEvent::InputTranscript(text) => println!("🎤 {}", text),
                    SessionEvent::TurnComplete => {
                        turns += 1;
                        if turns >= args.turns {
                            session.close();
                        }
                    }
                    SessionEvent::ToolCall(call) => warn!("Unhandled tool call: {}", call.name),
                    SessionEvent::GoAway { time_left } => warn!("Server going away in {:?}", time_left),
                    SessionEvent::Error { code, message } => error!("Session error {}: {}", code, message),
                    SessionEvent::Closed { .. } => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing session");
                session.close();
            }
        }
    }
}

fn finish_playback(playback: PlaybackReconstructor<WavFileOutput>, path: PathBuf) -> Result<()> {
    let stats = playback.stats();
    let output = playback.into_output();
    info!(
        "Wrote {} samples ({} fragments, {} underruns) to {}",
        output.samples_written(),
        stats.fragments,
        stats.underrun_restarts,
        path.display()
    );
    output.finalize()?;
    Ok(())
}

async fn run_snap3d(gateway: GatewayConfig, args: Snap3dArgs) -> Result<()> {
    let poller = AsyncTaskPoller::new(
        HttpTaskTransport::new(&gateway),
        HttpResourceLoader::new(),
        PollerConfig::default(),
    );

    let request = SubmitRequest {
        refine: !args.no_refine,
        use_vertex_color: args.vertex_color,
        ..SubmitRequest::new(args.prompt)
    };
    let mut handle = poller.submit_and_track(&request).await?;
    info!("Tracking task {}", handle.task_id());

    while let Some(event) = handle.next_event().await {
        match event {
            TaskEvent::Artifact { kind, url, .. } => println!("{}: {}", kind.as_str(), url),
            TaskEvent::Failed(e) => error!("Generation failed ({}): {}", e.code(), e.message()),
        }
    }

    let task = handle.finish().await?;
    info!("Task {} finished as {:?}", task.task_id, task.status);
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use facelink::audio::NullAudioOutput;
use facelink::config::FacelinkConfig;
use facelink::protocol::{BlendShape, Blendshapes, FaceFrame, Quaternion};
use facelink::session::{PeerSession, SessionEvent};
use facelink::signaling::{Role, SignalingChannel};
use facelink::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use facelink::transport::webrtc::{LinkState, PeerConfig, VirtualNetwork};
use signal_store::{DirectoryStore, DocumentStore, MemoryStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("facelink: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = match &cli.config {
        Some(path) => FacelinkConfig::load(path)?,
        None => FacelinkConfig::default(),
    }
    .with_extra_servers(&cli.ice_servers);

    match cli.command {
        Command::Caller(args) => handle_caller(&config, args).await,
        Command::Receiver(args) => handle_receiver(&config, args).await,
        Command::Loopback(args) => handle_loopback(&config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "facelink",
    about = "Stream face tracking frames between two peers over a WebRTC data channel",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "FACELINK_CONFIG",
        help = "TOML config file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "ice-server",
        global = true,
        value_name = "URL",
        help = "Extra STUN/TURN url; repeatable"
    )]
    ice_servers: Vec<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "FACELINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "FACELINK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish an offer and stream synthetic frames once connected
    Caller(PeerArgs),
    /// Answer the caller and log the frames that arrive
    Receiver(PeerArgs),
    /// Run both roles in this process over an in-memory store and a virtual network
    Loopback(LoopbackArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    #[arg(
        long,
        value_name = "DIR",
        env = "FACELINK_STORE_DIR",
        help = "Directory shared by both peers for signaling"
    )]
    store_dir: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Stop after N frames")]
    frames: Option<u64>,
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    #[arg(long, value_name = "N", default_value_t = 90)]
    frames: u64,
}

fn directory_store(config: &FacelinkConfig, args: &PeerArgs) -> Result<Arc<dyn DocumentStore>> {
    let dir = args
        .store_dir
        .clone()
        .or_else(|| config.store_dir.clone())
        .context("a signaling directory is required (--store-dir or store_dir in the config)")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating signaling directory {}", dir.display()))?;
    Ok(Arc::new(DirectoryStore::new(dir)))
}

async fn handle_caller(config: &FacelinkConfig, args: PeerArgs) -> Result<()> {
    let signaling = SignalingChannel::new(directory_store(config, &args)?);
    let session = PeerSession::initialize(
        Role::Caller,
        signaling,
        config.peer_config()?,
        Box::new(NullAudioOutput),
    )
    .await?;
    spawn_event_log(&session, "caller");

    session.connect().await?;
    println!("offer published; waiting for the receiver");

    let outcome = tokio::select! {
        result = stream_frames(&session, config.frame_interval(), args.frames) => result,
        _ = tokio::signal::ctrl_c() => Ok(0),
    };
    session.close().await;
    let sent = outcome?;
    println!("sent {sent} frames");
    Ok(())
}

async fn handle_receiver(config: &FacelinkConfig, args: PeerArgs) -> Result<()> {
    let signaling = SignalingChannel::new(directory_store(config, &args)?);
    let session = PeerSession::initialize(
        Role::Receiver,
        signaling,
        config.peer_config()?,
        Box::new(NullAudioOutput),
    )
    .await?;
    spawn_event_log(&session, "receiver");
    println!("waiting for an offer");

    let mut frames = session.frames();
    let mut received = 0u64;
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    received += 1;
                    if received % 30 == 1 {
                        info!(
                            received,
                            jaw_open = frame.blendshapes.get(BlendShape::JawOpen),
                            "frame received"
                        );
                    }
                    if args.frames.is_some_and(|limit| received >= limit) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "frame consumer lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.close().await;
    println!("received {received} frames");
    Ok(())
}

async fn handle_loopback(config: &FacelinkConfig, args: LoopbackArgs) -> Result<()> {
    let network = VirtualNetwork::start()
        .await
        .context("starting virtual network")?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    let peer_config = |net| -> Result<PeerConfig> {
        let mut peer = config.peer_config()?;
        peer.ice_servers.clear();
        peer.network = Some(net);
        Ok(peer)
    };

    let receiver = PeerSession::initialize(
        Role::Receiver,
        SignalingChannel::new(Arc::clone(&store)),
        peer_config(network.receiver())?,
        Box::new(NullAudioOutput),
    )
    .await?;
    let caller = PeerSession::initialize(
        Role::Caller,
        SignalingChannel::new(Arc::clone(&store)),
        peer_config(network.caller())?,
        Box::new(NullAudioOutput),
    )
    .await?;
    spawn_event_log(&caller, "caller");
    spawn_event_log(&receiver, "receiver");

    let mut frames = receiver.frames();
    let counter = tokio::spawn(async move {
        let mut received = 0u64;
        loop {
            match frames.recv().await {
                Ok(_) => received += 1,
                Err(RecvError::Lagged(skipped)) => received += skipped,
                Err(RecvError::Closed) => break,
            }
        }
        received
    });

    caller.connect().await?;
    let outcome = stream_frames(&caller, config.frame_interval(), Some(args.frames)).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    caller.close().await;
    receiver.close().await;
    // the frame counter finishes once the last frame sender is gone
    drop(receiver);
    network.stop().await;

    let sent = outcome?;
    let received = counter.await.unwrap_or(0);
    println!("loopback: sent {sent} frames, received {received}");
    Ok(())
}

/// Wait for the link, then send frames at `interval` until `limit` is reached.
async fn stream_frames(session: &PeerSession, interval: Duration, limit: Option<u64>) -> Result<u64> {
    let mut link = session.watch_link_state();
    let state = *link
        .wait_for(|state| {
            matches!(
                state,
                LinkState::Connected | LinkState::Failed | LinkState::Closed
            )
        })
        .await
        .context("session ended before connecting")?;
    if state != LinkState::Connected {
        bail!("link {state} before any frame was sent");
    }
    println!("connected; streaming frames");

    let mut ticker = tokio::time::interval(interval);
    let mut sent = 0u64;
    while limit.is_none_or(|limit| sent < limit) {
        ticker.tick().await;
        if session.link_state() != LinkState::Connected {
            warn!(state = %session.link_state(), "link lost; stopping stream");
            break;
        }
        session.send(&synthetic_frame(sent))?;
        sent += 1;
    }
    Ok(sent)
}

fn spawn_event_log(session: &PeerSession, role: &'static str) {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::LinkStateChanged(state)) => println!("[{role}] link: {state}"),
                Ok(SessionEvent::HandshakeStalled { waited, .. }) => {
                    println!("[{role}] still not connected after {}s", waited.as_secs());
                }
                Ok(SessionEvent::Error(message)) => println!("[{role}] error: {message}"),
                Ok(event) => debug!(role, ?event, "session event"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// A slowly talking, blinking, head-turning face.
fn synthetic_frame(tick: u64) -> FaceFrame {
    let t = tick as f32 / 30.0;
    let mut blendshapes = Blendshapes::default();
    blendshapes.set(BlendShape::JawOpen, 0.5 + 0.5 * (t * 4.0).sin());
    let blink = if tick % 90 < 5 { 1.0 } else { 0.0 };
    blendshapes.set(BlendShape::EyeBlinkLeft, blink);
    blendshapes.set(BlendShape::EyeBlinkRight, blink);
    let smile = 0.3 + 0.2 * (t * 0.5).sin();
    blendshapes.set(BlendShape::MouthSmileLeft, smile);
    blendshapes.set(BlendShape::MouthSmileRight, smile);

    let yaw = 0.3 * (t * 0.7).sin();
    let face = Quaternion::new(0.0, (yaw / 2.0).sin(), 0.0, (yaw / 2.0).cos());
    let gaze = 0.2 * (t * 1.3).sin();
    let eye = Quaternion::new(0.0, (gaze / 2.0).sin(), 0.0, (gaze / 2.0).cos());
    FaceFrame::new(blendshapes, face, eye, eye)
}

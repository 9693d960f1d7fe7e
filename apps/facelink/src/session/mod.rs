//! Connection lifecycle for one role of a face-data link.
//!
//! A [`PeerSession`] is a handle onto a driver task. The driver alone owns the peer
//! connection, the data channel and the store subscriptions; every store notification,
//! transport callback and user command reaches it through the same ordered queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::{AudioConfigurationError, AudioOutput, AudioWorker};
use crate::protocol::{self, EncodeError, FaceFrame};
use crate::signaling::{Role, SignalingChannel, SignalingError};
use crate::transport::webrtc::{
    ChannelState, ConnectivityState, GatheringState, LinkState, PeerConfig, SignalingState,
};

mod driver;
mod listeners;
mod negotiation;

use driver::{Command, Driver, Input, Outputs};

const EVENT_CAPACITY: usize = 128;
const FRAME_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("{operation} is not available to the {role}")]
    WrongRole {
        role: Role,
        operation: &'static str,
    },
    #[error("session is closed")]
    Closed,
    #[error("peer connection setup failed: {0}")]
    Setup(String),
}

/// Observable progress of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignalingStateChanged(SignalingState),
    ConnectivityStateChanged(ConnectivityState),
    GatheringStateChanged(GatheringState),
    LinkStateChanged(LinkState),
    ChannelStateChanged(ChannelState),
    LoudspeakerEnabled,
    AudioFailed(AudioConfigurationError),
    /// The link was not connected within the configured stall interval.
    HandshakeStalled { attempt: u64, waited: Duration },
    Error(String),
}

pub struct PeerSession {
    role: Role,
    inputs: mpsc::UnboundedSender<Input>,
    link_state: watch::Receiver<LinkState>,
    events: broadcast::Sender<SessionEvent>,
    frames: broadcast::Sender<FaceFrame>,
    loudspeaker: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    /// Create the peer connection for `role` and start listening on the store.
    ///
    /// The receiver clears any stale offer and answer before it subscribes to the offer
    /// slot. Both roles subscribe to the other side's candidates straight away.
    pub async fn initialize(
        role: Role,
        signaling: SignalingChannel,
        config: PeerConfig,
        audio: Box<dyn AudioOutput>,
    ) -> Result<Self, SessionError> {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = watch::channel(LinkState::New);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        let loudspeaker = Arc::new(AtomicBool::new(false));

        let audio = AudioWorker::spawn(audio, Arc::clone(&loudspeaker), events.clone())
            .map_err(|err| SessionError::Setup(format!("audio worker: {err}")))?;
        let outputs = Outputs {
            link_state: link_tx,
            events: events.clone(),
            frames: frames.clone(),
        };
        let mut driver = Driver::new(role, signaling, config, audio, inputs_tx.clone(), outputs)?;
        if let Err(err) = driver.start().await {
            driver.close().await;
            return Err(err);
        }
        let handle = tokio::spawn(driver.run(inputs_rx));
        tracing::info!(role = %role, "session initialized");

        Ok(Self {
            role,
            inputs: inputs_tx,
            link_state: link_rx,
            events,
            frames,
            loudspeaker,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Start a connection attempt. Caller only; calling again starts over.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.role != Role::Caller {
            return Err(SessionError::WrongRole {
                role: self.role,
                operation: "connect",
            });
        }
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(Command::Connect { reply }))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Queue one frame. Dropped without error unless the data channel is open.
    pub fn send(&self, frame: &FaceFrame) -> Result<(), EncodeError> {
        let payload = protocol::encode(frame)?;
        if self
            .inputs
            .send(Input::Command(Command::Send(payload)))
            .is_err()
        {
            tracing::trace!("session closed; frame dropped");
        }
        Ok(())
    }

    /// Tear everything down. Returns once subscriptions are released and the peer
    /// connection is closed. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .inputs
            .send(Input::Command(Command::Close { reply: Some(reply) }))
            .is_ok()
        {
            let _ = rx.await;
        }
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_state.borrow()
    }

    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Decoded frames from the remote side.
    pub fn frames(&self) -> broadcast::Receiver<FaceFrame> {
        self.frames.subscribe()
    }

    pub fn loudspeaker_enabled(&self) -> bool {
        self.loudspeaker.load(Ordering::SeqCst)
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        let _ = self
            .inputs
            .send(Input::Command(Command::Close { reply: None }));
    }
}

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;

use super::listeners::Listeners;
use super::negotiation::{AnswerAction, CandidateQueue, OfferAction, answer_action, offer_action};
use super::{SessionError, SessionEvent};
use crate::audio::AudioWorker;
use crate::protocol::{self, FaceFrame};
use crate::signaling::{
    ConnectivityCandidate, Role, SignalMessage, SignalingChannel, SignalingError, Slot,
};
use crate::transport::webrtc::{
    ChannelSender, ChannelState, LinkState, PeerConfig, PeerEvent, PeerEventSink, PeerLink,
    build_api,
};

/// Everything the driver reacts to, funnelled through one ordered queue.
pub(crate) enum Input {
    Command(Command),
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
    Signal {
        attempt: Option<u64>,
        slot: Slot,
        message: SignalMessage,
    },
    StallCheck {
        attempt: u64,
    },
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Send(Bytes),
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

enum ConnectionState {
    Uninitialized,
    Negotiating { link: PeerLink },
    Open { link: PeerLink, sender: ChannelSender },
    Closed,
}

impl ConnectionState {
    fn link(&self) -> Option<&PeerLink> {
        match self {
            ConnectionState::Negotiating { link } | ConnectionState::Open { link, .. } => Some(link),
            ConnectionState::Uninitialized | ConnectionState::Closed => None,
        }
    }
}

/// Per-attempt bookkeeping, reset whenever the peer connection is rebuilt.
#[derive(Default)]
struct AttemptProgress {
    offered: bool,
    /// Answer applied (caller) or offer answered (receiver).
    remote_sdp: Option<String>,
    audio_requested: bool,
}

pub(crate) struct Outputs {
    pub(crate) link_state: watch::Sender<LinkState>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) frames: broadcast::Sender<FaceFrame>,
}

pub(crate) struct Driver {
    role: Role,
    signaling: SignalingChannel,
    config: PeerConfig,
    api: API,
    inputs: mpsc::UnboundedSender<Input>,
    state: ConnectionState,
    attempt: u64,
    progress: AttemptProgress,
    candidates: CandidateQueue,
    listeners: Listeners,
    audio: AudioWorker,
    outputs: Outputs,
    stall_timer: Option<JoinHandle<()>>,
}

impl Driver {
    pub(crate) fn new(
        role: Role,
        signaling: SignalingChannel,
        config: PeerConfig,
        audio: AudioWorker,
        inputs: mpsc::UnboundedSender<Input>,
        outputs: Outputs,
    ) -> Result<Self, SessionError> {
        let api = build_api(&config).map_err(|err| SessionError::Setup(err.to_string()))?;
        Ok(Self {
            role,
            signaling,
            config,
            api,
            inputs,
            state: ConnectionState::Uninitialized,
            attempt: 0,
            progress: AttemptProgress::default(),
            candidates: CandidateQueue::default(),
            listeners: Listeners::default(),
            audio,
            outputs,
            stall_timer: None,
        })
    }

    /// Build the first peer connection and open the role's standing subscriptions.
    pub(crate) async fn start(&mut self) -> Result<(), SessionError> {
        self.open_link().await?;
        if self.role == Role::Receiver {
            self.signaling.clear_handshake().await?;
            self.listeners
                .watch(&self.signaling, Slot::CallerOffer, None, self.inputs.clone())
                .await?;
        }
        self.listeners
            .watch(
                &self.signaling,
                self.role.remote_candidate_slot(),
                None,
                self.inputs.clone(),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            match input {
                Input::Command(Command::Close { reply }) => {
                    self.close().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                Input::Command(Command::Connect { reply }) => {
                    let result = self.connect().await;
                    let _ = reply.send(result);
                }
                Input::Command(Command::Send(payload)) => self.send(payload),
                Input::Peer { attempt, event } => {
                    if attempt == self.attempt {
                        self.on_peer_event(event).await;
                    } else {
                        tracing::trace!(attempt, current = self.attempt, ?event, "stale transport event");
                    }
                }
                Input::Signal {
                    attempt,
                    slot,
                    message,
                } => {
                    if attempt.is_some_and(|attempt| attempt != self.attempt) {
                        tracing::trace!(slot = %slot, "signal for an earlier attempt ignored");
                        continue;
                    }
                    self.on_signal(slot, message).await;
                }
                Input::StallCheck { attempt } => self.check_stall(attempt),
            }
        }
        tracing::debug!(role = %self.role, "session driver stopped");
    }

    async fn open_link(&mut self) -> Result<(), SessionError> {
        self.attempt += 1;
        let attempt = self.attempt;
        let inputs = self.inputs.clone();
        let sink: PeerEventSink = Arc::new(move |event| {
            let _ = inputs.send(Input::Peer { attempt, event });
        });
        let link = PeerLink::open(&self.api, &self.config, self.role, sink)
            .await
            .map_err(|err| SessionError::Setup(err.to_string()))?;
        self.state = ConnectionState::Negotiating { link };
        self.progress = AttemptProgress::default();
        self.publish_link_state(LinkState::New);
        tracing::info!(role = %self.role, attempt, "peer connection ready");
        Ok(())
    }

    /// Close the current connection and forget the remote candidates it received.
    async fn teardown_link(&mut self) {
        self.cancel_stall_timer();
        self.candidates.reset();
        match std::mem::replace(&mut self.state, ConnectionState::Uninitialized) {
            ConnectionState::Negotiating { link } => link.close().await,
            ConnectionState::Open { link, sender } => {
                drop(sender);
                link.close().await;
            }
            ConnectionState::Uninitialized => {}
            ConnectionState::Closed => self.state = ConnectionState::Closed,
        }
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Caller {
            return Err(SessionError::WrongRole {
                role: self.role,
                operation: "connect",
            });
        }
        if matches!(self.state, ConnectionState::Closed) {
            return Err(SessionError::Closed);
        }
        if self.progress.offered || matches!(self.state, ConnectionState::Uninitialized) {
            tracing::info!(previous = self.attempt, "starting a new connection attempt");
            self.teardown_link().await;
            self.open_link().await?;
        }

        self.listeners.cancel(Slot::ReceiverAnswer).await;
        if let Err(err) = self.signaling.clear_handshake().await {
            return Err(self.transport_failure(err));
        }

        let Some(link) = self.state.link() else {
            return Err(SessionError::Closed);
        };
        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.abort_attempt(err.to_string()).await),
        };
        self.progress.offered = true;

        if let Err(err) = self.signaling.write_description(&offer).await {
            return Err(self.transport_failure(err));
        }
        tracing::info!(attempt = self.attempt, "offer published");

        if let Err(err) = self
            .listeners
            .watch(
                &self.signaling,
                Slot::ReceiverAnswer,
                Some(self.attempt),
                self.inputs.clone(),
            )
            .await
        {
            return Err(self.transport_failure(err));
        }
        self.arm_stall_timer();
        Ok(())
    }

    fn send(&self, payload: Bytes) {
        match &self.state {
            ConnectionState::Open { sender, .. } => sender.send(payload),
            _ => tracing::trace!(len = payload.len(), "channel not open; frame dropped"),
        }
    }

    pub(crate) async fn close(&mut self) {
        self.listeners.cancel_all().await;
        self.teardown_link().await;
        self.state = ConnectionState::Closed;
        self.publish_link_state(LinkState::Closed);
        tracing::info!(role = %self.role, "session closed");
    }

    async fn on_signal(&mut self, slot: Slot, message: SignalMessage) {
        match (slot, message) {
            (Slot::ReceiverAnswer, SignalMessage::Description(answer))
                if self.role == Role::Caller =>
            {
                self.on_answer(answer.sdp).await;
            }
            (Slot::CallerOffer, SignalMessage::Description(offer))
                if self.role == Role::Receiver =>
            {
                self.on_offer(offer.sdp).await;
            }
            (slot, SignalMessage::Candidate(candidate))
                if slot == self.role.remote_candidate_slot() =>
            {
                self.on_remote_candidate(candidate).await;
            }
            (slot, message) => {
                tracing::debug!(slot = %slot, ?message, "unexpected signaling message ignored");
            }
        }
    }

    async fn on_answer(&mut self, sdp: String) {
        let Some(link) = self.state.link() else {
            tracing::debug!("answer arrived without a peer connection");
            return;
        };
        match answer_action(link.signaling_state(), self.progress.remote_sdp.as_deref(), &sdp) {
            AnswerAction::Apply => match link.apply_answer(&sdp).await {
                Ok(()) => {
                    tracing::info!(attempt = self.attempt, "answer applied");
                    self.progress.remote_sdp = Some(sdp);
                    self.flush_candidates().await;
                }
                Err(err) => {
                    self.abort_attempt(err.to_string()).await;
                }
            },
            AnswerAction::IgnoreDuplicate => tracing::debug!("duplicate answer ignored"),
            AnswerAction::IgnoreUnexpected(state) => {
                tracing::debug!(state = %state, "answer ignored in this signaling state");
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        match offer_action(self.progress.remote_sdp.as_deref(), &sdp) {
            OfferAction::IgnoreDuplicate => {
                tracing::debug!("duplicate offer ignored");
                return;
            }
            OfferAction::Restart => {
                tracing::info!(previous = self.attempt, "caller sent a new offer; rebuilding");
                self.teardown_link().await;
                if let Err(err) = self.open_link().await {
                    self.report(&err);
                    return;
                }
            }
            OfferAction::Accept => {
                if matches!(self.state, ConnectionState::Uninitialized) {
                    if let Err(err) = self.open_link().await {
                        self.report(&err);
                        return;
                    }
                }
            }
        }

        let Some(link) = self.state.link() else {
            return;
        };
        let answer = match link.accept_offer(&sdp).await {
            Ok(answer) => answer,
            Err(err) => {
                self.abort_attempt(err.to_string()).await;
                return;
            }
        };
        self.progress.remote_sdp = Some(sdp);
        self.flush_candidates().await;

        if let Err(err) = self.signaling.write_description(&answer).await {
            self.transport_failure(err);
            return;
        }
        tracing::info!(attempt = self.attempt, "answer published");
        self.arm_stall_timer();
    }

    async fn on_remote_candidate(&mut self, candidate: ConnectivityCandidate) {
        if !self.candidates.push(candidate) {
            tracing::trace!("duplicate remote candidate ignored");
            return;
        }
        if self.progress.remote_sdp.is_some() {
            self.flush_candidates().await;
        } else {
            tracing::debug!(
                pending = self.candidates.pending_len(),
                "remote candidate queued until the remote description is set"
            );
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(link) = self.state.link() else {
            return;
        };
        for candidate in self.candidates.take_pending() {
            if let Err(err) = link.add_candidate(&candidate).await {
                tracing::warn!(error = %err, candidate = %candidate.candidate, "remote candidate rejected");
            }
        }
    }

    /// Publish a locally gathered candidate, replacing the previous one in our slot.
    async fn update_local_candidate(&mut self, candidate: ConnectivityCandidate) {
        match self.signaling.write_candidate(self.role, &candidate).await {
            Ok(()) => tracing::trace!(candidate = %candidate.candidate, "local candidate published"),
            Err(err) => {
                self.transport_failure(err);
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::CandidateGenerated(candidate) => self.update_local_candidate(candidate).await,
            PeerEvent::SignalingStateChanged(state) => {
                tracing::debug!(state = %state, "signaling state changed");
                self.emit(SessionEvent::SignalingStateChanged(state));
            }
            PeerEvent::ConnectivityStateChanged(state) => {
                tracing::debug!(state = %state, "connectivity state changed");
                self.emit(SessionEvent::ConnectivityStateChanged(state));
            }
            PeerEvent::GatheringStateChanged(state) => {
                tracing::trace!(state = %state, "gathering state changed");
                self.emit(SessionEvent::GatheringStateChanged(state));
            }
            PeerEvent::LinkStateChanged(state) => self.on_link_state(state),
            PeerEvent::ChannelOpened(channel) => self.on_channel_open(channel),
            PeerEvent::ChannelClosed => self.on_channel_closed(),
            PeerEvent::MessageReceived(payload) => match protocol::decode(&payload) {
                Ok(frame) => {
                    let _ = self.outputs.frames.send(frame);
                }
                Err(err) => {
                    tracing::trace!(error = %err, len = payload.len(), "malformed frame dropped");
                }
            },
        }
    }

    fn on_link_state(&mut self, state: LinkState) {
        tracing::info!(attempt = self.attempt, state = %state, "link state changed");
        self.publish_link_state(state);
        if state == LinkState::Connected {
            self.cancel_stall_timer();
            if !self.progress.audio_requested {
                self.progress.audio_requested = true;
                self.audio.request_configuration();
            }
        }
    }

    fn on_channel_open(&mut self, channel: Arc<RTCDataChannel>) {
        self.state = match std::mem::replace(&mut self.state, ConnectionState::Uninitialized) {
            ConnectionState::Negotiating { link } => {
                tracing::info!(label = %channel.label(), "data channel ready");
                self.emit(SessionEvent::ChannelStateChanged(ChannelState::Open));
                ConnectionState::Open {
                    link,
                    sender: ChannelSender::spawn(channel),
                }
            }
            other => {
                tracing::debug!("data channel opened outside negotiation; ignored");
                other
            }
        };
    }

    fn on_channel_closed(&mut self) {
        self.state = match std::mem::replace(&mut self.state, ConnectionState::Uninitialized) {
            ConnectionState::Open { link, sender } => {
                drop(sender);
                tracing::info!("data channel closed");
                self.emit(SessionEvent::ChannelStateChanged(ChannelState::Closed));
                ConnectionState::Negotiating { link }
            }
            other => other,
        };
    }

    fn arm_stall_timer(&mut self) {
        let Some(after) = self.config.stall_warning else {
            return;
        };
        self.cancel_stall_timer();
        let inputs = self.inputs.clone();
        let attempt = self.attempt;
        self.stall_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(Input::StallCheck { attempt });
        }));
    }

    fn cancel_stall_timer(&mut self) {
        if let Some(timer) = self.stall_timer.take() {
            timer.abort();
        }
    }

    fn check_stall(&self, attempt: u64) {
        if attempt != self.attempt || *self.outputs.link_state.borrow() == LinkState::Connected {
            return;
        }
        let waited = self.config.stall_warning.unwrap_or(Duration::ZERO);
        tracing::warn!(attempt, waited_ms = waited.as_millis() as u64, "handshake has not connected yet");
        self.emit(SessionEvent::HandshakeStalled { attempt, waited });
    }

    async fn abort_attempt(&mut self, reason: String) -> SessionError {
        tracing::warn!(attempt = self.attempt, reason = %reason, "negotiation failed; attempt abandoned");
        self.teardown_link().await;
        // callbacks still in flight from the discarded connection must not match
        self.attempt += 1;
        self.progress = AttemptProgress::default();
        self.publish_link_state(LinkState::Failed);
        let err = SessionError::Negotiation(reason);
        self.emit(SessionEvent::Error(err.to_string()));
        err
    }

    fn transport_failure(&self, err: SignalingError) -> SessionError {
        let err = SessionError::Signaling(err);
        self.report(&err);
        err
    }

    fn report(&self, err: &SessionError) {
        tracing::warn!(error = %err, "session error");
        self.emit(SessionEvent::Error(err.to_string()));
    }

    fn publish_link_state(&self, state: LinkState) {
        let changed = self.outputs.link_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(SessionEvent::LinkStateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.outputs.events.send(event);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.cancel_stall_timer();
    }
}

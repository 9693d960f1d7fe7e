//! Thin ownership layer over a webrtc-rs peer connection.
//!
//! Every transport callback is translated into a [`PeerEvent`] and handed to a sink supplied
//! by the caller; nothing here keeps negotiation state of its own.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::signaling::{ConnectivityCandidate, Role, SessionDescription};

mod config;
mod state;
mod vnet;

pub use config::{
    DEFAULT_DATA_CHANNEL_LABEL, IceTimeouts, PeerConfig, PeerConfigBuilder, PeerConfigError,
    default_ice_servers,
};
pub use state::{ChannelState, ConnectivityState, GatheringState, LinkState, SignalingState};
pub use vnet::VirtualNetwork;

const VOICE_STREAM_ID: &str = "facelink";
const VOICE_TRACK_ID: &str = "voice";

/// Everything the transport reports, in the order the callbacks fire.
pub enum PeerEvent {
    SignalingStateChanged(SignalingState),
    ConnectivityStateChanged(ConnectivityState),
    GatheringStateChanged(GatheringState),
    LinkStateChanged(LinkState),
    CandidateGenerated(ConnectivityCandidate),
    ChannelOpened(Arc<RTCDataChannel>),
    ChannelClosed,
    MessageReceived(Bytes),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::SignalingStateChanged(state) => {
                f.debug_tuple("SignalingStateChanged").field(state).finish()
            }
            PeerEvent::ConnectivityStateChanged(state) => {
                f.debug_tuple("ConnectivityStateChanged").field(state).finish()
            }
            PeerEvent::GatheringStateChanged(state) => {
                f.debug_tuple("GatheringStateChanged").field(state).finish()
            }
            PeerEvent::LinkStateChanged(state) => {
                f.debug_tuple("LinkStateChanged").field(state).finish()
            }
            PeerEvent::CandidateGenerated(candidate) => {
                f.debug_tuple("CandidateGenerated").field(candidate).finish()
            }
            PeerEvent::ChannelOpened(channel) => f
                .debug_tuple("ChannelOpened")
                .field(&channel.label())
                .finish(),
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
            PeerEvent::MessageReceived(bytes) => f
                .debug_struct("MessageReceived")
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

pub fn build_api(config: &PeerConfig) -> Result<API, webrtc::Error> {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(config.ice_timeouts.disconnected),
        Some(config.ice_timeouts.failed),
        Some(config.ice_timeouts.keepalive),
    );
    if let Some(net) = &config.network {
        setting.set_vnet(Some(Arc::clone(net)));
    }

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// One peer connection with its voice track plus, for the caller, the data channel
/// created with it.
pub struct PeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl PeerLink {
    pub async fn open(
        api: &API,
        config: &PeerConfig,
        role: Role,
        sink: PeerEventSink,
    ) -> Result<Self, webrtc::Error> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            bundle_policy: RTCBundlePolicy::MaxCompat,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        register_connection_callbacks(&pc, &sink);
        add_voice_track(&pc).await?;

        match role {
            Role::Caller => {
                let init = RTCDataChannelInit {
                    ordered: Some(config.ordered),
                    max_retransmits: config.max_retransmits,
                    ..Default::default()
                };
                let channel = pc
                    .create_data_channel(&config.data_channel_label, Some(init))
                    .await?;
                attach_channel(&channel, &sink);
                tracing::debug!(label = %config.data_channel_label, "data channel created");
            }
            Role::Receiver => {
                let sink = Arc::clone(&sink);
                pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        tracing::debug!(label = %channel.label(), "remote data channel announced");
                        attach_channel(&channel, &sink);
                    })
                }));
            }
        }

        Ok(Self { pc })
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state().into()
    }

    /// Create an offer and install it locally. Candidates trickle afterwards.
    pub async fn create_offer(&self) -> Result<SessionDescription, webrtc::Error> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    /// Install a remote offer and answer it.
    pub async fn accept_offer(&self, sdp: &str) -> Result<SessionDescription, webrtc::Error> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    pub async fn apply_answer(&self, sdp: &str) -> Result<(), webrtc::Error> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())?;
        self.pc.set_remote_description(answer).await
    }

    pub async fn add_candidate(&self, candidate: &ConnectivityCandidate) -> Result<(), webrtc::Error> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
    }

    pub async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(error = %err, "peer connection close reported an error");
        }
    }
}

fn register_connection_callbacks(pc: &Arc<RTCPeerConnection>, sink: &PeerEventSink) {
    let candidates = Arc::clone(sink);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = Arc::clone(&candidates);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::trace!("candidate gathering finished");
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink(PeerEvent::CandidateGenerated(ConnectivityCandidate {
                    candidate: init.candidate,
                    sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                    sdp_mid: init.sdp_mid,
                })),
                Err(err) => tracing::warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));

    let signaling = Arc::clone(sink);
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let sink = Arc::clone(&signaling);
        Box::pin(async move { sink(PeerEvent::SignalingStateChanged(state.into())) })
    }));

    let connectivity = Arc::clone(sink);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = Arc::clone(&connectivity);
        Box::pin(async move { sink(PeerEvent::ConnectivityStateChanged(state.into())) })
    }));

    let gathering = Arc::clone(sink);
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let sink = Arc::clone(&gathering);
        Box::pin(async move { sink(PeerEvent::GatheringStateChanged(state.into())) })
    }));

    let link = Arc::clone(sink);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = Arc::clone(&link);
        Box::pin(async move { sink(PeerEvent::LinkStateChanged(state.into())) })
    }));
}

/// Both sides offer a send-receive Opus track so the call carries voice next to the
/// face data. Inbound audio is drained so the receive buffers never fill up.
async fn add_voice_track(pc: &Arc<RTCPeerConnection>) -> Result<(), webrtc::Error> {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        VOICE_TRACK_ID.to_owned(),
        VOICE_STREAM_ID.to_owned(),
    ));
    let sender = pc
        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    tokio::spawn(async move {
        let mut rtcp = vec![0u8; 1500];
        while sender.read(&mut rtcp).await.is_ok() {}
    });

    pc.on_track(Box::new(
        |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(async move {
                tracing::debug!(
                    kind = %track.kind(),
                    codec = %track.codec().capability.mime_type,
                    "remote track started"
                );
                tokio::spawn(async move {
                    let mut packets = 0u64;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    tracing::debug!(packets, "remote track ended");
                });
            })
        },
    ));
    Ok(())
}

fn attach_channel(channel: &Arc<RTCDataChannel>, sink: &PeerEventSink) {
    let opened = Arc::clone(sink);
    let weak: Weak<RTCDataChannel> = Arc::downgrade(channel);
    channel.on_open(Box::new(move || {
        let sink = Arc::clone(&opened);
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(channel) = weak.upgrade() {
                tracing::debug!(label = %channel.label(), "data channel open");
                sink(PeerEvent::ChannelOpened(channel));
            }
        })
    }));

    let closed = Arc::clone(sink);
    channel.on_close(Box::new(move || {
        let sink = Arc::clone(&closed);
        Box::pin(async move { sink(PeerEvent::ChannelClosed) })
    }));

    let messages = Arc::clone(sink);
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let sink = Arc::clone(&messages);
        Box::pin(async move { sink(PeerEvent::MessageReceived(message.data)) })
    }));
}

/// Outbound half of an open data channel. Frames queue here and a pump task hands them to
/// the channel, dropping anything that arrives while the channel is not open.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Bytes>,
    pump: JoinHandle<()>,
}

impl ChannelSender {
    pub fn spawn(channel: Arc<RTCDataChannel>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let pump = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if channel.ready_state() != RTCDataChannelState::Open {
                    tracing::trace!(len = payload.len(), "channel not open; frame dropped");
                    continue;
                }
                let text = match String::from_utf8(payload.to_vec()) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "outbound payload is not utf-8; dropped");
                        continue;
                    }
                };
                if let Err(err) = channel.send_text(text).await {
                    tracing::debug!(error = %err, "data channel send failed");
                }
            }
        });
        Self { tx, pump }
    }

    pub fn send(&self, payload: Bytes) {
        if self.tx.send(payload).is_err() {
            tracing::trace!("channel pump stopped; frame dropped");
        }
    }
}

impl Drop for ChannelSender {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

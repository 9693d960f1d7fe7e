use std::fmt;

use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

macro_rules! labelled_state {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Human readable form used for status display.
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

labelled_state! {
    /// Offer/answer progress of the local peer connection.
    SignalingState {
        New => "New",
        Stable => "Stable",
        HaveLocalOffer => "Have Local Offer",
        HaveRemoteOffer => "Have Remote Offer",
        HaveLocalAnswer => "Have Local Answer",
        HaveRemoteAnswer => "Have Remote Answer",
        Closed => "Closed",
    }
}

labelled_state! {
    ConnectivityState {
        New => "New",
        Checking => "Checking",
        Connected => "Connected",
        Completed => "Completed",
        Failed => "Failed",
        Disconnected => "Disconnected",
        Closed => "Closed",
    }
}

labelled_state! {
    GatheringState {
        New => "New",
        Gathering => "Gathering",
        Complete => "Complete",
        Closed => "Closed",
    }
}

labelled_state! {
    /// Aggregate state of the peer link. This is what observers wait on.
    LinkState {
        New => "New",
        Connecting => "Connecting",
        Connected => "Connected",
        Disconnected => "Disconnected",
        Failed => "Failed",
        Closed => "Closed",
    }
}

labelled_state! {
    ChannelState {
        Connecting => "Connecting",
        Open => "Open",
        Closing => "Closing",
        Closed => "Closed",
    }
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Unspecified => SignalingState::New,
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalAnswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemoteAnswer,
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }
}

impl From<RTCIceConnectionState> for ConnectivityState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                ConnectivityState::New
            }
            RTCIceConnectionState::Checking => ConnectivityState::Checking,
            RTCIceConnectionState::Connected => ConnectivityState::Connected,
            RTCIceConnectionState::Completed => ConnectivityState::Completed,
            RTCIceConnectionState::Failed => ConnectivityState::Failed,
            RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCIceConnectionState::Closed => ConnectivityState::Closed,
        }
    }
}

impl From<RTCIceGathererState> for GatheringState {
    fn from(state: RTCIceGathererState) -> Self {
        match state {
            RTCIceGathererState::Unspecified | RTCIceGathererState::New => GatheringState::New,
            RTCIceGathererState::Gathering => GatheringState::Gathering,
            RTCIceGathererState::Complete => GatheringState::Complete,
            RTCIceGathererState::Closed => GatheringState::Closed,
        }
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
        }
    }
}

impl From<RTCDataChannelState> for ChannelState {
    fn from(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }
}

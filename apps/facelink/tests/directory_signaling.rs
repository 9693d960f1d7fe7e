use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use facelink::audio::NullAudioOutput;
use facelink::session::PeerSession;
use facelink::signaling::{Role, SignalingChannel};
use facelink::transport::webrtc::{LinkState, PeerConfig, VirtualNetwork};
use signal_store::DirectoryStore;
use tokio::time::timeout;

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("facelink-signal-{}", uuid::Uuid::new_v4()))
}

fn channel(root: &PathBuf) -> SignalingChannel {
    SignalingChannel::new(Arc::new(
        DirectoryStore::new(root).with_poll_interval(Duration::from_millis(20)),
    ))
}

fn host_config(net: Arc<webrtc::util::vnet::net::Net>) -> PeerConfig {
    let mut config = PeerConfig::builder()
        .virtual_network(net)
        .build()
        .expect("peer config");
    config.ice_servers.clear();
    config
}

/// Two store handles over one directory stand in for two processes on one host.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_signal_through_a_shared_directory() {
    let root = scratch_dir();
    let network = VirtualNetwork::start().await.expect("virtual network");

    let receiver = PeerSession::initialize(
        Role::Receiver,
        channel(&root),
        host_config(network.receiver()),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("receiver");
    let caller = PeerSession::initialize(
        Role::Caller,
        channel(&root),
        host_config(network.caller()),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("caller");

    caller.connect().await.expect("connect");
    for session in [&caller, &receiver] {
        let mut link = session.watch_link_state();
        timeout(
            Duration::from_secs(20),
            link.wait_for(|state| *state == LinkState::Connected),
        )
        .await
        .expect("connected before timeout")
        .map(|_| ())
        .expect("session alive");
    }

    caller.close().await;
    receiver.close().await;
    network.stop().await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}

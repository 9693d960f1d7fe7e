use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use facelink::audio::{AudioConfigurationError, AudioOutput, NullAudioOutput};
use facelink::protocol::{BlendShape, Blendshapes, FaceFrame, Quaternion};
use facelink::session::{PeerSession, SessionError, SessionEvent};
use facelink::signaling::{
    ConnectivityCandidate, DEFAULT_COLLECTION, Role, SignalMessage, SignalingChannel,
    SignalingError, Slot,
};
use facelink::transport::webrtc::{
    GatheringState, IceTimeouts, LinkState, PeerConfig, VirtualNetwork,
};
use signal_store::{DocumentStore, MemoryStore, StoreError};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("facelink=debug,signal_store=debug")
        .with_test_writer()
        .try_init();
}

fn vnet_config(net: Arc<webrtc::util::vnet::net::Net>) -> PeerConfig {
    let mut config = PeerConfig::builder()
        .virtual_network(net)
        .ice_timeouts(IceTimeouts {
            disconnected: Duration::from_secs(2),
            failed: Duration::from_secs(5),
            keepalive: Duration::from_millis(200),
        })
        .build()
        .expect("peer config");
    // host candidates on the virtual router are all these tests need
    config.ice_servers.clear();
    config
}

#[derive(Clone, Default)]
struct CountingAudio {
    activations: Arc<AtomicUsize>,
}

impl AudioOutput for CountingAudio {
    fn lock_configuration(&mut self) -> Result<(), AudioConfigurationError> {
        Ok(())
    }

    fn set_play_and_record(&mut self) -> Result<(), AudioConfigurationError> {
        Ok(())
    }

    fn route_to_speaker(&mut self) -> Result<(), AudioConfigurationError> {
        Ok(())
    }

    fn activate(&mut self) -> Result<(), AudioConfigurationError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlock_configuration(&mut self) {}
}

struct Pair {
    store: Arc<MemoryStore>,
    network: VirtualNetwork,
    caller: PeerSession,
    receiver: PeerSession,
    caller_audio: CountingAudio,
}

async fn pair() -> Pair {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let network = VirtualNetwork::start().await.expect("virtual network");
    let caller_audio = CountingAudio::default();

    let receiver = PeerSession::initialize(
        Role::Receiver,
        SignalingChannel::new(store.clone()),
        vnet_config(network.receiver()),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("receiver");
    let caller = PeerSession::initialize(
        Role::Caller,
        SignalingChannel::new(store.clone()),
        vnet_config(network.caller()),
        Box::new(caller_audio.clone()),
    )
    .await
    .expect("caller");

    Pair {
        store,
        network,
        caller,
        receiver,
        caller_audio,
    }
}

async fn wait_for_link(session: &PeerSession, want: LinkState) {
    let mut link = session.watch_link_state();
    timeout(CONNECT_TIMEOUT, link.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("{:?} never reached {want}", session.role()))
        .map(|_| ())
        .expect("session alive");
}

async fn read_sdp(channel: &SignalingChannel, slot: Slot) -> Option<String> {
    match channel.read_slot(slot).await.expect("read") {
        Some(SignalMessage::Description(description)) => Some(description.sdp),
        _ => None,
    }
}

fn sample_frame() -> FaceFrame {
    let mut blendshapes = Blendshapes::default();
    blendshapes.set(BlendShape::JawOpen, 0.75);
    blendshapes.set(BlendShape::EyeBlinkLeft, 1.0);
    FaceFrame::new(
        blendshapes,
        Quaternion::new(0.0, 0.38268343, 0.0, 0.9238795),
        Quaternion::IDENTITY,
        Quaternion::new(0.0, 0.0, 0.0998, 0.995),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offer_answer_and_candidates_connect_both_sides() {
    let pair = pair().await;
    pair.caller.connect().await.expect("connect");

    wait_for_link(&pair.caller, LinkState::Connected).await;
    wait_for_link(&pair.receiver, LinkState::Connected).await;

    // frames sent before the channel opens are dropped, so keep sending until one lands
    let mut frames = pair.receiver.frames();
    let sent = sample_frame();
    let received = timeout(CONNECT_TIMEOUT, async {
        loop {
            pair.caller.send(&sent).expect("encode");
            let next = tokio::select! {
                frame = frames.recv() => frame.ok(),
                _ = sleep(Duration::from_millis(50)) => None,
            };
            if let Some(frame) = next {
                break frame;
            }
        }
    })
    .await
    .expect("frame delivered");
    assert_eq!(received.blendshapes.get(BlendShape::JawOpen), 0.75);
    assert_eq!(received.blendshapes.get(BlendShape::EyeBlinkLeft), 1.0);
    assert_eq!(received.face, sent.face);
    assert_eq!(received.right_eye, sent.right_eye);

    timeout(Duration::from_secs(5), async {
        while !pair.caller.loudspeaker_enabled() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("audio configured");
    assert_eq!(pair.caller_audio.activations.load(Ordering::SeqCst), 1);

    pair.caller.close().await;
    pair.receiver.close().await;
    pair.network.stop().await;
}

async fn wait_for_sdp(channel: &SignalingChannel, slot: Slot) -> String {
    timeout(CONNECT_TIMEOUT, async {
        loop {
            if let Some(sdp) = read_sdp(channel, slot).await {
                break sdp;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{slot} never written"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offer_and_answer_carry_voice_next_to_the_data_channel() {
    let pair = pair().await;
    let observer = SignalingChannel::new(pair.store.clone());
    pair.caller.connect().await.expect("connect");

    let offer = wait_for_sdp(&observer, Slot::CallerOffer).await;
    let answer = wait_for_sdp(&observer, Slot::ReceiverAnswer).await;
    for (name, sdp) in [("offer", &offer), ("answer", &answer)] {
        assert!(sdp.contains("m=audio"), "{name} has no audio section:\n{sdp}");
        assert!(sdp.contains("m=application"), "{name} has no data section:\n{sdp}");
        assert!(sdp.to_ascii_lowercase().contains("opus/48000"), "{name} lacks opus:\n{sdp}");
    }

    wait_for_link(&pair.caller, LinkState::Connected).await;
    wait_for_link(&pair.receiver, LinkState::Connected).await;

    pair.caller.close().await;
    pair.receiver.close().await;
    pair.network.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_releases_subscriptions_and_silences_send() {
    let pair = pair().await;
    assert_eq!(pair.store.watcher_count(DEFAULT_COLLECTION, "callerOffer"), 1);
    assert_eq!(pair.store.watcher_count(DEFAULT_COLLECTION, "callerCandidate"), 1);
    assert_eq!(pair.store.watcher_count(DEFAULT_COLLECTION, "receiverCandidate"), 1);

    pair.caller.connect().await.expect("connect");
    assert_eq!(pair.store.watcher_count(DEFAULT_COLLECTION, "receiverAnswer"), 1);
    wait_for_link(&pair.caller, LinkState::Connected).await;

    let mut events = pair.caller.subscribe();
    pair.caller.close().await;
    pair.receiver.close().await;

    for slot in Slot::ALL {
        assert_eq!(
            pair.store.watcher_count(DEFAULT_COLLECTION, slot.document_name()),
            0,
            "{slot} still watched"
        );
    }
    assert_eq!(pair.caller.link_state(), LinkState::Closed);
    pair.caller.send(&sample_frame()).expect("send after close is a no-op");
    assert!(matches!(pair.caller.connect().await, Err(SessionError::Closed)));

    let mut saw_closed = false;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::LinkStateChanged(LinkState::Closed)) => saw_closed = true,
            Ok(_) | Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert!(saw_closed);

    // closing twice is harmless
    pair.caller.close().await;
    pair.network.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_connect_leaves_only_the_new_answer() {
    let pair = pair().await;
    let observer = SignalingChannel::new(pair.store.clone());

    pair.caller.connect().await.expect("first connect");
    let first_offer = read_sdp(&observer, Slot::CallerOffer).await.expect("offer");
    let first_answer = timeout(CONNECT_TIMEOUT, async {
        loop {
            if let Some(sdp) = read_sdp(&observer, Slot::ReceiverAnswer).await {
                break sdp;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first answer");

    pair.caller.connect().await.expect("second connect");
    let second_offer = read_sdp(&observer, Slot::CallerOffer).await.expect("offer");
    assert_ne!(first_offer, second_offer);

    let second_answer = timeout(CONNECT_TIMEOUT, async {
        loop {
            if let Some(sdp) = read_sdp(&observer, Slot::ReceiverAnswer).await {
                if sdp != first_answer {
                    break sdp;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("second answer");
    assert_ne!(second_answer, first_answer);

    wait_for_link(&pair.caller, LinkState::Connected).await;
    wait_for_link(&pair.receiver, LinkState::Connected).await;
    assert_eq!(
        read_sdp(&observer, Slot::ReceiverAnswer).await.as_deref(),
        Some(second_answer.as_str())
    );

    pair.caller.close().await;
    pair.receiver.close().await;
    pair.network.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_descriptions_leave_an_established_link_alone() {
    let pair = pair().await;
    let observer = SignalingChannel::new(pair.store.clone());
    pair.caller.connect().await.expect("connect");
    wait_for_link(&pair.caller, LinkState::Connected).await;
    wait_for_link(&pair.receiver, LinkState::Connected).await;

    let mut caller_events = pair.caller.subscribe();
    let mut receiver_events = pair.receiver.subscribe();

    for slot in [Slot::CallerOffer, Slot::ReceiverAnswer] {
        let fields = pair
            .store
            .get(DEFAULT_COLLECTION, slot.document_name())
            .await
            .expect("get")
            .expect("present");
        pair.store
            .set(DEFAULT_COLLECTION, slot.document_name(), fields)
            .await
            .expect("rewrite");
    }
    sleep(Duration::from_millis(500)).await;

    assert_eq!(pair.caller.link_state(), LinkState::Connected);
    assert_eq!(pair.receiver.link_state(), LinkState::Connected);
    for events in [&mut caller_events, &mut receiver_events] {
        loop {
            match events.try_recv() {
                Ok(SessionEvent::LinkStateChanged(state)) => {
                    panic!("replay changed link state to {state}")
                }
                Ok(SessionEvent::SignalingStateChanged(state)) => {
                    panic!("replay moved signaling state to {state}")
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
    assert!(read_sdp(&observer, Slot::ReceiverAnswer).await.is_some());

    pair.caller.close().await;
    pair.receiver.close().await;
    pair.network.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stall_warning_fires_without_changing_state() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let network = VirtualNetwork::start().await.expect("virtual network");
    let mut config = vnet_config(network.caller());
    config.stall_warning = Some(Duration::from_millis(200));

    let caller = PeerSession::initialize(
        Role::Caller,
        SignalingChannel::new(store.clone()),
        config,
        Box::new(NullAudioOutput),
    )
    .await
    .expect("caller");
    let mut events = caller.subscribe();
    caller.connect().await.expect("connect");

    let stalled = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::HandshakeStalled { attempt, waited }) => break (attempt, waited),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("session closed"),
            }
        }
    })
    .await
    .expect("stall warning");
    assert_eq!(stalled.1, Duration::from_millis(200));
    assert!(matches!(
        caller.link_state(),
        LinkState::New | LinkState::Connecting
    ));

    caller.close().await;
    network.stop().await;
}

#[tokio::test]
async fn only_the_caller_connects() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let receiver = PeerSession::initialize(
        Role::Receiver,
        SignalingChannel::new(store),
        PeerConfig::host_only(),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("receiver");
    assert!(matches!(
        receiver.connect().await,
        Err(SessionError::WrongRole {
            role: Role::Receiver,
            ..
        })
    ));
    receiver.close().await;
}

#[tokio::test]
async fn unavailable_store_surfaces_a_transport_error() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = PeerSession::initialize(
        Role::Caller,
        SignalingChannel::new(store.clone()),
        PeerConfig::host_only(),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("caller");
    let mut events = caller.subscribe();

    store.set_available(false);
    let err = caller.connect().await.expect_err("store is down");
    assert!(matches!(
        err,
        SessionError::Signaling(SignalingError::Transport(StoreError::Unavailable))
    ));
    assert!(matches!(events.try_recv(), Ok(SessionEvent::Error(_))));
    assert_ne!(caller.link_state(), LinkState::Failed);

    caller.close().await;
}

#[tokio::test]
async fn receiver_clears_stale_handshake_on_startup() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let channel = SignalingChannel::new(store.clone());
    channel
        .write_description(&facelink::signaling::SessionDescription::offer("stale offer"))
        .await
        .expect("offer");
    channel
        .write_description(&facelink::signaling::SessionDescription::answer("stale answer"))
        .await
        .expect("answer");

    let receiver = PeerSession::initialize(
        Role::Receiver,
        channel.clone(),
        PeerConfig::host_only(),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("receiver");
    assert_eq!(read_sdp(&channel, Slot::CallerOffer).await, None);
    assert_eq!(read_sdp(&channel, Slot::ReceiverAnswer).await, None);
    receiver.close().await;
}

async fn relay(to: &SignalingChannel, message: SignalMessage) {
    let written = match message {
        SignalMessage::Description(description) => to.write_description(&description).await,
        SignalMessage::Candidate(candidate) => to.write_candidate(Role::Receiver, &candidate).await,
    };
    written.expect("relay write");
}

/// Each side gets its own store. The receiver's writes are relayed to the caller as they
/// happen, while the caller's candidates are collected and handed to the receiver in the
/// requested order, half of them before the offer.
async fn connect_with_candidate_order(reverse: bool) {
    init_tracing();
    let network = VirtualNetwork::start().await.expect("virtual network");
    let caller_side = SignalingChannel::new(Arc::new(MemoryStore::new()));
    let receiver_side = SignalingChannel::new(Arc::new(MemoryStore::new()));

    let receiver = PeerSession::initialize(
        Role::Receiver,
        receiver_side.clone(),
        vnet_config(network.receiver()),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("receiver");
    let caller = PeerSession::initialize(
        Role::Caller,
        caller_side.clone(),
        vnet_config(network.caller()),
        Box::new(NullAudioOutput),
    )
    .await
    .expect("caller");

    let mut answers = receiver_side
        .subscribe(Slot::ReceiverAnswer)
        .await
        .expect("answer subscription");
    let mut remote_candidates = receiver_side
        .subscribe(Slot::ReceiverCandidate)
        .await
        .expect("candidate subscription");
    let forward_to = caller_side.clone();
    let relay_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(message) = answers.next() => relay(&forward_to, message).await,
                Some(message) = remote_candidates.next() => relay(&forward_to, message).await,
                else => break,
            }
        }
    });

    let mut caller_events = caller.subscribe();
    let mut published = caller_side
        .subscribe(Slot::CallerCandidate)
        .await
        .expect("caller candidates");
    caller.connect().await.expect("connect");
    let offer = match caller_side.read_slot(Slot::CallerOffer).await.expect("read") {
        Some(SignalMessage::Description(offer)) => offer,
        other => panic!("no offer published: {other:?}"),
    };

    timeout(CONNECT_TIMEOUT, async {
        loop {
            match caller_events.recv().await {
                Ok(SessionEvent::GatheringStateChanged(GatheringState::Complete)) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("caller closed while gathering"),
            }
        }
    })
    .await
    .expect("gathering complete");
    let mut gathered = Vec::new();
    while let Ok(Some(message)) = timeout(Duration::from_millis(300), published.next()).await {
        if let SignalMessage::Candidate(candidate) = message {
            gathered.push(candidate);
        }
    }
    assert!(!gathered.is_empty(), "caller published no candidates");

    // an unreachable host rides along so the order actually varies
    let mut sequence = vec![ConnectivityCandidate {
        candidate: "candidate:3442447574 1 udp 2122260223 10.0.0.99 50000 typ host".into(),
        sdp_mline_index: gathered[0].sdp_mline_index,
        sdp_mid: gathered[0].sdp_mid.clone(),
    }];
    sequence.extend(gathered);
    if reverse {
        sequence.reverse();
    }
    let (early, late) = sequence.split_at(sequence.len() / 2);

    for candidate in early {
        receiver_side
            .write_candidate(Role::Caller, candidate)
            .await
            .expect("early candidate");
    }
    sleep(Duration::from_millis(100)).await;
    receiver_side.write_description(&offer).await.expect("offer");
    sleep(Duration::from_millis(100)).await;
    for candidate in late {
        receiver_side
            .write_candidate(Role::Caller, candidate)
            .await
            .expect("late candidate");
    }

    wait_for_link(&caller, LinkState::Connected).await;
    wait_for_link(&receiver, LinkState::Connected).await;

    relay_task.abort();
    caller.close().await;
    receiver.close().await;
    network.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidates_in_gathering_order_connect() {
    connect_with_candidate_order(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidates_in_reverse_order_connect() {
    connect_with_candidate_order(true).await;
}

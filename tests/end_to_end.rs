//! Drives the real listener, registry and relay engine over loopback with
//! the crate's own RTMP client playing the encoder.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rtmp_fanout::amf::{self, AmfObject, AmfValue};
use rtmp_fanout::client::{ClientConfig, RtmpConnector};
use rtmp_fanout::error::{Error, RelayError};
use rtmp_fanout::media::{MediaPacket, PacketKind};
use rtmp_fanout::protocol::constants::NS_PUBLISH_BAD_NAME;
use rtmp_fanout::registry::{Delivery, StreamKey, StreamRegistry, Subscription};
use rtmp_fanout::relay::{RelayConfig, RelayEngine, RelayState, RelayTarget};
use rtmp_fanout::server::{RtmpServer, ServerConfig};
use rtmp_fanout::stats::StatsAggregator;

const WAIT: Duration = Duration::from_secs(10);

async fn start_server(registry: Arc<StreamRegistry>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RtmpServer::new(ServerConfig::with_addr(addr), registry);
    tokio::spawn(async move { server.run_until(listener, std::future::pending()).await });
    addr
}

async fn publish(addr: SocketAddr, name: &str) -> RtmpConnector {
    let config = ClientConfig::new(&format!("rtmp://{}/live/{}", addr, name)).unwrap();
    let mut connector = RtmpConnector::connect(config).await.unwrap();
    connector.publish(name).await.unwrap();
    connector
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_packet(subscription: &mut Subscription) -> MediaPacket {
    match tokio::time::timeout(WAIT, subscription.recv()).await.unwrap() {
        Delivery::Packet(packet) => packet,
        other => panic!("expected a packet, got {:?}", other),
    }
}

/// Forwards to `upstream`, but stops reading from the client once `budget`
/// bytes went through. Replies keep flowing, so publishing succeeds and
/// only media backs up.
async fn stalling_proxy(upstream: SocketAddr, budget: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(server) = TcpStream::connect(upstream).await else {
                    return;
                };
                let (mut client_read, mut client_write) = client.into_split();
                let (mut server_read, mut server_write) = server.into_split();
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut server_read, &mut client_write).await;
                });

                let mut forwarded = 0;
                let mut buf = vec![0u8; 16 * 1024];
                while forwarded < budget {
                    match client_read.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if server_write.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                            forwarded += n;
                        }
                    }
                }
                std::future::pending::<()>().await;
            });
        }
    });
    addr
}

fn key(name: &str) -> StreamKey {
    StreamKey::try_new("live", name).unwrap()
}

fn metadata() -> MediaPacket {
    let object = AmfObject::new().with("width", 1280.0).with("height", 720.0);
    MediaPacket::metadata(0, amf::encode_all(&[AmfValue::from("onMetaData"), object.into()]))
}

fn avc_header() -> MediaPacket {
    MediaPacket::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0x01, 0x64, 0x00, 0x1f]))
}

fn aac_header() -> MediaPacket {
    MediaPacket::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
}

fn keyframe(timestamp: u32) -> MediaPacket {
    MediaPacket::video(timestamp, Bytes::from(vec![0x17, 0x01, 0, 0, 0, 0x65, 0x88]))
}

fn inter_frame(timestamp: u32, marker: u8) -> MediaPacket {
    MediaPacket::video(timestamp, Bytes::from(vec![0x27, 0x01, 0, 0, 0, 0x41, marker]))
}

fn same_media(a: &MediaPacket, b: &MediaPacket) -> bool {
    a.kind == b.kind && a.timestamp == b.timestamp && a.data == b.data
}

#[tokio::test]
async fn test_second_publisher_rejected_first_unaffected() {
    let registry = Arc::new(StreamRegistry::new());
    let addr = start_server(Arc::clone(&registry)).await;

    let mut first = publish(addr, "show").await;
    let owner = registry.stream_stats(&key("show")).unwrap().publisher;

    let config = ClientConfig::new(&format!("rtmp://{}/live/show", addr)).unwrap();
    let mut second = RtmpConnector::connect(config).await.unwrap();
    let err = second.publish("show").await.unwrap_err();
    assert!(
        matches!(&err, Error::Relay(RelayError::Auth(code)) if code == NS_PUBLISH_BAD_NAME),
        "{err}"
    );

    assert!(registry.is_publishing(&key("show")));
    assert_eq!(registry.stream_stats(&key("show")).unwrap().publisher, owner);

    let mut player = registry.subscribe(&key("show"), 500);
    first.send_packet(&keyframe(0)).await.unwrap();
    let packet = next_packet(&mut player).await;
    assert!(packet.keyframe);
}

#[tokio::test]
async fn test_late_subscriber_gets_gop_before_live() {
    let registry = Arc::new(StreamRegistry::new());
    let addr = start_server(Arc::clone(&registry)).await;
    let mut encoder = publish(addr, "gop").await;

    let sent = vec![
        metadata(),
        avc_header(),
        aac_header(),
        inter_frame(0, 0xEE), // before any keyframe, not cached
        keyframe(33),
        inter_frame(66, 1),
        MediaPacket::audio(70, Bytes::from_static(&[0xAF, 0x01, 0x21])),
        inter_frame(100, 2),
    ];
    for packet in &sent {
        encoder.send_packet(packet).await.unwrap();
    }
    wait_until(|| registry.stream_stats(&key("gop")).is_some_and(|s| s.packets == 8)).await;

    let mut late = registry.subscribe(&key("gop"), 501);
    let catchup = late.take_catchup();

    let expected: Vec<&MediaPacket> = sent.iter().enumerate().filter(|(i, _)| *i != 3).map(|(_, p)| p).collect();
    assert_eq!(catchup.len(), expected.len());
    for (got, want) in catchup.iter().zip(&expected) {
        assert!(same_media(got, want), "{:?} != {:?}", got, want);
    }
    assert_eq!(catchup[0].kind, PacketKind::Metadata);

    let gop_sequences: Vec<u64> = catchup[3..].iter().map(|p| p.sequence).collect();
    assert!(gop_sequences.windows(2).all(|w| w[0] < w[1]));

    encoder.send_packet(&inter_frame(133, 3)).await.unwrap();
    let live = next_packet(&mut late).await;
    assert_eq!(live.timestamp, 133);
    assert!(live.sequence > *gop_sequences.last().unwrap());
}

#[tokio::test]
async fn test_publisher_disconnect_releases_key() {
    let registry = Arc::new(StreamRegistry::new());
    let addr = start_server(Arc::clone(&registry)).await;

    let encoder = publish(addr, "drop").await;
    assert!(registry.is_publishing(&key("drop")));
    drop(encoder);

    wait_until(|| !registry.is_publishing(&key("drop"))).await;
    let again = publish(addr, "drop").await;
    assert!(again.is_publishing());
}

#[tokio::test]
async fn test_zero_targets_never_relays() {
    let registry = Arc::new(StreamRegistry::new());
    let events = registry.events();
    let engine = Arc::new(RelayEngine::new(Vec::new(), Arc::clone(&registry), RelayConfig::default()));
    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(events).await }
    });
    let stats = StatsAggregator::new(Arc::clone(&registry), Arc::clone(engine.status_board()), engine.targets());

    let addr = start_server(Arc::clone(&registry)).await;
    let mut encoder = publish(addr, "solo").await;
    encoder.send_packet(&keyframe(0)).await.unwrap();
    wait_until(|| registry.stream_stats(&key("solo")).is_some_and(|s| s.packets == 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.active_streams, 1);
    assert_eq!(snapshot.connected_platforms, 0);
    assert!(snapshot.relays.is_empty());
    assert_eq!(engine.session_count(&key("solo")), 0);
    assert_eq!(engine.active_stream_count(), 0);
}

#[tokio::test]
async fn test_relay_preserves_order_and_stops_with_source() {
    // The "platform" is a second instance of the server
    let mirror = Arc::new(StreamRegistry::new());
    let mirror_addr = start_server(Arc::clone(&mirror)).await;
    let mut watcher = mirror.subscribe(&key("mirror"), 900);

    let origin = Arc::new(StreamRegistry::new());
    let events = origin.events();
    let target = RelayTarget::new("local", format!("rtmp://{}/live/", mirror_addr), "mirror");
    let engine = Arc::new(RelayEngine::new(vec![target], Arc::clone(&origin), RelayConfig::default()));
    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(events).await }
    });
    let origin_addr = start_server(Arc::clone(&origin)).await;

    let mut encoder = publish(origin_addr, "show").await;
    let mut sent = vec![keyframe(0)];
    sent.extend((1..=20u32).map(|i| inter_frame(i * 33, i as u8)));
    for packet in &sent {
        encoder.send_packet(packet).await.unwrap();
    }

    for want in &sent {
        let got = next_packet(&mut watcher).await;
        assert!(same_media(&got, want), "{:?} != {:?}", got, want);
    }

    let board = Arc::clone(engine.status_board());
    assert_eq!(board.get(&key("show"), "local").unwrap().state, RelayState::Relaying);

    // Source goes away: the relay session is torn down and the mirror ends
    drop(encoder);
    wait_until(|| engine.session_count(&key("show")) == 0 && board.is_empty()).await;
    wait_until(|| !mirror.is_publishing(&key("mirror"))).await;
}

#[tokio::test]
async fn test_failing_target_not_retried_after_unpublish() {
    // Accepts and immediately hangs up, so every attempt fails mid-handshake
    let flaky = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let flaky_addr = flaky.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = Arc::clone(&accepted);
        async move {
            while let Ok((socket, _)) = flaky.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        }
    });

    let registry = Arc::new(StreamRegistry::new());
    let events = registry.events();
    let target = RelayTarget::new("flaky", format!("rtmp://{}/live", flaky_addr), "k");
    let config = RelayConfig::default()
        .backoff(Duration::from_millis(10), Duration::from_millis(40))
        .max_attempts(0);
    let engine = Arc::new(RelayEngine::new(vec![target], Arc::clone(&registry), config));
    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(events).await }
    });

    let publisher = registry.begin_publish(&key("flaky"), 1).unwrap();
    wait_until(|| accepted.load(Ordering::SeqCst) >= 3).await;
    let status = engine.status_board().get(&key("flaky"), "flaky").unwrap();
    assert!(status.attempts >= 2);
    assert!(status.last_error.is_some());

    publisher.end();
    wait_until(|| engine.session_count(&key("flaky")) == 0 && engine.status_board().is_empty()).await;

    // Let any connection already in the accept backlog drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = accepted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_stalled_target_leaves_relaying() {
    let mirror = Arc::new(StreamRegistry::new());
    let mirror_addr = start_server(Arc::clone(&mirror)).await;
    let proxy_addr = stalling_proxy(mirror_addr, 200 * 1024).await;

    let origin = Arc::new(StreamRegistry::new());
    let events = origin.events();
    let target = RelayTarget::new("stalled", format!("rtmp://{}/live/", proxy_addr), "mirror");
    let config = RelayConfig::default()
        .write_timeout(Duration::from_millis(300))
        .backoff(Duration::from_secs(60), Duration::from_secs(60))
        .max_attempts(0);
    let engine = Arc::new(RelayEngine::new(vec![target], Arc::clone(&origin), config));
    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(events).await }
    });

    let publisher = origin.begin_publish(&key("big"), 1).unwrap();
    let board = Arc::clone(engine.status_board());
    wait_until(|| board.get(&key("big"), "stalled").is_some_and(|s| s.state == RelayState::Relaying)).await;

    // Push until the target's socket buffers are full and a write times out
    let mut frame = vec![0x27u8; 32 * 1024];
    frame[0] = 0x17;
    let keyframe_data = Bytes::from(frame.clone());
    frame[0] = 0x27;
    let inter_data = Bytes::from(frame);
    publisher.ingest(MediaPacket::video(0, keyframe_data.clone())).unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(20), async {
        let mut timestamp = 0u32;
        while board.get(&key("big"), "stalled").is_some_and(|s| s.state == RelayState::Relaying) {
            for i in 0..8 {
                timestamp += 33;
                let data = if i == 0 { &keyframe_data } else { &inter_data };
                publisher
                    .ingest(MediaPacket::video(timestamp, data.clone()))
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(pushed.is_ok(), "stalled target still reported relaying");

    let status = board.get(&key("big"), "stalled").unwrap();
    assert_eq!(status.state, RelayState::Retrying);
    assert_eq!(status.attempts, 1);
    assert!(status.last_error.unwrap().contains("timed out"));

    publisher.end();
    wait_until(|| engine.session_count(&key("big")) == 0 && board.is_empty()).await;
}

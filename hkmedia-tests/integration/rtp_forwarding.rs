//! RTP/RTCP demultiplexing over loopback UDP.

use std::net::SocketAddr;
use std::time::Duration;

use hkmedia_core::MediaConfig;
use hkmedia_core::rtp::{DemuxPorts, IpFamily, PortAllocator, PortSpan, RtpDemuxer};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_DEADLINE: Duration = Duration::from_secs(5);

// Version 2, payload type 0x60 (96) with the marker bit set
const RTP_PACKET: [u8; 12] = [0x80, 0xE0, 0x00, 0x01, 0, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF];
// Sender report, packet type 200
const RTCP_PACKET: [u8; 8] = [0x80, 0xC8, 0x00, 0x06, 0xDE, 0xAD, 0xBE, 0xEF];

struct Harness {
    demuxer: RtpDemuxer,
    rtp: UdpSocket,
    rtcp: UdpSocket,
    camera: UdpSocket,
    input: SocketAddr,
}

async fn harness() -> Harness {
    let config = MediaConfig::for_testing();
    let allocator = PortAllocator::new(&config.ports);

    let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtcp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let input = allocator
        .reserve(IpFamily::V4, PortSpan::Single)
        .expect("no free UDP port");

    let ports = DemuxPorts {
        input,
        rtp: rtp.local_addr().unwrap().port(),
        rtcp: rtcp.local_addr().unwrap().port(),
    };
    let demuxer = RtpDemuxer::bind(IpFamily::V4, ports, &config.rtp)
        .await
        .unwrap();
    assert_eq!(demuxer.local_addr().port(), input);
    assert!(allocator.cancel(input));

    Harness {
        demuxer,
        rtp,
        rtcp,
        camera: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        input: SocketAddr::from(([127, 0, 0, 1], input)),
    }
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buffer = [0u8; 2048];
    let len = timeout(RECV_DEADLINE, socket.recv(&mut buffer))
        .await
        .expect("nothing forwarded")
        .unwrap();
    buffer[..len].to_vec()
}

#[tokio::test]
async fn test_packets_split_by_payload_type() {
    let mut h = harness().await;

    h.camera.send_to(&RTCP_PACKET, h.input).await.unwrap();
    assert_eq!(recv(&h.rtcp).await, RTCP_PACKET);

    h.camera.send_to(&RTP_PACKET, h.input).await.unwrap();
    assert_eq!(recv(&h.rtp).await, RTP_PACKET);

    assert!(timeout(RECV_DEADLINE, h.demuxer.wait_for_rtp()).await.unwrap());
    let activity = h.demuxer.activity();
    assert_eq!(activity.rtp_packets, 1);
    assert_eq!(activity.rtcp_packets, 1);

    h.demuxer.close().await;
    assert!(!h.demuxer.is_running());
}

#[tokio::test]
async fn test_rtcp_is_replayed_to_rtp_port_while_idle() {
    let mut h = harness().await;

    h.camera.send_to(&RTCP_PACKET, h.input).await.unwrap();
    assert_eq!(recv(&h.rtcp).await, RTCP_PACKET);

    // Only RTCP arrives, so the RTP port hears the heartbeat repeatedly
    assert_eq!(recv(&h.rtp).await, RTCP_PACKET);
    assert_eq!(recv(&h.rtp).await, RTCP_PACKET);
    assert!(h.demuxer.activity().heartbeats >= 2);
    assert_eq!(h.demuxer.activity().rtp_packets, 0);

    h.demuxer.close().await;
}

#[tokio::test]
async fn test_no_heartbeat_before_first_rtcp() {
    let mut h = harness().await;
    let interval = MediaConfig::for_testing().rtp.heartbeat_interval;

    let mut buffer = [0u8; 64];
    let quiet = timeout(interval * 4, h.rtp.recv(&mut buffer)).await;

    assert!(quiet.is_err());
    assert_eq!(h.demuxer.activity().heartbeats, 0);
    h.demuxer.close().await;
}

#[tokio::test]
async fn test_close_releases_port_and_waiters() {
    let mut h = harness().await;
    assert!(h.demuxer.activity().running);

    h.demuxer.close().await;

    assert!(!timeout(RECV_DEADLINE, h.demuxer.wait_for_rtp()).await.unwrap());
    assert!(UdpSocket::bind(h.input).await.is_ok());
}

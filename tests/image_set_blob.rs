//! End-to-end capture over a real TCP socket
//!
//! A minimal device task accepts the session, completes the handshake and
//! streams one fragmented image set. The received set is persisted as a blob
//! and restored from disk.

use std::sync::Arc;
use std::time::Duration;

use stereolink::protocol::{Frame, MessageKind, PROTOCOL_VERSION, fragment_image_set};
use stereolink::transport::{TcpTransport, Transport};
use stereolink::{
    Channel, DeviceConnection, DeviceDescriptor, ImageSet, ImageType, NetworkProtocol, PixelFormat,
    SessionState, Timestamp, TransferConfig, TransferError,
};
use tokio::net::TcpListener;

fn stereo_set(sequence: u32) -> ImageSet {
    let (width, height) = (48, 32);
    let pixels = (width * height) as usize;
    let ramp = (0..pixels).map(|i| i as u8).collect();
    let left = Channel::new(ImageType::Left, PixelFormat::Mono8, width, height, ramp).unwrap();
    let right =
        Channel::new(ImageType::Right, PixelFormat::Mono8, width, height, vec![7; pixels]).unwrap();
    let disparity = Channel::new(
        ImageType::Disparity,
        PixelFormat::Mono12,
        width,
        height,
        vec![0x0f; pixels * 2],
    )
    .unwrap();
    let timestamp = Timestamp::new(1_700_000_123, 456);
    let mut set = ImageSet::new(sequence, timestamp, vec![left, right, disparity]).unwrap();
    set.exposure_us = 4000;
    set
}

async fn serve_one_set(listener: TcpListener, set: ImageSet) {
    let (stream, _) = listener.accept().await.unwrap();
    let transport = Arc::new(TcpTransport::from_stream(stream).unwrap());

    let hello = transport.recv().await.unwrap();
    assert_eq!(hello.kind, MessageKind::Hello);
    transport.send(Frame::new(MessageKind::HelloAck, 0, vec![PROTOCOL_VERSION])).await.unwrap();

    let mut frames = fragment_image_set(&set, 1024).unwrap();
    frames.reverse();
    for frame in frames {
        transport.send(frame).await.unwrap();
    }

    loop {
        match transport.recv().await {
            Ok(frame) if frame.kind == MessageKind::Heartbeat => {
                let ack = Frame::control(MessageKind::HeartbeatAck, frame.id);
                if transport.send(ack).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn captured_set_survives_blob_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let sent = stereo_set(42);
    let device_task = tokio::spawn(serve_one_set(listener, sent.clone()));

    let descriptor = DeviceDescriptor::at(address, NetworkProtocol::Tcp);
    let config = TransferConfig {
        heartbeat_interval_ms: 50,
        liveness_window_ms: 500,
        ..TransferConfig::default()
    };
    let connection = match DeviceConnection::connect(&descriptor, config).await {
        Ok(connection) => connection,
        Err(err) => panic!("connect failed: {err}"),
    };
    assert_eq!(connection.state(), SessionState::Live);
    assert_eq!(connection.device().map(|d| d.address), Some(address));

    let received = connection
        .images()
        .collect_received_image_set(Duration::from_secs(2))
        .await
        .expect("image set within timeout");
    assert_eq!(received, sent);
    assert_eq!(received.number_of_channels(), 3);
    assert_eq!(received.channel(ImageType::Disparity).map(|c| c.bit_depth()), Some(12));

    let path = std::env::temp_dir().join(format!("stereolink-blob-{}.slis", std::process::id()));
    std::fs::write(&path, received.to_blob().unwrap()).unwrap();
    let restored = ImageSet::from_blob(&std::fs::read(&path).unwrap()).unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(restored, sent);
    assert_eq!(restored.geometry(), sent.geometry());

    connection.close();
    tokio::time::timeout(Duration::from_secs(2), device_task).await.unwrap().unwrap();
}

#[test]
fn corrupted_blob_is_rejected() {
    let mut blob = stereo_set(1).to_blob().unwrap();
    assert!(matches!(ImageSet::from_blob(&blob[..3]), Err(TransferError::Serialization { .. })));

    blob[4] = blob[4].wrapping_add(1);
    assert!(matches!(ImageSet::from_blob(&blob), Err(TransferError::Serialization { .. })));
}

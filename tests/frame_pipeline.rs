//! End-to-end tests: encoder -> bytes -> decoder -> connection state machine
//!
//! Each endpoint validates outbound frames with its own state machine before
//! encoding them, and feeds decoded inbound frames to the same machine, the
//! way a transport layer built on this crate would.

use bytes::{Bytes, BytesMut};
use h2engine::frames::{FramePayload, PushPromiseFrame, SettingsFrame};
use h2engine::*;

struct Endpoint {
    connection: ConnectionStateMachine,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    outbound: BytesMut,
}

/// One decoded inbound frame and what the state machine made of it
struct Received {
    frame: Frame,
    outcome: StateMachineResultWithEffect,
    post: PostFrameOperation,
}

impl Endpoint {
    fn new(role: ConnectionRole, config: &ConnectionConfig) -> Self {
        let mut endpoint = Endpoint {
            connection: ConnectionStateMachine::new(role, config),
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(role).with_max_header_list_size(config.max_header_list_size()),
            outbound: BytesMut::new(),
        };
        if role == ConnectionRole::Client {
            endpoint.outbound.extend_from_slice(CONNECTION_PREFACE);
        }
        endpoint.send(Frame::settings(config.initial_settings().clone()));
        endpoint
    }

    fn send(&mut self, frame: Frame) -> StateMachineResultWithEffect {
        let outcome = self.connection.send_frame(&frame);
        if outcome.result.is_success() {
            let payload = self.encoder.encode(&frame, &mut self.outbound).unwrap();
            if let Some(payload) = payload {
                self.outbound.extend_from_slice(&payload);
            }
        }
        outcome
    }

    fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    fn receive(&mut self, bytes: &[u8]) -> Vec<Received> {
        self.decoder.append_bytes(bytes);
        let mut received = Vec::new();
        while let Some((frame, flow_controlled_length)) = self.decoder.next_frame().unwrap() {
            let (outcome, post) = self.connection.receive_frame(&frame, flow_controlled_length);
            match &outcome.effect {
                Some(StateChange::LocalSettingsChanged(change)) => {
                    self.decoder.apply_local_settings(change)
                }
                Some(StateChange::RemoteSettingsChanged(change)) => {
                    self.encoder.apply_remote_settings(change)
                }
                _ => {}
            }
            if post == PostFrameOperation::SendAck {
                let ack = match &frame.payload {
                    FramePayload::Ping(ping) => Frame::ping(ping.data, true),
                    _ => Frame::settings_ack(),
                };
                self.send(ack);
            }
            received.push(Received {
                frame,
                outcome,
                post,
            });
        }
        received
    }
}

/// Run the preface exchange until both sides have applied everything
fn connect(config: &ConnectionConfig) -> (Endpoint, Endpoint) {
    let mut client = Endpoint::new(ConnectionRole::Client, config);
    let mut server = Endpoint::new(ConnectionRole::Server, config);

    for _ in 0..2 {
        let bytes = client.take_outbound();
        server.receive(&bytes);
        let bytes = server.take_outbound();
        client.receive(&bytes);
    }
    assert_eq!(client.connection.state(), ConnectionStateKind::Active);
    assert_eq!(server.connection.state(), ConnectionStateKind::Active);
    (client, server)
}

fn request(path: &str) -> Headers {
    Headers::from_pairs(&[
        (":method", "GET"),
        (":path", path),
        (":scheme", "https"),
        (":authority", "example.com"),
    ])
}

#[test]
fn test_preface_and_settings_ack() {
    let config = ConnectionConfig::default();
    let mut client = Endpoint::new(ConnectionRole::Client, &config);
    let mut server = Endpoint::new(ConnectionRole::Server, &config);

    let bytes = client.take_outbound();
    assert!(bytes.starts_with(CONNECTION_PREFACE));
    let received = server.receive(&bytes);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].post, PostFrameOperation::SendAck);
    assert!(matches!(
        received[0].outcome.effect,
        Some(StateChange::RemoteSettingsChanged(_))
    ));

    // Server SETTINGS followed by its ACK of ours
    let received = client.receive(&server.take_outbound());
    let types: Vec<FrameType> = received.iter().map(|r| r.frame.frame_type()).collect();
    assert_eq!(types, vec![FrameType::Settings, FrameType::Settings]);
    assert!(matches!(
        received[1].outcome.effect,
        Some(StateChange::LocalSettingsChanged(_))
    ));
}

#[test]
fn test_request_response_over_the_wire() {
    let (mut client, mut server) = connect(&ConnectionConfig::default());
    let stream_id = StreamId::new(1);

    assert!(client.send(Frame::headers(stream_id, request("/index.html"), true)).result.is_success());
    let received = server.receive(&client.take_outbound());
    assert_eq!(received.len(), 1);
    match &received[0].frame.payload {
        FramePayload::Headers(headers) => {
            assert_eq!(headers.headers.get_str(":path"), Some("/index.html"));
            assert!(headers.end_stream);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let response = Headers::from_pairs(&[(":status", "200"), ("content-length", "11")]);
    server.send(Frame::headers(stream_id, response, false));
    let outcome = server.send(Frame::data(stream_id, Bytes::from_static(b"hello world"), true));
    assert!(matches!(outcome.effect, Some(StateChange::StreamClosed(_))));

    let received = client.receive(&server.take_outbound());
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|r| r.outcome.result.is_success()));
    assert!(matches!(received[1].outcome.effect, Some(StateChange::StreamClosed(_))));
    assert_eq!(client.connection.open_streams(), 0);
}

#[test]
fn test_large_body_streamed_in_chunks() {
    let (mut client, mut server) = connect(&ConnectionConfig::default());
    let stream_id = StreamId::new(1);
    let upload = Headers::from_pairs(&[
        (":method", "POST"),
        (":path", "/upload"),
        (":scheme", "https"),
        (":authority", "example.com"),
        ("content-length", "48000"),
    ]);

    client.send(Frame::headers(stream_id, upload, false));
    let body = vec![0x42u8; 16000];
    for index in 0..3 {
        let outcome = client.send(Frame::data(stream_id, Bytes::from(body.clone()), index == 2));
        assert!(outcome.result.is_success());
    }

    // Deliver the bytes in small slices; DATA is surfaced as it arrives
    let bytes = client.take_outbound();
    let mut body_bytes = 0;
    let mut flow_controlled = 0;
    let mut data_frames = 0;
    for slice in bytes.chunks(1000) {
        for received in server.receive(slice) {
            assert!(received.outcome.result.is_success(), "{}", received.outcome.result);
            if let FramePayload::Data(data) = &received.frame.payload {
                data_frames += 1;
                body_bytes += data.data.len();
                if let Some(StateChange::FlowControlChange(change)) = &received.outcome.effect {
                    flow_controlled = 65535 - change.local_connection_window_size as usize;
                }
            }
        }
    }

    assert!(data_frames > 3);
    assert_eq!(body_bytes, 48000);
    assert_eq!(server.connection.local_connection_window_size(), Some(65535 - 48000));
    assert!(flow_controlled >= 32000);
    assert_eq!(
        server.connection.stream_state(stream_id).map(|s| s.name()),
        Some("halfClosedRemoteLocalIdle")
    );
}

#[test]
fn test_connection_window_replenished() {
    let (mut client, mut server) = connect(&ConnectionConfig::default());
    let stream_id = StreamId::new(1);
    client.send(Frame::headers(stream_id, request("/upload"), false));
    for _ in 0..3 {
        client.send(Frame::data(stream_id, Bytes::from(vec![0x43u8; 16000]), false));
    }
    assert_eq!(client.connection.remote_connection_window_size(), Some(65535 - 48000));

    let mut manager = InboundWindowManager::new(65535);
    let mut increments = Vec::new();
    for received in server.receive(&client.take_outbound()) {
        if let Some(StateChange::FlowControlChange(change)) = &received.outcome.effect {
            if let Some(increment) = manager.new_window_size(change.local_connection_window_size) {
                increments.push(increment);
                server.send(Frame::window_update(StreamId::ROOT, increment));
            }
        }
    }

    // Only the third frame takes the window to half its target or below
    assert_eq!(increments, vec![48000]);
    assert_eq!(server.connection.local_connection_window_size(), Some(65535));

    client.receive(&server.take_outbound());
    assert_eq!(client.connection.remote_connection_window_size(), Some(65535));
}

#[test]
fn test_large_header_block_continuation() {
    let config = ConnectionConfig::builder()
        .settings(SettingsBuilder::new().max_header_list_size(1 << 16))
        .unwrap()
        .build()
        .unwrap();
    let (mut client, mut server) = connect(&config);
    let stream_id = StreamId::new(1);

    let mut headers = request("/");
    for index in 0..100 {
        headers.add(format!("x-filler-{}", index), "v".repeat(200));
    }
    client.send(Frame::headers(stream_id, headers, true));

    let bytes = client.take_outbound();
    assert!(bytes.len() > DEFAULT_MAX_FRAME_SIZE as usize);
    let received = server.receive(&bytes);
    assert_eq!(received.len(), 1);
    match &received[0].frame.payload {
        FramePayload::Headers(block) => {
            assert_eq!(block.headers.get_str("x-filler-99").map(str::len), Some(200));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_header_list_limit_from_config() {
    let config = ConnectionConfig::builder()
        .settings(SettingsBuilder::new().max_header_list_size(1024))
        .unwrap()
        .build()
        .unwrap();
    let (mut client, mut server) = connect(&config);

    let mut headers = request("/");
    headers.add("x-big", "z".repeat(4096));
    client.send(Frame::headers(StreamId::new(1), headers, true));

    server.decoder.append_bytes(&client.take_outbound());
    let result = server.decoder.next_frame();
    assert!(matches!(result, Err(Error::ExcessivelyLargeHeaderBlock { .. })));
}

#[test]
fn test_ping_round_trip() {
    let (mut client, mut server) = connect(&ConnectionConfig::default());

    client.send(Frame::ping(*b"12345678", false));
    let received = server.receive(&client.take_outbound());
    assert_eq!(received[0].post, PostFrameOperation::SendAck);

    let received = client.receive(&server.take_outbound());
    match &received[0].frame.payload {
        FramePayload::Ping(ping) => {
            assert!(ping.ack);
            assert_eq!(&ping.data, b"12345678");
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_push_over_the_wire() {
    let (mut client, mut server) = connect(&ConnectionConfig::default());
    let stream_id = StreamId::new(1);
    let promised = StreamId::new(2);

    client.send(Frame::headers(stream_id, request("/"), true));
    server.receive(&client.take_outbound());

    let promise = Frame::new(
        stream_id,
        FramePayload::PushPromise(PushPromiseFrame::new(promised, request("/style.css"))),
    );
    assert!(server.send(promise).result.is_success());
    let pushed = Headers::from_pairs(&[(":status", "200")]);
    server.send(Frame::headers(promised, pushed, true));

    let received = client.receive(&server.take_outbound());
    assert_eq!(received.len(), 2);
    assert!(received[0].outcome.result.is_success());
    assert!(matches!(
        received[1].outcome.effect,
        Some(StateChange::StreamCreatedAndClosed { .. })
    ));
}

#[test]
fn test_goaway_over_the_wire() {
    let (mut client, mut server) = connect(&ConnectionConfig::default());
    client.send(Frame::headers(StreamId::new(1), request("/a"), true));
    client.send(Frame::headers(StreamId::new(3), request("/b"), true));
    server.receive(&client.take_outbound());

    server.send(Frame::goaway(StreamId::new(1), ErrorCode::NoError, Bytes::from_static(b"bye")));
    let received = client.receive(&server.take_outbound());
    assert_eq!(
        received[0].outcome.effect,
        Some(StateChange::BulkStreamClosure {
            closed_streams: vec![StreamId::new(3)]
        })
    );
    assert_eq!(client.connection.state(), ConnectionStateKind::RemotelyQuiesced);
}

#[test]
fn test_peer_settings_reach_encoder() {
    let mut client = Endpoint::new(ConnectionRole::Client, &ConnectionConfig::default());
    let settings = SettingsBuilder::new()
        .initial_window_size(1 << 20)
        .max_frame_size(1 << 15)
        .build()
        .unwrap();
    client.send(Frame::settings(settings));

    // The preface SETTINGS, then the update
    let mut server = Endpoint::new(ConnectionRole::Server, &ConnectionConfig::default());
    let received = server.receive(&client.take_outbound());
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|r| r.post == PostFrameOperation::SendAck));
    match &received[1].frame.payload {
        FramePayload::Settings(SettingsFrame::Settings(settings)) => {
            assert_eq!(settings.get(SettingsParameter::InitialWindowSize), Some(1 << 20));
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(server.encoder.max_frame_size(), 1 << 15);
    assert_eq!(
        server.connection.remote_settings().map(|values| values.initial_window_size),
        Some(1 << 20)
    );
}

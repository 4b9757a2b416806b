//! Session-level behavior against a local mock streaming server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use oggcast::{
    CodecKind, ConnectionState, Event, IcecastConfig, Segment, SegmentPipeline, Session,
};

mod test_support;

/// Accepts one source connection, answers 200 and collects the body until
/// the peer disconnects.
fn spawn_server(listener: TcpListener) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();

        let mut body = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match socket.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&buf[..n]),
            }
        }
        body
    })
}

fn config_for(port: u16) -> IcecastConfig {
    IcecastConfig {
        hostname: "127.0.0.1".to_string(),
        port,
        mount: "/live.ogg".to_string(),
        password: "hackme".to_string(),
        ..IcecastConfig::default()
    }
}

fn collecting_session(codec: CodecKind, port: u16) -> (Session, Arc<Mutex<Vec<Event>>>) {
    let session = Session::new(codec, 48000, 1, None, &config_for(port)).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.set_callback(move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    (session, events)
}

fn stream_states(events: &[Event]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::StreamState { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn live_session_streams_ogg_to_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_server(listener);

    let (session, events) = collecting_session(CodecKind::Opus, port);
    session.start().unwrap();

    wait_for("the connection", Duration::from_secs(10), || {
        stream_states(&events.lock().unwrap()).contains(&ConnectionState::Connected)
    });

    // Let some audio flow.
    thread::sleep(Duration::from_millis(500));
    session.stop().unwrap();

    let body = server.join().unwrap();
    assert!(body.len() > 100, "server saw almost no data");
    assert_eq!(&body[..4], b"OggS");
    assert!(
        body.windows(8).any(|w| w == b"OpusHead"),
        "no Opus header on the wire"
    );

    let recorded = events.lock().unwrap().clone();
    let states = stream_states(&recorded);
    assert_eq!(states[0], ConnectionState::Connecting);
    assert_eq!(states[1], ConnectionState::Connected);
    assert!(states.contains(&ConnectionState::Disconnecting));
    assert!(states.contains(&ConnectionState::Disconnected));

    // The live pipeline stays wired across stop; only the connection is
    // gone.
    assert!(session.transform().is_some());
}

#[test]
fn no_events_after_stop_returns() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_server(listener);

    let (session, events) = collecting_session(CodecKind::Opus, port);
    session.start().unwrap();

    wait_for("the connection", Duration::from_secs(10), || {
        stream_states(&events.lock().unwrap()).contains(&ConnectionState::Connected)
    });

    session.stop().unwrap();
    let count = events.lock().unwrap().len();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(events.lock().unwrap().len(), count);

    drop(session);
    let _ = server.join();
}

#[test]
fn refused_connection_reports_and_stops() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (session, events) = collecting_session(CodecKind::Opus, port);
    session.start().unwrap();

    wait_for("the failure report", Duration::from_secs(10), || {
        stream_states(&events.lock().unwrap()).contains(&ConnectionState::Disconnected)
    });
    session.stop().unwrap();

    let recorded = events.lock().unwrap().clone();
    let states = stream_states(&recorded);
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::ConnectionError,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );

    // The connection error is preceded by an error event with the same
    // code.
    let error_event = recorded.iter().find_map(|event| match event {
        Event::Error { error } => Some(*error),
        _ => None,
    });
    let state_error = recorded.iter().find_map(|event| match event {
        Event::StreamState {
            state: ConnectionState::ConnectionError,
            error,
        } => *error,
        _ => None,
    });
    assert_eq!(error_event, state_error);
    assert!(error_event.is_some());
}

#[test]
fn flat_profile_schedules_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (session, events) = collecting_session(CodecKind::Opus, port);
    session.set_reconnection_profile("flat");
    session.start().unwrap();

    wait_for("a reconnect announcement", Duration::from_secs(10), || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, Event::Reconnect { .. }))
    });

    // Stopping mid-sleep returns promptly.
    let begin = Instant::now();
    session.stop().unwrap();
    assert!(begin.elapsed() < Duration::from_secs(2));

    let recorded = events.lock().unwrap().clone();
    let remaining = recorded
        .iter()
        .find_map(|event| match event {
            Event::Reconnect { remaining } => Some(*remaining),
            _ => None,
        })
        .unwrap();
    assert!(remaining <= Duration::from_secs(10));
    assert!(remaining > Duration::from_secs(8));
}

#[test]
fn forced_switch_hands_over_to_a_file_segment() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_server(listener);

    // A recognizable payload standing in for a pre-recorded Ogg file.
    let marker: Vec<u8> = b"OggSfilepayload!".repeat(512);
    let dir = std::env::temp_dir().join("oggcast-session-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("segment.ogg");
    std::fs::write(&path, &marker).unwrap();

    let (session, events) = collecting_session(CodecKind::Opus, port);
    session.queue_segment(Segment::new(
        SegmentPipeline::FileSimple,
        None,
        Some(path.to_str().unwrap().to_string()),
    ));

    session.start().unwrap();
    wait_for("the connection", Duration::from_secs(10), || {
        stream_states(&events.lock().unwrap()).contains(&ConnectionState::Connected)
    });

    session.switch_segment();
    wait_for("the segment handover", Duration::from_secs(10), || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(
                event,
                Event::SegmentConnect {
                    pipeline: SegmentPipeline::FileSimple,
                }
            ))
    });

    // Give the file bytes time to reach the server.
    thread::sleep(Duration::from_millis(500));
    session.stop().unwrap();

    let body = server.join().unwrap();
    assert!(
        body.windows(16).any(|w| w == &b"OggSfilepayload!"[..]),
        "file segment bytes never reached the server"
    );

    let recorded = events.lock().unwrap().clone();
    let disconnect_at = recorded
        .iter()
        .position(|event| matches!(
            event,
            Event::SegmentDisconnect {
                pipeline: SegmentPipeline::Live,
            }
        ))
        .expect("the live segment is disconnected first");
    let connect_at = recorded
        .iter()
        .position(|event| matches!(
            event,
            Event::SegmentConnect {
                pipeline: SegmentPipeline::FileSimple,
            }
        ))
        .unwrap();
    assert!(disconnect_at < connect_at);

    // After the swap the file segment is current and the live pipeline is
    // gone.
    assert_eq!(
        session.segment().unwrap().pipeline(),
        SegmentPipeline::FileSimple
    );
    assert!(session.transform().is_none());
}

#[test]
fn vu_meter_results_flow_while_streaming() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_server(listener);

    let (session, events) = collecting_session(CodecKind::Opus, port);
    session.set_vumeter_interval(2);
    session.start().unwrap();

    wait_for("a metering result", Duration::from_secs(10), || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, Event::VuMeterResult { .. }))
    });

    session.stop().unwrap();
    let _ = server.join();

    let recorded = events.lock().unwrap().clone();
    let result = recorded
        .iter()
        .find_map(|event| match event {
            Event::VuMeterResult { result } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(result.rate, 48000);
    assert_eq!(result.channels, 1);
}

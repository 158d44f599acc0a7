use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use iax_engine::testing::MockTransport;
use iax_engine::{
    CallParams, DefaultHooks, Engine, EngineConfig, EventKind, ManualTimeProvider, MediaSink,
    Transaction, TimeProvider,
};
use iax_proto::constants::format::{self, MediaType};
use iax_proto::constants::{FrameType, IaxControl};
use iax_proto::{ie_tag, Frame, FullFrame, IeList, MiniFrame};

fn peer() -> SocketAddr {
    "192.0.2.10:4569".parse().unwrap()
}

const SERVER_CALL: u16 = 0x77;

struct Capture {
    seen: Arc<Mutex<Vec<(u32, usize, bool)>>>,
}

impl MediaSink for Capture {
    fn media(&self, payload: &[u8], timestamp: u32, mark: bool) {
        self.seen.lock().push((timestamp, payload.len(), mark));
    }
}

fn capture_sink() -> (Box<Capture>, Arc<Mutex<Vec<(u32, usize, bool)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    (Box::new(Capture { seen: seen.clone() }), seen)
}

fn setup() -> (Arc<Engine>, Arc<MockTransport>, Arc<ManualTimeProvider>) {
    let time = Arc::new(ManualTimeProvider::new(std::time::Instant::now(), 0));
    let transport = MockTransport::new("192.0.2.1:4569".parse().unwrap());
    let config = EngineConfig {
        auth_required: false,
        ..EngineConfig::client()
    };
    let engine = Engine::with_transport(
        config,
        transport.clone(),
        Arc::new(DefaultHooks),
        time.clone(),
    );
    (engine, transport, time)
}

fn connect_call(
    engine: &Arc<Engine>,
    transport: &Arc<MockTransport>,
    time: &Arc<ManualTimeProvider>,
) -> Arc<Transaction> {
    let tr = engine
        .start_call(
            peer(),
            CallParams {
                username: Some("a".into()),
                called_number: Some("100".into()),
                format: format::ULAW,
                capability: format::ULAW,
                ..CallParams::default()
            },
        )
        .unwrap();
    let mut ies = IeList::new();
    ies.append_u32(ie_tag::FORMAT, format::ULAW);
    let accept = FullFrame {
        frame_type: FrameType::Iax,
        subclass: IaxControl::Accept as u32,
        src_call: SERVER_CALL,
        dst_call: tr.local_call(),
        retrans: false,
        oseq: 0,
        iseq: 1,
        timestamp: 5,
        payload: ies.to_bytes().unwrap(),
    };
    engine.process_datagram(
        &Frame::Full(accept).to_bytes().unwrap(),
        peer(),
        time.now_instant(),
    );
    let ev = tr.get_event(time.now_instant()).expect("accept event");
    assert_eq!(ev.kind, EventKind::Accept);
    transport.take_sent();
    tr
}

fn voice_full(dst: u16, oseq: u8, ts: u32, payload: &[u8]) -> Vec<u8> {
    let full = FullFrame {
        frame_type: FrameType::Voice,
        subclass: format::ULAW,
        src_call: SERVER_CALL,
        dst_call: dst,
        retrans: false,
        oseq,
        iseq: 1,
        timestamp: ts,
        payload: payload.to_vec(),
    };
    Frame::Full(full).to_bytes().unwrap()
}

fn mini(ts: u16, payload: &[u8]) -> Vec<u8> {
    let frame = MiniFrame {
        src_call: SERVER_CALL,
        timestamp: ts,
        payload: payload.to_vec(),
    };
    Frame::Mini(frame).to_bytes().unwrap()
}

#[test]
fn test_first_media_goes_full_then_minis() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    let data = [0x55u8; 160];

    // 8 kHz source: 160 samples per 20 ms packet.
    for (k, src_ts) in [0u32, 160, 320, 480, 640].iter().enumerate() {
        time.advance(Duration::from_millis(20));
        let sent = tr.send_media(&data, *src_ts, format::ULAW, MediaType::Audio, false);
        assert_eq!(sent, 160, "packet {k} written");
    }

    let frames = transport.take_frames();
    let fulls = frames
        .iter()
        .filter(|f| matches!(f, Frame::Full(full) if full.frame_type == FrameType::Voice))
        .count();
    let minis: Vec<u16> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Mini(m) => Some(m.timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(fulls, 1, "the first packet advertises the codec");
    assert_eq!(minis.len(), 4);
    // Mini timestamps pace at 20 ms.
    for pair in minis.windows(2) {
        assert_eq!(pair[1] - pair[0], 20);
    }

    let stats = tr.audio_stats();
    assert_eq!(stats.sent, 5);
    assert_eq!(stats.sent_bytes, 800);
    assert_eq!(stats.drop_out, 0);
}

#[test]
fn test_receiver_reconstructs_and_drops_out_of_order() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    let (sink, seen) = capture_sink();
    tr.set_media_sink(MediaType::Audio, Some(sink));
    let lc = tr.local_call();
    let now = || time.now_instant();

    engine.process_datagram(&voice_full(lc, 1, 1000, &[1; 160]), peer(), now());
    engine.process_datagram(&mini(1020, &[2; 160]), peer(), now());
    engine.process_datagram(&mini(1010, &[3; 160]), peer(), now());

    let delivered: Vec<u32> = seen.lock().iter().map(|(ts, _, _)| *ts).collect();
    assert_eq!(delivered, vec![1000 * 8, 1020 * 8]);
    let stats = tr.audio_stats();
    assert_eq!(stats.recv, 3);
    assert_eq!(stats.oo_packets, 1);
    assert_eq!(stats.oo_bytes, 160);
}

#[test]
fn test_wraparound_reconstruction() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    let (sink, seen) = capture_sink();
    tr.set_media_sink(MediaType::Audio, Some(sink));
    let lc = tr.local_call();
    let now = || time.now_instant();

    engine.process_datagram(&voice_full(lc, 1, 0xFFE0, &[0; 4]), peer(), now());
    for ts in [0xFFF0u16, 0x0010, 0x0030] {
        engine.process_datagram(&mini(ts, &[0; 4]), peer(), now());
    }

    let delivered: Vec<u32> = seen.lock().iter().map(|(ts, _, _)| *ts / 8).collect();
    assert_eq!(delivered, vec![0xFFE0, 0xFFF0, 0x1_0010, 0x1_0030]);
}

#[test]
fn test_mini_before_full_voice_requests_vnak() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    let now = || time.now_instant();

    for ts in [100u16, 120, 140] {
        engine.process_datagram(&mini(ts, &[9; 160]), peer(), now());
    }
    let frames = transport.take_frames();
    let vnaks = frames
        .iter()
        .filter(|f| matches!(f, Frame::Full(full) if full.subclass == IaxControl::Vnak as u32))
        .count();
    assert_eq!(vnaks, 1, "every third early mini asks for the full frame");
    assert_eq!(tr.audio_stats().recv, 0, "early minis are not counted as received");
}

#[test]
fn test_overrun_drops_and_rewinds_clock() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    time.advance(Duration::from_millis(1000));
    let data = [0u8; 160];

    // First packet anchors the outbound clock at 1000 ms.
    assert_eq!(tr.send_media(&data, 0, format::ULAW, MediaType::Audio, false), 160);
    // The source then runs hot: packets every 160 samples with no wall
    // time passing. At +120 ms of skew the frame is dropped.
    let mut dropped_at = None;
    for k in 1..=6u32 {
        let sent = tr.send_media(&data, k * 160, format::ULAW, MediaType::Audio, false);
        if sent == 0 {
            dropped_at = Some(k);
            break;
        }
    }
    assert_eq!(dropped_at, Some(6), "skew reaches the 120 ms threshold");
    let stats = tr.audio_stats();
    assert_eq!(stats.sent, 6);
    assert_eq!(stats.drop_out, 1);
    transport.take_sent();
}

#[test]
fn test_underrun_adjusts_and_keeps_sending() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    time.advance(Duration::from_millis(1000));
    let data = [0u8; 160];

    assert_eq!(tr.send_media(&data, 0, format::ULAW, MediaType::Audio, false), 160);
    // Wall time leaps ahead of the source; the frame still goes out.
    time.advance(Duration::from_millis(500));
    assert_eq!(tr.send_media(&data, 160, format::ULAW, MediaType::Audio, false), 160);
    time.advance(Duration::from_millis(20));
    assert_eq!(tr.send_media(&data, 320, format::ULAW, MediaType::Audio, false), 160);

    let stats = tr.audio_stats();
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.drop_out, 0);
    // Timestamps stay monotonic on the wire.
    let frames = transport.take_frames();
    let minis: Vec<u16> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Mini(m) => Some(m.timestamp),
            _ => None,
        })
        .collect();
    assert!(minis.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn test_old_source_timestamp_dropped() {
    let (engine, transport, time) = setup();
    let tr = connect_call(&engine, &transport, &time);
    time.advance(Duration::from_millis(100));
    let data = [0u8; 160];
    assert_eq!(tr.send_media(&data, 1000, format::ULAW, MediaType::Audio, false), 160);
    // Older than the first source timestamp: nothing to pace against.
    assert_eq!(tr.send_media(&data, 500, format::ULAW, MediaType::Audio, false), 0);
    assert_eq!(tr.audio_stats().drop_out, 1);
    transport.take_sent();
}

#[test]
fn test_voice_before_accept_uses_buffered_accept() {
    let (engine, transport, time) = setup();
    let tr = engine
        .start_call(
            peer(),
            CallParams {
                format: format::ULAW,
                capability: format::ULAW,
                ..CallParams::default()
            },
        )
        .unwrap();
    let (sink, seen) = capture_sink();
    tr.set_media_sink(MediaType::Audio, Some(sink));
    transport.take_sent();

    // Accept and voice arrive back to back, before any event pass.
    let mut ies = IeList::new();
    ies.append_u32(ie_tag::FORMAT, format::ULAW);
    let accept = FullFrame {
        frame_type: FrameType::Iax,
        subclass: IaxControl::Accept as u32,
        src_call: SERVER_CALL,
        dst_call: tr.local_call(),
        retrans: false,
        oseq: 0,
        iseq: 1,
        timestamp: 5,
        payload: ies.to_bytes().unwrap(),
    };
    engine.process_datagram(
        &Frame::Full(accept).to_bytes().unwrap(),
        peer(),
        time.now_instant(),
    );
    engine.process_datagram(
        &voice_full(tr.local_call(), 1, 40, &[7; 160]),
        peer(),
        time.now_instant(),
    );

    assert_eq!(seen.lock().len(), 1, "early voice is honored");
    // The buffered Accept still produces its event.
    let ev = tr.get_event(time.now_instant()).expect("accept event");
    assert_eq!(ev.kind, EventKind::Accept);
    // No reject went out.
    let frames = transport.take_frames();
    assert!(frames.iter().all(
        |f| !matches!(f, Frame::Full(full) if full.subclass == IaxControl::Reject as u32
            && full.frame_type == FrameType::Iax)
    ));
}

#[test]
fn test_incoming_voice_before_accept_rejects_101() {
    let (engine, transport, time) = setup();
    let now = || time.now_instant();
    // A peer opens a call towards us...
    let mut ies = IeList::new();
    ies.append_u16(ie_tag::VERSION, 2);
    ies.append_str(ie_tag::CALLED_NUMBER, "100");
    ies.append_u32(ie_tag::FORMAT, format::ULAW);
    ies.append_u32(ie_tag::CAPABILITY, format::ULAW);
    let new = FullFrame {
        frame_type: FrameType::Iax,
        subclass: IaxControl::New as u32,
        src_call: 0x21,
        dst_call: 0,
        retrans: false,
        oseq: 0,
        iseq: 0,
        timestamp: 1,
        payload: ies.to_bytes().unwrap(),
    };
    engine.process_datagram(&Frame::Full(new).to_bytes().unwrap(), peer(), now());
    assert_eq!(engine.transaction_count(), 1);

    // ...and fires voice before we ever accepted.
    let voice = FullFrame {
        frame_type: FrameType::Voice,
        subclass: format::ULAW,
        src_call: 0x21,
        dst_call: 0,
        retrans: false,
        oseq: 1,
        iseq: 0,
        timestamp: 20,
        payload: vec![0; 160],
    };
    engine.process_datagram(&Frame::Full(voice).to_bytes().unwrap(), peer(), now());

    let frames = transport.take_frames();
    let rejects: Vec<&FullFrame> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Full(full)
                if full.frame_type == FrameType::Iax
                    && full.subclass == IaxControl::Reject as u32 =>
            {
                Some(full)
            }
            _ => None,
        })
        .collect();
    assert_eq!(rejects.len(), 1);
    let reject_ies = IeList::decode(&rejects[0].payload).unwrap();
    assert_eq!(reject_ies.numeric(ie_tag::CAUSECODE), Some(101));
}

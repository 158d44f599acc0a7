use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use iax_engine::testing::MockTransport;
use iax_engine::{
    CallParams, DefaultHooks, Engine, EngineConfig, EventKind, ManualTimeProvider, State,
    Transaction, TimeProvider,
};
use iax_proto::constants::{format, FrameType, IaxControl};
use iax_proto::{ie_tag, Frame, FullFrame, IeList};

fn peer() -> SocketAddr {
    "192.0.2.10:4569".parse().unwrap()
}

fn setup(config: EngineConfig) -> (Arc<Engine>, Arc<MockTransport>, Arc<ManualTimeProvider>) {
    let time = Arc::new(ManualTimeProvider::new(std::time::Instant::now(), 0));
    let transport = MockTransport::new("192.0.2.1:4569".parse().unwrap());
    let engine = Engine::with_transport(
        config,
        transport.clone(),
        Arc::new(DefaultHooks),
        time.clone(),
    );
    (engine, transport, time)
}

fn client_config() -> EngineConfig {
    EngineConfig {
        auth_required: false,
        ..EngineConfig::client()
    }
}

fn iax_wire(
    subclass: IaxControl,
    src: u16,
    dst: u16,
    oseq: u8,
    iseq: u8,
    ts: u32,
    ies: &IeList,
) -> Vec<u8> {
    let full = FullFrame {
        frame_type: FrameType::Iax,
        subclass: subclass as u32,
        src_call: src,
        dst_call: dst,
        retrans: false,
        oseq,
        iseq,
        timestamp: ts,
        payload: ies.to_bytes().unwrap(),
    };
    Frame::Full(full).to_bytes().unwrap()
}

fn text_wire(src: u16, dst: u16, oseq: u8, iseq: u8, ts: u32, text: &str) -> Vec<u8> {
    let full = FullFrame {
        frame_type: FrameType::Text,
        subclass: 0,
        src_call: src,
        dst_call: dst,
        retrans: false,
        oseq,
        iseq,
        timestamp: ts,
        payload: text.as_bytes().to_vec(),
    };
    Frame::Full(full).to_bytes().unwrap()
}

fn full_frames(frames: &[Frame]) -> Vec<&FullFrame> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Full(full) => Some(full),
            _ => None,
        })
        .collect()
}

const SERVER_CALL: u16 = 0x99;

/// Drive an outgoing call to Connected by answering its New with Accept.
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
    let frames = transport.take_frames();
    let new = full_frames(&frames)[0];
    assert_eq!(new.subclass, IaxControl::New as u32);
    let mut ies = IeList::new();
    ies.append_u32(ie_tag::FORMAT, format::ULAW);
    let accept = iax_wire(
        IaxControl::Accept,
        SERVER_CALL,
        tr.local_call(),
        0,
        1,
        5,
        &ies,
    );
    engine.process_datagram(&accept, peer(), time.now_instant());
    let ev = tr.get_event(time.now_instant()).expect("accept event");
    assert_eq!(ev.kind, EventKind::Accept);
    assert_eq!(tr.state(), State::Connected);
    transport.take_sent();
    tr
}

#[test]
fn test_poke_exchange() {
    let (engine, transport, time) = setup(client_config());
    let tr = engine.poke(peer()).unwrap();
    let frames = transport.take_frames();
    let poke = full_frames(&frames)[0];
    assert_eq!(poke.subclass, IaxControl::Poke as u32);
    assert_eq!(poke.dst_call, 0);
    assert_eq!(poke.oseq, 0);

    let pong = iax_wire(
        IaxControl::Pong,
        SERVER_CALL,
        tr.local_call(),
        0,
        1,
        poke.timestamp,
        &IeList::new(),
    );
    engine.process_datagram(&pong, peer(), time.now_instant());
    let handled = engine.pump_events(time.now_instant());
    assert!(handled >= 1);

    let (_, ev) = engine.events().try_recv().expect("terminated event");
    assert_eq!(ev.kind, EventKind::Terminated);
    assert!(ev.is_final);
    assert!(ev.ies.is_empty());
    assert_eq!(tr.state(), State::Terminated);
    assert_eq!(engine.transaction_count(), 0);
}

#[test]
fn test_retransmit_schedule_doubles_then_times_out() {
    let config = EngineConfig {
        retrans_count: 3,
        retrans_interval_ms: 100,
        ..client_config()
    };
    let (engine, transport, time) = setup(config);
    let tr = engine.poke(peer()).unwrap();
    assert_eq!(transport.take_sent().len(), 1);

    // Nothing due before the first interval.
    time.advance(Duration::from_millis(99));
    assert!(tr.get_event(time.now_instant()).is_none());
    assert_eq!(transport.sent_count(), 0);

    // Retransmissions at +100, +200, +400 carry the retransmit bit.
    for step in [1u64, 200, 400] {
        time.advance(Duration::from_millis(step));
        assert!(tr.get_event(time.now_instant()).is_none());
        let frames = transport.take_frames();
        let fulls = full_frames(&frames);
        assert_eq!(fulls.len(), 1, "one retransmission per due interval");
        assert!(fulls[0].retrans);
        assert_eq!(fulls[0].subclass, IaxControl::Poke as u32);
    }

    // Budget exhausted: the final doubled interval expires into Timeout.
    time.advance(Duration::from_millis(800));
    let ev = tr.get_event(time.now_instant()).expect("timeout event");
    assert_eq!(ev.kind, EventKind::Timeout);
    assert!(ev.is_final);
    assert_eq!(tr.state(), State::Terminated);
}

#[test]
fn test_implicit_ack_clears_earlier_frames() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);

    assert!(tr.send_text("one"));
    assert!(tr.send_text("two"));
    assert!(tr.send_text("three"));
    let frames = transport.take_frames();
    let texts = full_frames(&frames);
    assert_eq!(texts.len(), 3);
    let last = texts[2];

    // ACK only the last text; the earlier two are implicitly acked.
    let ack = iax_wire(
        IaxControl::Ack,
        SERVER_CALL,
        tr.local_call(),
        last.iseq,
        last.oseq.wrapping_add(1),
        last.timestamp,
        &IeList::new(),
    );
    engine.process_datagram(&ack, peer(), time.now_instant());
    assert!(tr.get_event(time.now_instant()).is_none());
    transport.take_sent();

    // Past the retransmission interval nothing is resent.
    time.advance(Duration::from_millis(600));
    assert!(tr.get_event(time.now_instant()).is_none());
    let leftover = transport.take_frames();
    assert!(
        full_frames(&leftover)
            .iter()
            .all(|f| f.frame_type != FrameType::Text),
        "implicitly acked frames must not retransmit"
    );
}

#[test]
fn test_vnak_recovery_delivers_in_order() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let now = || time.now_instant();
    let lc = tr.local_call();

    // Peer continues from oseq 1 (its Accept used oseq 0).
    for (oseq, text) in [(1u8, "t1"), (2, "t2")] {
        engine.process_datagram(&text_wire(SERVER_CALL, lc, oseq, 1, 100 + oseq as u32, text), peer(), now());
    }
    // A gap: 5 and 6 arrive while 3 and 4 are missing.
    for (oseq, text) in [(5u8, "t5"), (6, "t6")] {
        engine.process_datagram(&text_wire(SERVER_CALL, lc, oseq, 1, 110 + oseq as u32, text), peer(), now());
    }
    let frames = transport.take_frames();
    let vnaks: Vec<_> = full_frames(&frames)
        .into_iter()
        .filter(|f| f.subclass == IaxControl::Vnak as u32)
        .cloned()
        .collect();
    assert_eq!(vnaks.len(), 1, "one gap, one VNAK");
    assert_eq!(vnaks[0].iseq, 3, "VNAK names the first missing oseq");

    // The peer retransmits from 3.
    for (oseq, text) in [(3u8, "t3"), (4, "t4"), (5, "t5"), (6, "t6")] {
        engine.process_datagram(&text_wire(SERVER_CALL, lc, oseq, 1, 120 + oseq as u32, text), peer(), now());
    }
    let mut texts = Vec::new();
    while let Some(ev) = tr.get_event(now()) {
        if ev.kind == EventKind::Text {
            texts.push(String::from_utf8(ev.payload).unwrap());
        }
    }
    assert_eq!(texts, ["t1", "t2", "t3", "t4", "t5", "t6"]);
}

#[test]
fn test_late_duplicate_is_acked_and_dropped() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let lc = tr.local_call();
    let wire = text_wire(SERVER_CALL, lc, 1, 1, 50, "hello");

    engine.process_datagram(&wire, peer(), time.now_instant());
    let ev = tr.get_event(time.now_instant()).expect("text event");
    assert_eq!(ev.kind, EventKind::Text);
    transport.take_sent();

    // The duplicate is answered with a lone ACK and produces no event.
    engine.process_datagram(&wire, peer(), time.now_instant());
    let frames = transport.take_frames();
    let fulls = full_frames(&frames);
    assert_eq!(fulls.len(), 1);
    assert_eq!(fulls[0].subclass, IaxControl::Ack as u32);
    assert!(tr.get_event(time.now_instant()).is_none());
}

#[test]
fn test_ping_timeout_terminates() {
    let config = EngineConfig {
        retrans_count: 2,
        retrans_interval_ms: 100,
        ping_interval_ms: 1_000,
        ..client_config()
    };
    let (engine, transport, time) = setup(config);
    let tr = connect_call(&engine, &transport, &time);

    // First pass only schedules the ping.
    assert!(tr.get_event(time.now_instant()).is_none());
    assert_eq!(transport.take_frames().len(), 0);

    time.advance(Duration::from_millis(1_001));
    assert!(tr.get_event(time.now_instant()).is_none());
    let frames = transport.take_frames();
    let pings = full_frames(&frames);
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].subclass, IaxControl::Ping as u32);

    // No Pong ever comes back: 100 + 200 retransmit, then timeout.
    for step in [100u64, 200, 400] {
        time.advance(Duration::from_millis(step));
        tr.get_event(time.now_instant());
    }
    assert_eq!(tr.state(), State::Terminated);
}

#[test]
fn test_incoming_ping_answered_with_pong() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let ping = iax_wire(
        IaxControl::Ping,
        SERVER_CALL,
        tr.local_call(),
        1,
        1,
        777,
        &IeList::new(),
    );
    engine.process_datagram(&ping, peer(), time.now_instant());
    let frames = transport.take_frames();
    let pongs: Vec<_> = full_frames(&frames)
        .into_iter()
        .filter(|f| f.subclass == IaxControl::Pong as u32)
        .cloned()
        .collect();
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0].timestamp, 777, "pong echoes the ping timestamp");
}

#[test]
fn test_hangup_carries_cause() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    assert!(tr.send_hangup(Some("normal clearing"), 31));
    let frames = transport.take_frames();
    let hangup = full_frames(&frames)[0].clone();
    assert_eq!(hangup.subclass, IaxControl::Hangup as u32);
    let ies = IeList::decode(&hangup.payload).unwrap();
    assert_eq!(ies.string(ie_tag::CAUSE), Some("normal clearing"));
    assert_eq!(ies.numeric(ie_tag::CAUSECODE), Some(31));
    assert_eq!(tr.state(), State::Terminating);

    // The peer's ACK finishes the transaction.
    let ack = iax_wire(
        IaxControl::Ack,
        SERVER_CALL,
        tr.local_call(),
        hangup.iseq,
        hangup.oseq.wrapping_add(1),
        hangup.timestamp,
        &IeList::new(),
    );
    engine.process_datagram(&ack, peer(), time.now_instant());
    let ev = tr.get_event(time.now_instant()).expect("terminated");
    assert_eq!(ev.kind, EventKind::Terminated);
    assert!(ev.local);
    assert_eq!(tr.state(), State::Terminated);
}

#[test]
fn test_inbound_inval_terminates() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let inval = iax_wire(
        IaxControl::Inval,
        SERVER_CALL,
        tr.local_call(),
        1,
        1,
        0,
        &IeList::new(),
    );
    engine.process_datagram(&inval, peer(), time.now_instant());
    let ev = tr.get_event(time.now_instant()).expect("invalid event");
    assert_eq!(ev.kind, EventKind::Invalid);
    assert!(ev.is_final);
    assert_eq!(tr.state(), State::Terminated);
}

#[test]
fn test_unsupported_subclass_answered_with_unsupport() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let dial = iax_wire(
        IaxControl::Dial,
        SERVER_CALL,
        tr.local_call(),
        1,
        1,
        60,
        &IeList::new(),
    );
    engine.process_datagram(&dial, peer(), time.now_instant());
    let ev = tr.get_event(time.now_instant()).expect("not implemented");
    assert_eq!(ev.kind, EventKind::NotImplemented);
    let frames = transport.take_frames();
    let unsupport: Vec<_> = full_frames(&frames)
        .into_iter()
        .filter(|f| f.subclass == IaxControl::Unsupport as u32)
        .cloned()
        .collect();
    assert_eq!(unsupport.len(), 1);
    let ies = IeList::decode(&unsupport[0].payload).unwrap();
    assert_eq!(
        ies.numeric(ie_tag::IAX_UNKNOWN),
        Some(IaxControl::Dial as u32)
    );
}

#[test]
fn test_lagrq_echoed_with_lagrp() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let lagrq = iax_wire(
        IaxControl::LagRq,
        SERVER_CALL,
        tr.local_call(),
        1,
        1,
        4242,
        &IeList::new(),
    );
    engine.process_datagram(&lagrq, peer(), time.now_instant());
    assert!(tr.get_event(time.now_instant()).is_none());
    let frames = transport.take_frames();
    let lagrp: Vec<_> = full_frames(&frames)
        .into_iter()
        .filter(|f| f.subclass == IaxControl::LagRp as u32)
        .cloned()
        .collect();
    assert_eq!(lagrp.len(), 1);
    assert_eq!(lagrp[0].timestamp, 4242);
}

#[test]
fn test_quelch_and_dtmf_events() {
    let (engine, transport, time) = setup(client_config());
    let tr = connect_call(&engine, &transport, &time);
    let lc = tr.local_call();
    engine.process_datagram(
        &iax_wire(IaxControl::Quelch, SERVER_CALL, lc, 1, 1, 10, &IeList::new()),
        peer(),
        time.now_instant(),
    );
    let dtmf = FullFrame {
        frame_type: FrameType::Dtmf,
        subclass: '5' as u32,
        src_call: SERVER_CALL,
        dst_call: lc,
        retrans: false,
        oseq: 2,
        iseq: 1,
        timestamp: 20,
        payload: Vec::new(),
    };
    engine.process_datagram(
        &Frame::Full(dtmf).to_bytes().unwrap(),
        peer(),
        time.now_instant(),
    );
    let ev = tr.get_event(time.now_instant()).unwrap();
    assert_eq!(ev.kind, EventKind::Quelch);
    let ev = tr.get_event(time.now_instant()).unwrap();
    assert_eq!(ev.kind, EventKind::Dtmf);
    assert_eq!(ev.subclass, '5' as u32);
    assert_eq!(tr.state(), State::Connected);
}

#[test]
fn test_outbound_dtmf_and_text_require_connected() {
    let (engine, _transport, _time) = setup(client_config());
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
    assert!(!tr.send_dtmf('1'));
    assert!(!tr.send_text("early"));
}

#[test]
fn test_inbound_queue_overflow_drops() {
    let config = EngineConfig {
        max_in_frames: 4,
        ..client_config()
    };
    let (engine, transport, time) = setup(config);
    let tr = connect_call(&engine, &transport, &time);
    let lc = tr.local_call();
    // Flood without pumping events in between.
    for oseq in 1..=10u8 {
        engine.process_datagram(
            &text_wire(SERVER_CALL, lc, oseq, 1, 100 + oseq as u32, "x"),
            peer(),
            time.now_instant(),
        );
    }
    let mut delivered = 0;
    while let Some(ev) = tr.get_event(time.now_instant()) {
        if ev.kind == EventKind::Text {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 4, "queue cap bounds undelivered backlog");
}

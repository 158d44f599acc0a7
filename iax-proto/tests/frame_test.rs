use iax_proto::constants::{format, FrameType, IaxControl};
use iax_proto::{
    pack_subclass, unpack_subclass, Frame, FrameError, FullFrame, MetaTrunkFrame, MetaVideoFrame,
    MiniFrame, TrunkEntry,
};

#[test]
fn test_full_frame_header_layout() {
    let frame = FullFrame {
        frame_type: FrameType::Iax,
        subclass: IaxControl::New as u32,
        src_call: 0x1234,
        dst_call: 0,
        retrans: false,
        oseq: 0,
        iseq: 0,
        timestamp: 0x0A0B0C0D,
        payload: vec![],
    };
    let bytes = Frame::Full(frame).to_bytes().unwrap();
    assert_eq!(
        bytes,
        vec![0x92, 0x34, 0x00, 0x00, 0x0A, 0x0B, 0x0C, 0x0D, 0x00, 0x00, 0x06, 0x01]
    );
}

#[test]
fn test_full_frame_retrans_bit() {
    let frame = FullFrame {
        frame_type: FrameType::Iax,
        subclass: IaxControl::Ping as u32,
        src_call: 2,
        dst_call: 3,
        retrans: true,
        oseq: 7,
        iseq: 5,
        timestamp: 1000,
        payload: vec![],
    };
    let bytes = Frame::Full(frame.clone()).to_bytes().unwrap();
    assert_eq!(&bytes[2..4], &[0x80, 0x03]);
    let decoded = FullFrame::decode(&bytes).unwrap();
    assert!(decoded.retrans);
    assert_eq!(decoded.dst_call, 3);
    assert_eq!(decoded, frame);
}

#[test]
fn test_voice_subclass_power_of_two() {
    // ULAW (bit 2) travels as a literal; H264 (bit 21) needs the
    // exponent form.
    let frame = FullFrame {
        frame_type: FrameType::Video,
        subclass: format::H264,
        src_call: 9,
        dst_call: 10,
        retrans: false,
        oseq: 1,
        iseq: 1,
        timestamp: 20,
        payload: vec![0xAA; 3],
    };
    let bytes = Frame::Full(frame.clone()).to_bytes().unwrap();
    assert_eq!(bytes[11], 0x80 | 21);
    assert_eq!(FullFrame::decode(&bytes).unwrap(), frame);
}

#[test]
fn test_subclass_codec_rejects_composite() {
    assert_eq!(pack_subclass(0x7F).unwrap(), 0x7F);
    assert_eq!(pack_subclass(1 << 31).unwrap(), 0x80 | 31);
    assert!(matches!(
        pack_subclass(0x81),
        Err(FrameError::InvalidSubclass(_))
    ));
    assert!(matches!(
        pack_subclass(0x180),
        Err(FrameError::InvalidSubclass(_))
    ));
}

#[test]
fn test_subclass_decode_inverts_encode() {
    for v in (0u32..0x80).chain((7..32).map(|e| 1u32 << e)) {
        assert_eq!(unpack_subclass(pack_subclass(v).unwrap()).unwrap(), v);
    }
}

#[test]
fn test_mini_frame_roundtrip() {
    let frame = MiniFrame {
        src_call: 0x0042,
        timestamp: 0xFFE0,
        payload: vec![1, 2, 3, 4],
    };
    let bytes = Frame::Mini(frame.clone()).to_bytes().unwrap();
    assert_eq!(&bytes[..4], &[0x00, 0x42, 0xFF, 0xE0]);
    match Frame::decode(&bytes).unwrap() {
        Frame::Mini(decoded) => assert_eq!(decoded, frame),
        other => panic!("expected mini frame, got {other:?}"),
    }
}

#[test]
fn test_meta_video_roundtrip() {
    let frame = MetaVideoFrame {
        src_call: 77,
        mark: true,
        timestamp: 0x7ABC,
        payload: vec![9; 10],
    };
    let bytes = Frame::MetaVideo(frame.clone()).to_bytes().unwrap();
    assert_eq!(&bytes[..2], &[0, 0]);
    assert_eq!(bytes[2] & 0x80, 0x80);
    match Frame::decode(&bytes).unwrap() {
        Frame::MetaVideo(decoded) => assert_eq!(decoded, frame),
        other => panic!("expected meta video frame, got {other:?}"),
    }
}

#[test]
fn test_meta_trunk_with_timestamps_roundtrip() {
    let mut frame = MetaTrunkFrame::new(123_456, true);
    for (call, ts) in [(2u16, 100u16), (3, 120), (4, 140)] {
        frame.entries.push(TrunkEntry {
            src_call: call,
            timestamp: Some(ts),
            payload: vec![call as u8; 5],
        });
    }
    let bytes = Frame::MetaTrunk(frame.clone()).to_bytes().unwrap();
    assert_eq!(&bytes[..4], &[0x00, 0x00, 0x01, 0x01]);
    match Frame::decode(&bytes).unwrap() {
        Frame::MetaTrunk(decoded) => assert_eq!(decoded, frame),
        other => panic!("expected meta trunk frame, got {other:?}"),
    }
}

#[test]
fn test_meta_trunk_without_timestamps_roundtrip() {
    let mut frame = MetaTrunkFrame::new(42, false);
    frame.entries.push(TrunkEntry {
        src_call: 5,
        timestamp: None,
        payload: vec![0xCC; 160],
    });
    let bytes = Frame::MetaTrunk(frame.clone()).to_bytes().unwrap();
    match Frame::decode(&bytes).unwrap() {
        Frame::MetaTrunk(decoded) => assert_eq!(decoded, frame),
        other => panic!("expected meta trunk frame, got {other:?}"),
    }
}

#[test]
fn test_truncated_buffers_error() {
    assert!(matches!(
        Frame::decode(&[0x80]),
        Err(FrameError::ShortBuffer { .. })
    ));
    assert!(matches!(
        FullFrame::decode(&[0x80, 0x01, 0x00, 0x00, 0x00]),
        Err(FrameError::ShortBuffer { .. })
    ));
    // Trunk entry whose declared length overruns the datagram.
    let mut bytes = Vec::new();
    MetaTrunkFrame::new(1, false).encode(&mut bytes);
    bytes.extend_from_slice(&[0x00, 0x02, 0x00, 0xFF, 0x01]);
    assert!(matches!(
        Frame::decode(&bytes),
        Err(FrameError::ShortBuffer { .. })
    ));
}

#[test]
fn test_unknown_meta_indicator() {
    let bytes = [0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
    assert!(matches!(
        Frame::decode(&bytes),
        Err(FrameError::InvalidMeta(0x02))
    ));
}

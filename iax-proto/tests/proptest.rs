use iax_proto::constants::FrameType;
use iax_proto::{
    ie_tag, pack_subclass, unpack_subclass, Frame, FullFrame, Ie, IeList, IeValue, MetaTrunkFrame,
    MetaVideoFrame, MiniFrame, TrunkEntry,
};
use proptest::prelude::*;

/// The encodable subclass domain: literals below 0x80 and exact powers
/// of two up to 2^31.
fn arb_subclass() -> impl Strategy<Value = u32> {
    prop_oneof![0u32..0x80, (0u32..32).prop_map(|e| 1u32 << e)]
}

fn arb_frame_type() -> impl Strategy<Value = FrameType> {
    prop_oneof![
        Just(FrameType::Dtmf),
        Just(FrameType::Voice),
        Just(FrameType::Video),
        Just(FrameType::Control),
        Just(FrameType::Null),
        Just(FrameType::Iax),
        Just(FrameType::Text),
        Just(FrameType::Image),
        Just(FrameType::Html),
        Just(FrameType::Noise),
    ]
}

prop_compose! {
    fn arb_full_frame()(
        frame_type in arb_frame_type(),
        subclass in arb_subclass(),
        src_call in 0u16..=0x7FFF,
        dst_call in 0u16..=0x7FFF,
        retrans in any::<bool>(),
        oseq in any::<u8>(),
        iseq in any::<u8>(),
        timestamp in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) -> FullFrame {
        FullFrame { frame_type, subclass, src_call, dst_call, retrans, oseq, iseq, timestamp, payload }
    }
}

proptest! {
    #[test]
    fn subclass_roundtrips(value in arb_subclass()) {
        prop_assert_eq!(unpack_subclass(pack_subclass(value).unwrap()).unwrap(), value);
    }

    #[test]
    fn full_frame_roundtrips(frame in arb_full_frame()) {
        let bytes = Frame::Full(frame.clone()).to_bytes().unwrap();
        prop_assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Full(frame));
    }

    #[test]
    fn mini_frame_roundtrips(
        src_call in 1u16..=0x7FFF,
        timestamp in any::<u16>(),
        payload in proptest::collection::vec(any::<u8>(), 0..300),
    ) {
        let frame = MiniFrame { src_call, timestamp, payload };
        let bytes = Frame::Mini(frame.clone()).to_bytes().unwrap();
        prop_assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Mini(frame));
    }

    #[test]
    fn meta_video_roundtrips(
        src_call in 0u16..=0x7FFF,
        mark in any::<bool>(),
        timestamp in 0u16..=0x7FFF,
        payload in proptest::collection::vec(any::<u8>(), 0..300),
    ) {
        let frame = MetaVideoFrame { src_call, mark, timestamp, payload };
        let bytes = Frame::MetaVideo(frame.clone()).to_bytes().unwrap();
        prop_assert_eq!(Frame::decode(&bytes).unwrap(), Frame::MetaVideo(frame));
    }

    #[test]
    fn meta_trunk_roundtrips(
        timestamp in any::<u32>(),
        with_timestamps in any::<bool>(),
        raw in proptest::collection::vec(
            (1u16..=0x7FFF, any::<u16>(), proptest::collection::vec(any::<u8>(), 0..200)),
            0..6,
        ),
    ) {
        let mut frame = MetaTrunkFrame::new(timestamp, with_timestamps);
        for (src_call, ts, payload) in raw {
            frame.entries.push(TrunkEntry {
                src_call,
                timestamp: with_timestamps.then_some(ts),
                payload,
            });
        }
        let bytes = Frame::MetaTrunk(frame.clone()).to_bytes().unwrap();
        prop_assert_eq!(Frame::decode(&bytes).unwrap(), Frame::MetaTrunk(frame));
    }

    #[test]
    fn ie_list_roundtrips(
        user in "[a-z]{1,16}",
        refresh in any::<u16>(),
        cap in any::<u32>(),
        token in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut list = IeList::new();
        list.append_str(ie_tag::USERNAME, user)
            .append_u16(ie_tag::REFRESH, refresh)
            .append_u32(ie_tag::CAPABILITY, cap)
            .append_bin(ie_tag::CALLTOKEN, token);
        let bytes = list.to_bytes().unwrap();
        prop_assert_eq!(IeList::decode(&bytes).unwrap(), list);
    }

    #[test]
    fn unknown_ies_survive(tag in 60u8..=255, data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut list = IeList::new();
        list.append(Ie { tag, value: IeValue::Bin(data) });
        let bytes = list.to_bytes().unwrap();
        prop_assert_eq!(IeList::decode(&bytes).unwrap().to_bytes().unwrap(), bytes);
    }
}

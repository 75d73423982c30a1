//! Property tests for packet framing.

#![allow(clippy::unwrap_used, missing_docs)]

use bytes::BytesMut;
use proptest::prelude::*;
use tds_codec::{Message, MessageAssembler, Packet, PacketSequence, TdsCodec};
use tds_protocol::PacketType;
use tokio_util::codec::{Decoder, Encoder};

fn encode_all(packets: Vec<Packet>, codec: &mut TdsCodec) -> BytesMut {
    let mut wire = BytesMut::new();
    for packet in packets {
        codec.encode(packet, &mut wire).unwrap();
    }
    wire
}

proptest! {
    #[test]
    fn prop_framing_roundtrip(
        payload in proptest::collection::vec(any::<u8>(), 0..3000),
        max_packet_size in 16usize..700,
    ) {
        let mut codec = TdsCodec::new();
        let mut seq = PacketSequence::new();
        let message = Message::new(PacketType::SqlBatch, payload.clone());
        let mut wire = encode_all(message.into_packets(max_packet_size, &mut seq), &mut codec);

        let packets = codec.decode_all(&mut wire).unwrap();
        prop_assert!(wire.is_empty());

        let eom: Vec<bool> = packets.iter().map(Packet::is_end_of_message).collect();
        prop_assert_eq!(eom.iter().filter(|e| **e).count(), 1);
        prop_assert!(*eom.last().unwrap());
        prop_assert!(packets.iter().all(|p| p.total_size() <= max_packet_size));

        let ids: Vec<u8> = packets.iter().map(|p| p.header.packet_id).collect();
        prop_assert!(ids.windows(2).all(|w| w[1] == w[0].wrapping_add(1) || (w[0] == 255 && w[1] == 1)));

        let mut assembler = MessageAssembler::new();
        let mut reassembled = None;
        for packet in packets {
            reassembled = assembler.push(packet);
        }
        prop_assert_eq!(&reassembled.unwrap().payload[..], &payload[..]);
    }

    #[test]
    fn prop_byte_by_byte_decode(
        payload in proptest::collection::vec(any::<u8>(), 0..600),
    ) {
        let mut codec = TdsCodec::new();
        let mut seq = PacketSequence::new();
        let wire = encode_all(
            Message::new(PacketType::TabularResult, payload.clone()).into_packets(100, &mut seq),
            &mut codec,
        );

        let mut buf = BytesMut::new();
        let mut collected = Vec::new();
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                collected.extend_from_slice(&packet.payload);
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(collected, payload);
    }
}

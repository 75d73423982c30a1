//! Benchmarks for TDS header handling and token stream parsing.

#![allow(clippy::unwrap_used, missing_docs)]

use bytes::{BufMut, BytesMut};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tds_protocol::{
    PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, StreamingTokenParser,
    codec::write_b_varchar,
    token::{Done, DoneStatus},
};

fn bench_packet_header(c: &mut Criterion) {
    let header = PacketHeader::new(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 4096);
    let encoded = header.to_bytes();

    c.bench_function("packet_header_encode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
            header.encode(&mut buf);
            black_box(buf)
        })
    });

    c.bench_function("packet_header_decode", |b| {
        b.iter(|| {
            let mut cursor = &encoded[..];
            black_box(PacketHeader::decode(&mut cursor).unwrap())
        })
    });
}

/// A result set of `rows` rows with an INT and an NVARCHAR(64) column.
fn result_set(rows: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(0x81);
    buf.put_u16_le(2);
    buf.put_u32_le(0);
    buf.put_u16_le(0);
    buf.put_u8(0x38);
    write_b_varchar(&mut buf, "id");
    buf.put_u32_le(0);
    buf.put_u16_le(1);
    buf.put_u8(0xE7);
    buf.put_u16_le(128);
    buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
    write_b_varchar(&mut buf, "name");

    for i in 0..rows {
        buf.put_u8(0xD1);
        buf.put_i32_le(i as i32);
        let name: Vec<u16> = format!("customer-{i:06}").encode_utf16().collect();
        buf.put_u16_le((name.len() * 2) as u16);
        for unit in name {
            buf.put_u16_le(unit);
        }
    }

    buf.put_u8(0xFD);
    Done {
        status: DoneStatus::COUNT,
        cur_cmd: 0xC1,
        row_count: rows as u64,
    }
    .encode(&mut buf);
    buf
}

fn bench_token_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_parser");
    let data = result_set(1_000);
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("single_feed", |b| {
        b.iter(|| {
            let mut parser = StreamingTokenParser::new();
            black_box(parser.feed(&data, true).unwrap())
        })
    });

    // Packet-sized slices force tokens to straddle feeds.
    group.bench_function("packet_sized_feeds", |b| {
        b.iter(|| {
            let mut parser = StreamingTokenParser::new();
            let chunks: Vec<&[u8]> = data.chunks(4088).collect();
            let mut count = 0;
            for (i, chunk) in chunks.iter().enumerate() {
                count += parser.feed(chunk, i + 1 == chunks.len()).unwrap().tokens.len();
            }
            black_box(count)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_packet_header, bench_token_parser);
criterion_main!(benches);

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tds_protocol::StreamingTokenParser;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    /// Token stream bytes.
    data: Vec<u8>,
    /// Where packet boundaries fall.
    splits: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    // Feed the stream in arbitrary pieces; the parser must never panic and
    // must resume across every boundary.
    let mut parser = StreamingTokenParser::new();
    let mut rest = input.data.as_slice();
    for split in input.splits {
        let at = usize::from(split).min(rest.len());
        let (chunk, tail) = rest.split_at(at);
        if parser.feed(chunk, false).is_err() {
            return;
        }
        rest = tail;
    }
    let _ = parser.feed(rest, true);
});

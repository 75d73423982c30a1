#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tds_codec::TdsCodec;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes from the wire, split into as many packets as fit.
    let mut buf = BytesMut::from(data);
    let _ = TdsCodec::new().decode_all(&mut buf);
});

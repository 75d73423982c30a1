#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::token::EnvChange;

fuzz_target!(|data: &[u8]| {
    // EnvChange tokens carry database, packet size, collation and routing info
    let mut bytes = Bytes::copy_from_slice(data);
    let _ = EnvChange::decode(&mut bytes);
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::PreLogin;

fuzz_target!(|data: &[u8]| {
    // PRELOGIN responses come straight from the server.
    let _ = PreLogin::decode(data);
});

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_client::{ConnectionCore, Encrypt, PreloginRequest, Session};

fuzz_target!(|chunks: Vec<Vec<u8>>| {
    // Hostile server bytes against a connection waiting for PRELOGIN.
    let Ok(mut core) = ConnectionCore::new(Session::new("fuzz", 4096), None) else {
        return;
    };
    let (prelogin, _done) = PreloginRequest::new(Encrypt::Off);
    core.enqueue(Box::new(prelogin));
    let _ = core.take_outbound();
    for chunk in chunks {
        core.receive(Bytes::from(chunk));
        let _ = core.take_outbound();
    }
    core.transport_closed();
});

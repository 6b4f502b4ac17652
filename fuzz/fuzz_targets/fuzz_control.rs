#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_link::protocol::message::ControlMessage;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let type_id = u16::from_be_bytes([data[0], data[1]]);

    if let Ok(msg) = ControlMessage::from_body(type_id, &data[2..]) {
        // anything accepted must survive a roundtrip
        let body = msg.to_body().expect("accepted message re-encodes");
        assert_eq!(ControlMessage::from_body(type_id, &body).ok(), Some(msg));
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_link::core::envelope::Envelope;
use packet_link::core::frame::Frame;

const MAX_PAYLOAD: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    // Stream decoding: walk every frame in the buffer
    let mut offset = 0;
    while let Ok(Some((frame, used))) = Frame::decode(&data[offset..], MAX_PAYLOAD) {
        let _ = Envelope::from_bytes(frame.payload.clone());
        offset += used;
    }

    // Datagram decoding must agree with stream decoding on complete frames
    if let Ok(frame) = Frame::decode_datagram(data, MAX_PAYLOAD) {
        let bytes = frame.to_bytes(MAX_PAYLOAD).expect("decoded frame re-encodes");
        assert_eq!(&bytes[..], data);
    }
});

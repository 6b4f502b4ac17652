#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_link::core::payload::{decode_value, encode_value};
use packet_link::{FieldKind, Schema};

fuzz_target!(|data: &[u8]| {
    let schema = Schema::new()
        .field("id", FieldKind::U64)
        .field("name", FieldKind::String)
        .field("scores", FieldKind::sequence(FieldKind::F32))
        .field("tag", FieldKind::optional(FieldKind::U16))
        .field(
            "inner",
            FieldKind::Object(Schema::new().field("blob", FieldKind::Bytes)),
        );

    if let Ok(value) = decode_value(&schema, data) {
        let body = encode_value(&schema, &value).expect("decoded value re-encodes");
        assert_eq!(decode_value(&schema, &body).ok(), Some(value));
    }
});

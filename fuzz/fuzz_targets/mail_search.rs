#![no_main]
use libfuzzer_sys::fuzz_target;

use mail_search::{
    decoders::{base64, charsets::to_ucase_utf8_string, quoted_printable},
    parsers::parse,
    search::{decode_header, search},
    serialize::{deserialize, patch_header_size, peek_sizes, serialize},
    stream::Stream,
    MessageSize,
};

fuzz_target!(|data: &[u8]| {
    // raw bytes as a message
    if let Ok(tree) = parse(&mut Stream::new(data)) {
        let blob = serialize(&tree);
        let restored = deserialize(&blob).unwrap();
        assert_eq!(restored, tree);

        let _ = search("needle", None, &mut Stream::new(data), &tree, true);
    }

    // raw bytes as a cache blob
    if let Ok(tree) = deserialize(data) {
        let blob = serialize(&tree);
        assert_eq!(blob, data);

        let mut blob = blob;
        let _ = peek_sizes(&blob);
        let _ = patch_header_size(&mut blob, &MessageSize::new(4096, 4096, 0));
    }

    // raw bytes through every decoder
    let mut out = Vec::new();
    let _ = base64::decode(data, &mut out);
    out.clear();
    let _ = quoted_printable::decode(data, &mut out);
    let _ = to_ucase_utf8_string(None, data);
    let _ = to_ucase_utf8_string(Some("iso-8859-1"), data);
    decode_header(data, |_, _| true);
});

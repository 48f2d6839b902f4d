#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let increment = u16::from(selector % 4) + 1;
    let width = usize::from(increment);

    // Big-endian pairs, with a zero pair standing in for a missing word
    let words: Vec<Option<u16>> = rest
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .map(|w| (w != 0).then_some(w))
        .collect();
    let usable = words.len() - words.len() % width;
    let words = &words[..usable];

    let decoded = fieldgate::codec::decode_signed(words, increment);
    assert_eq!(decoded.len(), words.len());
    for value in decoded.iter().flatten() {
        let _ = fieldgate::codec::apply_scale(Some(*value), 0.1, -55.0, 2);
        if let Ok(encoded) = fieldgate::codec::encode_for_write(*value, increment) {
            assert_eq!(encoded.len(), width);
        }
    }
});

//! Value Codec
//!
//! Pure conversions between 16-bit register words and engineering values.
//! Multi-word values are big-endian across words: the first word of a group
//! is the most significant. Nothing here touches the bus.

use crate::error::{FieldgateError, Result};

/// Decode a word buffer into signed values, one slot per word.
///
/// Every `word_increment` words form one two's-complement value stored in the
/// group's leading slot; the remaining slots of the group are `None`. A group
/// containing a missing word decodes to `None`. Keeping one slot per word lets
/// callers index the result by `address - block_start`.
///
/// # Panics
///
/// Panics when `word_increment` is outside `1..=4` or the buffer length is not
/// a multiple of it. Both are caller bugs, not data errors.
pub fn decode_signed(words: &[Option<u16>], word_increment: u16) -> Vec<Option<i64>> {
    assert!(
        (1..=4).contains(&word_increment),
        "word increment {} outside 1..=4",
        word_increment
    );
    let inc = usize::from(word_increment);
    assert!(
        words.len() % inc == 0,
        "buffer of {} words is not a multiple of the word increment {}",
        words.len(),
        inc
    );

    let mut out = Vec::with_capacity(words.len());
    for group in words.chunks(inc) {
        out.push(decode_group(group));
        out.extend(std::iter::repeat_n(None, inc - 1));
    }
    out
}

fn decode_group(group: &[Option<u16>]) -> Option<i64> {
    let mut raw: u64 = 0;
    for word in group {
        raw = (raw << 16) | u64::from((*word)?);
    }
    let bits = 16 * group.len() as u32;
    let raw = i128::from(raw);
    let half = 1i128 << (bits - 1);
    let signed = if raw >= half { raw - (1i128 << bits) } else { raw };
    i64::try_from(signed).ok()
}

/// Scale a raw value into engineering units, rounded to `precision` decimals
pub fn apply_scale(raw: Option<i64>, scale: f64, bias: f64, precision: u32) -> Option<f64> {
    let value = round_to(raw? as f64 * scale + bias, precision);
    value.is_finite().then_some(value)
}

/// Round half away from zero to `precision` decimal places
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(15) as i32);
    (value * factor).round() / factor
}

/// Split a signed value into `word_increment` words, most significant first.
///
/// Negative values are written in two's complement across the full width.
/// Positive values may use the full unsigned range of the width.
pub fn encode_for_write(value: i64, word_increment: u16) -> Result<Vec<u16>> {
    if !(1..=4).contains(&word_increment) {
        return Err(FieldgateError::validation(
            "word_increment",
            format!("{} is outside 1..=4", word_increment),
        ));
    }
    let bits = 16 * u32::from(word_increment);
    let span = 1i128 << bits;
    let min = -(span / 2);
    let value = i128::from(value);
    if value < min || value >= span {
        return Err(FieldgateError::validation(
            "value",
            format!("{} does not fit in {} register(s)", value, word_increment),
        ));
    }

    let raw = if value < 0 { value + span } else { value };
    let words = (0..word_increment)
        .rev()
        .map(|i| ((raw >> (16 * u32::from(i))) & 0xFFFF) as u16)
        .collect();
    Ok(words)
}

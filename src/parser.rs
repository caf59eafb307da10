//! Positional decoding of raw frames.
//!
//! A frame is split on `:` with no escaping. Asking for a field past the end
//! yields `None`. Quantities come in two flavours: [`coerce_quantity`] mirrors
//! the permissive text-to-number coercion of the stream's original consumers
//! (bad text becomes `NaN`), [`parse_quantity`] refuses anything that is not a
//! finite number.

use crate::error::FrameError;
use crate::protocol::FIELD_DELIMITER;

pub const TOPIC_FIELD: usize = 0;
pub const SKU_FIELD: usize = 1;
pub const QUANTITY_FIELD: usize = 2;

/// Borrowed view over the fields of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fields<'a> {
    raw: &'a str,
}

/// Decodes `raw` into positional fields.
#[inline]
pub fn decode(raw: &str) -> Fields<'_> {
    Fields { raw }
}

impl<'a> Fields<'a> {
    pub fn raw(&self) -> &'a str {
        self.raw
    }

    pub fn get(&self, index: usize) -> Option<&'a str> {
        self.raw.split(FIELD_DELIMITER).nth(index)
    }

    /// Number of fields; never zero, an empty frame has one empty field.
    pub fn count(&self) -> usize {
        self.raw.split(FIELD_DELIMITER).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.raw.split(FIELD_DELIMITER)
    }

    pub fn topic(&self) -> &'a str {
        self.get(TOPIC_FIELD).unwrap_or_default()
    }

    pub fn sku(&self) -> Option<&'a str> {
        self.get(SKU_FIELD)
    }

    pub fn quantity(&self) -> Option<&'a str> {
        self.get(QUANTITY_FIELD)
    }
}

/// Raw-text prefix test used for the counted topics.
///
/// Case-sensitive and blind to field boundaries: `orders-archived:1` matches
/// prefix `orders`.
#[inline]
pub fn has_prefix(raw: &str, prefix: &str) -> bool {
    raw.starts_with(prefix)
}

/// Permissive coercion: absent → `NaN`, blank → `0`, otherwise decimal,
/// exponent, `0x`/`0o`/`0b` integers or signed `Infinity`; anything else is
/// `NaN`.
pub fn coerce_quantity(text: Option<&str>) -> f64 {
    let Some(text) = text else {
        return f64::NAN;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(value) = radix_literal(trimmed) {
        return value;
    }
    let decimal_chars = trimmed
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if !decimal_chars {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

fn radix_literal(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'0' {
        return None;
    }
    let radix = match bytes[1] {
        b'x' | b'X' => 16,
        b'o' | b'O' => 8,
        b'b' | b'B' => 2,
        _ => return None,
    };
    let digits = &text[2..];
    if digits.is_empty() {
        return Some(f64::NAN);
    }
    let mut value = 0.0f64;
    for ch in digits.chars() {
        match ch.to_digit(radix) {
            Some(d) => value = value * f64::from(radix) + f64::from(d),
            None => return Some(f64::NAN),
        }
    }
    Some(value)
}

/// Strict quantity parse for `topic`'s field.
pub fn parse_quantity(topic: &'static str, text: Option<&str>) -> Result<f64, FrameError> {
    let Some(text) = text else {
        return Err(FrameError::MalformedFrame(format!(
            "{topic} frame has no quantity field"
        )));
    };
    let value = if text.trim().is_empty() {
        f64::NAN
    } else {
        coerce_quantity(Some(text))
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FrameError::NumericParseFailure {
            field: topic,
            text: text.to_string(),
        })
    }
}

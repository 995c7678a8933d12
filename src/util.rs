use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

/// `prefix` + 16 hex digits of `millis` + 16 hex digits of `request_seq`.
#[inline]
pub(crate) fn format_response_id(prefix: &str, millis: u64, request_seq: u64) -> String {
    let mut out = String::with_capacity(prefix.len() + 32);
    out.push_str(prefix);
    push_u64_hex_16(&mut out, millis);
    push_u64_hex_16(&mut out, request_seq);
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary, for log fields.
#[must_use]
pub(crate) fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

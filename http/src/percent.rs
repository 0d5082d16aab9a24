//! Percent-decoding for URL components.

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(10 + c - b'a'),
        b'A'..=b'F' => Some(10 + c - b'A'),
        _ => None,
    }
}

/// Decode three-character `%HH` escapes. A malformed escape keeps the `%`
/// literally; `+` maps to space only when `plus_as_space` is set.
pub fn url_decode(encoded: &str, plus_as_space: bool) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(high), Some(low)) => {
                        out.push((high << 4) | low);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_passthrough() {
        assert_eq!(url_decode("hello", false), "hello");
        assert_eq!(url_decode("", false), "");
    }

    #[test]
    fn test_hex_escapes() {
        assert_eq!(url_decode("a%20b", false), "a b");
        assert_eq!(url_decode("%2Fpath%2f", false), "/path/");
        assert_eq!(url_decode("%E4%B8%AD", false), "中");
    }

    #[test]
    fn test_malformed_escape_keeps_percent() {
        assert_eq!(url_decode("100%", false), "100%");
        assert_eq!(url_decode("%zz", false), "%zz");
        assert_eq!(url_decode("%4", false), "%4");
    }

    #[test]
    fn test_plus_only_when_configured() {
        assert_eq!(url_decode("a+b", false), "a+b");
        assert_eq!(url_decode("a+b", true), "a b");
    }
}

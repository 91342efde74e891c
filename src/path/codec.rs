//! Reversible mapping between [`Path`]s and backend-native key strings
//!
//! Each backend declares its own separator and reserved characters. Encoding
//! escapes the escape character first and the reserved characters second, so
//! a literal separator inside a segment never collides with a real nesting
//! boundary and `decode(encode(p)) == p` for every path.

use super::Path;
use serde_json::{Map, Value};

/// Escape character shared by the built-in codecs
pub const ESCAPE: char = '~';

/// Backend-specific path codec
pub trait KeyCodec: Send + Sync {
    /// Character joining encoded segments
    fn separator(&self) -> char;

    /// Escape one segment so it contains no separator or reserved character
    fn encode_segment(&self, segment: &str) -> String;

    /// Reverse [`KeyCodec::encode_segment`]
    fn decode_segment(&self, token: &str) -> String;

    /// Encode a whole path; the root encodes to the empty string
    fn encode(&self, path: &Path) -> String {
        let separator = self.separator().to_string();
        path.segments()
            .iter()
            .map(|segment| self.encode_segment(segment))
            .collect::<Vec<_>>()
            .join(&separator)
    }

    /// Decode a key produced by [`KeyCodec::encode`]
    fn decode(&self, key: &str) -> Path {
        if key.is_empty() {
            return Path::root();
        }
        key.split(self.separator())
            .map(|token| self.decode_segment(token))
            .collect()
    }

    /// Encode every map key of a value, recursively
    fn encode_keys(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (self.encode_segment(&k), self.encode_keys(v)))
                    .collect::<Map<String, Value>>(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.encode_keys(v)).collect()),
            other => other,
        }
    }

    /// Decode every map key of a value, recursively
    fn decode_keys(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (self.decode_segment(&k), self.decode_keys(v)))
                    .collect::<Map<String, Value>>(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.decode_keys(v)).collect()),
            other => other,
        }
    }
}

/// Codec using short `~N` tokens for a small reserved set.
///
/// `~0` is the escape character, `~1` the separator and `~2`, `~3`, ... the
/// entries of `reserved` in order. An empty segment encodes as a lone `~`.
/// Reserved characters must not be ASCII alphanumerics.
#[derive(Debug, Clone, Copy)]
pub struct SeparatorCodec {
    /// Nesting separator
    pub separator: char,
    /// Additional characters the backend forbids inside a segment
    pub reserved: &'static [char],
}

/// Flat-table keys: `.` separates, `$` is reserved
pub const TABLE_CODEC: SeparatorCodec = SeparatorCodec {
    separator: '.',
    reserved: &['$'],
};

/// Document field paths: `.` separates, `$` and NUL are forbidden in field names
pub const DOCUMENT_CODEC: SeparatorCodec = SeparatorCodec {
    separator: '.',
    reserved: &['$', '\0'],
};

/// JSON-path identifiers for the native tree store
pub const JSON_PATH_CODEC: HexCodec = HexCodec { separator: '.' };

impl SeparatorCodec {
    fn token(index: usize) -> char {
        // Index 0 is the escape itself, 1 the separator
        std::char::from_digit(index as u32, 36).unwrap_or('z')
    }

    fn lookup(&self, token: char) -> Option<char> {
        match token.to_digit(36)? as usize {
            0 => Some(ESCAPE),
            1 => Some(self.separator),
            n => self.reserved.get(n - 2).copied(),
        }
    }
}

impl KeyCodec for SeparatorCodec {
    fn separator(&self) -> char {
        self.separator
    }

    fn encode_segment(&self, segment: &str) -> String {
        if segment.is_empty() {
            return ESCAPE.to_string();
        }
        // Escape character first so later tokens stay unambiguous
        let mut out = segment.replace(ESCAPE, &format!("{ESCAPE}{}", Self::token(0)));
        out = out.replace(self.separator, &format!("{ESCAPE}{}", Self::token(1)));
        for (i, reserved) in self.reserved.iter().enumerate() {
            out = out.replace(*reserved, &format!("{ESCAPE}{}", Self::token(i + 2)));
        }
        out
    }

    fn decode_segment(&self, token: &str) -> String {
        if token.len() == ESCAPE.len_utf8() && token.starts_with(ESCAPE) {
            return String::new();
        }
        let mut out = String::with_capacity(token.len());
        let mut chars = token.chars();
        while let Some(c) = chars.next() {
            if c != ESCAPE {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some(t) => match self.lookup(t) {
                    Some(original) => out.push(original),
                    None => {
                        out.push(ESCAPE);
                        out.push(t);
                    }
                },
                None => out.push(ESCAPE),
            }
        }
        out
    }
}

/// Codec replacing every character outside `[A-Za-z0-9_]` with a fixed-width
/// `~xxxxxx` hexadecimal code point token. Used where the reserved set is
/// large (spaces, brackets, quotes, `$`, `@`, `*`, ...).
#[derive(Debug, Clone, Copy)]
pub struct HexCodec {
    /// Nesting separator
    pub separator: char,
}

const HEX_WIDTH: usize = 6;

impl HexCodec {
    fn is_safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }
}

impl KeyCodec for HexCodec {
    fn separator(&self) -> char {
        self.separator
    }

    fn encode_segment(&self, segment: &str) -> String {
        if segment.is_empty() {
            return ESCAPE.to_string();
        }
        let mut out = String::with_capacity(segment.len());
        for c in segment.chars() {
            if Self::is_safe(c) {
                out.push(c);
            } else {
                out.push_str(&format!("{ESCAPE}{:0width$x}", c as u32, width = HEX_WIDTH));
            }
        }
        out
    }

    fn decode_segment(&self, token: &str) -> String {
        if token.len() == ESCAPE.len_utf8() && token.starts_with(ESCAPE) {
            return String::new();
        }
        let mut out = String::with_capacity(token.len());
        let mut rest = token;
        while let Some(pos) = rest.find(ESCAPE) {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + ESCAPE.len_utf8()..];
            let decoded = after
                .get(..HEX_WIDTH)
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .and_then(char::from_u32);
            match decoded {
                Some(c) => {
                    out.push(c);
                    rest = &after[HEX_WIDTH..];
                }
                None => {
                    out.push(ESCAPE);
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use proptest::prelude::*;
    use serde_json::json;

    fn codecs() -> Vec<Box<dyn KeyCodec>> {
        vec![Box::new(TABLE_CODEC), Box::new(DOCUMENT_CODEC), Box::new(JSON_PATH_CODEC)]
    }

    #[test]
    fn test_separator_tokens() {
        assert_eq!(TABLE_CODEC.encode(&path!["a.b", "c"]), "a~1b.c");
        assert_eq!(TABLE_CODEC.encode(&path!["a~1b"]), "a~01b");
        assert_eq!(TABLE_CODEC.encode(&path!["$x"]), "~2x");
        assert_eq!(DOCUMENT_CODEC.encode(&path!["$set", "a\0"]), "~2set.a~3");
        assert_eq!(TABLE_CODEC.encode(&Path::root()), "");
        assert_eq!(TABLE_CODEC.encode(&path![""]), "~");
    }

    #[test]
    fn test_hex_tokens() {
        assert_eq!(JSON_PATH_CODEC.encode_segment("a b"), "a~000020b");
        assert_eq!(JSON_PATH_CODEC.encode_segment("[0]"), "~00005b0~00005d");
        assert_eq!(JSON_PATH_CODEC.encode_segment("plain_1"), "plain_1");
        assert_eq!(JSON_PATH_CODEC.decode_segment("~01f600"), "\u{1f600}");
    }

    #[test]
    fn test_literal_separator_does_not_merge_with_nesting() {
        for codec in codecs() {
            let literal = codec.encode(&path!["a.b"]);
            let nested = codec.encode(&path!["a", "b"]);
            assert_ne!(literal, nested);
            assert_eq!(codec.decode(&literal), path!["a.b"]);
            assert_eq!(codec.decode(&nested), path!["a", "b"]);
        }
    }

    #[test]
    fn test_empty_segments_round_trip() {
        for codec in codecs() {
            for p in [Path::root(), path![""], path!["", ""], path!["a", ""], path!["", "a"]] {
                assert_eq!(codec.decode(&codec.encode(&p)), p);
            }
        }
    }

    #[test]
    fn test_key_rewriting_round_trips() {
        let value = json!({"a.b": {"$c": [ {"d e": 1} ]}, "~": null});
        for codec in codecs() {
            let encoded = codec.encode_keys(value.clone());
            let keys: Vec<String> = encoded.as_object().unwrap().keys().cloned().collect();
            assert!(keys.iter().all(|k| !k.contains('.')));
            assert_eq!(codec.decode_keys(encoded), value);
        }
    }

    fn segment_strategy() -> impl Strategy<Value = String> {
        // Bias towards the characters every codec has to escape
        prop::collection::vec(
            prop_oneof![
                Just('.'),
                Just('~'),
                Just('$'),
                Just('\0'),
                Just(' '),
                Just('['),
                Just(']'),
                Just('0'),
                Just('1'),
                any::<char>(),
            ],
            0..8,
        )
        .prop_map(|chars| chars.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_codecs_are_bijective(segments in prop::collection::vec(segment_strategy(), 0..6)) {
            let p = Path::from_segments(segments);
            for codec in codecs() {
                let key = codec.encode(&p);
                prop_assert_eq!(codec.decode(&key), p.clone());
            }
        }

        #[test]
        fn prop_encoded_segments_avoid_separator(segment in segment_strategy()) {
            for codec in codecs() {
                prop_assert!(!codec.encode_segment(&segment).contains(codec.separator()));
            }
        }
    }
}

//! TXT record codec: `key=value` byte strings to/from an ordered key/value list.

/// A value that can be encoded into a TXT entry. Mirrors the "string, number,
/// boolean, or raw bytes" union in the spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxtValue {
    Str(String),
    Number(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl TxtValue {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            TxtValue::Str(s) => s.into_bytes(),
            TxtValue::Number(n) => n.to_string().into_bytes(),
            TxtValue::Bool(b) => b.to_string().into_bytes(),
            TxtValue::Bytes(b) => b,
        }
    }
}

impl From<&str> for TxtValue {
    fn from(s: &str) -> Self {
        TxtValue::Str(s.to_owned())
    }
}
impl From<String> for TxtValue {
    fn from(s: String) -> Self {
        TxtValue::Str(s)
    }
}

/// Decoded TXT value: a lossily-decoded string view, or the authoritative raw
/// bytes, depending on the caller's `binary` choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxtDecoded {
    Str(String),
    Bytes(Vec<u8>),
}

/// Encode an ordered key/value map into `"key=value"` byte strings, in
/// insertion order. Callers who need map semantics keep the ordering
/// themselves (e.g. a `Vec<(String, TxtValue)>`) since the wire format does
/// not care, and spec S2's record output is order-sensitive.
pub fn encode(entries: &[(String, TxtValue)]) -> Vec<Vec<u8>> {
    entries
        .iter()
        .map(|(k, v)| {
            let mut out = k.as_bytes().to_vec();
            out.push(b'=');
            out.extend(v.clone().into_bytes());
            out
        })
        .collect()
}

/// Decode a list of TXT byte strings into ordered key/value pairs. Entries
/// with no `=` get an empty value; entries that would produce an empty key
/// are discarded.
pub fn decode(items: &[Vec<u8>], binary: bool) -> Vec<(String, TxtDecoded)> {
    items
        .iter()
        .filter_map(|item| {
            let eq = item.iter().position(|&b| b == b'=');
            let (key_bytes, value_bytes): (&[u8], &[u8]) = match eq {
                Some(i) => (&item[..i], &item[i + 1..]),
                None => (&item[..], &[][..]),
            };
            if key_bytes.is_empty() {
                return None;
            }
            let key = String::from_utf8_lossy(key_bytes).into_owned();
            let value = if binary {
                TxtDecoded::Bytes(value_bytes.to_vec())
            } else {
                TxtDecoded::Str(String::from_utf8_lossy(value_bytes).into_owned())
            };
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_key_equals_value() {
        let entries = vec![("foo".to_string(), TxtValue::from("bar"))];
        let encoded = encode(&entries);
        assert_eq!(encoded, vec![b"foo=bar".to_vec()]);
    }

    #[test]
    fn encodes_non_string_values_by_stringifying() {
        let entries = vec![
            ("n".to_string(), TxtValue::Number(42)),
            ("b".to_string(), TxtValue::Bool(true)),
        ];
        let encoded = encode(&entries);
        assert_eq!(encoded, vec![b"n=42".to_vec(), b"b=true".to_vec()]);
    }

    #[test]
    fn round_trips_string_map() {
        let entries = vec![
            ("foo".to_string(), TxtValue::from("bar")),
            ("baz".to_string(), TxtValue::from("qux")),
        ];
        let encoded = encode(&entries);
        let decoded = decode(&encoded, false);
        let as_strings: Vec<(String, String)> = decoded
            .into_iter()
            .map(|(k, v)| match v {
                TxtDecoded::Str(s) => (k, s),
                TxtDecoded::Bytes(_) => unreachable!(),
            })
            .collect();
        assert_eq!(
            as_strings,
            vec![("foo".to_string(), "bar".to_string()), ("baz".to_string(), "qux".to_string())]
        );
    }

    #[test]
    fn missing_equals_yields_empty_value() {
        let decoded = decode(&[b"flag".to_vec()], false);
        assert_eq!(decoded, vec![("flag".to_string(), TxtDecoded::Str(String::new()))]);
    }

    #[test]
    fn empty_key_is_discarded() {
        let decoded = decode(&[b"=value".to_vec()], false);
        assert!(decoded.is_empty());
    }

    #[test]
    fn binary_mode_preserves_raw_bytes() {
        let decoded = decode(&[b"foo=\xff\xfe".to_vec()], true);
        assert_eq!(decoded, vec![("foo".to_string(), TxtDecoded::Bytes(vec![0xff, 0xfe]))]);
    }
}

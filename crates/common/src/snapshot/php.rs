//! Reader for PHP's `serialize()` format
//!
//! Source installations store some values (post type definitions, array
//! metadata) as PHP-serialized strings. Only the scalar and array forms
//! are understood; objects and references make the input count as
//! "not serialized", which is how source installations treat
//! anything they cannot unserialize.

/// Deepest array nesting accepted before the input counts as unserializable
const MAX_DEPTH: usize = 512;

/// A decoded PHP value
#[derive(Debug, Clone, PartialEq)]
pub enum PhpValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered key/value pairs; keys are `Int` or `Str`
    Array(Vec<(PhpValue, PhpValue)>),
}

impl PhpValue {
    /// Look up a string key in an array value
    pub fn get(&self, key: &str) -> Option<&PhpValue> {
        match self {
            PhpValue::Array(entries) => entries.iter().find_map(|(k, v)| match k {
                PhpValue::Str(k) if k == key => Some(v),
                PhpValue::Int(i) if key.parse::<i64>().ok() == Some(*i) => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PhpValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PhpValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Decode a serialized value, or `None` when `input` is not one
pub fn unserialize(input: &str) -> Option<PhpValue> {
    let input = input.trim();
    let mut parser = Parser {
        input: input.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    (parser.pos == parser.input.len()).then_some(value)
}

/// Whether `input` is a complete PHP-serialized value
pub fn is_serialized(input: &str) -> bool {
    unserialize(input).is_some()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn value(&mut self) -> Option<PhpValue> {
        let tag = *self.input.get(self.pos)?;
        match tag {
            b'N' => {
                self.expect(b"N;")?;
                Some(PhpValue::Null)
            }
            b'b' => {
                self.expect(b"b:")?;
                match self.until(b';')? {
                    "0" => Some(PhpValue::Bool(false)),
                    "1" => Some(PhpValue::Bool(true)),
                    _ => None,
                }
            }
            b'i' => {
                self.expect(b"i:")?;
                self.until(b';')?.parse().ok().map(PhpValue::Int)
            }
            b'd' => {
                self.expect(b"d:")?;
                let raw = self.until(b';')?;
                let float = match raw {
                    "INF" => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    "NAN" => f64::NAN,
                    other => other.parse().ok()?,
                };
                Some(PhpValue::Float(float))
            }
            b's' => {
                self.expect(b"s:")?;
                let len: usize = self.until(b':')?.parse().ok()?;
                self.expect(b"\"")?;
                // Length is in bytes, not characters
                let end = self.pos.checked_add(len)?;
                let bytes = self.input.get(self.pos..end)?;
                let text = std::str::from_utf8(bytes).ok()?.to_string();
                self.pos = end;
                self.expect(b"\";")?;
                Some(PhpValue::Str(text))
            }
            b'a' => {
                self.expect(b"a:")?;
                let count: usize = self.until(b':')?.parse().ok()?;
                self.expect(b"{")?;
                if self.depth >= MAX_DEPTH {
                    return None;
                }
                self.depth += 1;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let key = self.value()?;
                    if !matches!(key, PhpValue::Int(_) | PhpValue::Str(_)) {
                        return None;
                    }
                    let value = self.value()?;
                    entries.push((key, value));
                }
                self.expect(b"}")?;
                self.depth -= 1;
                Some(PhpValue::Array(entries))
            }
            _ => None,
        }
    }

    fn expect(&mut self, token: &[u8]) -> Option<()> {
        if self.input.get(self.pos..self.pos + token.len())? == token {
            self.pos += token.len();
            Some(())
        } else {
            None
        }
    }

    /// Read up to `delim` and consume it
    fn until(&mut self, delim: u8) -> Option<&'a str> {
        let input: &'a [u8] = self.input;
        let rest = input.get(self.pos..)?;
        let offset = rest.iter().position(|&b| b == delim)?;
        let text = std::str::from_utf8(&rest[..offset]).ok()?;
        self.pos += offset + 1;
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_type_definition() {
        let raw = r#"a:3:{s:3:"key";s:19:"post_type_6650a1b2c";s:9:"post_type";s:6:"course";s:6:"active";b:1;}"#;
        let value = unserialize(raw).unwrap();
        assert_eq!(value.get("post_type").and_then(PhpValue::as_str), Some("course"));
        assert_eq!(value.get("active"), Some(&PhpValue::Bool(true)));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(unserialize("i:42;"), Some(PhpValue::Int(42)));
        assert_eq!(unserialize("N;"), Some(PhpValue::Null));
        assert_eq!(unserialize("d:1.5;"), Some(PhpValue::Float(1.5)));
        assert_eq!(unserialize(r#"s:2:"42";"#), Some(PhpValue::Str("42".into())));
    }

    #[test]
    fn test_string_length_counts_bytes() {
        let value = unserialize(r#"s:5:"café";"#).unwrap();
        assert_eq!(value.as_str(), Some("café"));
    }

    #[test]
    fn test_integer_keys() {
        let value = unserialize(r#"a:2:{i:0;s:1:"a";i:1;s:1:"b";}"#).unwrap();
        assert_eq!(value.get("1").and_then(PhpValue::as_str), Some("b"));
    }

    #[test]
    fn test_plain_text_is_not_serialized() {
        assert!(!is_serialized("Hello world"));
        assert!(!is_serialized("42"));
        assert!(!is_serialized(r#"s:10:"short";"#));
        assert!(!is_serialized("i:42;trailing"));
        assert!(!is_serialized(r#"O:8:"stdClass":0:{}"#));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let hostile = format!("{};", "a:1:{i:0;".repeat(200_000));
        assert_eq!(unserialize(&hostile), None);

        let mut nested = "N;".to_string();
        for _ in 0..MAX_DEPTH {
            nested = format!("a:1:{{i:0;{}}}", nested);
        }
        assert!(is_serialized(&nested));
        assert!(!is_serialized(&format!("a:1:{{i:0;{}}}", nested)));
    }
}

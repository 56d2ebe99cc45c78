//! Key/value dictionary wire codec.
//!
//! Network configurations travel between controller and member as a flat
//! text dictionary: one `key=value` pair per line, with a small escape
//! alphabet so binary values survive. Keys are kept sorted so the same
//! logical config always serializes to the same bytes (the chunk signatures
//! cover raw dictionary bytes).

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors from dictionary decoding.
#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("dictionary exceeds maximum size of {0} bytes")]
    TooLarge(usize),

    #[error("truncated escape sequence")]
    TruncatedEscape,

    #[error("missing '=' separator on line {0}")]
    MissingSeparator(usize),
}

/// Hard ceiling on serialized dictionary size. Large configs are chunked at
/// the packet layer, but an unbounded dictionary is always a bug.
pub const DICTIONARY_MAX_SIZE: usize = 1 << 20;

/// An ordered string-keyed dictionary with binary-safe values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Dictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set a binary value.
    pub fn set_bytes(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set_bytes(key, value.as_bytes().to_vec());
    }

    /// Set an integer value (lowercase hex, no prefix).
    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set_str(key, &format!("{:x}", value));
    }

    /// Set a boolean value ("1" / "0").
    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set_str(key, if value { "1" } else { "0" });
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Get a binary value.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Get a value as UTF-8, if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_bytes(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Get a hex integer value.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        u64::from_str_radix(self.get_str(key)?, 16).ok()
    }

    /// Get a boolean value; anything other than "1" is false.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_str(key).map(|s| s == "1")
    }

    /// Serialize to the line-oriented wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            for &b in value {
                match b {
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    0 => out.extend_from_slice(b"\\0"),
                    b'=' => out.extend_from_slice(b"\\e"),
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    _ => out.push(b),
                }
            }
            out.push(b'\n');
        }
        out
    }

    /// Parse the line-oriented wire form.
    ///
    /// Unknown escape codes decode to the escaped byte itself; blank lines
    /// are skipped.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DictionaryError> {
        if data.len() > DICTIONARY_MAX_SIZE {
            return Err(DictionaryError::TooLarge(DICTIONARY_MAX_SIZE));
        }
        let mut dict = Dictionary::new();
        for (line_no, line) in data.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let eq = line
                .iter()
                .position(|&b| b == b'=')
                .ok_or(DictionaryError::MissingSeparator(line_no + 1))?;
            let key = String::from_utf8_lossy(&line[..eq]).into_owned();

            let mut value = Vec::new();
            let mut i = eq + 1;
            while i < line.len() {
                if line[i] == b'\\' {
                    let code = *line.get(i + 1).ok_or(DictionaryError::TruncatedEscape)?;
                    value.push(match code {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b'0' => 0,
                        b'e' => b'=',
                        other => other,
                    });
                    i += 2;
                } else {
                    value.push(line[i]);
                    i += 1;
                }
            }
            dict.entries.insert(key, value);
        }
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_plain() {
        let mut d = Dictionary::new();
        d.set_str("n", "home-lan");
        d.set_u64("nwid", 0x8056_c2e2_1c00_0001);
        d.set_bool("p", true);

        let parsed = Dictionary::from_bytes(&d.to_bytes()).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(parsed.get_str("n"), Some("home-lan"));
        assert_eq!(parsed.get_u64("nwid"), Some(0x8056_c2e2_1c00_0001));
        assert_eq!(parsed.get_bool("p"), Some(true));
    }

    #[test]
    fn test_round_trip_binary() {
        let mut d = Dictionary::new();
        let blob: Vec<u8> = vec![0, b'\n', b'\r', b'=', b'\\', 0xff, 7];
        d.set_bytes("C", blob.clone());
        let parsed = Dictionary::from_bytes(&d.to_bytes()).unwrap();
        assert_eq!(parsed.get_bytes("C"), Some(blob.as_slice()));
    }

    #[test]
    fn test_deterministic_serialization() {
        let mut a = Dictionary::new();
        a.set_str("b", "2");
        a.set_str("a", "1");
        let mut b = Dictionary::new();
        b.set_str("a", "1");
        b.set_str("b", "2");
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_missing_separator() {
        assert!(matches!(
            Dictionary::from_bytes(b"novalue\n"),
            Err(DictionaryError::MissingSeparator(1))
        ));
    }

    #[test]
    fn test_empty() {
        let d = Dictionary::new();
        assert!(d.is_empty());
        assert!(d.to_bytes().is_empty());
        assert!(Dictionary::from_bytes(b"").unwrap().is_empty());
    }
}

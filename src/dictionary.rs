//! Escaped key=value dictionary carried in HELLO metadata sections.
//!
//! Entries are encoded one per line as `key=value\n`. Values are arbitrary
//! bytes; the bytes `\0`, `\r`, `\n`, `=` and `\\` are backslash-escaped so
//! the framing survives binary content. Keys sort deterministically in the
//! encoded form.

use std::collections::BTreeMap;

/// Binary-safe key=value dictionary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_bytes(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set_bytes(key, value.as_bytes().to_vec());
    }

    /// Integers are stored as lowercase hex strings.
    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set_bytes(key, format!("{:x}", value).into_bytes());
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_bytes(key).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        u64::from_str_radix(self.get_str(key)?, 16).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in &self.entries {
            escape_into(k.as_bytes(), &mut out);
            out.push(b'=');
            escape_into(v, &mut out);
            out.push(b'\n');
        }
        out
    }

    /// Decode an encoded dictionary. `None` on framing violations.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut entries = BTreeMap::new();
        let mut key: Option<Vec<u8>> = None;
        let mut current = Vec::new();
        let mut bytes = data.iter().copied();
        while let Some(b) = bytes.next() {
            match b {
                b'\\' => {
                    let escaped = bytes.next()?;
                    current.push(match escaped {
                        b'0' => 0,
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b'e' => b'=',
                        b'\\' => b'\\',
                        _ => return None,
                    });
                }
                b'=' => {
                    if key.is_some() {
                        return None;
                    }
                    key = Some(std::mem::take(&mut current));
                }
                b'\n' => {
                    let k = key.take()?;
                    let k = String::from_utf8(k).ok()?;
                    entries.insert(k, std::mem::take(&mut current));
                }
                _ => current.push(b),
            }
        }
        // Trailing bytes without a terminating newline are a framing error.
        if key.is_some() || !current.is_empty() {
            return None;
        }
        Some(Self { entries })
    }
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        match b {
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'=' => out.extend_from_slice(b"\\e"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_binary_values() {
        let mut d = Dictionary::new();
        d.set_str("name", "node-1");
        d.set_bytes("blob", vec![0u8, b'=', b'\n', b'\r', b'\\', 0xff]);
        d.set_u64("clock", 0x1234_5678_9abc);

        let encoded = d.encode();
        let decoded = Dictionary::decode(&encoded).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.get_u64("clock"), Some(0x1234_5678_9abc));
        assert_eq!(decoded.get_str("name"), Some("node-1"));
    }

    #[test]
    fn empty_dictionary_round_trips() {
        let d = Dictionary::new();
        assert!(d.encode().is_empty());
        assert_eq!(Dictionary::decode(&[]).unwrap(), d);
    }

    #[test]
    fn rejects_malformed_framing() {
        assert!(Dictionary::decode(b"no-separator\n").is_none());
        assert!(Dictionary::decode(b"key=value").is_none());
        assert!(Dictionary::decode(b"a=b=c\n").is_none());
        assert!(Dictionary::decode(b"key=bad\\q\n").is_none());
    }
}

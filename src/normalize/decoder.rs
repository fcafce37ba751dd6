//! Byte chunk decoders feeding the normalizer.

/// Turns raw response bytes into text deltas. Implementations buffer partial
/// input between calls; `flush` drains whatever is left at end of stream.
pub trait ChunkDecoder: Send {
    fn decode(&mut self, bytes: &[u8]) -> String;

    fn flush(&mut self) -> String;
}

/// Plain UTF-8, carrying multi-byte sequences split across chunks
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkDecoder for Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: from_utf8 validated this prefix
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more bytes
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    fn flush(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }
}

/// Newline-delimited JSON; text is taken from the first pointer that holds a
/// string. Lines that are not JSON, or flagged by a `skip_when_true` pointer,
/// contribute nothing.
pub struct NdjsonDecoder {
    utf8: Utf8Decoder,
    line: String,
    text_pointers: Vec<String>,
    skip_when_true: Vec<String>,
}

impl NdjsonDecoder {
    pub fn new(text_pointers: Vec<String>) -> Self {
        Self {
            utf8: Utf8Decoder::new(),
            line: String::new(),
            text_pointers,
            skip_when_true: Vec::new(),
        }
    }

    pub fn skip_when_true(mut self, pointers: Vec<String>) -> Self {
        self.skip_when_true = pointers;
        self
    }

    fn extract(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        if self
            .skip_when_true
            .iter()
            .any(|p| value.pointer(p).and_then(|v| v.as_bool()) == Some(true))
        {
            return None;
        }
        self.text_pointers
            .iter()
            .find_map(|p| value.pointer(p).and_then(|v| v.as_str()))
            .map(str::to_string)
    }

    fn drain_lines(&mut self) -> String {
        let mut out = String::new();
        while let Some(idx) = self.line.find('\n') {
            let line: String = self.line.drain(..=idx).collect();
            if let Some(text) = self.extract(&line) {
                out.push_str(&text);
            }
        }
        out
    }
}

impl ChunkDecoder for NdjsonDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let text = self.utf8.decode(bytes);
        self.line.push_str(&text);
        self.drain_lines()
    }

    fn flush(&mut self) -> String {
        let tail = self.utf8.flush();
        self.line.push_str(&tail);
        let mut out = self.drain_lines();
        let last = std::mem::take(&mut self.line);
        if let Some(text) = self.extract(&last) {
            out.push_str(&text);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_split_multibyte() {
        let bytes = "héllo 世界".as_bytes();
        let mut d = Utf8Decoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&d.decode(std::slice::from_ref(b)));
        }
        out.push_str(&d.flush());
        assert_eq!(out, "héllo 世界");
    }

    #[test]
    fn test_utf8_invalid_byte_replaced() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode(&[b'a', 0xff, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_ndjson_lines_across_chunks() {
        let mut d = NdjsonDecoder::new(vec![
            "/result/response/token".to_string(),
            "/contentDelta".to_string(),
        ]);
        let mut out = d.decode(br#"{"result":{"response":{"token":"Hel"}}}"#);
        assert_eq!(out, "");
        out.push_str(&d.decode(b"\n{\"result\":{\"resp"));
        out.push_str(&d.decode(b"onse\":{\"token\":\"lo\"}}}\nnot json\n"));
        out.push_str(&d.decode(br#"{"contentDelta":"!"}"#));
        out.push_str(&d.flush());
        assert_eq!(out, "Hello!");
    }

    #[test]
    fn test_ndjson_skip_flag() {
        let mut d = NdjsonDecoder::new(vec!["/result/response/token".to_string()])
            .skip_when_true(vec!["/result/response/isThinking".to_string()]);
        let input = concat!(
            r#"{"result":{"response":{"token":"hmm","isThinking":true}}}"#,
            "\n",
            r#"{"result":{"response":{"token":"ok","isThinking":false}}}"#,
            "\n"
        );
        assert_eq!(d.decode(input.as_bytes()), "ok");
    }
}

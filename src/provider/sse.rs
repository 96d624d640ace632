/// Incremental framing for server-sent-event bodies.
///
/// Buffers raw bytes and yields the payload of each complete `data:` line.
/// All three vendors stream line-delimited SSE; only the payload shape
/// differs, so framing lives here and parsing stays in each adapter.
///
/// The buffer holds bytes, not a `String`: a network read can end in the
/// middle of a multi-byte UTF-8 character, so decoding happens per
/// complete line (`\n` is never part of a multi-byte sequence).
pub(crate) struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed a network chunk, returning every complete `data:` payload it
    /// finished. Partial trailing lines stay buffered for the next chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                // event:/id:/comment lines and blank separators
                continue;
            };
            let data = data.trim();
            if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
        payloads
    }
}

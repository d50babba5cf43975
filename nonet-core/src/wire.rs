//! Framing: newline-terminated UTF-8 lines. No length prefix, no checksum.

/// Longest accepted line, terminator excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Encode `text` as one line: the bytes of `text` followed by `\n`.
pub fn encode_line(text: &str) -> Result<Vec<u8>, LineEncodeError> {
    if text.contains(['\n', '\r']) {
        return Err(LineEncodeError::LineBreak);
    }
    if text.len() > MAX_LINE_LEN {
        return Err(LineEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.push(b'\n');
    Ok(out)
}

/// Error encoding text into a line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineEncodeError {
    #[error("text contains a line break")]
    LineBreak,
    #[error("line too large")]
    TooLarge,
}

/// Decode one line from the front of `bytes`. Returns the line (terminator and a trailing
/// `\r` stripped) and the number of bytes consumed.
/// Returns `NeedMore` if no terminator is present yet; the caller reads more and retries.
pub fn decode_line(bytes: &[u8]) -> Result<(String, usize), LineDecodeError> {
    let window = &bytes[..bytes.len().min(MAX_LINE_LEN + 2)];
    let Some(pos) = window.iter().position(|&b| b == b'\n') else {
        if bytes.len() > MAX_LINE_LEN + 1 {
            return Err(LineDecodeError::TooLarge);
        }
        return Err(LineDecodeError::NeedMore);
    };
    let line = strip_cr(&bytes[..pos]);
    if line.len() > MAX_LINE_LEN {
        return Err(LineDecodeError::TooLarge);
    }
    let text = std::str::from_utf8(line).map_err(LineDecodeError::Utf8)?;
    Ok((text.to_string(), pos + 1))
}

/// Decode a final unterminated line left in the buffer at end-of-stream.
/// Returns `None` for an empty remainder.
pub fn decode_trailing(bytes: &[u8]) -> Result<Option<String>, LineDecodeError> {
    let line = strip_cr(bytes);
    if line.is_empty() {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(LineDecodeError::TooLarge);
    }
    let text = std::str::from_utf8(line).map_err(LineDecodeError::Utf8)?;
    Ok(Some(text.to_string()))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Error decoding a line (need more bytes, too large, or not UTF-8).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("line too large")]
    TooLarge,
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

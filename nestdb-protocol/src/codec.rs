//! Line-delimited JSON codec.
//!
//! Every record is one JSON object terminated by `\n`. Blank lines and a
//! trailing `\r` are tolerated.

use crate::error::ProtocolError;
use crate::MAX_LINE_SIZE;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as a JSON line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Incremental decoder for line-delimited JSON.
pub struct LineDecoder {
    buffer: BytesMut,
    max_line: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_line,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next record.
    ///
    /// A malformed line is consumed before its error is returned, so the
    /// caller can log it and keep decoding.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > self.max_line {
                    let size = self.buffer.len();
                    self.buffer.clear();
                    return Err(ProtocolError::LineTooLong {
                        size,
                        max: self.max_line,
                    });
                }
                return Ok(None);
            };

            let line = self.buffer.split_to(pos + 1);
            let text = std::str::from_utf8(&line[..pos]).map_err(|_| ProtocolError::InvalidUtf8)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if !text.starts_with('{') {
                return Err(ProtocolError::NotAnObject);
            }
            return Ok(Some(serde_json::from_str(text)?));
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

use crate::Error;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single protocol line, excluding CRLF
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line delimiter on the wire
pub const CRLF: &[u8; 2] = b"\r\n";

/// Tokio codec that splits a byte stream into CRLF-terminated lines.
///
/// A line ends at the first LF immediately preceded by CR. Stray CR or LF
/// bytes inside the line are dropped. Bytes still buffered at end of stream
/// without a CRLF are discarded, never yielded as a line.
///
/// Lines are decoded as UTF-8 with invalid sequences replaced by U+FFFD, so
/// an 8-bit message body is not stored byte for byte.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Offset already scanned for CRLF in the current buffer
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

fn sanitize(raw: &[u8]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| *b != b'\r' && *b != b'\n')
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Step back one byte so a CR at the end of the last scan still pairs
        let start = self.next_index.saturating_sub(1).min(src.len());

        match src[start..].windows(2).position(|w| w == CRLF) {
            Some(offset) => {
                let pos = start + offset;
                self.next_index = 0;
                if pos > self.max_length {
                    return Err(Error::LineTooLong {
                        max: self.max_length,
                    });
                }
                let line = src.split_to(pos);
                src.advance(CRLF.len());
                Ok(Some(sanitize(&line)))
            }
            None => {
                // A full line plus its CR may be pending; anything longer can't fit
                if src.len() > self.max_length + 1 {
                    return Err(Error::LineTooLong {
                        max: self.max_length,
                    });
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                if !src.is_empty() {
                    tracing::trace!("Discarding {} bytes without CRLF at end of stream", src.len());
                    src.clear();
                }
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.as_ref();
        dst.reserve(line.len() + CRLF.len());
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(CRLF);
        Ok(())
    }
}

//! Line framing for redirected stdio.
//!
//! Writes arrive fragmented at arbitrary byte boundaries; the decoder holds
//! the tail until a newline shows up. Works with `FramedRead` over any
//! `AsyncRead` as well as a bare `BytesMut` owned by the redirector.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Splits on `\n`, strips a trailing `\r`, decodes UTF-8 lossily.
#[derive(Debug, Default)]
pub struct LineDecoder {
    // Bytes before this offset are known to hold no newline.
    next_index: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_line(mut line: BytesMut) -> String {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl Decoder for LineDecoder {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();
        let start = self.next_index.min(read_to);
        match src[start..read_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = start + offset;
                self.next_index = 0;
                let mut line = src.split_to(newline + 1);
                line.truncate(newline);
                Ok(Some(Self::take_line(line)))
            }
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let rest = src.split_to(src.len());
        Ok(Some(Self::take_line(rest)))
    }
}

//! Newline-delimited JSON codec for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization. One encoded
//! message is exactly one line; JSON string escaping guarantees no raw
//! newline ever lands inside a frame.
//!
//! Decoding is lossy by design: a line that is not valid JSON for `T` is
//! logged and dropped, and only that line is affected. A buffered trailing
//! chunk with no newline yet is discarded at EOF.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

pub struct JsonLinesCodec<T> {
    lines: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "max line length exceeded")
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode(src).map_err(into_io)? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::warn!(target: "agent::codec", error = %e, "Discarding undecodable frame");
                }
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    tracing::debug!(
                        target: "agent::codec",
                        bytes = src.len(),
                        "Discarding unterminated trailing chunk at EOF"
                    );
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.lines.encode(json, dst).map_err(into_io)
    }
}

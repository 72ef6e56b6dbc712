//! Line codec for the server-sent chat stream.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! runaway or hostile server cannot make the client buffer an unbounded
//! line. An oversized line is logged and dropped up to its newline and
//! decoding carries on with the next line, so one bad frame never ends
//! the stream. Use it with [`tokio_util::codec::FramedRead`] over the response
//! body (adapted to [`tokio::io::AsyncRead`] with
//! [`tokio_util::io::StreamReader`]).

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum accepted stream line: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// `\n`-delimited UTF-8 line decoder for `GET /chat/stream` bodies.
///
/// Lines over [`MAX_LINE_BYTES`] are skipped; transport failures decode
/// to [`AppError::Stream`].
#[derive(Debug)]
pub struct SseLineCodec(LinesCodec);

impl SseLineCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for SseLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SseLineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Err(LinesCodecError::MaxLineLengthExceeded) => skipped_oversized(),
                other => return other.map_err(map_codec_error),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src) {
                Err(LinesCodecError::MaxLineLengthExceeded) => skipped_oversized(),
                other => return other.map_err(map_codec_error),
            }
        }
    }
}

// `LinesCodec` stays in discard mode until the next newline, so decoding
// again resumes at the following line.
fn skipped_oversized() {
    warn!(limit = MAX_LINE_BYTES, "skipping oversized stream line");
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::MalformedEvent(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Stream(io_err.to_string()),
    }
}

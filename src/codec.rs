//! Streaming compression codecs
//!
//! Cached text (HTTP bodies and finalized partition shards) is stored
//! Brotli-compressed. Source record files come gzipped from upstream.

use crate::fetch::ByteStream;
use async_compression::{
    tokio::bufread::{BrotliDecoder, BrotliEncoder, GzipDecoder},
    Level,
};
use std::pin::Pin;
use tokio::io::{AsyncBufRead, BufReader};

/// Buffered text of a record file
pub type TextReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Compress a text byte stream for storage
///
/// Brotli's maximal quality is far too slow for multi-gigabyte shards, a
/// middle setting keeps most of the size benefit.
pub fn compress_text<R: AsyncBufRead>(reader: R) -> BrotliEncoder<R> {
    BrotliEncoder::with_quality(reader, Level::Precise(5))
}

/// Decompress a byte stream produced by [`compress_text()`]
pub fn decompress_text<R: AsyncBufRead>(reader: R) -> BrotliDecoder<R> {
    BrotliDecoder::new(reader)
}

/// Decompress a gzipped byte stream, which may hold several gzip members
pub fn gunzip<R: AsyncBufRead>(reader: R) -> GzipDecoder<R> {
    let mut decoder = GzipDecoder::new(reader);
    decoder.multiple_members(true);
    decoder
}

/// Text of a record file body, which is gzipped if its URL says so
pub fn record_text(url: &str, body: ByteStream) -> TextReader {
    let body = BufReader::new(body);
    if url.ends_with(".gz") {
        Box::pin(BufReader::new(gunzip(body)))
    } else {
        Box::pin(body)
    }
}

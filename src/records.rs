//! Resilient N-Quads record stream
//!
//! Upstream files hold one quad per line, but are not guaranteed to be well
//! formed. Each line is parsed on its own, and lines that fail to parse are
//! logged and skipped so that one bad line does not sacrifice the rest of a
//! multi-hour parse.

use crate::{Error, Result};
use futures::{stream, Stream};
use oxrdf::GraphName;
use oxrdfio::{RdfFormat, RdfParser};
use std::io::{self, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Parsed record: subject, predicate, object and owning graph
pub type Record = oxrdf::Quad;

/// Parse a stream of newline-delimited N-Quads
///
/// Blank lines and comment lines are ignored. Malformed lines are skipped.
/// A line that holds more than one record is a fatal
/// [`Error::ParseInvariant`].
pub fn parse<R: AsyncBufRead + Unpin>(reader: R) -> impl Stream<Item = Result<Record>> {
    stream::try_unfold(
        LineReader {
            reader,
            line: 0,
            buf: Vec::new(),
        },
        next_record,
    )
}

/// Owning graph of a record, if it is an IRI
pub fn owner(record: &Record) -> Option<&str> {
    match &record.graph_name {
        GraphName::NamedNode(node) => Some(node.as_str()),
        GraphName::BlankNode(_) | GraphName::DefaultGraph => None,
    }
}

/// Serialize a record back into an N-Quads line
pub fn write_line(record: &Record, out: &mut Vec<u8>) -> io::Result<()> {
    writeln!(out, "{record} .")
}

/// State of a [`parse()`] stream between two records
struct LineReader<R> {
    reader: R,
    line: u64,
    buf: Vec<u8>,
}

/// Read lines until one holds a record or the input ends
async fn next_record<R: AsyncBufRead + Unpin>(
    mut state: LineReader<R>,
) -> Result<Option<(Record, LineReader<R>)>> {
    loop {
        state.buf.clear();
        if state.reader.read_until(b'\n', &mut state.buf).await? == 0 {
            return Ok(None);
        }
        state.line += 1;
        if let Some(record) = parse_line(&state.buf, state.line)? {
            return Ok(Some((record, state)));
        }
    }
}

/// Parse one line, returning `None` if it holds no usable record
///
/// The parser keeps going after a syntax error, so a line holding several
/// records is told apart from a line holding none.
fn parse_line(bytes: &[u8], line: u64) -> Result<Option<Record>> {
    let text = bytes.trim_ascii();
    if text.is_empty() || text.starts_with(b"#") {
        return Ok(None);
    }
    let mut records = Vec::with_capacity(1);
    let mut error = None;
    for result in RdfParser::from_format(RdfFormat::NQuads).for_reader(text) {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                error.get_or_insert(e);
            }
        }
    }
    match (records.len(), error) {
        (0, Some(e)) => {
            log::debug!(
                "Skipping malformed line {line} ({e}): {}",
                String::from_utf8_lossy(text)
            );
            Ok(None)
        }
        (0, None) => Ok(None),
        (1, None) => Ok(records.pop()),
        (count, _) => Err(Error::ParseInvariant { line, count }),
    }
}

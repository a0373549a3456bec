//! Line-delimited request framing (component C1): each request is one
//! JSON line; a `put` carrying a body is immediately followed by a
//! second line holding that body as a quoted base64 string.

use crate::protocol::types::Request;
use crate::util::clonable::ClonableBytes;
use crate::util::delim::SkipByteReader;
use base64::Engine;
use std::io::{self, Cursor, Read};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Reads the next request and, if it declares a body, the body that
    /// follows it. `Ok(None)` means a clean EOF between requests.
    ///
    /// A malformed or short body is reported as an `Err` *inside* the
    /// returned tuple, not propagated out of this call: per spec §4.1,
    /// a single malformed body aborts only the one request, while
    /// anything that desyncs the framing itself (a missing body line, a
    /// malformed header) is fatal to the whole session and surfaces as
    /// the outer `Err`.
    pub async fn next_request(
        &mut self,
    ) -> io::Result<Option<(Request, Option<io::Result<ClonableBytes>>)>> {
        let line = loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };

        let request: Request = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let body = if request.body_size > 0 {
            let Some(body_line) = self.lines.next_line().await? else {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before the declared request body arrived",
                ));
            };
            Some(decode_body_line(&body_line, request.body_size as u64))
        } else {
            None
        };

        Ok(Some((request, body)))
    }
}

/// Strips the surrounding JSON string quotes and base64-decodes what's
/// left, yielding the raw output bytes for a `put`. Verifies the decoded
/// length matches `expected_size` exactly (spec §4.1: a short body is a
/// fatal per-request error).
fn decode_body_line(line: &str, expected_size: u64) -> io::Result<ClonableBytes> {
    let mut unquoted = String::with_capacity(line.len());
    SkipByteReader::new(Cursor::new(line.as_bytes()), b'"').read_to_string(&mut unquoted)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(unquoted.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if decoded.len() as u64 != expected_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "declared BodySize {expected_size} but decoded body is {} bytes",
                decoded.len()
            ),
        ));
    }
    Ok(ClonableBytes::new(decoded))
}

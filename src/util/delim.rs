//! A small `Read` adapter shared by the protocol decoder: stripping a
//! single framing byte out of a stream before it reaches a real decoder
//! (e.g. base64).

use std::io::{self, Read};

/// Wraps a reader, silently dropping every occurrence of one configured
/// byte. Used to strip the surrounding `"` quote bytes from a JSON string
/// literal before feeding its contents to a base64 decoder.
pub struct SkipByteReader<R> {
    inner: R,
    skip: u8,
}

impl<R: Read> SkipByteReader<R> {
    pub fn new(inner: R, skip: u8) -> Self {
        SkipByteReader { inner, skip }
    }
}

impl<R: Read> Read for SkipByteReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.inner.read(buf)?;
            if n == 0 {
                return Ok(0);
            }
            let mut write = 0;
            for read in 0..n {
                if buf[read] != self.skip {
                    buf[write] = buf[read];
                    write += 1;
                }
            }
            if write > 0 {
                return Ok(write);
            }
            // Every byte in this chunk was the skip byte; try again.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn skip_byte_reader_drops_quotes() {
        let mut r = SkipByteReader::new(Cursor::new(b"\"aGVsbG8=\"".to_vec()), b'"');
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "aGVsbG8=");
    }
}

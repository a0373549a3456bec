//! An in-memory byte buffer that hands out independent, seekable views
//! over the same bytes. A PUT body must reach both the local disk writer
//! and the remote uploader; cloning a [`ClonableBytes`] gives each
//! consumer its own cursor without either disturbing the other or the
//! shared backing storage.

use std::io::{self, Read, Seek, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::ReadBuf;

#[derive(Clone, Debug)]
pub struct ClonableBytes {
    data: Arc<Vec<u8>>,
}

impl ClonableBytes {
    pub fn new(data: Vec<u8>) -> Self {
        ClonableBytes {
            data: Arc::new(data),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A fresh, independently-seekable view over the same bytes.
    pub fn view(&self) -> ClonableBytesReader {
        ClonableBytesReader {
            data: self.data.clone(),
            pos: 0,
        }
    }
}

pub struct ClonableBytesReader {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for ClonableBytesReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

// `ClonableBytesReader` is plain in-memory data, so the async and sync
// `Read` impls share the same cursor arithmetic: there's never a
// pending-I/O case, only a synchronous copy.
impl tokio::io::AsyncRead for ClonableBytesReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl Seek for ClonableBytesReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.data.len() as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }
        self.pos = new_pos as usize;
        Ok(self.pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_views_read_same_bytes() {
        let body = ClonableBytes::new(b"hello".to_vec());
        let mut a = body.view();
        let mut b = body.view();

        let mut buf_a = [0u8; 2];
        a.read_exact(&mut buf_a).unwrap();
        assert_eq!(&buf_a, b"he");

        let mut buf_b = Vec::new();
        b.read_to_end(&mut buf_b).unwrap();
        assert_eq!(buf_b, b"hello");
    }

    #[test]
    fn seek_from_end_and_current() {
        let body = ClonableBytes::new(b"0123456789".to_vec());
        let mut v = body.view();
        v.seek(SeekFrom::End(-3)).unwrap();
        let mut out = Vec::new();
        v.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"789");
    }

    #[tokio::test]
    async fn view_is_also_a_plain_asyncread() {
        use tokio::io::AsyncReadExt;

        let body = ClonableBytes::new(b"hello".to_vec());
        let mut out = Vec::new();
        body.view().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }
}

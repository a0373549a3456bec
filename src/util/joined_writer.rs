//! Routes a single contiguous byte stream into an ordered list of
//! per-output writers, closing each one after it has received its
//! declared size and advancing to the next. Used by the bundle downloader
//! to fan a single ranged HTTP read out across many local-disk writers.

use std::io;

#[async_trait::async_trait]
pub trait AsyncCloseWrite: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

pub struct JoinedWriter<W> {
    writers: Vec<(W, u64)>,
    idx: usize,
    written_current: u64,
}

impl<W: AsyncCloseWrite> JoinedWriter<W> {
    /// Builds a joined writer over `writers`, each paired with its
    /// declared size. Zero-size writers are closed immediately so the
    /// caller never has to special-case them while feeding bytes.
    pub async fn new(mut writers: Vec<(W, u64)>) -> io::Result<Self> {
        let mut idx = 0;
        while idx < writers.len() && writers[idx].1 == 0 {
            writers[idx].0.close().await?;
            idx += 1;
        }
        Ok(JoinedWriter {
            writers,
            idx,
            written_current: 0,
        })
    }

    /// Feeds `buf` into the current writer, rolling over to subsequent
    /// writers (closing each as it fills) as needed. Bytes beyond the
    /// last writer's declared size are an error: the caller mis-declared
    /// sizes relative to what was actually downloaded.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            if self.idx >= self.writers.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "joined writer received more bytes than the declared total size",
                ));
            }
            let (writer, size) = &mut self.writers[self.idx];
            let remaining = size.saturating_sub(self.written_current) as usize;
            let take = remaining.min(buf.len());
            if take > 0 {
                writer.write_all(&buf[..take]).await?;
                self.written_current += take as u64;
                buf = &buf[take..];
            }
            if self.written_current >= *size {
                writer.close().await?;
                self.idx += 1;
                self.written_current = 0;
                while self.idx < self.writers.len() && self.writers[self.idx].1 == 0 {
                    self.writers[self.idx].0.close().await?;
                    self.idx += 1;
                }
            }
        }
        Ok(())
    }

    /// Closes every writer that has not yet been fully fed. Called on the
    /// error path so a short chunk download never leaves a half-open file.
    pub async fn close_remaining(&mut self) -> io::Result<()> {
        while self.idx < self.writers.len() {
            self.writers[self.idx].0.close().await?;
            self.idx += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use std::sync::Arc;

    #[derive(Clone)]
    struct RecordingWriter {
        buf: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl RecordingWriter {
        fn new() -> Self {
            RecordingWriter {
                buf: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl AsyncCloseWrite for RecordingWriter {
        async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.buf.lock().await.extend_from_slice(buf);
            Ok(())
        }
        async fn close(&mut self) -> io::Result<()> {
            *self.closed.lock().await = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn splits_across_writers_in_order() {
        let a = RecordingWriter::new();
        let b = RecordingWriter::new();
        let c = RecordingWriter::new(); // zero-size, closed immediately

        let mut joined =
            JoinedWriter::new(vec![(a.clone(), 3), (b.clone(), 2), (c.clone(), 0)])
                .await
                .unwrap();
        assert!(*c.closed.lock().await);

        joined.write_all(b"helloXY").await.unwrap();

        assert_eq!(*a.buf.lock().await, b"hel");
        assert!(*a.closed.lock().await);
        assert_eq!(*b.buf.lock().await, b"lo");
    }

    #[tokio::test]
    async fn overflow_is_an_error() {
        let a = RecordingWriter::new();
        let mut joined = JoinedWriter::new(vec![(a, 1)]).await.unwrap();
        assert!(joined.write_all(b"xy").await.is_err());
    }
}
